// Inbound frame handlers — the protocol side effects of each server frame

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::event::EventManager;
use crate::logger::Logger;
use crate::mediator::Mediator;
use crate::message::{AckCode, AckUpdate, Notification, UnregisterCode};
use crate::subscription::{PushSubscription, SubscriptionOptions};

/// Pending register/unregister expectations expire after this long; a
/// server reply landing later is treated as unexpected.
pub const EXPECT_TTL: Duration = Duration::from_secs(60);
/// Delay before retrying a reply with status 500.
pub const SERVER_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Handles the server's hello response: persists the UAID, treats a
/// rotation as an order to re-register every channel, and opens the hello
/// gate once the session is usable.
pub struct HelloHandler {
    log: Logger,
}

impl HelloHandler {
    pub(crate) fn new(log: Logger) -> Self {
        Self { log }
    }

    pub(crate) fn handle(&self, mediator: &Arc<Mediator>, status: u32, uaid: String) {
        if status != 200 {
            self.log
                .warn(format!("dropping hello reply with status {status}"));
            return;
        }

        let rotated = mediator.session().complete_hello(&uaid);
        // The exchange we just completed is ping traffic as far as the
        // server's rate limit is concerned.
        mediator.ping_sender().just_pinged();

        if rotated {
            self.log
                .info("server rotated the uaid; re-registering all channels");
        }

        // Re-registration exchanges frames with the server, so it cannot run
        // on the read-loop task that called us. The hello gate opens only
        // after it finishes: `connect` resolves with the registry already
        // re-registered.
        let mediator = Arc::clone(mediator);
        tokio::spawn(async move {
            if rotated {
                mediator.registry().re_init_all(&mediator).await;
            }
            mediator.session().open_hello_gate();
        });
    }
}

struct PendingRegister {
    options: SubscriptionOptions,
    events: Option<EventManager>,
    queued_at: Instant,
}

/// Handles register replies and correlates them with in-flight `subscribe`
/// and re-init requests.
pub struct RegisterHandler {
    log: Logger,
    expected: Mutex<HashMap<String, PendingRegister>>,
    waiters: Mutex<Vec<(String, oneshot::Sender<Arc<PushSubscription>>)>>,
}

impl RegisterHandler {
    pub(crate) fn new(log: Logger) -> Self {
        Self {
            log,
            expected: Mutex::new(HashMap::new()),
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Record that a `register` frame for `channel_id` is in flight.
    pub fn expect_register(
        &self,
        channel_id: String,
        options: SubscriptionOptions,
        events: Option<EventManager>,
    ) {
        let mut expected = self.expected.lock();
        expected.retain(|_, pending| pending.queued_at.elapsed() < EXPECT_TTL);
        expected.insert(
            channel_id,
            PendingRegister {
                options,
                events,
                queued_at: Instant::now(),
            },
        );
    }

    /// A completion that resolves when a registration for
    /// `application_server_key` succeeds.
    pub fn await_register(
        &self,
        application_server_key: &str,
    ) -> oneshot::Receiver<Arc<PushSubscription>> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .push((application_server_key.to_string(), tx));
        rx
    }

    pub(crate) fn handle(
        &self,
        mediator: &Arc<Mediator>,
        status: u32,
        channel_id: String,
        push_endpoint: Option<String>,
    ) {
        let Some(pending) = self.take_expected(&channel_id) else {
            self.log.warn(format!(
                "register reply for unexpected channel {channel_id}; unregistering it"
            ));
            if let Err(e) =
                mediator.send_unregister(&channel_id, UnregisterCode::UserUnsubscribed)
            {
                self.log
                    .warn(format!("failed to clean up channel {channel_id}: {e}"));
            }
            return;
        };

        match status {
            200 => {
                let Some(endpoint) = push_endpoint else {
                    self.log.warn(format!(
                        "register reply for {channel_id} is missing pushEndpoint"
                    ));
                    return;
                };
                match mediator
                    .registry()
                    .add(channel_id, endpoint, pending.options, pending.events)
                {
                    Ok(subscription) => self.resolve_waiters(&subscription),
                    Err(e) => self.log.error(format!("failed to store subscription: {e}")),
                }
            }
            409 => {
                // Channel-id collision; retry right away with a fresh id.
                self.log
                    .warn(format!("channel {channel_id} conflicted, retrying"));
                if let Err(e) = mediator.send_register(pending.options, pending.events) {
                    self.log.warn(format!("register retry failed: {e}"));
                }
            }
            500 => {
                self.log.warn(format!(
                    "server error registering {channel_id}, retrying in {}s",
                    SERVER_RETRY_DELAY.as_secs()
                ));
                let mediator = Arc::clone(mediator);
                tokio::spawn(async move {
                    tokio::time::sleep(SERVER_RETRY_DELAY).await;
                    if let Err(e) = mediator.send_register(pending.options, pending.events) {
                        mediator
                            .log()
                            .warn(format!("delayed register retry failed: {e}"));
                    }
                });
            }
            other => {
                self.log.warn(format!(
                    "dropping register reply for {channel_id} with status {other}"
                ));
            }
        }
    }

    fn take_expected(&self, channel_id: &str) -> Option<PendingRegister> {
        let mut expected = self.expected.lock();
        expected.retain(|_, pending| pending.queued_at.elapsed() < EXPECT_TTL);
        expected.remove(channel_id)
    }

    fn resolve_waiters(&self, subscription: &Arc<PushSubscription>) {
        let key = subscription.application_server_key();
        let mut waiters = self.waiters.lock();
        let mut remaining = Vec::with_capacity(waiters.len());
        for (waiter_key, tx) in waiters.drain(..) {
            if waiter_key == key {
                let _ = tx.send(Arc::clone(subscription));
            } else {
                remaining.push((waiter_key, tx));
            }
        }
        *waiters = remaining;
    }
}

struct PendingUnregister {
    code: UnregisterCode,
    queued_at: Instant,
}

/// Handles unregister replies and correlates them with in-flight
/// `unsubscribe` requests.
pub struct UnregisterHandler {
    log: Logger,
    expected: Mutex<HashMap<String, PendingUnregister>>,
    waiters: Mutex<Vec<(String, oneshot::Sender<()>)>>,
}

impl UnregisterHandler {
    pub(crate) fn new(log: Logger) -> Self {
        Self {
            log,
            expected: Mutex::new(HashMap::new()),
            waiters: Mutex::new(Vec::new()),
        }
    }

    pub fn expect_unregister(&self, channel_id: String, code: UnregisterCode) {
        let mut expected = self.expected.lock();
        expected.retain(|_, pending| pending.queued_at.elapsed() < EXPECT_TTL);
        expected.insert(
            channel_id,
            PendingUnregister {
                code,
                queued_at: Instant::now(),
            },
        );
    }

    /// A completion that resolves when the server confirms the unregister
    /// of `channel_id`.
    pub fn await_unregister(&self, channel_id: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().push((channel_id.to_string(), tx));
        rx
    }

    pub(crate) fn handle(&self, mediator: &Arc<Mediator>, status: u32, channel_id: String) {
        let pending = self.take_expected(&channel_id);

        match status {
            200 => {
                if let Err(e) = mediator.registry().remove(&channel_id) {
                    self.log
                        .warn(format!("failed to remove channel {channel_id}: {e}"));
                }
                self.resolve_waiters(&channel_id);
            }
            500 => {
                let code = pending
                    .map(|p| p.code)
                    .unwrap_or(UnregisterCode::UserUnsubscribed);
                self.log.warn(format!(
                    "server error unregistering {channel_id}, retrying in {}s",
                    SERVER_RETRY_DELAY.as_secs()
                ));
                let mediator = Arc::clone(mediator);
                tokio::spawn(async move {
                    tokio::time::sleep(SERVER_RETRY_DELAY).await;
                    if let Err(e) = mediator.send_unregister(&channel_id, code) {
                        mediator
                            .log()
                            .warn(format!("delayed unregister retry failed: {e}"));
                    }
                });
            }
            other => {
                self.log.warn(format!(
                    "dropping unregister reply for {channel_id} with status {other}"
                ));
            }
        }
    }

    fn take_expected(&self, channel_id: &str) -> Option<PendingUnregister> {
        let mut expected = self.expected.lock();
        expected.retain(|_, pending| pending.queued_at.elapsed() < EXPECT_TTL);
        expected.remove(channel_id)
    }

    fn resolve_waiters(&self, channel_id: &str) {
        let mut waiters = self.waiters.lock();
        let mut remaining = Vec::with_capacity(waiters.len());
        for (waiter_id, tx) in waiters.drain(..) {
            if waiter_id == channel_id {
                let _ = tx.send(());
            } else {
                remaining.push((waiter_id, tx));
            }
        }
        *waiters = remaining;
    }
}

/// Routes a notification to its subscription and enqueues exactly one ack
/// entry describing what happened.
pub struct NotificationHandler {
    log: Logger,
}

impl NotificationHandler {
    pub(crate) fn new(log: Logger) -> Self {
        Self { log }
    }

    pub(crate) fn handle(&self, mediator: &Arc<Mediator>, notification: Notification) {
        let code = match mediator.registry().get(&notification.channel_id) {
            None => {
                self.log.warn(format!(
                    "notification for unknown channel {}",
                    notification.channel_id
                ));
                AckCode::OtherFail
            }
            Some(subscription) => match subscription.handle_notification(&notification) {
                Ok(()) => AckCode::Success,
                Err(e) => {
                    self.log.warn(format!(
                        "notification for {} not delivered: {e}",
                        notification.channel_id
                    ));
                    e.ack_code()
                }
            },
        };

        mediator.ack(AckUpdate {
            channel_id: notification.channel_id,
            version: notification.version,
            code,
        });
    }
}

/// Server-initiated pings are keepalives; nothing to do but note them.
pub struct PingHandler {
    log: Logger,
}

impl PingHandler {
    pub(crate) fn new(log: Logger) -> Self {
        Self { log }
    }

    pub(crate) fn handle(&self) {
        self.log.debug("server ping");
    }
}

/// Broadcast channels are reserved by the protocol; frames are accepted
/// and ignored.
pub struct BroadcastHandler {
    log: Logger,
}

impl BroadcastHandler {
    pub(crate) fn new(log: Logger) -> Self {
        Self { log }
    }

    pub(crate) fn handle(&self) {
        self.log.debug("ignoring broadcast frame");
    }
}
