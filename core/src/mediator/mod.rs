// Mediator — owns handler/sender state, the ack queue and its flush
// timer, and the socket write path

mod handlers;
mod senders;

pub use handlers::{
    BroadcastHandler, HelloHandler, NotificationHandler, PingHandler, RegisterHandler,
    UnregisterHandler, EXPECT_TTL, SERVER_RETRY_DELAY,
};
pub use senders::{PingSender, PING_MIN_INTERVAL};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::event::EventManager;
use crate::logger::Logger;
use crate::message::{AckUpdate, ClientMessage, ServerMessage, UnregisterCode};
use crate::session::Session;
use crate::subscription::{PushSubscription, SubscriptionOptions, SubscriptionRegistry};

pub const DEFAULT_ACK_INTERVAL: Duration = Duration::from_millis(30_000);

/// Outbound frames are queued here as JSON text; the manager's writer task
/// pumps them onto the socket.
pub type SocketSender = mpsc::UnboundedSender<String>;

#[derive(Debug, Clone)]
pub struct MediatorOptions {
    pub ack_interval: Duration,
}

impl Default for MediatorOptions {
    fn default() -> Self {
        Self {
            ack_interval: DEFAULT_ACK_INTERVAL,
        }
    }
}

/// Routes inbound frames to their handlers and outbound frames to the
/// socket, and batches acks on a timer.
pub struct Mediator {
    log: Logger,
    session: Arc<Session>,
    registry: Arc<SubscriptionRegistry>,
    socket: RwLock<Option<SocketSender>>,
    ack_queue: Mutex<Vec<AckUpdate>>,
    ack_interval: Duration,
    ack_timer: Mutex<Option<JoinHandle<()>>>,
    hello: HelloHandler,
    register: RegisterHandler,
    unregister: UnregisterHandler,
    notification: NotificationHandler,
    ping_handler: PingHandler,
    broadcast: BroadcastHandler,
    ping: PingSender,
}

impl Mediator {
    pub fn new(
        session: Arc<Session>,
        registry: Arc<SubscriptionRegistry>,
        options: MediatorOptions,
        log: Logger,
    ) -> Arc<Self> {
        Arc::new(Self {
            hello: HelloHandler::new(log.scoped("hello")),
            register: RegisterHandler::new(log.scoped("register")),
            unregister: UnregisterHandler::new(log.scoped("unregister")),
            notification: NotificationHandler::new(log.scoped("notification")),
            ping_handler: PingHandler::new(log.scoped("ping")),
            broadcast: BroadcastHandler::new(log.scoped("broadcast")),
            ping: PingSender::new(),
            log,
            session,
            registry,
            socket: RwLock::new(None),
            ack_queue: Mutex::new(Vec::new()),
            ack_interval: options.ack_interval,
            ack_timer: Mutex::new(None),
        })
    }

    /// Start the ack flush timer. Must run inside a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let mediator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(mediator.ack_interval).await;
                mediator.flush_acks();
            }
        });
        if let Some(previous) = self.ack_timer.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the ack timer.
    pub fn destroy(&self) {
        if let Some(timer) = self.ack_timer.lock().take() {
            timer.abort();
        }
    }

    pub fn attach_socket(&self, sender: SocketSender) {
        *self.socket.write() = Some(sender);
    }

    pub fn detach_socket(&self) {
        *self.socket.write() = None;
    }

    pub fn socket_open(&self) -> bool {
        self.socket
            .read()
            .as_ref()
            .is_some_and(|sender| !sender.is_closed())
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn register_handler(&self) -> &RegisterHandler {
        &self.register
    }

    pub fn unregister_handler(&self) -> &UnregisterHandler {
        &self.unregister
    }

    pub fn ping_sender(&self) -> &PingSender {
        &self.ping
    }

    pub(crate) fn log(&self) -> &Logger {
        &self.log
    }

    fn send_frame(&self, frame: &ClientMessage) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        let socket = self.socket.read();
        let Some(sender) = socket.as_ref() else {
            return Err(Error::SocketClosed);
        };
        self.log.debug(format!("sending {text}"));
        sender.send(text).map_err(|_| Error::SocketClosed)
    }

    pub fn send_hello(&self) -> Result<()> {
        let frame = senders::hello(
            self.session.uaid().as_deref(),
            self.registry.channel_ids(),
        );
        self.send_frame(&frame)
    }

    /// Queue a register expectation and send the frame. Returns the freshly
    /// generated channel id.
    pub fn send_register(
        &self,
        options: SubscriptionOptions,
        events: Option<EventManager>,
    ) -> Result<String> {
        let (channel_id, frame) = senders::register(self.session.uaid().as_deref(), &options)?;
        self.register
            .expect_register(channel_id.clone(), options, events);
        self.send_frame(&frame)?;
        Ok(channel_id)
    }

    pub fn send_unregister(&self, channel_id: &str, code: UnregisterCode) -> Result<()> {
        self.unregister
            .expect_unregister(channel_id.to_string(), code);
        self.send_frame(&senders::unregister(channel_id, code))
    }

    pub fn send_ping(&self) -> Result<()> {
        let frame = self.ping.build()?;
        self.send_frame(&frame)?;
        self.ping.just_pinged();
        Ok(())
    }

    /// Queue one ack entry for the next batch.
    pub fn ack(&self, update: AckUpdate) {
        self.ack_queue.lock().push(update);
    }

    pub fn pending_acks(&self) -> usize {
        self.ack_queue.lock().len()
    }

    /// Drain the ack queue into a single batched frame. No-op while the
    /// queue is empty or the socket is closed; a failed send re-queues the
    /// batch in order.
    pub fn flush_acks(&self) {
        if !self.socket_open() {
            return;
        }
        let updates: Vec<AckUpdate> = {
            let mut queue = self.ack_queue.lock();
            if queue.is_empty() {
                return;
            }
            std::mem::take(&mut *queue)
        };
        if let Err(e) = self.send_frame(&senders::ack(updates.clone())) {
            self.log
                .warn(format!("failed to flush {} ack(s): {e}", updates.len()));
            let mut queue = self.ack_queue.lock();
            let mut restored = updates;
            restored.append(&mut queue);
            *queue = restored;
        }
    }

    /// Route one inbound frame to its handler.
    pub fn handle(self: &Arc<Self>, message: ServerMessage) {
        match message {
            ServerMessage::Hello { status, uaid, .. } => self.hello.handle(self, status, uaid),
            ServerMessage::Register {
                status,
                channel_id,
                push_endpoint,
            } => self.register.handle(self, status, channel_id, push_endpoint),
            ServerMessage::Unregister { status, channel_id } => {
                self.unregister.handle(self, status, channel_id)
            }
            ServerMessage::Notification(notification) => {
                self.notification.handle(self, notification)
            }
            ServerMessage::Ping => self.ping_handler.handle(),
            ServerMessage::Broadcast { .. } => self.broadcast.handle(),
        }
    }

    /// Host-facing subscribe: idempotent per application server key.
    pub async fn subscribe(
        self: &Arc<Self>,
        options: SubscriptionOptions,
    ) -> Result<Arc<PushSubscription>> {
        if options.application_server_key.is_empty() {
            return Err(Error::InvalidOptions(
                "options.applicationServerKey is required".to_string(),
            ));
        }
        if let Some(existing) = self
            .registry
            .get_by_application_server_key(&options.application_server_key)
        {
            return Ok(existing);
        }

        let completion = self
            .register
            .await_register(&options.application_server_key);
        self.send_register(options, None)?;
        completion
            .await
            .map_err(|_| Error::Aborted("register completion dropped".to_string()))
    }

    /// Host-facing unsubscribe: resolves once the server confirms.
    pub async fn unsubscribe(self: &Arc<Self>, channel_id: &str) -> Result<()> {
        let completion = self.unregister.await_unregister(channel_id);
        self.send_unregister(channel_id, UnregisterCode::UserUnsubscribed)?;
        completion
            .await
            .map_err(|_| Error::Aborted("unregister completion dropped".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::Logger;
    use crate::message::AckCode;
    use crate::store::{MemoryStorage, Storage};
    use crate::subscription::UnsubscribeFn;

    fn build() -> (Arc<Mediator>, Storage) {
        let storage = Storage::new(Arc::new(MemoryStorage::new()));
        let log = Logger::new("test");
        let session = Arc::new(Session::new(storage.clone(), log.scoped("session")).unwrap());
        let unsubscribe: UnsubscribeFn = Arc::new(|_| Box::pin(async { Ok(()) }));
        let registry = Arc::new(
            SubscriptionRegistry::new(storage.clone(), log.scoped("subscriptions"), unsubscribe)
                .unwrap(),
        );
        let mediator = Mediator::new(
            session,
            registry,
            MediatorOptions::default(),
            log.scoped("mediator"),
        );
        (mediator, storage)
    }

    fn attach(mediator: &Arc<Mediator>) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        mediator.attach_socket(tx);
        rx
    }

    fn sent(rx: &mut mpsc::UnboundedReceiver<String>) -> serde_json::Value {
        serde_json::from_str(&rx.try_recv().expect("a frame was sent")).unwrap()
    }

    #[tokio::test]
    async fn test_send_fails_without_socket() {
        let (mediator, _) = build();
        assert!(matches!(mediator.send_hello(), Err(Error::SocketClosed)));
    }

    #[tokio::test]
    async fn test_send_hello_carries_uaid_and_channels() {
        let (mediator, _) = build();
        let mut rx = attach(&mediator);
        mediator.send_hello().unwrap();
        let frame = sent(&mut rx);
        assert_eq!(frame["messageType"], "hello");
        assert_eq!(frame["uaid"], "");
        assert_eq!(frame["use_webpush"], true);
    }

    #[tokio::test]
    async fn test_register_before_hello_fails() {
        let (mediator, _) = build();
        let _rx = attach(&mediator);
        let options = SubscriptionOptions {
            user_visible_only: true,
            application_server_key: "key".to_string(),
        };
        assert!(matches!(
            mediator.send_register(options, None),
            Err(Error::HelloNotCompleted)
        ));
    }

    #[tokio::test]
    async fn test_acks_flush_as_one_batch_in_order() {
        let (mediator, _) = build();
        let mut rx = attach(&mediator);

        for version in ["v1", "v2"] {
            mediator.ack(AckUpdate {
                channel_id: "chan".to_string(),
                version: version.to_string(),
                code: AckCode::Success,
            });
        }
        mediator.flush_acks();

        let frame = sent(&mut rx);
        assert_eq!(frame["messageType"], "ack");
        assert_eq!(frame["updates"][0]["version"], "v1");
        assert_eq!(frame["updates"][1]["version"], "v2");
        assert_eq!(frame["updates"][0]["code"], 100);
        assert_eq!(mediator.pending_acks(), 0);
    }

    #[tokio::test]
    async fn test_empty_ack_queue_sends_nothing() {
        let (mediator, _) = build();
        let mut rx = attach(&mediator);
        mediator.flush_acks();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_acks_survive_closed_socket() {
        let (mediator, _) = build();
        mediator.ack(AckUpdate {
            channel_id: "chan".to_string(),
            version: "v1".to_string(),
            code: AckCode::Success,
        });
        // No socket attached: the queue must be left intact for the next flush.
        mediator.flush_acks();
        assert_eq!(mediator.pending_acks(), 1);
    }

    #[tokio::test]
    async fn test_notification_for_unknown_channel_acks_other_fail() {
        let (mediator, _) = build();
        let _rx = attach(&mediator);

        mediator.handle(ServerMessage::Notification(crate::message::Notification {
            channel_id: "nobody-home".to_string(),
            version: "v9".to_string(),
            ttl: Some(60),
            data: None,
            headers: None,
        }));

        assert_eq!(mediator.pending_acks(), 1);
        mediator.flush_acks();
    }

    #[tokio::test]
    async fn test_hello_reply_persists_uaid_and_opens_gate() {
        let (mediator, storage) = build();
        let _rx = attach(&mediator);

        mediator.handle(ServerMessage::Hello {
            status: 200,
            uaid: "5f0774ac-09a3-45d9-91e4-f4aaebaeec72".to_string(),
            use_webpush: Some(true),
        });
        mediator.session().hello_completed().await;

        assert_eq!(
            storage.read::<String>("uaid").unwrap().as_deref(),
            Some("5f0774ac-09a3-45d9-91e4-f4aaebaeec72")
        );
    }

    #[tokio::test]
    async fn test_unexpected_register_reply_triggers_cleanup_unregister() {
        let (mediator, _) = build();
        let mut rx = attach(&mediator);

        mediator.handle(ServerMessage::Register {
            status: 200,
            channel_id: "never-asked".to_string(),
            push_endpoint: Some("https://example.com/push/never-asked".to_string()),
        });

        let frame = sent(&mut rx);
        assert_eq!(frame["messageType"], "unregister");
        assert_eq!(frame["channelID"], "never-asked");
        assert_eq!(frame["code"], 200);
    }

    #[tokio::test]
    async fn test_subscribe_requires_application_server_key() {
        let (mediator, _) = build();
        let result = mediator
            .subscribe(SubscriptionOptions {
                user_visible_only: true,
                application_server_key: String::new(),
            })
            .await;
        assert!(matches!(result, Err(Error::InvalidOptions(_))));
    }
}
