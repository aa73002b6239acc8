// Push manager — socket lifecycle and the host-facing surface

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Error, Result};
use crate::logger::Logger;
use crate::mediator::{Mediator, MediatorOptions, DEFAULT_ACK_INTERVAL};
use crate::message::ServerMessage;
use crate::session::Session;
use crate::store::{Storage, StorageBackend};
use crate::subscription::{
    PushSubscription, SubscriptionOptions, SubscriptionRegistry, UnsubscribeFn,
};

pub const DEFAULT_AUTOPUSH_URL: &str = "wss://push.services.mozilla.com";

/// Host-supplied backoff policy: attempt number → delay before the next
/// connection attempt.
pub type ReconnectDelay = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

#[derive(Clone)]
pub struct PushManagerOptions {
    pub autopush_url: String,
    pub ack_interval: Duration,
    pub reconnect_delay: ReconnectDelay,
}

impl Default for PushManagerOptions {
    fn default() -> Self {
        Self {
            autopush_url: DEFAULT_AUTOPUSH_URL.to_string(),
            ack_interval: DEFAULT_ACK_INTERVAL,
            reconnect_delay: Arc::new(|_| Duration::from_millis(1000)),
        }
    }
}

impl std::fmt::Debug for PushManagerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushManagerOptions")
            .field("autopush_url", &self.autopush_url)
            .field("ack_interval", &self.ack_interval)
            .finish_non_exhaustive()
    }
}

/// Back-fills the mediator reference after two-phase construction: the
/// registry (and its subscriptions) need an unsubscribe callback before the
/// mediator exists.
#[derive(Default)]
struct UnsubscribeHook {
    mediator: OnceLock<Weak<Mediator>>,
}

impl UnsubscribeHook {
    fn wire(&self, mediator: &Arc<Mediator>) {
        let _ = self.mediator.set(Arc::downgrade(mediator));
    }

    fn unsubscribe_fn(self: &Arc<Self>) -> UnsubscribeFn {
        let hook = Arc::clone(self);
        Arc::new(move |channel_id: String| {
            let hook = Arc::clone(&hook);
            Box::pin(async move {
                let mediator = hook
                    .mediator
                    .get()
                    .and_then(Weak::upgrade)
                    .ok_or_else(|| Error::Aborted("manager destroyed".to_string()))?;
                mediator.unsubscribe(&channel_id).await
            })
        })
    }
}

/// Owns one Autopush session end to end: the storage-backed registry, the
/// mediator, and the WebSocket connection loop with reconnect.
pub struct PushManager {
    log: Logger,
    options: PushManagerOptions,
    session: Arc<Session>,
    registry: Arc<SubscriptionRegistry>,
    mediator: Arc<Mediator>,
    reconnect: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    conn_task: Mutex<Option<JoinHandle<()>>>,
}

impl PushManager {
    /// Build the engine over `backend` and open the socket. Must be called
    /// inside a tokio runtime. Await [`PushManager::ready`] before
    /// subscribing: registration requires a completed hello.
    pub fn create(
        backend: Arc<dyn StorageBackend>,
        options: PushManagerOptions,
    ) -> Result<Arc<Self>> {
        let log = Logger::new("push-manager");
        let storage = Storage::new(backend);
        let session = Arc::new(Session::new(storage.clone(), log.scoped("session"))?);

        let hook = Arc::new(UnsubscribeHook::default());
        let registry = Arc::new(SubscriptionRegistry::new(
            storage,
            log.scoped("subscriptions"),
            hook.unsubscribe_fn(),
        )?);
        let mediator = Mediator::new(
            Arc::clone(&session),
            Arc::clone(&registry),
            MediatorOptions {
                ack_interval: options.ack_interval,
            },
            log.scoped("mediator"),
        );
        hook.wire(&mediator);
        mediator.start();

        let (shutdown, _) = watch::channel(false);
        let manager = Arc::new(Self {
            log,
            options,
            session,
            registry,
            mediator,
            reconnect: Arc::new(AtomicBool::new(true)),
            shutdown,
            conn_task: Mutex::new(None),
        });
        manager.spawn_connection_loop();
        Ok(manager)
    }

    /// Resolves once the current connection's hello exchange has completed
    /// (including re-registration after a UAID rotation).
    ///
    /// Neither this nor `subscribe` carries an internal timeout; hosts that
    /// need one should wrap calls in `tokio::time::timeout`.
    pub async fn ready(&self) {
        self.session.hello_completed().await;
    }

    pub fn uaid(&self) -> Option<String> {
        self.session.uaid()
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Subscribe with the sender's VAPID public key. Returns the existing
    /// subscription if one already exists for that key; otherwise resolves
    /// once the server confirms the registration.
    pub async fn subscribe(&self, options: SubscriptionOptions) -> Result<Arc<PushSubscription>> {
        self.mediator.subscribe(options).await
    }

    /// Unsubscribe a channel; resolves once the server confirms.
    pub async fn unsubscribe(&self, channel_id: &str) -> Result<()> {
        self.mediator.unsubscribe(channel_id).await
    }

    /// Client-initiated keepalive; fails if the previous ping was less than
    /// 30 minutes ago.
    pub fn ping(&self) -> Result<()> {
        self.mediator.send_ping()
    }

    /// Graceful shutdown: stop reconnecting, close the socket, stop the ack
    /// timer.
    pub async fn destroy(&self) {
        self.log.info("shutting down");
        self.reconnect.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        self.mediator.destroy();
        let task = self.conn_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn spawn_connection_loop(self: &Arc<Self>) {
        let log = self.log.scoped("socket");
        let url = self.options.autopush_url.clone();
        let reconnect_delay = Arc::clone(&self.options.reconnect_delay);
        let session = Arc::clone(&self.session);
        let mediator = Arc::clone(&self.mediator);
        let reconnect = Arc::clone(&self.reconnect);
        let mut shutdown_rx = self.shutdown.subscribe();

        let task = tokio::spawn(async move {
            let mut attempt: u32 = 0;
            'outer: loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                session.reset_hello_gate();
                log.debug(format!("connecting to {url}"));

                let connected = tokio::select! {
                    result = connect_async(url.as_str()) => result,
                    _ = shutdown_rx.changed() => break 'outer,
                };

                match connected {
                    Ok((stream, _response)) => {
                        attempt = 0;
                        log.info(format!("connected to {url}"));
                        let (mut sink, mut reader) = stream.split();
                        let (tx, mut outbound) = mpsc::unbounded_channel::<String>();
                        mediator.attach_socket(tx);

                        let writer = tokio::spawn(async move {
                            while let Some(text) = outbound.recv().await {
                                if sink.send(Message::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                            let _ = sink.close().await;
                        });

                        if let Err(e) = mediator.send_hello() {
                            log.warn(format!("failed to send hello: {e}"));
                        }

                        let shutdown_requested = loop {
                            tokio::select! {
                                _ = shutdown_rx.changed() => break true,
                                frame = reader.next() => match frame {
                                    Some(Ok(Message::Text(text))) => {
                                        match serde_json::from_str::<ServerMessage>(&text) {
                                            Ok(message) => mediator.handle(message),
                                            Err(e) => log.warn(format!(
                                                "dropping malformed frame: {e}"
                                            )),
                                        }
                                    }
                                    Some(Ok(Message::Binary(_))) => {
                                        log.warn("dropping unexpected binary frame");
                                    }
                                    Some(Ok(Message::Close(_))) | None => break false,
                                    Some(Ok(_)) => {}
                                    Some(Err(e)) => {
                                        log.warn(format!("socket error: {e}"));
                                        break false;
                                    }
                                }
                            }
                        };

                        mediator.detach_socket();
                        let _ = writer.await;
                        if shutdown_requested {
                            break 'outer;
                        }
                        log.warn("disconnected");
                    }
                    Err(e) => log.warn(format!("connection failed: {e}")),
                }

                if !reconnect.load(Ordering::SeqCst) {
                    break;
                }
                attempt += 1;
                let delay = reconnect_delay(attempt);
                log.debug(format!("reconnecting in {delay:?}"));
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
            mediator.detach_socket();
        });
        *self.conn_task.lock() = Some(task);
    }
}

impl std::fmt::Debug for PushManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushManager")
            .field("autopush_url", &self.options.autopush_url)
            .field("uaid", &self.session.uaid())
            .finish_non_exhaustive()
    }
}
