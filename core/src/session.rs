// Shared session state — UAID persistence and the hello gate

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::error::Result;
use crate::logger::Logger;
use crate::store::Storage;

pub const KEY_UAID: &str = "uaid";

/// State shared between the manager and the mediator: the server-assigned
/// UAID and the gate that opens once a hello exchange has completed.
pub struct Session {
    storage: Storage,
    log: Logger,
    uaid: RwLock<Option<String>>,
    hello_tx: watch::Sender<bool>,
    hello_rx: watch::Receiver<bool>,
}

impl Session {
    pub fn new(storage: Storage, log: Logger) -> Result<Self> {
        let uaid: Option<String> = storage.read(KEY_UAID)?;
        let (hello_tx, hello_rx) = watch::channel(false);
        Ok(Self {
            storage,
            log,
            uaid: RwLock::new(uaid),
            hello_tx,
            hello_rx,
        })
    }

    /// The UAID from the last completed hello (or a prior run). `None` until
    /// the first hello completes on a fresh install.
    pub fn uaid(&self) -> Option<String> {
        self.uaid.read().clone()
    }

    /// Record the server's hello response. Persists a changed UAID and
    /// returns `true` when the server rotated away from a previously
    /// established identity, which obligates the caller to re-register
    /// every subscription.
    pub fn complete_hello(&self, uaid: &str) -> bool {
        let mut guard = self.uaid.write();
        let prior = guard.clone();
        if prior.as_deref() != Some(uaid) {
            if let Err(e) = self.storage.write(KEY_UAID, &uaid) {
                self.log.error(format!("failed to persist uaid: {e}"));
            }
            *guard = Some(uaid.to_string());
        }
        matches!(prior, Some(ref p) if !p.is_empty() && p != uaid)
    }

    /// Open the hello gate; `connect` callers waiting in
    /// [`Session::hello_completed`] resume.
    pub fn open_hello_gate(&self) {
        let _ = self.hello_tx.send(true);
    }

    /// Close the gate again ahead of a (re)connect attempt.
    pub fn reset_hello_gate(&self) {
        let _ = self.hello_tx.send(false);
    }

    /// Wait until the current connection's hello exchange has completed.
    pub async fn hello_completed(&self) {
        let mut rx = self.hello_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
