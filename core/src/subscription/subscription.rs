// Push subscription — per-channel crypto state and notification decryption

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use crate::codec;
use crate::crypto::{self, webpush, CryptoError, EcKeyPair, Jwk, AUTH_SECRET_LEN};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, EventManager, ListenerId};
use crate::logger::Logger;
use crate::mediator::Mediator;
use crate::message::{AckCode, Notification};
use crate::store::Storage;

const KEY_ENDPOINT: &str = "endpoint";
const KEY_OPTIONS: &str = "options";
const KEY_AUTH: &str = "auth";
const KEY_PRIVATE_ENC_KEY: &str = "privateEncKey";

const ENCODING_AES128GCM: &str = "aes128gcm";

/// Options supplied by the host when subscribing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionOptions {
    pub user_visible_only: bool,
    /// The sender's VAPID public key, base64url of the uncompressed point.
    pub application_server_key: String,
}

/// Callback a subscription uses to unsubscribe itself through the manager.
pub type UnsubscribeFn = Arc<dyn Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Error raised while handling a notification. Never surfaces to the host;
/// it determines the ack disposition reported to the server.
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("decryption failed: {0}")]
    Decrypt(String),
    #[error("notification handling failed: {0}")]
    Other(String),
}

impl NotificationError {
    pub fn ack_code(&self) -> AckCode {
        match self {
            NotificationError::Decrypt(_) => AckCode::DecryptFail,
            NotificationError::Other(_) => AckCode::OtherFail,
        }
    }
}

impl From<CryptoError> for NotificationError {
    fn from(err: CryptoError) -> Self {
        NotificationError::Decrypt(err.to_string())
    }
}

/// One logical push subscription: a channel id, the endpoint third parties
/// POST to, and the key material that decrypts what they send.
///
/// The keypair, auth secret, and endpoint never change over a
/// subscription's lifetime; a UAID rotation replaces the subscription
/// wholesale (same `applicationServerKey`, fresh channel id and keys).
pub struct PushSubscription {
    channel_id: String,
    endpoint: String,
    options: SubscriptionOptions,
    auth: [u8; AUTH_SECRET_LEN],
    keys: EcKeyPair,
    storage: Storage,
    events: EventManager,
    log: Logger,
    unsubscribe: UnsubscribeFn,
}

impl PushSubscription {
    /// Create a fresh subscription: validate the endpoint, generate key
    /// material, and persist everything under the channel-id namespace.
    ///
    /// `events` is only passed on the re-init path so the replacement
    /// subscription inherits its predecessor's listeners; in that case a
    /// `pushsubscriptionchange` event fires synchronously before returning.
    pub fn create(
        channel_id: String,
        storage: &Storage,
        endpoint: String,
        options: SubscriptionOptions,
        unsubscribe: UnsubscribeFn,
        log: &Logger,
        events: Option<EventManager>,
    ) -> Result<Arc<Self>> {
        Url::parse(&endpoint)
            .map_err(|e| Error::InvalidOptions(format!("invalid endpoint {endpoint:?}: {e}")))?;
        if options.application_server_key.is_empty() {
            return Err(Error::InvalidOptions(
                "options.applicationServerKey is required".to_string(),
            ));
        }

        let storage = storage.extend(&channel_id);
        storage.write(KEY_ENDPOINT, &endpoint)?;
        storage.write(KEY_OPTIONS, &options)?;

        let auth = crypto::generate_auth_secret();
        let keys = EcKeyPair::generate();
        storage.write(KEY_AUTH, &codec::base64url_encode(&auth))?;
        storage.write(KEY_PRIVATE_ENC_KEY, &keys.to_jwk())?;

        let log = log.scoped(&channel_id);
        let recreated = events.is_some();
        let events = events.unwrap_or_else(|| EventManager::new(log.clone()));

        let subscription = Arc::new(Self {
            channel_id,
            endpoint,
            options,
            auth,
            keys,
            storage,
            events,
            log,
            unsubscribe,
        });

        if recreated {
            subscription
                .events
                .dispatch(&Event::PushSubscriptionChange(subscription.to_json()));
        }

        Ok(subscription)
    }

    /// Rebuild a subscription from its persisted namespace. Fails if any of
    /// the four persisted keys is missing or malformed.
    pub fn recover(
        channel_id: String,
        storage: &Storage,
        unsubscribe: UnsubscribeFn,
        log: &Logger,
    ) -> Result<Arc<Self>> {
        let storage = storage.extend(&channel_id);
        let missing =
            |key: &str| Error::Storage(format!("subscription {channel_id} is missing `{key}`"));

        let endpoint: String = storage.read(KEY_ENDPOINT)?.ok_or_else(|| missing(KEY_ENDPOINT))?;
        let options: SubscriptionOptions =
            storage.read(KEY_OPTIONS)?.ok_or_else(|| missing(KEY_OPTIONS))?;
        let auth_encoded: String = storage.read(KEY_AUTH)?.ok_or_else(|| missing(KEY_AUTH))?;
        let jwk: Jwk = storage
            .read(KEY_PRIVATE_ENC_KEY)?
            .ok_or_else(|| missing(KEY_PRIVATE_ENC_KEY))?;

        let auth_bytes = codec::base64url_decode(&auth_encoded)
            .map_err(|e| Error::Storage(format!("subscription {channel_id} auth is invalid: {e}")))?;
        let auth: [u8; AUTH_SECRET_LEN] = auth_bytes.as_slice().try_into().map_err(|_| {
            Error::Storage(format!(
                "subscription {channel_id} auth has {} bytes, expected {AUTH_SECRET_LEN}",
                auth_bytes.len()
            ))
        })?;
        let keys = EcKeyPair::from_jwk(&jwk)?;

        let log = log.scoped(&channel_id);
        Ok(Arc::new(Self {
            events: EventManager::new(log.clone()),
            channel_id,
            endpoint,
            options,
            auth,
            keys,
            storage,
            log,
            unsubscribe,
        }))
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn options(&self) -> &SubscriptionOptions {
        &self.options
    }

    pub fn application_server_key(&self) -> &str {
        &self.options.application_server_key
    }

    /// base64url of the 16-byte auth secret.
    pub fn auth(&self) -> String {
        codec::base64url_encode(&self.auth)
    }

    /// base64url of the uncompressed public point senders encrypt against.
    pub fn p256dh(&self) -> String {
        codec::base64url_encode(&self.keys.public_key_bytes())
    }

    /// Raw uncompressed public point, for encryption helpers in tests.
    pub fn public_key_bytes(&self) -> [u8; 65] {
        self.keys.public_key_bytes()
    }

    /// The JSON projection handed to hosts and carried on
    /// `pushsubscriptionchange` events.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "endpoint": self.endpoint,
            "expirationTime": null,
            "keys": {
                "auth": self.auth(),
                "p256dh": self.p256dh(),
            },
        })
    }

    pub fn add_listener(
        &self,
        kind: EventKind,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> ListenerId {
        self.events.add_listener(kind, callback)
    }

    pub fn remove_listener(&self, kind: EventKind, id: ListenerId) -> bool {
        self.events.remove_listener(kind, id)
    }

    /// Process an inbound notification frame addressed to this channel.
    ///
    /// A data-less frame is a keepalive and dispatches `Notification(None)`.
    /// Otherwise the payload must be an aes128gcm record; it is decrypted,
    /// un-padded, and dispatched as UTF-8. Errors carry the ack code the
    /// mediator reports back.
    pub fn handle_notification(
        &self,
        notification: &Notification,
    ) -> std::result::Result<(), NotificationError> {
        let Some(data) = notification.data.as_deref() else {
            self.events.dispatch(&Event::Notification(None));
            return Ok(());
        };

        let encoding = notification.headers.as_ref().and_then(|headers| {
            headers
                .get("encoding")
                .or_else(|| headers.get("Content-Encoding"))
        });
        if encoding.map(String::as_str) != Some(ENCODING_AES128GCM) {
            return Err(NotificationError::Decrypt(format!(
                "unsupported content encoding {encoding:?}"
            )));
        }

        let record = codec::base64url_decode(data)
            .map_err(|e| NotificationError::Decrypt(format!("payload is not base64url: {e}")))?;
        let prep = webpush::decrypt_prep(&self.keys, &self.auth, &record)?;
        let padded = webpush::aes_gcm_decrypt(&prep.ciphertext, &prep.cek, &prep.nonce)?;
        let payload = webpush::remove_padding(&padded, true)?;
        let text = String::from_utf8(payload)
            .map_err(|e| NotificationError::Decrypt(format!("payload is not UTF-8: {e}")))?;

        // VAPID re-verification of forwarded Authorization headers would sit
        // here (crypto::vapid::verify_vapid_auth); it stays disabled until
        // server forwarding behavior settles.

        self.log.debug("delivering decrypted notification");
        self.events.dispatch(&Event::Notification(Some(text)));
        Ok(())
    }

    /// Re-register this subscription after a UAID rotation: expect a
    /// register completion for our VAPID key, send a fresh `register`, and
    /// return the replacement subscription (which inherits our listeners
    /// and has already announced itself via `pushsubscriptionchange`).
    pub async fn re_init(&self, mediator: &Arc<Mediator>) -> Result<Arc<PushSubscription>> {
        self.log.info("re-registering after uaid rotation");
        let completion = mediator
            .register_handler()
            .await_register(&self.options.application_server_key);
        mediator.send_register(self.options.clone(), Some(self.events.clone()))?;
        completion
            .await
            .map_err(|_| Error::Aborted("register completion dropped".to_string()))
    }

    /// Remove every key persisted under this subscription's namespace.
    pub fn destroy(&self) -> Result<()> {
        self.log.debug("destroying subscription state");
        self.storage.remove(KEY_ENDPOINT)?;
        self.storage.remove(KEY_OPTIONS)?;
        self.storage.remove(KEY_AUTH)?;
        self.storage.remove(KEY_PRIVATE_ENC_KEY)?;
        Ok(())
    }

    /// Unsubscribe through the manager that owns this subscription.
    pub async fn unsubscribe(&self) -> Result<()> {
        (self.unsubscribe)(self.channel_id.clone()).await
    }
}

impl std::fmt::Debug for PushSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushSubscription")
            .field("channel_id", &self.channel_id)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    fn noop_unsubscribe() -> UnsubscribeFn {
        Arc::new(|_| Box::pin(async { Ok(()) }))
    }

    fn options() -> SubscriptionOptions {
        SubscriptionOptions {
            user_visible_only: true,
            application_server_key: "BCh0IFs".to_string(),
        }
    }

    fn root_storage() -> Storage {
        Storage::new(Arc::new(MemoryStorage::new()))
    }

    fn create(storage: &Storage) -> Arc<PushSubscription> {
        PushSubscription::create(
            "f2ca74ee-d688-4cb2-8ae1-9deb4805be29".to_string(),
            storage,
            "https://example.com/push/f2ca74ee".to_string(),
            options(),
            noop_unsubscribe(),
            &Logger::new("test"),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_create_persists_namespaced_state() {
        let storage = root_storage();
        let subscription = create(&storage);

        let ns = storage.extend(subscription.channel_id());
        assert_eq!(
            ns.read::<String>("endpoint").unwrap().as_deref(),
            Some("https://example.com/push/f2ca74ee")
        );
        assert_eq!(
            ns.read::<SubscriptionOptions>("options").unwrap().unwrap(),
            options()
        );
        let auth: String = ns.read("auth").unwrap().unwrap();
        assert_eq!(codec::base64url_decode(&auth).unwrap().len(), 16);
        let jwk: Jwk = ns.read("privateEncKey").unwrap().unwrap();
        assert_eq!(jwk.crv, "P-256");
    }

    #[test]
    fn test_create_rejects_relative_endpoint() {
        let result = PushSubscription::create(
            "c".to_string(),
            &root_storage(),
            "/push/only-a-path".to_string(),
            options(),
            noop_unsubscribe(),
            &Logger::new("test"),
            None,
        );
        assert!(matches!(result, Err(Error::InvalidOptions(_))));
    }

    #[test]
    fn test_create_requires_application_server_key() {
        let result = PushSubscription::create(
            "c".to_string(),
            &root_storage(),
            "https://example.com/push".to_string(),
            SubscriptionOptions {
                user_visible_only: true,
                application_server_key: String::new(),
            },
            noop_unsubscribe(),
            &Logger::new("test"),
            None,
        );
        assert!(matches!(result, Err(Error::InvalidOptions(_))));
    }

    #[test]
    fn test_recover_restores_key_material() {
        let storage = root_storage();
        let original = create(&storage);

        let recovered = PushSubscription::recover(
            original.channel_id().to_string(),
            &storage,
            noop_unsubscribe(),
            &Logger::new("test"),
        )
        .unwrap();

        assert_eq!(recovered.endpoint(), original.endpoint());
        assert_eq!(recovered.auth(), original.auth());
        assert_eq!(recovered.p256dh(), original.p256dh());
        assert_eq!(recovered.options(), original.options());
    }

    #[test]
    fn test_recover_fails_on_missing_key() {
        let storage = root_storage();
        let original = create(&storage);
        storage
            .extend(original.channel_id())
            .remove("privateEncKey")
            .unwrap();

        let result = PushSubscription::recover(
            original.channel_id().to_string(),
            &storage,
            noop_unsubscribe(),
            &Logger::new("test"),
        );
        assert!(matches!(result, Err(Error::Storage(_))));
    }

    #[test]
    fn test_destroy_removes_all_keys() {
        let storage = root_storage();
        let subscription = create(&storage);
        subscription.destroy().unwrap();

        let ns = storage.extend(subscription.channel_id());
        assert_eq!(ns.read::<String>("endpoint").unwrap(), None);
        assert_eq!(ns.read::<SubscriptionOptions>("options").unwrap(), None);
        assert_eq!(ns.read::<String>("auth").unwrap(), None);
        assert_eq!(ns.read::<Jwk>("privateEncKey").unwrap(), None);
    }

    #[test]
    fn test_to_json_projection() {
        let subscription = create(&root_storage());
        let value = subscription.to_json();
        assert_eq!(value["endpoint"], subscription.endpoint());
        assert_eq!(value["expirationTime"], serde_json::Value::Null);
        assert_eq!(value["keys"]["auth"], subscription.auth());
        assert_eq!(value["keys"]["p256dh"], subscription.p256dh());
    }

    #[test]
    fn test_dataless_notification_dispatches_none() {
        let subscription = create(&root_storage());
        let payloads = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&payloads);
        subscription.add_listener(EventKind::Notification, move |event| {
            if let Event::Notification(payload) = event {
                sink.lock().push(payload.clone());
            }
        });

        subscription
            .handle_notification(&Notification {
                channel_id: subscription.channel_id().to_string(),
                version: "v1".to_string(),
                ttl: Some(60),
                data: None,
                headers: None,
            })
            .unwrap();

        assert_eq!(*payloads.lock(), vec![None]);
    }

    #[test]
    fn test_notification_without_aes128gcm_encoding_is_decrypt_fail() {
        let subscription = create(&root_storage());
        let err = subscription
            .handle_notification(&Notification {
                channel_id: subscription.channel_id().to_string(),
                version: "v1".to_string(),
                ttl: Some(60),
                data: Some("abc".to_string()),
                headers: Some(HashMap::from([(
                    "encoding".to_string(),
                    "aesgcm".to_string(),
                )])),
            })
            .unwrap_err();
        assert_eq!(err.ack_code(), AckCode::DecryptFail);
    }

    #[test]
    fn test_undecryptable_payload_is_decrypt_fail_and_fires_nothing() {
        let subscription = create(&root_storage());
        let fired = Arc::new(Mutex::new(false));
        let sink = Arc::clone(&fired);
        subscription.add_listener(EventKind::Notification, move |_| {
            *sink.lock() = true;
        });

        let err = subscription
            .handle_notification(&Notification {
                channel_id: subscription.channel_id().to_string(),
                version: "v1".to_string(),
                ttl: Some(60),
                data: Some("This should have been encrypted".to_string()),
                headers: Some(HashMap::from([(
                    "Content-Encoding".to_string(),
                    "aes128gcm".to_string(),
                )])),
            })
            .unwrap_err();

        assert_eq!(err.ack_code(), AckCode::DecryptFail);
        assert!(!*fired.lock());
    }

    #[tokio::test]
    async fn test_unsubscribe_invokes_callback_with_channel_id() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let unsubscribe: UnsubscribeFn = Arc::new(move |channel_id| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                *sink.lock() = Some(channel_id);
                Ok(())
            })
        });

        let storage = root_storage();
        let subscription = PushSubscription::create(
            "chan".to_string(),
            &storage,
            "https://example.com/push".to_string(),
            options(),
            unsubscribe,
            &Logger::new("test"),
            None,
        )
        .unwrap();

        subscription.unsubscribe().await.unwrap();
        assert_eq!(seen.lock().as_deref(), Some("chan"));
    }
}
