// Subscription registry — channel-id → subscription map plus the
// persisted `channelIDs` bookkeeping

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::event::EventManager;
use crate::logger::Logger;
use crate::mediator::Mediator;
use crate::store::Storage;
use crate::subscription::{PushSubscription, SubscriptionOptions, UnsubscribeFn};

pub const KEY_CHANNEL_IDS: &str = "channelIDs";

/// Exclusive owner of the live subscriptions for one manager.
pub struct SubscriptionRegistry {
    storage: Storage,
    log: Logger,
    subscriptions: RwLock<HashMap<String, Arc<PushSubscription>>>,
    unsubscribe: UnsubscribeFn,
}

impl SubscriptionRegistry {
    /// Build the registry and recover every persisted channel. Channels
    /// whose state fails to load are logged and skipped; the rest of the
    /// session stays usable.
    pub fn new(storage: Storage, log: Logger, unsubscribe: UnsubscribeFn) -> Result<Self> {
        let channel_ids: Vec<String> = storage.read(KEY_CHANNEL_IDS)?.unwrap_or_default();

        let mut subscriptions = HashMap::new();
        for channel_id in channel_ids {
            match PushSubscription::recover(
                channel_id.clone(),
                &storage,
                Arc::clone(&unsubscribe),
                &log,
            ) {
                Ok(subscription) => {
                    subscriptions.insert(channel_id, subscription);
                }
                Err(e) => {
                    log.warn(format!("skipping unrecoverable channel {channel_id}: {e}"));
                }
            }
        }
        if !subscriptions.is_empty() {
            log.info(format!("recovered {} subscription(s)", subscriptions.len()));
        }

        Ok(Self {
            storage,
            log,
            subscriptions: RwLock::new(subscriptions),
            unsubscribe,
        })
    }

    /// Construct a subscription for a server-confirmed registration and
    /// persist the updated channel set.
    pub fn add(
        &self,
        channel_id: String,
        endpoint: String,
        options: SubscriptionOptions,
        events: Option<EventManager>,
    ) -> Result<Arc<PushSubscription>> {
        let subscription = PushSubscription::create(
            channel_id.clone(),
            &self.storage,
            endpoint,
            options,
            Arc::clone(&self.unsubscribe),
            &self.log,
            events,
        )?;
        self.subscriptions
            .write()
            .insert(channel_id, Arc::clone(&subscription));
        self.save_channel_ids()?;
        Ok(subscription)
    }

    pub fn get(&self, channel_id: &str) -> Option<Arc<PushSubscription>> {
        self.subscriptions.read().get(channel_id).cloned()
    }

    pub fn get_by_application_server_key(&self, key: &str) -> Option<Arc<PushSubscription>> {
        self.subscriptions
            .read()
            .values()
            .find(|subscription| subscription.application_server_key() == key)
            .cloned()
    }

    /// Destroy a subscription's persisted state and drop it from the map.
    pub fn remove(&self, channel_id: &str) -> Result<()> {
        if let Some(subscription) = self.subscriptions.write().remove(channel_id) {
            subscription.destroy()?;
        }
        self.save_channel_ids()
    }

    pub fn channel_ids(&self) -> Vec<String> {
        self.subscriptions.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.read().is_empty()
    }

    /// Re-register every subscription after a UAID rotation. Each survivor
    /// is replaced by a fresh subscription (new channel id and keys, same
    /// application server key); the originals are destroyed and forgotten.
    pub async fn re_init_all(&self, mediator: &Arc<Mediator>) {
        let snapshot: Vec<Arc<PushSubscription>> =
            self.subscriptions.read().values().cloned().collect();
        self.log
            .info(format!("re-registering {} subscription(s)", snapshot.len()));

        for original in snapshot {
            match original.re_init(mediator).await {
                Ok(replacement) => {
                    self.log.debug(format!(
                        "channel {} replaced by {}",
                        original.channel_id(),
                        replacement.channel_id()
                    ));
                    if let Err(e) = original.destroy() {
                        self.log.warn(format!(
                            "failed to destroy rotated channel {}: {e}",
                            original.channel_id()
                        ));
                    }
                    self.subscriptions.write().remove(original.channel_id());
                    if let Err(e) = self.save_channel_ids() {
                        self.log.warn(format!("failed to persist channel set: {e}"));
                    }
                }
                Err(e) => {
                    self.log.warn(format!(
                        "failed to re-register channel {}: {e}",
                        original.channel_id()
                    ));
                }
            }
        }
    }

    fn save_channel_ids(&self) -> Result<()> {
        self.storage.write(KEY_CHANNEL_IDS, &self.channel_ids())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;

    fn noop_unsubscribe() -> UnsubscribeFn {
        Arc::new(|_| Box::pin(async { Ok(()) }))
    }

    fn options(key: &str) -> SubscriptionOptions {
        SubscriptionOptions {
            user_visible_only: true,
            application_server_key: key.to_string(),
        }
    }

    fn registry(storage: &Storage) -> SubscriptionRegistry {
        SubscriptionRegistry::new(storage.clone(), Logger::new("test"), noop_unsubscribe())
            .unwrap()
    }

    #[test]
    fn test_add_persists_channel_set() {
        let storage = Storage::new(Arc::new(MemoryStorage::new()));
        let registry = registry(&storage);

        registry
            .add(
                "chan-1".to_string(),
                "https://example.com/push/1".to_string(),
                options("key-a"),
                None,
            )
            .unwrap();

        assert_eq!(
            storage.read::<Vec<String>>(KEY_CHANNEL_IDS).unwrap(),
            Some(vec!["chan-1".to_string()])
        );
        assert!(registry.get("chan-1").is_some());
    }

    #[test]
    fn test_lookup_by_application_server_key() {
        let storage = Storage::new(Arc::new(MemoryStorage::new()));
        let registry = registry(&storage);
        registry
            .add(
                "chan-1".to_string(),
                "https://example.com/push/1".to_string(),
                options("key-a"),
                None,
            )
            .unwrap();
        registry
            .add(
                "chan-2".to_string(),
                "https://example.com/push/2".to_string(),
                options("key-b"),
                None,
            )
            .unwrap();

        let found = registry.get_by_application_server_key("key-b").unwrap();
        assert_eq!(found.channel_id(), "chan-2");
        assert!(registry.get_by_application_server_key("key-c").is_none());
    }

    #[test]
    fn test_remove_destroys_state_and_updates_channel_set() {
        let storage = Storage::new(Arc::new(MemoryStorage::new()));
        let registry = registry(&storage);
        registry
            .add(
                "chan-1".to_string(),
                "https://example.com/push/1".to_string(),
                options("key-a"),
                None,
            )
            .unwrap();

        registry.remove("chan-1").unwrap();

        assert!(registry.get("chan-1").is_none());
        assert_eq!(
            storage.read::<Vec<String>>(KEY_CHANNEL_IDS).unwrap(),
            Some(Vec::new())
        );
        assert_eq!(
            storage.extend("chan-1").read::<String>("endpoint").unwrap(),
            None
        );
    }

    #[test]
    fn test_new_recovers_persisted_channels() {
        let storage = Storage::new(Arc::new(MemoryStorage::new()));
        {
            let registry = registry(&storage);
            registry
                .add(
                    "chan-1".to_string(),
                    "https://example.com/push/1".to_string(),
                    options("key-a"),
                    None,
                )
                .unwrap();
        }

        let reloaded = registry(&storage);
        assert_eq!(reloaded.len(), 1);
        let recovered = reloaded.get("chan-1").unwrap();
        assert_eq!(recovered.endpoint(), "https://example.com/push/1");
    }

    #[test]
    fn test_new_skips_unrecoverable_channels() {
        let storage = Storage::new(Arc::new(MemoryStorage::new()));
        {
            let registry = registry(&storage);
            registry
                .add(
                    "chan-good".to_string(),
                    "https://example.com/push/1".to_string(),
                    options("key-a"),
                    None,
                )
                .unwrap();
        }
        // A channel listed in channelIDs with no persisted state behind it
        storage
            .write(
                KEY_CHANNEL_IDS,
                &vec!["chan-good".to_string(), "chan-ghost".to_string()],
            )
            .unwrap();

        let reloaded = registry(&storage);
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.get("chan-good").is_some());
        assert!(reloaded.get("chan-ghost").is_none());
    }
}
