// Subscription module — per-channel push state and the registry that owns it

mod registry;
#[allow(clippy::module_inception)]
mod subscription;

pub use registry::{SubscriptionRegistry, KEY_CHANNEL_IDS};
pub use subscription::{
    NotificationError, PushSubscription, SubscriptionOptions, UnsubscribeFn,
};
