// wpush core — Autopush client engine
//
// One durable WebSocket to an Autopush server, many logical push
// subscriptions multiplexed over it, Web Push crypto per subscription,
// and enough persisted state to resume all of it after a restart.

pub mod codec;
pub mod crypto;
pub mod error;
pub mod event;
pub mod logger;
pub mod manager;
pub mod mediator;
pub mod message;
pub mod session;
pub mod store;
pub mod subscription;

pub use error::{Error, Result};
pub use event::{Event, EventKind, EventManager, ListenerId};
pub use logger::Logger;
pub use manager::{PushManager, PushManagerOptions, ReconnectDelay, DEFAULT_AUTOPUSH_URL};
pub use mediator::{Mediator, MediatorOptions};
pub use message::{AckCode, AckUpdate, ClientMessage, Notification, ServerMessage, UnregisterCode};
pub use store::{MemoryStorage, SledStorage, Storage, StorageBackend};
pub use subscription::{
    PushSubscription, SubscriptionOptions, SubscriptionRegistry,
};
