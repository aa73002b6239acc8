// Event manager — topic-keyed listener registry with stable listener ids

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::logger::Logger;

/// Events a push subscription can emit to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A push message arrived. `None` means a keepalive notification that
    /// carried no payload.
    Notification(Option<String>),
    /// The subscription was recreated (UAID rotation); carries the JSON
    /// projection of the replacement subscription.
    PushSubscriptionChange(serde_json::Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Notification,
    PushSubscriptionChange,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Notification(_) => EventKind::Notification,
            Event::PushSubscriptionChange(_) => EventKind::PushSubscriptionChange,
        }
    }
}

/// Stable identifier handed back by `add_listener` so listeners can be
/// removed without relying on callback identity.
pub type ListenerId = Uuid;

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Topic → listener map. Cloning shares the listener table, which is what
/// lets a recreated subscription inherit its predecessor's listeners.
#[derive(Clone)]
pub struct EventManager {
    listeners: Arc<Mutex<HashMap<EventKind, Vec<(ListenerId, Callback)>>>>,
    log: Logger,
}

impl EventManager {
    pub fn new(log: Logger) -> Self {
        Self {
            listeners: Arc::new(Mutex::new(HashMap::new())),
            log,
        }
    }

    pub fn add_listener(
        &self,
        kind: EventKind,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = Uuid::new_v4();
        self.listeners
            .lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Returns whether a listener with that id was registered.
    pub fn remove_listener(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(entries) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Dispatch synchronously, in registration order, over a snapshot of the
    /// listener list. A panicking listener is logged and does not stop the
    /// remaining listeners.
    pub fn dispatch(&self, event: &Event) {
        let snapshot: Vec<(ListenerId, Callback)> = self
            .listeners
            .lock()
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();

        for (id, callback) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                self.log.error(format!(
                    "listener {id} panicked while handling {:?}",
                    event.kind()
                ));
            }
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .lock()
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> EventManager {
        EventManager::new(Logger::new("test"))
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let events = manager();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            events.add_listener(EventKind::Notification, move |_| {
                seen.lock().push(tag);
            });
        }

        events.dispatch(&Event::Notification(Some("payload".into())));
        assert_eq!(*seen.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_listener_receives_payload() {
        let events = manager();
        let received = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&received);
        events.add_listener(EventKind::Notification, move |event| {
            if let Event::Notification(payload) = event {
                *sink.lock() = Some(payload.clone());
            }
        });

        events.dispatch(&Event::Notification(None));
        assert_eq!(*received.lock(), Some(None));
    }

    #[test]
    fn test_remove_listener_by_id() {
        let events = manager();
        let count = Arc::new(Mutex::new(0u32));
        let sink = Arc::clone(&count);
        let id = events.add_listener(EventKind::Notification, move |_| {
            *sink.lock() += 1;
        });

        events.dispatch(&Event::Notification(None));
        assert!(events.remove_listener(EventKind::Notification, id));
        assert!(!events.remove_listener(EventKind::Notification, id));
        events.dispatch(&Event::Notification(None));

        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_block_later_ones() {
        let events = manager();
        let reached = Arc::new(Mutex::new(false));

        events.add_listener(EventKind::Notification, |_| {
            panic!("listener blew up");
        });
        let sink = Arc::clone(&reached);
        events.add_listener(EventKind::Notification, move |_| {
            *sink.lock() = true;
        });

        events.dispatch(&Event::Notification(None));
        assert!(*reached.lock());
    }

    #[test]
    fn test_listener_may_mutate_listeners_during_dispatch() {
        let events = manager();
        let inner = events.clone();
        let fired = Arc::new(Mutex::new(0u32));

        let sink = Arc::clone(&fired);
        events.add_listener(EventKind::Notification, move |_| {
            *sink.lock() += 1;
            // Registering from inside dispatch must not deadlock or fire
            // within the current dispatch (snapshot iteration).
            inner.add_listener(EventKind::Notification, |_| {});
        });

        events.dispatch(&Event::Notification(None));
        assert_eq!(*fired.lock(), 1);
        assert_eq!(events.listener_count(EventKind::Notification), 2);
    }

    #[test]
    fn test_kinds_are_isolated() {
        let events = manager();
        let fired = Arc::new(Mutex::new(false));
        let sink = Arc::clone(&fired);
        events.add_listener(EventKind::PushSubscriptionChange, move |_| {
            *sink.lock() = true;
        });

        events.dispatch(&Event::Notification(None));
        assert!(!*fired.lock());
    }
}
