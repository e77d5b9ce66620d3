//! Per-instance change notifications

use crate::reactive::{Listeners, Subscription};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_MODEL_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of the model instance that owns a bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(u64);

impl ModelId {
    fn next() -> Self {
        Self(NEXT_MODEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "model#{}", self.0)
    }
}

/// Which half of a write a notification describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangePhase {
    /// Before the write; carries the old value
    Changing,
    /// After the write; carries the new value
    Changed,
}

/// One half of a property write
#[derive(Clone)]
pub struct ChangeNotification {
    pub sender: ModelId,
    pub property: &'static str,
    pub phase: ChangePhase,
    value: Arc<dyn Any + Send + Sync>,
}

impl ChangeNotification {
    pub(crate) fn new<T: Send + Sync + 'static>(
        sender: ModelId,
        property: &'static str,
        phase: ChangePhase,
        value: T,
    ) -> Self {
        Self {
            sender,
            property,
            phase,
            value: Arc::new(value),
        }
    }

    /// The carried value, if it has type `T`
    pub fn value<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }
}

impl fmt::Debug for ChangeNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeNotification")
            .field("sender", &self.sender)
            .field("property", &self.property)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

struct BusInner {
    id: ModelId,
    listeners: Mutex<Listeners<ChangeNotification>>,
}

/// Broadcasts before/after notifications for every property of one model
/// instance. Property names are unique per bus.
#[derive(Clone)]
pub struct ChangeBus {
    inner: Arc<BusInner>,
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                id: ModelId::next(),
                listeners: Mutex::new(Listeners::new()),
            }),
        }
    }

    pub fn id(&self) -> ModelId {
        self.inner.id
    }

    /// Receive every notification on this bus.
    pub fn listen<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ChangeNotification) + Send + Sync + 'static,
    {
        let id = self.inner.listeners.lock().add(Arc::new(listener));
        let bus = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = bus.upgrade() {
                inner.listeners.lock().remove(id);
            }
        })
    }

    /// Receive notifications for one property only.
    pub fn listen_to<F>(&self, property: &'static str, listener: F) -> Subscription
    where
        F: Fn(&ChangeNotification) + Send + Sync + 'static,
    {
        self.listen(move |notification| {
            if notification.property == property {
                listener(notification);
            }
        })
    }

    pub(crate) fn emit(&self, notification: &ChangeNotification) {
        let listeners = self.inner.listeners.lock().snapshot();
        for listener in listeners {
            listener(notification);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}

impl fmt::Debug for ChangeBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeBus")
            .field("id", &self.inner.id)
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_to_filters_by_property() {
        let bus = ChangeBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.listen_to("name", move |n| {
            sink.lock().push((n.phase, n.value::<u32>().copied()));
        });

        bus.emit(&ChangeNotification::new(bus.id(), "other", ChangePhase::Changed, 1u32));
        bus.emit(&ChangeNotification::new(bus.id(), "name", ChangePhase::Changed, 2u32));

        assert_eq!(*seen.lock(), vec![(ChangePhase::Changed, Some(2))]);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(ChangeBus::new().id(), ChangeBus::new().id());
    }

    #[test]
    fn test_dropped_subscription_stops_delivery() {
        let bus = ChangeBus::new();
        let sub = bus.listen(|_| {});
        assert_eq!(bus.listener_count(), 1);
        drop(sub);
        assert_eq!(bus.listener_count(), 0);
    }
}
