//! Observable model properties
//!
//! Every write to a [`Property`] publishes a `Changing` notification carrying
//! the old value and then a `Changed` notification carrying the new one on
//! the owning model's [`ChangeBus`]. The pair is emitted under the property's
//! write lock with no suspension in between.

use super::bus::{ChangeBus, ChangeNotification, ChangePhase};
use super::observe::{Observation, Observe};
use crate::reactive::{Callback, ReactiveCell, Subscription};
use parking_lot::{ReentrantMutex, RwLock};
use std::fmt;
use std::sync::Arc;

struct PropertyInner<T> {
    bus: ChangeBus,
    name: &'static str,
    value: RwLock<T>,
    write: ReentrantMutex<()>,
}

/// A named, observable value on a model instance.
pub struct Property<T> {
    inner: Arc<PropertyInner<T>>,
}

impl<T> Clone for Property<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Property<T> {
    pub fn new(bus: &ChangeBus, name: &'static str, initial: T) -> Self {
        Self {
            inner: Arc::new(PropertyInner {
                bus: bus.clone(),
                name,
                value: RwLock::new(initial),
                write: ReentrantMutex::new(()),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.inner.bus
    }

    pub fn get(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Write `value`, emitting the changing/changed pair.
    ///
    /// A listener may write the same property again from inside its
    /// callback; that nested write completes before the outer one returns.
    pub fn set(&self, value: T) {
        let _writing = self.inner.write.lock();
        let old = self.get();
        self.emit(ChangePhase::Changing, old);
        *self.inner.value.write() = value.clone();
        self.emit(ChangePhase::Changed, value);
    }

    /// Apply `f` to a copy of the value and write the result.
    pub fn update<F: FnOnce(&mut T)>(&self, f: F) {
        let _writing = self.inner.write.lock();
        let mut next = self.get();
        f(&mut next);
        self.set(next);
    }

    /// Receive each new value after it is written.
    pub fn observe_changes<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.inner.bus.listen_to(self.inner.name, move |notification| {
            if notification.phase != ChangePhase::Changed {
                return;
            }
            if let Some(value) = notification.value::<T>() {
                listener(value);
            }
        })
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn emit(&self, phase: ChangePhase, value: T) {
        let notification = ChangeNotification::new(self.inner.bus.id(), self.inner.name, phase, value);
        self.inner.bus.emit(&notification);
    }
}

impl<T: Clone + Send + Sync + 'static> Observe<T> for Property<T> {
    fn current(&self) -> Option<T> {
        Some(self.get())
    }

    fn observe(&self, callback: Callback<T>) -> Subscription {
        self.observe_changes(move |value| callback(value))
    }
}

impl<T: fmt::Debug> fmt::Debug for Property<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("name", &self.inner.name)
            .field("value", &*self.inner.value.read())
            .finish()
    }
}

/// Read-only property fed by an observable source.
///
/// Each value the source pushes is written through the usual
/// changing/changed pair. Outside code cannot write it.
pub struct DerivedProperty<T> {
    property: Property<Option<T>>,
    _feed: Arc<Subscription>,
}

impl<T> Clone for DerivedProperty<T> {
    fn clone(&self) -> Self {
        Self {
            property: self.property.clone(),
            _feed: Arc::clone(&self._feed),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> DerivedProperty<T> {
    pub fn from_observable<O: Observe<T>>(bus: &ChangeBus, name: &'static str, source: O) -> Self {
        let property = Property::new(bus, name, source.current());
        let sink = property.clone();
        let feed = source.observe(Arc::new(move |value: &T| sink.set(Some(value.clone()))));
        // The feed owns the source so handles like `When` stay alive with it.
        let feed = Subscription::new(move || {
            drop(feed);
            drop(source);
        });
        Self {
            property,
            _feed: Arc::new(feed),
        }
    }

    pub fn name(&self) -> &'static str {
        self.property.name()
    }

    pub fn get(&self) -> Option<T> {
        self.property.get()
    }
}

impl<T: Clone + Send + Sync + 'static> Observe<T> for DerivedProperty<T> {
    fn current(&self) -> Option<T> {
        self.get()
    }

    fn observe(&self, callback: Callback<T>) -> Subscription {
        self.property.observe_changes(move |value| {
            if let Some(value) = value {
                callback(value);
            }
        })
    }
}

/// Property whose value is a reactive cell.
///
/// Observing it reads through the cell: the current value is the cell's
/// value, and both replacing the cell and pushes into the current cell are
/// reported.
pub struct CellProperty<T> {
    property: Property<Option<ReactiveCell<T>>>,
}

impl<T> Clone for CellProperty<T> {
    fn clone(&self) -> Self {
        Self {
            property: self.property.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> CellProperty<T> {
    pub fn new(bus: &ChangeBus, name: &'static str) -> Self {
        Self {
            property: Property::new(bus, name, None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.property.name()
    }

    pub fn cell(&self) -> Option<ReactiveCell<T>> {
        self.property.get()
    }

    pub fn set_cell(&self, cell: Option<ReactiveCell<T>>) {
        self.property.set(cell);
    }

    /// The current cell's value without triggering population
    pub fn peek(&self) -> Option<T> {
        self.cell().and_then(|cell| cell.peek())
    }

    fn through(&self) -> Observation<T> {
        Observation::of(self.property.clone()).switch_map(|cell: &Option<ReactiveCell<T>>| cell.clone())
    }
}

impl<T: Clone + Send + Sync + 'static> Observe<T> for CellProperty<T> {
    fn current(&self) -> Option<T> {
        self.peek()
    }

    fn observe(&self, callback: Callback<T>) -> Subscription {
        self.through().observe(callback)
    }
}
