//! Self-refreshing value slot
//!
//! A [`ReactiveCell`] holds at most one value and at most one active source.
//! Reading or subscribing to an empty cell that has a factory populates it,
//! and concurrent readers share that single population attempt.
//!
//! # Invariants
//!
//! 1. At most one source feeds the cell. Attaching a source tears down the
//!    previous one first, and values from a torn-down source are dropped
//!    even if its task has not observed the abort yet.
//! 2. The factory runs at most once per empty period: concurrent
//!    `value()`/`subscribe()` calls before resolution share one attempt.
//! 3. A failed population is not retried by the cell. The error is held
//!    until the next successful push or `invalidate()`.

use super::merge::{Merge, UpdateStrategy};
use super::source::Source;
use super::subscription::{Callback, Listeners, Subscription};
use crate::error::{Result, StoreError};
use futures::StreamExt;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Factory invoked to populate an empty cell.
pub type CellFactory<T> = Arc<dyn Fn() -> Source<T> + Send + Sync>;

/// Event delivered to cell subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum CellEvent<T> {
    Value(T),
    Error(StoreError),
}

/// Merge functions captured where `T: Merge` is known.
pub(crate) struct Merger<T> {
    merge: fn(&mut T, T),
    is_absent: fn(&T) -> bool,
}

impl<T> Clone for Merger<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Merger<T> {}

impl<T: Merge> Merger<T> {
    pub(crate) fn of() -> Self {
        Self {
            merge: |current, update| current.merge_from(update),
            is_absent: |value| value.is_absent(),
        }
    }
}

struct ActiveSource {
    generation: u64,
    task: Option<JoinHandle<()>>,
    population: bool,
}

impl ActiveSource {
    fn stop(self) {
        if let Some(task) = self.task {
            task.abort();
        }
    }
}

struct CellState<T> {
    value: Option<T>,
    error: Option<StoreError>,
    source: Option<ActiveSource>,
    generation: u64,
    listeners: Listeners<CellEvent<T>>,
}

struct CellInner<T> {
    label: String,
    state: Mutex<CellState<T>>,
    factory: Option<CellFactory<T>>,
    merger: Option<Merger<T>>,
    version: watch::Sender<u64>,
}

impl<T> Drop for CellInner<T> {
    fn drop(&mut self) {
        if let Some(source) = self.state.get_mut().source.take() {
            source.stop();
        }
    }
}

/// Builder for [`ReactiveCell`]
pub struct CellBuilder<T> {
    label: String,
    factory: Option<CellFactory<T>>,
    merger: Option<Merger<T>>,
    initial: Option<T>,
}

impl<T: Clone + Send + Sync + 'static> CellBuilder<T> {
    /// Name used in log output
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Populate the cell from `factory` whenever it is read while empty
    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Source<T> + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Start with a value already present
    pub fn initial(mut self, value: T) -> Self {
        self.initial = Some(value);
        self
    }

    /// Use the merge strategy instead of overwrite
    pub fn merge(mut self) -> Self
    where
        T: Merge,
    {
        self.merger = Some(Merger::of());
        self
    }

    pub(crate) fn merger(mut self, merger: Option<Merger<T>>) -> Self {
        self.merger = merger;
        self
    }

    pub fn build(self) -> ReactiveCell<T> {
        let (version, _) = watch::channel(0);
        ReactiveCell {
            inner: Arc::new(CellInner {
                label: self.label,
                state: Mutex::new(CellState {
                    value: self.initial,
                    error: None,
                    source: None,
                    generation: 0,
                    listeners: Listeners::new(),
                }),
                factory: self.factory,
                merger: self.merger,
                version,
            }),
        }
    }
}

/// One lazily populated, observable value slot.
///
/// Clones share the same slot.
pub struct ReactiveCell<T> {
    inner: Arc<CellInner<T>>,
}

impl<T> Clone for ReactiveCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for ReactiveCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> ReactiveCell<T> {
    pub fn builder() -> CellBuilder<T> {
        CellBuilder {
            label: "cell".to_string(),
            factory: None,
            merger: None,
            initial: None,
        }
    }

    /// Empty overwrite cell without a factory
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Overwrite cell holding `value`
    pub fn with_value(value: T) -> Self {
        Self::builder().initial(value).build()
    }

    /// Overwrite cell populated by `factory`
    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn() -> Source<T> + Send + Sync + 'static,
    {
        Self::builder().factory(factory).build()
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn strategy(&self) -> UpdateStrategy {
        if self.inner.merger.is_some() {
            UpdateStrategy::Merge
        } else {
            UpdateStrategy::Overwrite
        }
    }

    pub fn has_value(&self) -> bool {
        self.inner.state.lock().value.is_some()
    }

    /// Current value without triggering population
    pub fn peek(&self) -> Option<T> {
        self.inner.state.lock().value.clone()
    }

    pub fn last_error(&self) -> Option<StoreError> {
        self.inner.state.lock().error.clone()
    }

    /// Whether a source is currently attached
    pub fn has_source(&self) -> bool {
        self.inner.state.lock().source.is_some()
    }

    /// Whether the factory is currently running
    pub fn is_populating(&self) -> bool {
        self.inner
            .state
            .lock()
            .source
            .as_ref()
            .is_some_and(|source| source.population)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.state.lock().listeners.len()
    }

    /// Whether both handles point at the same slot
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Read the value, populating the cell first if it is empty.
    ///
    /// Returns the held error if the last population (or `set_error`)
    /// failed. If the population is detached before it resolves, the
    /// factory runs again. An empty cell with neither factory nor source
    /// waits for the next push.
    pub async fn value(&self) -> Result<T> {
        let mut changes = self.inner.version.subscribe();
        loop {
            let claimed = {
                let mut guard = self.inner.state.lock();
                let state = &mut *guard;
                if let Some(error) = &state.error {
                    return Err(error.clone());
                }
                if let Some(value) = &state.value {
                    return Ok(value.clone());
                }
                self.claim_population(state)
            };
            if let Some(generation) = claimed {
                self.start_population(generation);
            }
            if changes.changed().await.is_err() {
                return Err(StoreError::Closed);
            }
        }
    }

    /// Register `observer`, replaying the current value (or error) first.
    ///
    /// Subscribing to an empty cell triggers population.
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&CellEvent<T>) + Send + Sync + 'static,
    {
        self.listen(Arc::new(observer), true)
    }

    /// Register `observer` for future events only.
    ///
    /// Like `subscribe`, this triggers population of an empty cell.
    pub fn watch<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&CellEvent<T>) + Send + Sync + 'static,
    {
        self.listen(Arc::new(observer), false)
    }

    /// Push a value using the cell's strategy.
    pub fn push(&self, value: T) {
        if let Some(current) = self.apply(None, value) {
            self.notify(CellEvent::Value(current));
        }
    }

    /// Hold `error` and deliver it to every subscriber.
    pub fn set_error(&self, error: StoreError) {
        self.fail(None, error);
    }

    /// Drop the value, any held error and the active source.
    ///
    /// Subscribers stay registered; the next read or subscribe runs the
    /// factory again.
    pub fn invalidate(&self) {
        let previous = {
            let mut state = self.inner.state.lock();
            state.value = None;
            state.error = None;
            state.generation += 1;
            state.source.take()
        };
        if let Some(source) = previous {
            source.stop();
        }
        debug!(cell = %self.inner.label, "Cell invalidated");
        self.bump();
    }

    /// Invalidate and start a new population immediately.
    pub fn refresh(&self) {
        self.invalidate();
        let claimed = {
            let mut state = self.inner.state.lock();
            self.claim_population(&mut state)
        };
        if let Some(generation) = claimed {
            self.start_population(generation);
        }
    }

    /// Make `source` the one source feeding this cell.
    pub fn attach(&self, source: Source<T>) {
        let (generation, previous) = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            let generation = state.generation;
            let previous = state.source.replace(ActiveSource {
                generation,
                task: None,
                population: false,
            });
            (generation, previous)
        };
        if let Some(previous) = previous {
            previous.stop();
            debug!(cell = %self.inner.label, "Replaced active source");
        }
        self.run_source(generation, source);
    }

    /// Stop the active source, keeping the value.
    ///
    /// Readers still waiting on an empty cell wake up and claim a fresh
    /// population from the factory.
    pub fn detach(&self) {
        let previous = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.source.take()
        };
        if let Some(previous) = previous {
            previous.stop();
            debug!(cell = %self.inner.label, "Detached source");
        }
        self.bump();
    }

    fn listen(&self, callback: Callback<CellEvent<T>>, replay: bool) -> Subscription {
        let (id, current, claimed) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let id = state.listeners.add(Arc::clone(&callback));
            let current = match (&state.error, &state.value) {
                (Some(error), _) if replay => Some(CellEvent::Error(error.clone())),
                (None, Some(value)) if replay => Some(CellEvent::Value(value.clone())),
                _ => None,
            };
            let claimed = if state.value.is_none() && state.error.is_none() {
                self.claim_population(state)
            } else {
                None
            };
            (id, current, claimed)
        };

        if let Some(event) = current {
            callback(&event);
        }
        if let Some(generation) = claimed {
            self.start_population(generation);
        }

        let cell = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = cell.upgrade() {
                inner.state.lock().listeners.remove(id);
            }
        })
    }

    /// Reserve the population slot. The factory itself runs outside the lock.
    fn claim_population(&self, state: &mut CellState<T>) -> Option<u64> {
        if state.source.is_some() || self.inner.factory.is_none() {
            return None;
        }
        state.generation += 1;
        state.source = Some(ActiveSource {
            generation: state.generation,
            task: None,
            population: true,
        });
        Some(state.generation)
    }

    fn start_population(&self, generation: u64) {
        let Some(factory) = &self.inner.factory else {
            return;
        };
        debug!(cell = %self.inner.label, generation, "Populating cell");
        let source = factory();
        self.run_source(generation, source);
    }

    fn run_source(&self, generation: u64, source: Source<T>) {
        let task = spawn_driver(Arc::downgrade(&self.inner), generation, source);
        let mut state = self.inner.state.lock();
        match state.source.as_mut() {
            Some(active) if active.generation == generation => active.task = Some(task),
            _ => task.abort(),
        }
    }

    /// Apply `value` to the slot. Returns the resulting value to broadcast,
    /// or `None` if the push was dropped.
    fn apply(&self, generation: Option<u64>, value: T) -> Option<T> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if let Some(generation) = generation {
            if !is_current(state, generation) {
                return None;
            }
        }

        let next = match self.inner.merger {
            Some(merger) => {
                if (merger.is_absent)(&value) {
                    let error = StoreError::MergeMisuse(self.inner.label.clone());
                    warn!(cell = %self.inner.label, %error, "Dropping absent value");
                    return None;
                }
                match state.value.take() {
                    Some(mut current) => {
                        (merger.merge)(&mut current, value);
                        current
                    }
                    None => value,
                }
            }
            None => value,
        };

        state.value = Some(next.clone());
        state.error = None;
        Some(next)
    }

    fn fail(&self, generation: Option<u64>, error: StoreError) {
        {
            let mut state = self.inner.state.lock();
            if let Some(generation) = generation {
                if !is_current(&state, generation) {
                    return;
                }
            }
            state.error = Some(error.clone());
        }
        debug!(cell = %self.inner.label, %error, "Cell failed");
        self.notify(CellEvent::Error(error));
    }

    fn finish_source(&self, generation: u64, produced: bool) {
        let failure = {
            let mut state = self.inner.state.lock();
            if !is_current(&state, generation) {
                return;
            }
            state.source = None;
            if !produced && state.value.is_none() && state.error.is_none() {
                let error = StoreError::Population(format!(
                    "{} source ended without a value",
                    self.inner.label
                ));
                state.error = Some(error.clone());
                Some(error)
            } else {
                None
            }
        };
        match failure {
            Some(error) => self.notify(CellEvent::Error(error)),
            None => self.bump(),
        }
    }

    fn notify(&self, event: CellEvent<T>) {
        self.bump();
        let listeners = self.inner.state.lock().listeners.snapshot();
        for listener in listeners {
            listener(&event);
        }
    }

    fn bump(&self) {
        self.inner.version.send_modify(|version| *version += 1);
    }
}

fn is_current<T>(state: &CellState<T>, generation: u64) -> bool {
    state
        .source
        .as_ref()
        .is_some_and(|source| source.generation == generation)
}

fn spawn_driver<T>(target: Weak<CellInner<T>>, generation: u64, mut source: Source<T>) -> JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut produced = false;
        while let Some(item) = source.next().await {
            let Some(inner) = target.upgrade() else {
                return;
            };
            let cell = ReactiveCell { inner };
            match item {
                Ok(value) => {
                    produced = true;
                    if let Some(current) = cell.apply(Some(generation), value) {
                        cell.notify(CellEvent::Value(current));
                    }
                }
                Err(error) => cell.fail(Some(generation), error),
            }
        }
        if let Some(inner) = target.upgrade() {
            ReactiveCell { inner }.finish_source(generation, produced);
        }
    })
}

impl<T> fmt::Debug for ReactiveCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ReactiveCell")
            .field("label", &self.inner.label)
            .field("has_value", &state.value.is_some())
            .field("error", &state.error)
            .field("has_source", &state.source.is_some())
            .finish()
    }
}
