//! Observable values and their combinators

use crate::reactive::{Callback, CellEvent, ReactiveCell, Subscription};
use parking_lot::Mutex;
use std::sync::Arc;

/// Something with a current value that can be watched for changes.
///
/// `observe` reports future values only; callers read `current` for the
/// present one.
pub trait Observe<T>: Send + Sync + 'static {
    fn current(&self) -> Option<T>;

    fn observe(&self, callback: Callback<T>) -> Subscription;
}

/// A reactive cell observes as its pushed values. Observing an empty cell
/// triggers its population.
impl<T: Clone + Send + Sync + 'static> Observe<T> for ReactiveCell<T> {
    fn current(&self) -> Option<T> {
        self.peek()
    }

    fn observe(&self, callback: Callback<T>) -> Subscription {
        self.watch(move |event| {
            if let CellEvent::Value(value) = event {
                callback(value);
            }
        })
    }
}

/// An absent link stalls: no value, no notifications.
impl<T, O: Observe<T>> Observe<T> for Option<O> {
    fn current(&self) -> Option<T> {
        self.as_ref().and_then(|inner| inner.current())
    }

    fn observe(&self, callback: Callback<T>) -> Subscription {
        match self {
            Some(inner) => inner.observe(callback),
            None => Subscription::empty(),
        }
    }
}

/// A constant that never changes
#[derive(Debug, Clone, PartialEq)]
pub struct Just<T>(pub T);

impl<T: Clone + Send + Sync + 'static> Observe<T> for Just<T> {
    fn current(&self) -> Option<T> {
        Some(self.0.clone())
    }

    fn observe(&self, _callback: Callback<T>) -> Subscription {
        Subscription::empty()
    }
}

type CurrentFn<T> = Arc<dyn Fn() -> Option<T> + Send + Sync>;
type ObserveFn<T> = Arc<dyn Fn(Callback<T>) -> Subscription + Send + Sync>;

/// Type-erased observable, composable with `map`, `switch_map` and the
/// `combine` functions.
pub struct Observation<T> {
    current: CurrentFn<T>,
    observe: ObserveFn<T>,
}

impl<T> Clone for Observation<T> {
    fn clone(&self) -> Self {
        Self {
            current: Arc::clone(&self.current),
            observe: Arc::clone(&self.observe),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Observation<T> {
    pub fn of<O: Observe<T>>(source: O) -> Self {
        let source = Arc::new(source);
        let reader = Arc::clone(&source);
        Self {
            current: Arc::new(move || reader.current()),
            observe: Arc::new(move |callback| source.observe(callback)),
        }
    }

    pub fn map<U, F>(self, f: F) -> Observation<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let read = Arc::clone(&f);
        let current = self.current;
        let observe = self.observe;
        Observation {
            current: Arc::new(move || current().map(|value| read(&value))),
            observe: Arc::new(move |callback: Callback<U>| {
                let f = Arc::clone(&f);
                observe(Arc::new(move |value: &T| callback(&f(value))))
            }),
        }
    }

    /// Follow whatever observable `f` selects from the latest value.
    ///
    /// When this observation changes, the previous inner subscription is
    /// dropped, a new one is made, and the new inner's current value (if
    /// any) is emitted.
    pub fn switch_map<U, O, F>(self, f: F) -> Observation<U>
    where
        U: Clone + Send + Sync + 'static,
        O: Observe<U>,
        F: Fn(&T) -> O + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let read = Arc::clone(&f);
        let outer_current = self.current;
        let read_outer = Arc::clone(&outer_current);
        let outer_observe = self.observe;

        Observation {
            current: Arc::new(move || read_outer().and_then(|outer| read(&outer).current())),
            observe: Arc::new(move |callback: Callback<U>| {
                let inner_sub = Arc::new(Mutex::new(Subscription::empty()));
                let follow = {
                    let inner_sub = Arc::clone(&inner_sub);
                    let f = Arc::clone(&f);
                    move |outer: &T, emit: bool| {
                        let inner = f(outer);
                        let next = inner.observe(Arc::clone(&callback));
                        let previous = std::mem::replace(&mut *inner_sub.lock(), next);
                        drop(previous);
                        if emit {
                            if let Some(value) = inner.current() {
                                callback(&value);
                            }
                        }
                    }
                };

                if let Some(outer) = outer_current() {
                    follow(&outer, false);
                }
                let outer_sub = outer_observe(Arc::new(move |outer: &T| follow(outer, true)));

                Subscription::new(move || {
                    drop(outer_sub);
                    let inner = std::mem::replace(&mut *inner_sub.lock(), Subscription::empty());
                    drop(inner);
                })
            }),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Observe<T> for Observation<T> {
    fn current(&self) -> Option<T> {
        (self.current)()
    }

    fn observe(&self, callback: Callback<T>) -> Subscription {
        (self.observe)(callback)
    }
}

/// Combine-latest of two observations. Emits once both have a value.
pub fn combine2<A, B>(a: Observation<A>, b: Observation<B>) -> Observation<(A, B)>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
{
    let (read_a, read_b) = (a.clone(), b.clone());
    Observation {
        current: Arc::new(move || Some((read_a.current()?, read_b.current()?))),
        observe: Arc::new(move |callback: Callback<(A, B)>| {
            let latest = Arc::new(Mutex::new((a.current(), b.current())));

            let on_a = {
                let latest = Arc::clone(&latest);
                let callback = Arc::clone(&callback);
                move |value: &A| {
                    let pair = {
                        let mut latest = latest.lock();
                        latest.0 = Some(value.clone());
                        latest.1.clone().map(|b| (value.clone(), b))
                    };
                    if let Some(pair) = pair {
                        callback(&pair);
                    }
                }
            };
            let on_b = {
                let latest = Arc::clone(&latest);
                move |value: &B| {
                    let pair = {
                        let mut latest = latest.lock();
                        latest.1 = Some(value.clone());
                        latest.0.clone().map(|a| (a, value.clone()))
                    };
                    if let Some(pair) = pair {
                        callback(&pair);
                    }
                }
            };

            let sub_a = a.observe(Arc::new(on_a));
            let sub_b = b.observe(Arc::new(on_b));
            Subscription::new(move || {
                drop(sub_a);
                drop(sub_b);
            })
        }),
    }
}

/// Combine-latest of three observations.
pub fn combine3<A, B, C>(
    a: Observation<A>,
    b: Observation<B>,
    c: Observation<C>,
) -> Observation<(A, B, C)>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    combine2(combine2(a, b), c).map(|((a, b), c)| (a.clone(), b.clone(), c.clone()))
}
