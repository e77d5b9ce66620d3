//! Property-chain observation
//!
//! A [`PropertyPath`] is a chain of typed accessors from a root model to a
//! value, e.g. `view.selected -> channel cell -> name`. [`when`] resolves
//! the path against a root and yields a [`When`] handle that:
//!
//! - holds the current value at the end of the chain, if every link resolves
//! - follows every link: when an upstream link changes, the downstream
//!   subscription is torn down and rebuilt against the new target
//! - reads through reactive cells (a [`CellProperty`](super::CellProperty)
//!   or a `ReactiveCell` link reports the cell's values)
//! - suppresses consecutive duplicates
//!
//! An absent link (an accessor returning `None`) stalls the chain: no value
//! and no notifications until an upstream link changes.

use super::observe::{combine2, combine3, Observation, Observe};
use crate::reactive::{Callback, Listeners, Subscription};
use futures::channel::mpsc;
use futures::stream::Stream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

type Resolver<R, T> = Arc<dyn Fn(&R) -> Observation<T> + Send + Sync>;

/// Typed chain of accessors from `R` to `T`, built ahead of time.
pub struct PropertyPath<R, T> {
    resolve: Resolver<R, T>,
}

impl<R, T> Clone for PropertyPath<R, T> {
    fn clone(&self) -> Self {
        Self {
            resolve: Arc::clone(&self.resolve),
        }
    }
}

impl<R: 'static, T: Clone + Send + Sync + 'static> PropertyPath<R, T> {
    /// First link: select an observable from the root.
    pub fn new<O, F>(accessor: F) -> Self
    where
        O: Observe<T>,
        F: Fn(&R) -> O + Send + Sync + 'static,
    {
        Self {
            resolve: Arc::new(move |root: &R| Observation::of(accessor(root))),
        }
    }

    /// Next link: select an observable from the current value of this one.
    pub fn then<U, O, F>(&self, accessor: F) -> PropertyPath<R, U>
    where
        U: Clone + Send + Sync + 'static,
        O: Observe<U>,
        F: Fn(&T) -> O + Send + Sync + 'static,
    {
        let head = Arc::clone(&self.resolve);
        let accessor = Arc::new(accessor);
        PropertyPath {
            resolve: Arc::new(move |root: &R| {
                let accessor = Arc::clone(&accessor);
                head(root).switch_map(move |link: &T| accessor(link))
            }),
        }
    }

    /// Project the value at the end of the chain.
    pub fn map<U, F>(&self, f: F) -> PropertyPath<R, U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let head = Arc::clone(&self.resolve);
        let f = Arc::new(f);
        PropertyPath {
            resolve: Arc::new(move |root: &R| {
                let f = Arc::clone(&f);
                head(root).map(move |value| f(value))
            }),
        }
    }

    pub fn resolve(&self, root: &R) -> Observation<T> {
        (self.resolve)(root)
    }
}

struct WhenInner<T> {
    latest: Mutex<Option<T>>,
    listeners: Mutex<Listeners<T>>,
    upstream: Mutex<Option<Subscription>>,
}

impl<T: Clone + PartialEq> WhenInner<T> {
    fn offer(&self, value: &T) {
        {
            let mut latest = self.latest.lock();
            if latest.as_ref() == Some(value) {
                return;
            }
            *latest = Some(value.clone());
        }
        let listeners = self.listeners.lock().snapshot();
        for listener in listeners {
            listener(value);
        }
    }
}

/// Live, deduplicated view of a resolved chain.
///
/// Dropping every clone releases the upstream subscriptions.
pub struct When<T> {
    inner: Arc<WhenInner<T>>,
}

impl<T> Clone for When<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> When<T> {
    pub fn from_observation(observation: Observation<T>) -> Self {
        let inner = Arc::new(WhenInner {
            latest: Mutex::new(None),
            listeners: Mutex::new(Listeners::new()),
            upstream: Mutex::new(None),
        });

        let target: Weak<WhenInner<T>> = Arc::downgrade(&inner);
        let upstream = observation.observe(Arc::new(move |value: &T| {
            if let Some(inner) = target.upgrade() {
                inner.offer(value);
            }
        }));
        *inner.upstream.lock() = Some(upstream);

        if let Some(current) = observation.current() {
            let mut latest = inner.latest.lock();
            if latest.is_none() {
                *latest = Some(current);
            }
        }
        Self { inner }
    }

    pub fn current(&self) -> Option<T> {
        self.inner.latest.lock().clone()
    }

    /// Register `listener`, emitting the current value to it first.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let listener: Callback<T> = Arc::new(listener);
        let current = self.current();
        let subscription = self.listen(Arc::clone(&listener));
        if let Some(value) = current {
            listener(&value);
        }
        subscription
    }

    /// Register `listener` for future distinct values only.
    pub fn watch<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.listen(Arc::new(listener))
    }

    /// Stream of the current value followed by every later distinct value.
    pub fn stream(&self) -> WhenStream<T> {
        let (tx, rx) = mpsc::unbounded();
        if let Some(value) = self.current() {
            let _ = tx.unbounded_send(value);
        }
        let subscription = self.watch(move |value| {
            let _ = tx.unbounded_send(value.clone());
        });
        WhenStream {
            receiver: rx,
            _subscription: subscription,
            _source: self.clone(),
        }
    }

    fn listen(&self, listener: Callback<T>) -> Subscription {
        let id = self.inner.listeners.lock().add(listener);
        let target = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = target.upgrade() {
                inner.listeners.lock().remove(id);
            }
        })
    }
}

impl<T: fmt::Debug> fmt::Debug for When<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("When")
            .field("current", &*self.inner.latest.lock())
            .finish()
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Observe<T> for When<T> {
    fn current(&self) -> Option<T> {
        When::current(self)
    }

    fn observe(&self, callback: Callback<T>) -> Subscription {
        self.listen(callback)
    }
}

/// Async stream over a [`When`]
pub struct WhenStream<T> {
    receiver: mpsc::UnboundedReceiver<T>,
    _subscription: Subscription,
    _source: When<T>,
}

impl<T> Stream for WhenStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.receiver.poll_next_unpin(cx)
    }
}

/// Observe the value at the end of `path`, starting from `root`.
pub fn when<R, T>(root: &R, path: &PropertyPath<R, T>) -> When<T>
where
    R: 'static,
    T: Clone + PartialEq + Send + Sync + 'static,
{
    When::from_observation(path.resolve(root))
}

/// Combine two chains. Emits `combine` over the latest value of each once
/// both have resolved, and again whenever either changes.
pub fn when2<R, A, B, U, F>(
    root: &R,
    first: &PropertyPath<R, A>,
    second: &PropertyPath<R, B>,
    combine: F,
) -> When<U>
where
    R: 'static,
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    U: Clone + PartialEq + Send + Sync + 'static,
    F: Fn(&A, &B) -> U + Send + Sync + 'static,
{
    let joined = combine2(first.resolve(root), second.resolve(root));
    When::from_observation(joined.map(move |(a, b)| combine(a, b)))
}

/// Combine three chains.
pub fn when3<R, A, B, C, U, F>(
    root: &R,
    first: &PropertyPath<R, A>,
    second: &PropertyPath<R, B>,
    third: &PropertyPath<R, C>,
    combine: F,
) -> When<U>
where
    R: 'static,
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
    U: Clone + PartialEq + Send + Sync + 'static,
    F: Fn(&A, &B, &C) -> U + Send + Sync + 'static,
{
    let joined = combine3(first.resolve(root), second.resolve(root), third.resolve(root));
    When::from_observation(joined.map(move |(a, b, c)| combine(a, b, c)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeBus, Property};

    #[derive(Clone)]
    struct Inner {
        b: Property<u32>,
    }

    impl Inner {
        fn new(b: u32) -> Self {
            Self {
                b: Property::new(&ChangeBus::new(), "b", b),
            }
        }
    }

    struct Target {
        a: Property<Option<Inner>>,
        unrelated: Property<u32>,
    }

    fn target(b: u32) -> Target {
        let bus = ChangeBus::new();
        Target {
            a: Property::new(&bus, "a", Some(Inner::new(b))),
            unrelated: Property::new(&bus, "unrelated", 0),
        }
    }

    fn a_b() -> PropertyPath<Target, u32> {
        PropertyPath::new(|t: &Target| t.a.clone())
            .then(|a: &Option<Inner>| a.as_ref().map(|inner| inner.b.clone()))
    }

    fn record(when: &When<u32>) -> (Arc<Mutex<Vec<u32>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = when.subscribe(move |v| sink.lock().push(*v));
        (seen, sub)
    }

    #[test]
    fn test_emits_current_immediately() {
        let root = target(1);
        let observed = when(&root, &a_b());
        let (seen, _sub) = record(&observed);
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[test]
    fn test_follows_replaced_link_and_ignores_unrelated() {
        let root = target(1);
        let observed = when(&root, &a_b());
        let (seen, _sub) = record(&observed);

        let old = root.a.get().unwrap();
        old.b.set(2);
        root.unrelated.set(9);
        root.a.set(Some(Inner::new(3)));
        old.b.set(4);

        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_absent_link_stalls_until_restored() {
        let root = target(1);
        let observed = when(&root, &a_b());
        let (seen, _sub) = record(&observed);

        root.a.set(None);
        root.a.set(Some(Inner::new(5)));
        assert_eq!(*seen.lock(), vec![1, 5]);
    }

    #[test]
    fn test_consecutive_duplicates_suppressed() {
        let root = target(1);
        let observed = when(&root, &a_b());
        let (seen, _sub) = record(&observed);

        root.a.set(Some(Inner::new(1)));
        root.a.get().unwrap().b.set(1);
        root.a.get().unwrap().b.set(2);
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_when2_combines_latest() {
        let root = target(2);
        let unrelated = PropertyPath::new(|t: &Target| t.unrelated.clone());
        let sum = when2(&root, &a_b(), &unrelated, |b, u| b + u);
        let (seen, _sub) = record(&sum);

        root.unrelated.set(10);
        root.a.get().unwrap().b.set(3);
        assert_eq!(*seen.lock(), vec![2, 12, 13]);
    }

    #[tokio::test]
    async fn test_stream_yields_distinct_values() {
        let root = target(1);
        let observed = when(&root, &a_b());
        let mut values = observed.stream();

        root.a.get().unwrap().b.set(2);
        assert_eq!(values.next().await, Some(1));
        assert_eq!(values.next().await, Some(2));
    }
}
