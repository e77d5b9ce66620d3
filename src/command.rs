//! Single-flight commands
//!
//! A [`Command`] wraps a zero-argument producer. While one execution is in
//! flight every `execute()` returns that same execution; once it settles the
//! next call runs the producer again.
//!
//! Successful results are pushed into a replay-latest [`ReactiveCell`] that
//! starts at a caller-supplied seed. Failures go only to the error channel,
//! so bindings on the result keep working after a failed run.

use crate::error::{Result, StoreError};
use crate::reactive::{ReactiveCell, Source};
use futures::future::{self, BoxFuture, FutureExt, Shared};
use futures::StreamExt;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// A running (or settled) execution. Clones await the same run.
pub type Execution<T> = Shared<BoxFuture<'static, Result<T>>>;

type Producer<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

const ERROR_CHANNEL_CAPACITY: usize = 16;

struct CommandInner<T> {
    name: String,
    producer: Producer<T>,
    result: ReactiveCell<T>,
    errors: broadcast::Sender<StoreError>,
    in_flight: Mutex<Option<(u64, Execution<T>)>>,
    runs: AtomicU64,
}

/// Reusable asynchronous operation with collapsed concurrent invocations.
pub struct Command<T> {
    inner: Arc<CommandInner<T>>,
}

impl<T> Clone for Command<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Command<T> {
    fn with_producer(name: impl Into<String>, seed: T, producer: Producer<T>) -> Self {
        let name = name.into();
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        let result = ReactiveCell::builder()
            .label(format!("command:{name}"))
            .initial(seed)
            .build();
        Self {
            inner: Arc::new(CommandInner {
                name,
                producer,
                result,
                errors,
                in_flight: Mutex::new(None),
                runs: AtomicU64::new(0),
            }),
        }
    }

    /// Command around a synchronous producer. The producer runs on each
    /// new execution, not at construction.
    pub fn from_fn<F>(name: impl Into<String>, seed: T, producer: F) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        Self::with_producer(
            name,
            seed,
            Box::new(move || future::ready(producer()).boxed()),
        )
    }

    /// Command around an asynchronous producer.
    pub fn from_async<F, Fut>(name: impl Into<String>, seed: T, producer: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self::with_producer(name, seed, Box::new(move || producer().boxed()))
    }

    /// Command around a source factory. Each execution resolves with the
    /// source's first item.
    pub fn from_source<F>(name: impl Into<String>, seed: T, factory: F) -> Self
    where
        F: Fn() -> Source<T> + Send + Sync + 'static,
    {
        let name = name.into();
        let label = name.clone();
        Self::with_producer(
            name,
            seed,
            Box::new(move || {
                let mut source = factory();
                let label = label.clone();
                async move {
                    source.next().await.unwrap_or_else(|| {
                        Err(StoreError::Command(format!("{label}: source ended without a value")))
                    })
                }
                .boxed()
            }),
        )
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Start an execution, or join the one already in flight.
    ///
    /// The producer is invoked under the in-flight lock; it must not call
    /// `execute` on the same command synchronously.
    pub fn execute(&self) -> Execution<T> {
        let mut in_flight = self.inner.in_flight.lock();
        if let Some((_, execution)) = in_flight.as_ref() {
            debug!(command = %self.inner.name, "Joining in-flight execution");
            return execution.clone();
        }

        let run = self.inner.runs.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(command = %self.inner.name, run, "Executing");
        let work = (self.inner.producer)();
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let outcome = work.await.map_err(|err| match err {
                StoreError::Command(_) => err,
                other => StoreError::Command(format!("{}: {}", inner.name, other)),
            });

            {
                let mut in_flight = inner.in_flight.lock();
                if in_flight.as_ref().is_some_and(|(current, _)| *current == run) {
                    *in_flight = None;
                }
            }

            match &outcome {
                Ok(value) => inner.result.push(value.clone()),
                Err(error) => {
                    warn!(command = %inner.name, run, %error, "Execution failed");
                    // No receivers is fine; the error is still returned to awaiters.
                    let _ = inner.errors.send(error.clone());
                }
            }
            outcome
        });

        let execution = async move { task.await.unwrap_or_else(|err| Err(err.into())) }
            .boxed()
            .shared();
        *in_flight = Some((run, execution.clone()));
        execution
    }

    pub fn is_executing(&self) -> bool {
        self.inner.in_flight.lock().is_some()
    }

    /// Replay-latest cell of the most recent successful result.
    pub fn result(&self) -> ReactiveCell<T> {
        self.inner.result.clone()
    }

    pub fn latest(&self) -> Option<T> {
        self.inner.result.peek()
    }

    /// Failures of executions started after this call.
    pub fn errors(&self) -> broadcast::Receiver<StoreError> {
        self.inner.errors.subscribe()
    }

    /// Number of times the producer has been invoked.
    pub fn runs(&self) -> u64 {
        self.inner.runs.load(Ordering::Relaxed)
    }
}

impl<T> fmt::Debug for Command<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.inner.name)
            .field("executing", &self.inner.in_flight.lock().is_some())
            .finish()
    }
}
