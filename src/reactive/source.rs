//! Sources that feed reactive cells
//!
//! A source is a stream of results. One-shot fetches are single-item
//! streams; live feeds keep yielding until they end or are detached.

use crate::error::{Result, StoreError};
use futures::future;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::future::Future;

/// A boxed stream of values (or failures) pushed into a cell.
pub type Source<T> = BoxStream<'static, Result<T>>;

/// Source that resolves once from a future.
pub fn once<T, F>(fut: F) -> Source<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    stream::once(fut).boxed()
}

/// Source that yields an already-known value.
pub fn ready<T: Send + 'static>(value: T) -> Source<T> {
    stream::once(future::ready(Ok(value))).boxed()
}

/// Source that fails immediately.
pub fn failed<T: Send + 'static>(error: StoreError) -> Source<T> {
    stream::once(future::ready(Err(error))).boxed()
}

/// Source from any stream of results.
pub fn from_stream<T, S>(stream: S) -> Source<T>
where
    S: Stream<Item = Result<T>> + Send + 'static,
{
    stream.boxed()
}
