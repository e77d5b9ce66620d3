//! Reactive value cells
//!
//! The building block for everything else in the crate: a [`ReactiveCell`]
//! is a lazily populated slot fed by at most one [`Source`], observed through
//! RAII [`Subscription`]s.

mod cell;
mod merge;
pub mod source;
mod subscription;

pub use cell::{CellBuilder, CellEvent, CellFactory, ReactiveCell};
pub(crate) use cell::Merger;
pub use merge::{merge_field, Merge, UpdateStrategy};
pub use source::Source;
pub use subscription::{Callback, Subscription};
pub(crate) use subscription::Listeners;
