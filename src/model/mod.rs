//! Observable models
//!
//! Models own a [`ChangeBus`] and expose [`Property`] fields on it. Chains
//! of properties (reading through reactive cells where a link holds one) are
//! observed with [`when`].

mod bus;
mod observe;
mod property;
mod when;

pub use bus::{ChangeBus, ChangeNotification, ChangePhase, ModelId};
pub use observe::{combine2, combine3, Just, Observation, Observe};
pub use property::{CellProperty, DerivedProperty, Property};
pub use when::{when, when2, when3, PropertyPath, When, WhenStream};
