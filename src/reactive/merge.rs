//! Shallow field-wise merging for merge-strategy cells

use serde_json::Value;

/// How a cell combines a pushed value with the one it already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateStrategy {
    /// Replace the held value wholesale
    #[default]
    Overwrite,
    /// Merge the pushed value field by field into the held value
    Merge,
}

/// Values that can be shallow-merged.
///
/// Fields present in `update` win; fields absent from it survive.
pub trait Merge {
    fn merge_from(&mut self, update: Self);

    /// Whether this value carries nothing at all. Absent values are never
    /// merged into a cell.
    fn is_absent(&self) -> bool {
        false
    }
}

impl Merge for Value {
    fn merge_from(&mut self, update: Self) {
        match (self, update) {
            (Value::Object(current), Value::Object(fields)) => {
                for (name, value) in fields {
                    current.insert(name, value);
                }
            }
            (slot, other) => *slot = other,
        }
    }

    fn is_absent(&self) -> bool {
        self.is_null()
    }
}

impl<T: Merge> Merge for Option<T> {
    fn merge_from(&mut self, update: Self) {
        let Some(update) = update else { return };
        match self {
            Some(current) => current.merge_from(update),
            None => *self = Some(update),
        }
    }

    fn is_absent(&self) -> bool {
        self.is_none()
    }
}

/// Take `update` when it is present, keep `current` otherwise.
pub fn merge_field<T>(current: &mut Option<T>, update: Option<T>) {
    if update.is_some() {
        *current = update;
    }
}
