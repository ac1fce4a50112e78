//! Merge policy for adjacent slots.
//!
//! # Invariants
//! - `merge` is only defined on mergeable pairs; anything else is a
//!   `MergeError`, never a panic.
//! - The merged slot keeps the left slot's data and is transient.

use crate::model::range::UtcRange;
use crate::model::slot::Slot;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// `a` ends exactly where `b` starts and both carry equal reference data.
pub fn is_mergeable(a: &Slot, b: &Slot) -> bool {
    a.partition_key == b.partition_key
        && a.range.adjacent_to(&b.range)
        && a.data.reference_data_equals(&b.data)
}

/// Union `[a.lower, b.upper)` of two mergeable slots, carrying `a.data`.
pub fn merge(a: &Slot, b: &Slot) -> Result<Slot, MergeError> {
    if !is_mergeable(a, b) {
        return Err(MergeError {
            left: a.to_string(),
            right: b.to_string(),
        });
    }
    let range = UtcRange::new(a.range.lower(), b.range.upper()).map_err(|_| MergeError {
        left: a.to_string(),
        right: b.to_string(),
    })?;
    Ok(a.clone_with_range(range))
}

/// Merge requested on a non-mergeable pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeError {
    pub left: String,
    pub right: String,
}

impl Display for MergeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "slots are not mergeable: {} and {}", self.left, self.right)
    }
}

impl Error for MergeError {}
