//! Timeline domain model.
//!
//! # Responsibility
//! - Define interval primitives, partition keys, slots and associations.
//! - Keep one kind-tagged data shape per slot family.
//!
//! # Invariants
//! - Within one timeline, stored slots never overlap.
//! - No two adjacent stored slots carry mergeable data.

pub mod association;
pub mod partition;
pub mod range;
pub mod slot;
