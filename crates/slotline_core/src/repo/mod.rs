//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define the slot store and association queue contracts.
//! - Isolate SQLite query details from the analysis services.
//!
//! # Invariants
//! - Slot writes go through one atomic, revision-checked replace.
//! - Repository APIs return semantic errors (`ConcurrentModification`,
//!   `NotFound`) in addition to DB transport errors.

pub mod association_repo;
pub mod slot_repo;
