//! Timeline analysis services.
//!
//! # Responsibility
//! - Fold associations into slot timelines and extend logical slots.
//! - Keep scheduler-facing lifecycle calls decoupled from storage details.
//!
//! # Invariants
//! - Services only mutate slots through `SlotStore::replace_slots`.
//! - Every skip, abort and interrupt is logged with its partition key.

pub mod association_applier;
pub mod association_service;
pub mod boundary_extender;
pub mod merge_policy;
pub mod partition_lock;
pub mod step_span;
pub mod strategy;
pub mod timeout_guard;
