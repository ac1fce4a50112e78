//! Slot timeline analysis core.
//! Folds pending associations into per-partition slot timelines and keeps
//! them non-overlapping and maximally merged.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use config::{AnalysisConfig, ConfigError};
pub use db::{open_db, open_db_in_memory, DbError};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::association::{
    Association, AssociationData, AssociationId, AssociationKind, AssociationOptions,
    AssociationProgress, AssociationStatus,
};
pub use model::partition::{PartitionKey, PartitionKeyParseError};
pub use model::range::{Bound, RangeError, Timestamp, UtcRange};
pub use model::slot::{Slot, SlotData, SlotId, SlotKind, Timeline};
pub use repo::association_repo::{AssociationRepository, SqliteAssociationRepository};
pub use repo::slot_repo::{Direction, RepoError, RepoResult, SlotStore, SqliteSlotStore};
pub use service::association_applier::{
    ApplyError, ApplyOutcome, ApplyReport, ApplyState, AssociationApplier,
};
pub use service::association_service::{AssociationService, ServiceError};
pub use service::boundary_extender::{
    machine_state_template_only, BoundaryExtender, ExtendError, Extension, ScanCap,
};
pub use service::merge_policy::{is_mergeable, merge, MergeError};
pub use service::partition_lock::{InProcessPartitionLocks, PartitionLock};
pub use service::timeout_guard::{StepTimeoutAbort, TimeoutGuard};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
