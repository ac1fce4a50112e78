//! Association lifecycle use cases.
//!
//! # Responsibility
//! - Queue associations and run one pending association under the partition
//!   write lock.
//! - Record each run's outcome so interrupted work resumes and repeated
//!   failures reach the operator channel.
//!
//! # Invariants
//! - At most one application runs per partition at a time.
//! - A failed run never marks the association completed.

use crate::config::AnalysisConfig;
use crate::model::association::{
    Association, AssociationId, AssociationProgress, AssociationStatus,
};
use crate::model::partition::PartitionKey;
use crate::model::range::Timestamp;
use crate::repo::association_repo::AssociationRepository;
use crate::repo::slot_repo::{RepoError, SlotStore};
use crate::service::association_applier::{ApplyError, ApplyOutcome, AssociationApplier};
use crate::service::partition_lock::{try_acquire, PartitionLock};
use log::{debug, error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

#[derive(Debug)]
pub enum ServiceError {
    Repo(RepoError),
    Apply(ApplyError),
    /// Another writer holds the partition; the association stays pending.
    PartitionBusy(PartitionKey),
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Repo(err) => write!(f, "{err}"),
            Self::Apply(err) => write!(f, "{err}"),
            Self::PartitionBusy(key) => write!(f, "partition {key} is locked by another writer"),
        }
    }
}

impl Error for ServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            Self::Apply(err) => Some(err),
            Self::PartitionBusy(_) => None,
        }
    }
}

impl From<RepoError> for ServiceError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

impl From<ApplyError> for ServiceError {
    fn from(value: ApplyError) -> Self {
        Self::Apply(value)
    }
}

/// Entry points used by the upstream scheduler.
pub struct AssociationService<'l, S: SlotStore, R: AssociationRepository, L: PartitionLock> {
    store: S,
    repo: R,
    locks: &'l L,
    config: AnalysisConfig,
}

impl<'l, S, R, L> AssociationService<'l, S, R, L>
where
    S: SlotStore,
    R: AssociationRepository,
    L: PartitionLock,
{
    pub fn new(store: S, repo: R, locks: &'l L, config: AnalysisConfig) -> Self {
        Self {
            store,
            repo,
            locks,
            config,
        }
    }

    pub fn enqueue(&self, association: &Association) -> Result<AssociationId, ServiceError> {
        let id = self.repo.enqueue(association)?;
        debug!(
            "event=association_enqueue module=service status=ok partition={} association={} kind={} range={}",
            association.partition_key,
            id,
            association.kind(),
            association.range
        );
        Ok(id)
    }

    pub fn get(&self, id: AssociationId) -> Result<Option<Association>, ServiceError> {
        Ok(self.repo.get(id)?)
    }

    pub fn list_pending(&self, limit: Option<u32>) -> Result<Vec<Association>, ServiceError> {
        Ok(self.repo.list_pending(limit)?)
    }

    /// Runs one pending association as of `now` and records the outcome.
    ///
    /// # Errors
    /// - `PartitionBusy` when another writer holds the partition.
    /// - `Apply` when the run failed; attempts are incremented and the
    ///   association remains pending.
    /// - `Repo(NotFound)` for an unknown id.
    pub fn apply_pending(
        &self,
        id: AssociationId,
        now: Timestamp,
    ) -> Result<ApplyOutcome, ServiceError> {
        let association = self.repo.get(id)?.ok_or(RepoError::NotFound(id))?;
        if association.progress.status == AssociationStatus::Completed {
            debug!(
                "event=association_apply module=service status=skip partition={} association={} reason=already_completed",
                association.partition_key, id
            );
            return Ok(ApplyOutcome::Completed {
                slots_written: 0,
                merges: 0,
            });
        }

        let Some(_guard) = try_acquire(self.locks, association.partition_key) else {
            info!(
                "event=association_apply module=service status=busy partition={} association={}",
                association.partition_key, id
            );
            return Err(ServiceError::PartitionBusy(association.partition_key));
        };

        let mut progress = association.progress.clone();
        progress.status = AssociationStatus::InProgress;
        self.repo.record_progress(id, &progress)?;

        let applier = AssociationApplier::new(&self.store, &self.config);
        match applier.apply(&association, now) {
            Ok(report) => {
                let progress =
                    progress_after(&association, &progress, &report.outcome, report.step_span);
                self.repo.record_progress(id, &progress)?;
                Ok(report.outcome)
            }
            Err(err) => {
                progress.status = AssociationStatus::Failed;
                progress.attempts += 1;
                progress.last_error = Some(err.to_string());
                self.repo.record_progress(id, &progress)?;
                if progress.attempts >= self.config.max_failed_attempts {
                    error!(
                        "event=association_failure_escalated module=service status=error partition={} association={} attempts={} error={}",
                        association.partition_key, id, progress.attempts, err
                    );
                } else {
                    warn!(
                        "event=association_apply module=service status=error partition={} association={} attempts={} error={}",
                        association.partition_key, id, progress.attempts, err
                    );
                }
                Err(ServiceError::Apply(err))
            }
        }
    }
}

fn progress_after(
    association: &Association,
    previous: &AssociationProgress,
    outcome: &ApplyOutcome,
    step_span: Option<Duration>,
) -> AssociationProgress {
    let (status, applied_until) = match outcome {
        ApplyOutcome::Completed { .. } | ApplyOutcome::Skipped { .. } => (
            AssociationStatus::Completed,
            association
                .range
                .upper()
                .timestamp()
                .or(previous.applied_until),
        ),
        ApplyOutcome::Interrupted { resume_from, .. } => (
            AssociationStatus::Interrupted,
            resume_from.timestamp().or(previous.applied_until),
        ),
    };
    AssociationProgress {
        status,
        applied_until,
        step_span,
        attempts: previous.attempts,
        last_error: None,
    }
}
