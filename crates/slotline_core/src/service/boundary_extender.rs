//! Progressive extension of logical slots across fine-grained boundaries.
//!
//! # Responsibility
//! - Grow a slot computed from a finer timeline to the maximal run of fine
//!   slots that project onto the same logical value.
//!
//! # Invariants
//! - An unbounded side is returned unchanged without touching the store.
//! - A scan never exceeds its cap silently: `ScanCapExceeded` carries the
//!   partial result.
//! - A gap in the fine timeline ends the scan on that side.

use crate::config::AnalysisConfig;
use crate::model::range::{Bound, UtcRange};
use crate::model::slot::{ObservationStateData, Slot, SlotData, SlotKind, Timeline};
use crate::repo::slot_repo::{Direction, RepoError, SlotStore};
use crate::service::merge_policy::{is_mergeable, merge, MergeError};
use crate::service::timeout_guard::TimeoutGuard;
use log::{debug, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Maps a fine slot to its logical slot; `None` when it does not qualify.
pub type Projection = fn(&Slot) -> Option<Slot>;

/// Keeps only the machine state template of observation-state slots.
pub fn machine_state_template_only(slot: &Slot) -> Option<Slot> {
    let SlotData::ObservationState(data) = &slot.data else {
        return None;
    };
    let template = data.machine_state_template?;
    Some(Slot::new(
        slot.partition_key,
        slot.range,
        SlotData::ObservationState(ObservationStateData {
            machine_state_template: Some(template),
            ..ObservationStateData::default()
        }),
    ))
}

/// Bound on the number of candidates and the time one extension may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanCap {
    pub max_candidates: usize,
    pub max_elapsed: Duration,
}

impl ScanCap {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            max_candidates: config.extend_max_candidates,
            max_elapsed: config.extend_max_elapsed(),
        }
    }
}

/// Maximal slot found by an extension.
#[derive(Debug, Clone, PartialEq)]
pub struct Extension {
    pub slot: Slot,
    /// The scan stopped on the limit range rather than on the data.
    pub limit_reached: bool,
    /// Fine slots fetched.
    pub scanned: usize,
}

#[derive(Debug)]
pub enum ExtendError {
    /// Cap hit before the run ended; `partial` is valid but maybe not maximal.
    ScanCapExceeded { partial: Box<Extension>, cap: ScanCap },
    Store(RepoError),
    Merge(MergeError),
}

impl Display for ExtendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ScanCapExceeded { partial, cap } => write!(
                f,
                "extension scan cap exceeded after {} candidates (max {}, {}ms) at {}",
                partial.scanned,
                cap.max_candidates,
                cap.max_elapsed.as_millis(),
                partial.slot.range
            ),
            Self::Store(err) => write!(f, "{err}"),
            Self::Merge(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ExtendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::ScanCapExceeded { .. } => None,
            Self::Store(err) => Some(err),
            Self::Merge(err) => Some(err),
        }
    }
}

impl From<RepoError> for ExtendError {
    fn from(value: RepoError) -> Self {
        Self::Store(value)
    }
}

impl From<MergeError> for ExtendError {
    fn from(value: MergeError) -> Self {
        Self::Merge(value)
    }
}

/// Extends logical slots over one fine-grained slot kind.
pub struct BoundaryExtender<'s, S: SlotStore> {
    store: &'s S,
    fine_kind: SlotKind,
    projection: Projection,
    cap: ScanCap,
    limit: Option<UtcRange>,
}

impl<'s, S: SlotStore> BoundaryExtender<'s, S> {
    pub fn new(store: &'s S, fine_kind: SlotKind, projection: Projection, cap: ScanCap) -> Self {
        Self {
            store,
            fine_kind,
            projection,
            cap,
            limit: None,
        }
    }

    /// Never extends past the bounds of `limit`.
    pub fn with_limit(mut self, limit: UtcRange) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn extend_left(&self, slot: &Slot) -> Result<Extension, ExtendError> {
        let guard = TimeoutGuard::new(self.cap.max_elapsed);
        self.extend_side(self.start(slot), Direction::Left, &guard)
    }

    pub fn extend_right(&self, slot: &Slot) -> Result<Extension, ExtendError> {
        let guard = TimeoutGuard::new(self.cap.max_elapsed);
        self.extend_side(self.start(slot), Direction::Right, &guard)
    }

    /// Both sides under one shared cap.
    pub fn extend(&self, slot: &Slot) -> Result<Extension, ExtendError> {
        let guard = TimeoutGuard::new(self.cap.max_elapsed);
        let left = self.extend_side(self.start(slot), Direction::Left, &guard)?;
        self.extend_side(left, Direction::Right, &guard)
    }

    fn start(&self, slot: &Slot) -> Extension {
        Extension {
            slot: slot.clone(),
            limit_reached: false,
            scanned: 0,
        }
    }

    fn extend_side(
        &self,
        mut current: Extension,
        direction: Direction,
        guard: &TimeoutGuard,
    ) -> Result<Extension, ExtendError> {
        let timeline = Timeline::new(self.fine_kind, current.slot.partition_key);
        loop {
            let bound = match direction {
                Direction::Left => current.slot.range.lower(),
                Direction::Right => current.slot.range.upper(),
            };
            let Some(instant) = bound.timestamp() else {
                return Ok(current);
            };
            if self.at_limit(bound, direction) {
                current.limit_reached = true;
                return Ok(current);
            }
            if current.scanned >= self.cap.max_candidates || guard.check_step_timeout().is_err() {
                warn!(
                    "event=boundary_extend module=extender status=cap_exceeded partition={} kind={} scanned={} range={}",
                    timeline.partition_key, timeline.kind, current.scanned, current.slot.range
                );
                return Err(ExtendError::ScanCapExceeded {
                    partial: Box::new(current),
                    cap: self.cap,
                });
            }

            let Some(candidate) = self.store.find_adjacent(timeline, instant, direction)? else {
                return Ok(current);
            };
            current.scanned += 1;
            let Some(projected) = (self.projection)(&candidate) else {
                return Ok(current);
            };
            let projected = match self.limit {
                Some(limit) => match projected.range.intersect(&limit) {
                    Some(range) => projected.clone_with_range(range),
                    None => return Ok(current),
                },
                None => projected,
            };

            let merged = match direction {
                Direction::Left if is_mergeable(&projected, &current.slot) => {
                    merge(&projected, &current.slot)?
                }
                Direction::Right if is_mergeable(&current.slot, &projected) => {
                    merge(&current.slot, &projected)?
                }
                _ => return Ok(current),
            };
            debug!(
                "event=boundary_extend module=extender status=merged partition={} kind={} range={}",
                timeline.partition_key, timeline.kind, merged.range
            );
            current.slot = merged;
        }
    }

    fn at_limit(&self, bound: Bound, direction: Direction) -> bool {
        match (self.limit, direction) {
            (Some(limit), Direction::Left) => bound <= limit.lower(),
            (Some(limit), Direction::Right) => bound >= limit.upper(),
            (None, _) => false,
        }
    }
}
