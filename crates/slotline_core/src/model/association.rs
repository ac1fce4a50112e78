//! Association (pending modification) domain model.
//!
//! # Responsibility
//! - Describe one upstream assertion that an attribute held over a range.
//! - Track application progress so interrupted runs resume where they stopped.
//!
//! # Invariants
//! - `data.kind()` selects the merge strategy; no runtime type inspection.
//! - `progress.applied_until`, when set, lies inside `range`.

use crate::model::partition::PartitionKey;
use crate::model::range::{Bound, Timestamp, UtcRange};
use crate::model::slot::{ReferenceId, SlotKind, Timeline};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::Duration;
use uuid::Uuid;

/// Stable association identifier.
pub type AssociationId = Uuid;

/// Application options of one association.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationOptions {
    /// Do not merge with the slot immediately before the range.
    pub no_left_merge: bool,
    /// Do not merge with the slot immediately after the range.
    pub no_right_merge: bool,
    /// Only modify what lies before the application date/time.
    pub past_only: bool,
}

impl AssociationOptions {
    const NO_LEFT_MERGE: i64 = 1;
    const NO_RIGHT_MERGE: i64 = 2;
    const PAST_ONLY: i64 = 4;

    pub fn to_bits(self) -> i64 {
        let mut bits = 0;
        if self.no_left_merge {
            bits |= Self::NO_LEFT_MERGE;
        }
        if self.no_right_merge {
            bits |= Self::NO_RIGHT_MERGE;
        }
        if self.past_only {
            bits |= Self::PAST_ONLY;
        }
        bits
    }

    pub fn from_bits(bits: i64) -> Self {
        Self {
            no_left_merge: bits & Self::NO_LEFT_MERGE != 0,
            no_right_merge: bits & Self::NO_RIGHT_MERGE != 0,
            past_only: bits & Self::PAST_ONLY != 0,
        }
    }
}

/// Discriminant selecting the per-kind strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationKind {
    MachineStateTemplate,
    MachineObservationState,
    ShiftChange,
    ToolPosition,
    CncVariable,
}

impl AssociationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MachineStateTemplate => "machine_state_template",
            Self::MachineObservationState => "machine_observation_state",
            Self::ShiftChange => "shift_change",
            Self::ToolPosition => "tool_position",
            Self::CncVariable => "cnc_variable",
        }
    }

    /// Slot timeline kind this association writes to.
    pub fn target_slot_kind(self) -> SlotKind {
        match self {
            Self::MachineStateTemplate | Self::MachineObservationState => {
                SlotKind::ObservationState
            }
            Self::ShiftChange => SlotKind::Shift,
            Self::ToolPosition => SlotKind::ToolPosition,
            Self::CncVariable => SlotKind::CncVariable,
        }
    }
}

impl Display for AssociationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-tagged asserted fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssociationData {
    MachineStateTemplate {
        machine_state_template: ReferenceId,
        user: Option<ReferenceId>,
        shift: Option<ReferenceId>,
        /// Reset the observation state even when the template is unchanged.
        #[serde(default)]
        force: bool,
        /// The template cannot be applied without a user.
        #[serde(default)]
        user_required: bool,
    },
    MachineObservationState {
        machine_observation_state: ReferenceId,
        /// Production flag of the observation state.
        production: bool,
        machine_state_template: Option<ReferenceId>,
        user: Option<ReferenceId>,
        shift: Option<ReferenceId>,
    },
    ShiftChange {
        shift_template: Option<ReferenceId>,
        shift: Option<ReferenceId>,
    },
    ToolPosition {
        tool_number: String,
        magazine: Option<i32>,
        pot: Option<i32>,
    },
    CncVariable {
        key: String,
        value: Option<serde_json::Value>,
    },
}

impl AssociationData {
    pub fn kind(&self) -> AssociationKind {
        match self {
            Self::MachineStateTemplate { .. } => AssociationKind::MachineStateTemplate,
            Self::MachineObservationState { .. } => AssociationKind::MachineObservationState,
            Self::ShiftChange { .. } => AssociationKind::ShiftChange,
            Self::ToolPosition { .. } => AssociationKind::ToolPosition,
            Self::CncVariable { .. } => AssociationKind::CncVariable,
        }
    }
}

/// Lifecycle status of a pending association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationStatus {
    /// Created by an upstream writer, never applied.
    Pending,
    /// Partially applied; resumes from `applied_until`.
    InProgress,
    /// Stopped by a step timeout at a consistent point.
    Interrupted,
    /// Fully applied (or skipped as carrying no fact).
    Completed,
    /// Last attempt failed; stays eligible for retry.
    Failed,
}

impl AssociationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Interrupted => "interrupted",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "interrupted" => Some(Self::Interrupted),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Analysis bookkeeping carried between runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationProgress {
    pub status: AssociationStatus,
    /// Everything before this instant has been applied.
    pub applied_until: Option<Timestamp>,
    /// Width of one analysis window, `None` for the whole remaining range.
    pub step_span: Option<Duration>,
    /// Failed attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl Default for AssociationProgress {
    fn default() -> Self {
        Self {
            status: AssociationStatus::Pending,
            applied_until: None,
            step_span: None,
            attempts: 0,
            last_error: None,
        }
    }
}

/// Pending modification of one partition timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Association {
    pub id: AssociationId,
    pub partition_key: PartitionKey,
    pub range: UtcRange,
    pub data: AssociationData,
    pub options: AssociationOptions,
    /// When the upstream writer asserted the fact; "now" for `past_only`.
    pub application_date_time: Timestamp,
    pub progress: AssociationProgress,
}

impl Association {
    /// Creates a pending association with a generated id and default options.
    pub fn new(
        partition_key: PartitionKey,
        range: UtcRange,
        data: AssociationData,
        application_date_time: Timestamp,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            partition_key,
            range,
            data,
            options: AssociationOptions::default(),
            application_date_time,
            progress: AssociationProgress::default(),
        }
    }

    pub fn with_options(mut self, options: AssociationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn kind(&self) -> AssociationKind {
        self.data.kind()
    }

    pub fn timeline(&self) -> Timeline {
        Timeline::new(self.kind().target_slot_kind(), self.partition_key)
    }

    /// Part of `range` not applied yet.
    pub fn remaining_range(&self) -> UtcRange {
        match self.progress.applied_until {
            Some(applied_until) => self
                .range
                .with_lower(self.range.lower().max(Bound::At(applied_until))),
            None => self.range,
        }
    }
}
