//! Slot domain model.
//!
//! # Responsibility
//! - Define the persisted interval record and its kind-tagged data.
//! - Decode persisted data through an explicit per-kind decoder table.
//!
//! # Invariants
//! - `Slot::data.kind()` is the kind of the timeline the slot belongs to.
//! - Slots carrying empty data are never persisted.
//! - `id == None` marks a transient slot that has not been stored yet.

use crate::model::partition::PartitionKey;
use crate::model::range::UtcRange;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Persisted slot row id.
pub type SlotId = i64;

/// Id of a reference-data row (state template, shift, user, ...).
///
/// Reference data is compared by id, never by loaded instance.
pub type ReferenceId = i64;

/// Attribute family carried by a timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    ObservationState,
    Shift,
    ToolPosition,
    CncVariable,
}

impl SlotKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ObservationState => "observation_state",
            Self::Shift => "shift",
            Self::ToolPosition => "tool_position",
            Self::CncVariable => "cnc_variable",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "observation_state" => Some(Self::ObservationState),
            "shift" => Some(Self::Shift),
            "tool_position" => Some(Self::ToolPosition),
            "cnc_variable" => Some(Self::CncVariable),
            _ => None,
        }
    }

    /// Decodes persisted JSON data for this kind.
    pub fn decode_data(self, raw: &str) -> serde_json::Result<SlotData> {
        let decoder = SLOT_DATA_DECODERS
            .iter()
            .find(|(kind, _)| *kind == self)
            .map(|(_, decoder)| *decoder)
            .unwrap_or(decode_unknown);
        decoder(raw)
    }
}

impl Display for SlotKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type DataDecoder = fn(&str) -> serde_json::Result<SlotData>;

const SLOT_DATA_DECODERS: &[(SlotKind, DataDecoder)] = &[
    (SlotKind::ObservationState, decode_observation_state),
    (SlotKind::Shift, decode_shift),
    (SlotKind::ToolPosition, decode_tool_position),
    (SlotKind::CncVariable, decode_cnc_variable),
];

fn decode_observation_state(raw: &str) -> serde_json::Result<SlotData> {
    serde_json::from_str(raw).map(SlotData::ObservationState)
}

fn decode_shift(raw: &str) -> serde_json::Result<SlotData> {
    serde_json::from_str(raw).map(SlotData::Shift)
}

fn decode_tool_position(raw: &str) -> serde_json::Result<SlotData> {
    serde_json::from_str(raw).map(SlotData::ToolPosition)
}

fn decode_cnc_variable(raw: &str) -> serde_json::Result<SlotData> {
    serde_json::from_str(raw).map(SlotData::CncVariable)
}

fn decode_unknown(raw: &str) -> serde_json::Result<SlotData> {
    Err(<serde_json::Error as serde::de::Error>::custom(format!(
        "no decoder registered for slot data `{raw}`"
    )))
}

/// Machine state template / observation state held over a period.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationStateData {
    pub machine_state_template: Option<ReferenceId>,
    pub machine_observation_state: Option<ReferenceId>,
    pub user: Option<ReferenceId>,
    pub shift: Option<ReferenceId>,
    pub production: Option<bool>,
}

impl ObservationStateData {
    fn is_production(&self) -> bool {
        self.production == Some(true)
    }
}

/// Shift held over a period.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftData {
    pub shift_template: Option<ReferenceId>,
    pub shift: Option<ReferenceId>,
}

/// Tool loaded in a magazine position over a period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPositionData {
    pub tool_number: String,
    pub magazine: Option<i32>,
    pub pot: Option<i32>,
}

/// Cnc variable value over a period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CncVariableData {
    pub key: String,
    pub value: serde_json::Value,
}

/// Kind-tagged slot data.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotData {
    ObservationState(ObservationStateData),
    Shift(ShiftData),
    ToolPosition(ToolPositionData),
    CncVariable(CncVariableData),
}

impl SlotData {
    pub fn kind(&self) -> SlotKind {
        match self {
            Self::ObservationState(_) => SlotKind::ObservationState,
            Self::Shift(_) => SlotKind::Shift,
            Self::ToolPosition(_) => SlotKind::ToolPosition,
            Self::CncVariable(_) => SlotKind::CncVariable,
        }
    }

    /// Empty data asserts nothing; its fragment is dropped and leaves a gap.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::ObservationState(data) => {
                data.machine_state_template.is_none() && data.machine_observation_state.is_none()
            }
            Self::Shift(data) => data.shift_template.is_none() && data.shift.is_none(),
            Self::ToolPosition(_) => false,
            Self::CncVariable(data) => data.value.is_null(),
        }
    }

    /// Whether two slots carrying this data may be merged into one.
    ///
    /// A production and a non-production observation state never merge even
    /// when all their references match.
    pub fn reference_data_equals(&self, other: &SlotData) -> bool {
        match (self, other) {
            (Self::ObservationState(left), Self::ObservationState(right)) => {
                if (left.is_production() || right.is_production())
                    && left.production != right.production
                {
                    return false;
                }
                left.machine_state_template == right.machine_state_template
                    && left.machine_observation_state == right.machine_observation_state
                    && left.user == right.user
                    && left.shift == right.shift
            }
            (Self::Shift(left), Self::Shift(right)) => left == right,
            (Self::ToolPosition(left), Self::ToolPosition(right)) => left == right,
            (Self::CncVariable(left), Self::CncVariable(right)) => left == right,
            _ => false,
        }
    }

    /// Serializes the payload (without the kind tag) for storage.
    pub fn encode(&self) -> serde_json::Result<String> {
        match self {
            Self::ObservationState(data) => serde_json::to_string(data),
            Self::Shift(data) => serde_json::to_string(data),
            Self::ToolPosition(data) => serde_json::to_string(data),
            Self::CncVariable(data) => serde_json::to_string(data),
        }
    }
}

/// Scope of one independent timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timeline {
    pub kind: SlotKind,
    pub partition_key: PartitionKey,
}

impl Timeline {
    pub fn new(kind: SlotKind, partition_key: PartitionKey) -> Self {
        Self {
            kind,
            partition_key,
        }
    }
}

impl Display for Timeline {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.partition_key, self.kind)
    }
}

/// Interval of a partition timeline holding one attribute value.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    /// Row id once persisted.
    pub id: Option<SlotId>,
    pub partition_key: PartitionKey,
    pub range: UtcRange,
    pub data: SlotData,
    /// Optimistic-concurrency counter, bumped on every replace.
    pub revision: i64,
}

impl Slot {
    /// Creates a transient slot.
    pub fn new(partition_key: PartitionKey, range: UtcRange, data: SlotData) -> Self {
        Self {
            id: None,
            partition_key,
            range,
            data,
            revision: 0,
        }
    }

    pub fn kind(&self) -> SlotKind {
        self.data.kind()
    }

    pub fn timeline(&self) -> Timeline {
        Timeline::new(self.kind(), self.partition_key)
    }

    /// Transient copy of this slot restricted to another range.
    pub fn clone_with_range(&self, range: UtcRange) -> Slot {
        Slot::new(self.partition_key, range, self.data.clone())
    }

    /// Same range and same data, ignoring row identity.
    pub fn same_content(&self, other: &Slot) -> bool {
        self.partition_key == other.partition_key
            && self.range == other.range
            && self.data == other.data
    }
}

impl Display for Slot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.timeline(), self.range, self.revision)
    }
}
