//! Partition keys scoping independent slot timelines.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

static PARTITION_KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(machine|machine_module|user|line):(-?[0-9]+)$").expect("valid partition key regex")
});

/// Owning entity of a timeline. Timelines of different keys never interact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "entity", content = "id")]
pub enum PartitionKey {
    Machine(i64),
    MachineModule(i64),
    User(i64),
    Line(i64),
}

impl Display for PartitionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Machine(id) => write!(f, "machine:{id}"),
            Self::MachineModule(id) => write!(f, "machine_module:{id}"),
            Self::User(id) => write!(f, "user:{id}"),
            Self::Line(id) => write!(f, "line:{id}"),
        }
    }
}

/// Text could not be parsed as `<entity>:<id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionKeyParseError(pub String);

impl Display for PartitionKeyParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid partition key `{}`", self.0)
    }
}

impl Error for PartitionKeyParseError {}

impl FromStr for PartitionKey {
    type Err = PartitionKeyParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let captures = PARTITION_KEY_RE
            .captures(value.trim())
            .ok_or_else(|| PartitionKeyParseError(value.to_string()))?;
        let id = captures[2]
            .parse::<i64>()
            .map_err(|_| PartitionKeyParseError(value.to_string()))?;
        match &captures[1] {
            "machine" => Ok(Self::Machine(id)),
            "machine_module" => Ok(Self::MachineModule(id)),
            "user" => Ok(Self::User(id)),
            "line" => Ok(Self::Line(id)),
            _ => Err(PartitionKeyParseError(value.to_string())),
        }
    }
}
