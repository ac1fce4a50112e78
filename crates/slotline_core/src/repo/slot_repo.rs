//! Slot store contract, repository errors and SQLite implementation.
//!
//! # Responsibility
//! - Provide overlap/adjacency/point lookups over one partition timeline.
//! - Replace slot rows atomically with optimistic-concurrency checks.
//!
//! # Invariants
//! - Lookups return slots ordered by lower bound (`-∞` first).
//! - `replace_slots` is all-or-nothing: a stale revision or an overlap with a
//!   surviving row rolls the whole replace back.
//! - Rows with empty ranges or empty data are never written.

use crate::db::migrations::{current_user_version, latest_version};
use crate::db::DbError;
use crate::model::association::AssociationId;
use crate::model::partition::PartitionKey;
use crate::model::range::{Bound, Timestamp, UtcRange};
use crate::model::slot::{Slot, SlotId, SlotKind, Timeline};
use log::{debug, warn};
use rusqlite::{params, Connection, Row, Transaction, TransactionBehavior};
use std::error::Error;
use std::fmt::{Display, Formatter};

const SLOT_SELECT_SQL: &str = "SELECT
    id,
    slot_kind,
    partition_key,
    lower_ms,
    upper_ms,
    data,
    revision
FROM slots";

pub type RepoResult<T> = Result<T, RepoError>;

/// Slot store error.
#[derive(Debug)]
pub enum RepoError {
    /// Underlying SQLite/bootstrap error.
    Db(DbError),
    /// Store state changed between read and replace.
    ConcurrentModification {
        timeline: Timeline,
        slot_id: Option<SlotId>,
    },
    /// Connection schema is not at the expected migrated version.
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    /// Association row does not exist.
    NotFound(AssociationId),
    /// Persisted or requested data violates the slot model.
    InvalidData(String),
}

impl RepoError {
    pub fn is_concurrent_modification(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::ConcurrentModification {
                timeline,
                slot_id: Some(id),
            } => write!(f, "concurrent modification of slot {id} in {timeline}"),
            Self::ConcurrentModification {
                timeline,
                slot_id: None,
            } => write!(f, "concurrent insertion detected in {timeline}"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "slot store requires schema version {expected_version}, got {actual_version}"
            ),
            Self::NotFound(id) => write!(f, "association not found: {id}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::ConcurrentModification { .. } => None,
            Self::UninitializedConnection { .. } => None,
            Self::NotFound(_) => None,
            Self::InvalidData(_) => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Side of a bound to look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The slot ending exactly at the bound.
    Left,
    /// The slot starting exactly at the bound.
    Right,
}

/// Persisted per-partition slot rows.
pub trait SlotStore {
    /// Slots overlapping `range`, ascending by lower bound.
    fn find_overlapping(&self, timeline: Timeline, range: &UtcRange) -> RepoResult<Vec<Slot>>;
    /// Slot touching `bound` on the given side.
    fn find_adjacent(
        &self,
        timeline: Timeline,
        bound: Timestamp,
        direction: Direction,
    ) -> RepoResult<Option<Slot>>;
    /// Deletes `deleted` (checked against their revisions) and inserts
    /// `inserted` in one atomic unit. Returns the inserted rows as stored.
    fn replace_slots(
        &self,
        timeline: Timeline,
        deleted: &[Slot],
        inserted: &[Slot],
    ) -> RepoResult<Vec<Slot>>;
    /// Whole timeline, ascending by lower bound.
    fn find_all(&self, timeline: Timeline) -> RepoResult<Vec<Slot>>;
    /// Slot holding at `instant`.
    fn find_at(&self, timeline: Timeline, instant: Timestamp) -> RepoResult<Option<Slot>>;
}

/// SQLite-backed slot store.
pub struct SqliteSlotStore<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteSlotStore<'conn> {
    /// Creates the store from a migrated connection.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        let expected_version = latest_version();
        let actual_version = current_user_version(conn)?;
        if actual_version != expected_version {
            return Err(RepoError::UninitializedConnection {
                expected_version,
                actual_version,
            });
        }
        Ok(Self { conn })
    }
}

impl SlotStore for SqliteSlotStore<'_> {
    fn find_overlapping(&self, timeline: Timeline, range: &UtcRange) -> RepoResult<Vec<Slot>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(&format!(
            "{SLOT_SELECT_SQL}
             WHERE slot_kind = ?1
               AND partition_key = ?2
               AND (?4 IS NULL OR lower_ms IS NULL OR lower_ms < ?4)
               AND (?3 IS NULL OR upper_ms IS NULL OR upper_ms > ?3)
             ORDER BY lower_ms ASC;"
        ))?;
        let mut rows = stmt.query(params![
            timeline.kind.as_str(),
            timeline.partition_key.to_string(),
            lower_to_db(range.lower()),
            upper_to_db(range.upper()),
        ])?;
        let mut slots = Vec::new();
        while let Some(row) = rows.next()? {
            slots.push(parse_slot_row(row)?);
        }
        Ok(slots)
    }

    fn find_adjacent(
        &self,
        timeline: Timeline,
        bound: Timestamp,
        direction: Direction,
    ) -> RepoResult<Option<Slot>> {
        // Single-row lookups pin the bound index instead of letting the
        // planner fall back to a scan of the partition.
        let sql = match direction {
            Direction::Left => format!(
                "{SLOT_SELECT_SQL} INDEXED BY idx_slots_timeline_upper
                 WHERE slot_kind = ?1
                   AND partition_key = ?2
                   AND upper_ms = ?3
                 LIMIT 1;"
            ),
            Direction::Right => format!(
                "{SLOT_SELECT_SQL} INDEXED BY idx_slots_timeline_lower
                 WHERE slot_kind = ?1
                   AND partition_key = ?2
                   AND lower_ms = ?3
                 LIMIT 1;"
            ),
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![
            timeline.kind.as_str(),
            timeline.partition_key.to_string(),
            bound.as_millis(),
        ])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_slot_row(row)?));
        }
        Ok(None)
    }

    fn replace_slots(
        &self,
        timeline: Timeline,
        deleted: &[Slot],
        inserted: &[Slot],
    ) -> RepoResult<Vec<Slot>> {
        validate_inserted(timeline, inserted)?;

        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let mut next_revision = 1;
        for slot in deleted {
            let id = slot.id.ok_or_else(|| {
                RepoError::InvalidData(format!("cannot delete transient slot {slot}"))
            })?;
            if slot.timeline() != timeline {
                return Err(RepoError::InvalidData(format!(
                    "slot {id} does not belong to {timeline}"
                )));
            }
            let changed = tx.execute(
                "DELETE FROM slots
                 WHERE id = ?1
                   AND slot_kind = ?2
                   AND partition_key = ?3
                   AND revision = ?4;",
                params![
                    id,
                    timeline.kind.as_str(),
                    timeline.partition_key.to_string(),
                    slot.revision,
                ],
            )?;
            if changed == 0 {
                warn!(
                    "event=slot_replace module=repo status=conflict partition={} kind={} slot_id={} expected_revision={}",
                    timeline.partition_key, timeline.kind, id, slot.revision
                );
                return Err(RepoError::ConcurrentModification {
                    timeline,
                    slot_id: Some(id),
                });
            }
            next_revision = next_revision.max(slot.revision + 1);
        }

        let mut stored = Vec::with_capacity(inserted.len());
        for slot in inserted {
            if overlaps_stored_row(&tx, timeline, &slot.range)? {
                warn!(
                    "event=slot_replace module=repo status=conflict partition={} kind={} range={}",
                    timeline.partition_key, timeline.kind, slot.range
                );
                return Err(RepoError::ConcurrentModification {
                    timeline,
                    slot_id: None,
                });
            }
            let data = slot
                .data
                .encode()
                .map_err(|err| RepoError::InvalidData(format!("cannot encode slot data: {err}")))?;
            tx.execute(
                "INSERT INTO slots (
                    slot_kind,
                    partition_key,
                    lower_ms,
                    upper_ms,
                    data,
                    revision
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
                params![
                    timeline.kind.as_str(),
                    timeline.partition_key.to_string(),
                    lower_to_db(slot.range.lower()),
                    upper_to_db(slot.range.upper()),
                    data,
                    next_revision,
                ],
            )?;
            stored.push(Slot {
                id: Some(tx.last_insert_rowid()),
                revision: next_revision,
                ..slot.clone()
            });
        }

        tx.commit()?;
        debug!(
            "event=slot_replace module=repo status=ok partition={} kind={} deleted={} inserted={}",
            timeline.partition_key,
            timeline.kind,
            deleted.len(),
            stored.len()
        );
        Ok(stored)
    }

    fn find_all(&self, timeline: Timeline) -> RepoResult<Vec<Slot>> {
        self.find_overlapping(timeline, &UtcRange::all())
    }

    fn find_at(&self, timeline: Timeline, instant: Timestamp) -> RepoResult<Option<Slot>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SLOT_SELECT_SQL}
             WHERE slot_kind = ?1
               AND partition_key = ?2
               AND (lower_ms IS NULL OR lower_ms <= ?3)
               AND (upper_ms IS NULL OR upper_ms > ?3)
             LIMIT 1;"
        ))?;
        let mut rows = stmt.query(params![
            timeline.kind.as_str(),
            timeline.partition_key.to_string(),
            instant.as_millis(),
        ])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_slot_row(row)?));
        }
        Ok(None)
    }
}

fn validate_inserted(timeline: Timeline, inserted: &[Slot]) -> RepoResult<()> {
    let mut ranges = Vec::with_capacity(inserted.len());
    for slot in inserted {
        if slot.timeline() != timeline {
            return Err(RepoError::InvalidData(format!(
                "inserted slot {slot} does not belong to {timeline}"
            )));
        }
        if slot.range.is_empty() {
            return Err(RepoError::InvalidData(format!(
                "inserted slot has empty range {}",
                slot.range
            )));
        }
        if slot.data.is_empty() {
            return Err(RepoError::InvalidData(format!(
                "inserted slot has empty data over {}",
                slot.range
            )));
        }
        ranges.push(slot.range);
    }
    ranges.sort();
    if let Some(pair) = ranges.windows(2).find(|pair| pair[0].overlaps(&pair[1])) {
        return Err(RepoError::InvalidData(format!(
            "inserted slots overlap: {} and {}",
            pair[0], pair[1]
        )));
    }
    Ok(())
}

fn overlaps_stored_row(
    conn: &Connection,
    timeline: Timeline,
    range: &UtcRange,
) -> RepoResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM slots
            WHERE slot_kind = ?1
              AND partition_key = ?2
              AND (?4 IS NULL OR lower_ms IS NULL OR lower_ms < ?4)
              AND (?3 IS NULL OR upper_ms IS NULL OR upper_ms > ?3)
        );",
        params![
            timeline.kind.as_str(),
            timeline.partition_key.to_string(),
            lower_to_db(range.lower()),
            upper_to_db(range.upper()),
        ],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn parse_slot_row(row: &Row<'_>) -> RepoResult<Slot> {
    let kind_text: String = row.get("slot_kind")?;
    let kind = SlotKind::parse(&kind_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid slot kind `{kind_text}` in slots.slot_kind"))
    })?;

    let key_text: String = row.get("partition_key")?;
    let partition_key = key_text
        .parse::<PartitionKey>()
        .map_err(|err| RepoError::InvalidData(format!("{err} in slots.partition_key")))?;

    let lower = row
        .get::<_, Option<i64>>("lower_ms")?
        .map_or(Bound::NegInfinity, Bound::at);
    let upper = row
        .get::<_, Option<i64>>("upper_ms")?
        .map_or(Bound::PosInfinity, Bound::at);
    let range = UtcRange::new(lower, upper)
        .map_err(|err| RepoError::InvalidData(format!("{err} in slots range")))?;

    let data_text: String = row.get("data")?;
    let data = kind
        .decode_data(&data_text)
        .map_err(|err| RepoError::InvalidData(format!("{err} in slots.data")))?;

    Ok(Slot {
        id: Some(row.get("id")?),
        partition_key,
        range,
        data,
        revision: row.get("revision")?,
    })
}

pub(crate) fn lower_to_db(bound: Bound) -> Option<i64> {
    match bound {
        Bound::At(value) => Some(value.as_millis()),
        Bound::NegInfinity | Bound::PosInfinity => None,
    }
}

pub(crate) fn upper_to_db(bound: Bound) -> Option<i64> {
    lower_to_db(bound)
}
