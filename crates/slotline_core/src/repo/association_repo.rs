//! Pending association queue and SQLite implementation.
//!
//! # Responsibility
//! - Persist associations written by upstream producers.
//! - Track per-association analysis progress between runs.
//!
//! # Invariants
//! - `list_pending` never returns completed associations.
//! - Pending order is deterministic: `application_ms ASC, uuid ASC`.

use crate::db::migrations::{current_user_version, latest_version};
use crate::model::association::{
    Association, AssociationData, AssociationId, AssociationOptions, AssociationProgress,
    AssociationStatus,
};
use crate::model::partition::PartitionKey;
use crate::model::range::{Bound, Timestamp, UtcRange};
use crate::repo::slot_repo::{lower_to_db, upper_to_db, RepoError, RepoResult};
use rusqlite::{params, Connection, Row};
use std::time::Duration;
use uuid::Uuid;

const ASSOCIATION_SELECT_SQL: &str = "SELECT
    uuid,
    partition_key,
    lower_ms,
    upper_ms,
    data,
    options,
    application_ms,
    status,
    applied_until_ms,
    step_span_ms,
    attempts,
    last_error
FROM associations";

/// Repository interface for the association queue.
pub trait AssociationRepository {
    fn enqueue(&self, association: &Association) -> RepoResult<AssociationId>;
    fn get(&self, id: AssociationId) -> RepoResult<Option<Association>>;
    /// Associations not completed yet, oldest application first.
    fn list_pending(&self, limit: Option<u32>) -> RepoResult<Vec<Association>>;
    fn record_progress(&self, id: AssociationId, progress: &AssociationProgress)
        -> RepoResult<()>;
}

/// SQLite-backed association queue.
pub struct SqliteAssociationRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteAssociationRepository<'conn> {
    /// Creates the repository from a migrated connection.
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

impl AssociationRepository for SqliteAssociationRepository<'_> {
    fn enqueue(&self, association: &Association) -> RepoResult<AssociationId> {
        let data = serde_json::to_string(&association.data).map_err(|err| {
            RepoError::InvalidData(format!("cannot encode association data: {err}"))
        })?;
        self.conn.execute(
            "INSERT INTO associations (
                uuid,
                kind,
                partition_key,
                lower_ms,
                upper_ms,
                data,
                options,
                application_ms,
                status,
                applied_until_ms,
                step_span_ms,
                attempts,
                last_error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13);",
            params![
                association.id.to_string(),
                association.kind().as_str(),
                association.partition_key.to_string(),
                lower_to_db(association.range.lower()),
                upper_to_db(association.range.upper()),
                data,
                association.options.to_bits(),
                association.application_date_time.as_millis(),
                association.progress.status.as_str(),
                association.progress.applied_until.map(Timestamp::as_millis),
                association.progress.step_span.map(span_to_db),
                association.progress.attempts,
                association.progress.last_error.as_deref(),
            ],
        )?;
        Ok(association.id)
    }

    fn get(&self, id: AssociationId) -> RepoResult<Option<Association>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{ASSOCIATION_SELECT_SQL} WHERE uuid = ?1;"))?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_association_row(row)?));
        }
        Ok(None)
    }

    fn list_pending(&self, limit: Option<u32>) -> RepoResult<Vec<Association>> {
        let mut stmt = self.conn.prepare(&format!(
            "{ASSOCIATION_SELECT_SQL}
             WHERE status <> 'completed'
             ORDER BY application_ms ASC, uuid ASC
             LIMIT ?1;"
        ))?;
        let limit = limit.map_or(-1, i64::from);
        let mut rows = stmt.query([limit])?;
        let mut associations = Vec::new();
        while let Some(row) = rows.next()? {
            associations.push(parse_association_row(row)?);
        }
        Ok(associations)
    }

    fn record_progress(
        &self,
        id: AssociationId,
        progress: &AssociationProgress,
    ) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE associations
             SET
                status = ?2,
                applied_until_ms = ?3,
                step_span_ms = ?4,
                attempts = ?5,
                last_error = ?6,
                updated_at = (strftime('%s', 'now') * 1000)
             WHERE uuid = ?1;",
            params![
                id.to_string(),
                progress.status.as_str(),
                progress.applied_until.map(Timestamp::as_millis),
                progress.step_span.map(span_to_db),
                progress.attempts,
                progress.last_error.as_deref(),
            ],
        )?;
        if changed == 0 {
            return Err(RepoError::NotFound(id));
        }
        Ok(())
    }
}

fn parse_association_row(row: &Row<'_>) -> RepoResult<Association> {
    let uuid_text: String = row.get("uuid")?;
    let id = Uuid::parse_str(&uuid_text).map_err(|_| {
        RepoError::InvalidData(format!("invalid uuid `{uuid_text}` in associations.uuid"))
    })?;

    let key_text: String = row.get("partition_key")?;
    let partition_key = key_text
        .parse::<PartitionKey>()
        .map_err(|err| RepoError::InvalidData(format!("{err} in associations.partition_key")))?;

    let lower = row
        .get::<_, Option<i64>>("lower_ms")?
        .map_or(Bound::NegInfinity, Bound::at);
    let upper = row
        .get::<_, Option<i64>>("upper_ms")?
        .map_or(Bound::PosInfinity, Bound::at);
    let range = UtcRange::new(lower, upper)
        .map_err(|err| RepoError::InvalidData(format!("{err} in associations range")))?;

    let data_text: String = row.get("data")?;
    let data: AssociationData = serde_json::from_str(&data_text)
        .map_err(|err| RepoError::InvalidData(format!("{err} in associations.data")))?;

    let status_text: String = row.get("status")?;
    let status = AssociationStatus::parse(&status_text).ok_or_else(|| {
        RepoError::InvalidData(format!(
            "invalid status `{status_text}` in associations.status"
        ))
    })?;

    let step_span = match row.get::<_, Option<i64>>("step_span_ms")? {
        Some(value) if value > 0 => Some(Duration::from_millis(value as u64)),
        Some(value) => {
            return Err(RepoError::InvalidData(format!(
                "invalid step span `{value}` in associations.step_span_ms"
            )));
        }
        None => None,
    };

    Ok(Association {
        id,
        partition_key,
        range,
        data,
        options: AssociationOptions::from_bits(row.get("options")?),
        application_date_time: Timestamp(row.get("application_ms")?),
        progress: AssociationProgress {
            status,
            applied_until: row.get::<_, Option<i64>>("applied_until_ms")?.map(Timestamp),
            step_span,
            attempts: row.get("attempts")?,
            last_error: row.get("last_error")?,
        },
    })
}

fn span_to_db(span: Duration) -> i64 {
    i64::try_from(span.as_millis()).unwrap_or(i64::MAX)
}
