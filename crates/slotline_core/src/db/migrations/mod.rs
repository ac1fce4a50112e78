//! Schema migrations for the slot and association tables.
//!
//! # Responsibility
//! - Keep the ordered list of schema steps and report where a connection
//!   stands relative to it.
//! - Bring a connection to the latest schema in one transaction.
//!
//! # Invariants
//! - Step versions start at 1 and increase by exactly one.
//! - `PRAGMA user_version` always names the last step applied.
//! - A failing step rolls back every step of the same call.

use crate::db::{DbError, DbResult};
use log::{debug, info};
use rusqlite::Connection;

struct SchemaStep {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const SCHEMA_STEPS: &[SchemaStep] = &[
    SchemaStep {
        version: 1,
        name: "slots",
        sql: include_str!("0001_slots.sql"),
    },
    SchemaStep {
        version: 2,
        name: "associations",
        sql: include_str!("0002_associations.sql"),
    },
];

/// Position of a connection's schema relative to this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaState {
    Current,
    /// Steps after `from` up to `to` are still missing.
    Behind { from: u32, to: u32 },
    /// Written by a newer build; never touched.
    Ahead { found: u32, latest: u32 },
}

/// Latest schema version known by this build.
pub fn latest_version() -> u32 {
    SCHEMA_STEPS.last().map_or(0, |step| step.version)
}

/// Reads the applied schema version from `PRAGMA user_version`.
pub fn current_user_version(conn: &Connection) -> DbResult<u32> {
    Ok(conn.query_row("PRAGMA user_version;", [], |row| row.get::<_, u32>(0))?)
}

pub fn schema_state(conn: &Connection) -> DbResult<SchemaState> {
    let found = current_user_version(conn)?;
    let latest = latest_version();
    Ok(match found.cmp(&latest) {
        std::cmp::Ordering::Equal => SchemaState::Current,
        std::cmp::Ordering::Less => SchemaState::Behind {
            from: found,
            to: latest,
        },
        std::cmp::Ordering::Greater => SchemaState::Ahead { found, latest },
    })
}

/// Applies every missing schema step.
///
/// # Errors
/// - `UnsupportedSchemaVersion` when the database is ahead of this build.
/// - `Migration` naming the first step whose SQL failed.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<()> {
    let (from, to) = match schema_state(conn)? {
        SchemaState::Current => return Ok(()),
        SchemaState::Ahead { found, latest } => {
            return Err(DbError::UnsupportedSchemaVersion {
                db_version: found,
                latest_supported: latest,
            })
        }
        SchemaState::Behind { from, to } => (from, to),
    };

    let tx = conn.transaction()?;
    for step in SCHEMA_STEPS.iter().filter(|step| step.version > from) {
        tx.execute_batch(step.sql)
            .and_then(|()| tx.pragma_update(None, "user_version", step.version))
            .map_err(|source| DbError::Migration {
                version: step.version,
                name: step.name,
                source,
            })?;
        debug!(
            "event=db_migrate_step module=db status=ok version={} name={}",
            step.version, step.name
        );
    }
    tx.commit()?;

    info!("event=db_migrate module=db status=ok from_version={from} to_version={to}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{latest_version, SCHEMA_STEPS};

    #[test]
    fn step_versions_are_consecutive_from_one() {
        for (index, step) in SCHEMA_STEPS.iter().enumerate() {
            assert_eq!(step.version as usize, index + 1, "step {}", step.name);
        }
        assert_eq!(latest_version() as usize, SCHEMA_STEPS.len());
    }
}
