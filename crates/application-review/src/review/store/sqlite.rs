//! SQLite implementation of [`ReviewStore`].
//!
//! # Schema Versioning
//!
//! The schema version lives in SQLite's `user_version` pragma. To change the schema, bump
//! `SCHEMA_VERSION` and add a `migrate_v{N}_to_v{N+1}` step to `run_migrations`.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use tracing::{info, warn};

use super::retry::RetryPolicy;
use super::{ApplicationStats, ReviewStore, StoreError, VoteChange, VoteOutcome};
use crate::review::domain::{
    Application, ApplicationStatus, Decision, Polarity, ResponseId, Tally, Vote, VoterId,
};

const SCHEMA_VERSION: i32 = 2;

/// How long SQLite itself waits on a lock before handing `SQLITE_BUSY` to the retry policy.
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

const APPLICATION_COLUMNS: &str = "response_id, applicant_id, submitted_at, message_ref, status, \
                                   created_at, updated_at";

/// SQLite-backed review store.
///
/// `rusqlite::Connection` is not `Sync`, so the connection sits behind a `Mutex`. The lock is
/// released between retry attempts so a backoff never blocks other callers.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    retry: RetryPolicy,
}

impl SqliteStore {
    /// Open or create the database file at `path`.
    pub fn open<P: AsRef<Path>>(path: P, retry: RetryPolicy) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    StoreError::Unavailable(format!(
                        "create database directory {}: {err}",
                        parent.display()
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            warn!(
                journal_mode = %journal_mode,
                path = %path.display(),
                "SQLite refused WAL mode; concurrent readers will contend with writers"
            );
        }
        conn.execute_batch("PRAGMA synchronous = FULL;")?;

        let store = Self::with_connection(conn, retry)?;
        info!(path = %path.display(), "review store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests and demos).
    pub fn in_memory(retry: RetryPolicy) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, retry)
    }

    fn with_connection(conn: Connection, retry: RetryPolicy) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            retry,
        })
    }

    fn with_conn<T, F>(&self, what: &'static str, operation: F) -> Result<T, StoreError>
    where
        F: Fn(&mut Connection) -> Result<T, StoreError>,
    {
        self.retry.run(what, || {
            let mut conn = self.conn.lock().expect("sqlite connection mutex poisoned");
            operation(&mut conn)
        })
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    let current: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if current > SCHEMA_VERSION {
        return Err(StoreError::Unavailable(format!(
            "database schema version {current} is newer than supported version {SCHEMA_VERSION}"
        )));
    }

    if current < SCHEMA_VERSION {
        run_migrations(conn, current)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }

    Ok(())
}

fn run_migrations(conn: &Connection, from_version: i32) -> Result<(), StoreError> {
    if from_version < 1 {
        migrate_v0_to_v1(conn)?;
    }
    if from_version < 2 {
        migrate_v1_to_v2(conn)?;
    }
    Ok(())
}

fn migrate_v0_to_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS processed_responses (
            response_id TEXT PRIMARY KEY,
            processed_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS applications (
            response_id TEXT PRIMARY KEY,
            applicant_id TEXT NOT NULL,
            submitted_at TEXT NOT NULL,
            message_ref TEXT,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK(status IN ('pending', 'accepted', 'denied')),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_applications_message_ref
        ON applications(message_ref) WHERE message_ref IS NOT NULL;

        CREATE INDEX IF NOT EXISTS idx_applications_pending
        ON applications(created_at) WHERE status = 'pending';

        CREATE TABLE IF NOT EXISTS application_votes (
            response_id TEXT NOT NULL REFERENCES applications(response_id),
            voter_id TEXT NOT NULL,
            polarity TEXT NOT NULL CHECK(polarity IN ('approve', 'deny')),
            cast_at TEXT NOT NULL,
            PRIMARY KEY (response_id, voter_id)
        );
        "#,
    )?;
    Ok(())
}

/// Message references become unique. Where older rows share a reference, the most recently
/// inserted one keeps it.
fn migrate_v1_to_v2(conn: &Connection) -> Result<(), StoreError> {
    let cleared = conn.execute(
        "UPDATE applications SET message_ref = NULL
         WHERE message_ref IS NOT NULL
           AND rowid NOT IN (
               SELECT MAX(rowid) FROM applications
               WHERE message_ref IS NOT NULL
               GROUP BY message_ref
           )",
        [],
    )?;
    if cleared > 0 {
        warn!(cleared, "cleared duplicate message references during migration");
    }
    conn.execute_batch(
        r#"
        DROP INDEX IF EXISTS idx_applications_message_ref;
        CREATE UNIQUE INDEX idx_applications_message_ref
        ON applications(message_ref) WHERE message_ref IS NOT NULL;
        "#,
    )?;
    Ok(())
}

fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, message.into())
}

fn polarity_at(row: &Row<'_>, index: usize) -> rusqlite::Result<Polarity> {
    let raw: String = row.get(index)?;
    Polarity::parse(&raw).ok_or_else(|| conversion_error(index, format!("unknown polarity '{raw}'")))
}

fn application_from_row(row: &Row<'_>) -> rusqlite::Result<Application> {
    let raw_status: String = row.get(4)?;
    let status = ApplicationStatus::parse(&raw_status)
        .ok_or_else(|| conversion_error(4, format!("unknown status '{raw_status}'")))?;
    Ok(Application {
        response_id: ResponseId(row.get(0)?),
        applicant_id: row.get(1)?,
        submitted_at: row.get(2)?,
        external_message_ref: row.get(3)?,
        status,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn load_application(
    conn: &Connection,
    response_id: &ResponseId,
) -> Result<Option<Application>, StoreError> {
    let sql = format!("SELECT {APPLICATION_COLUMNS} FROM applications WHERE response_id = ?1");
    Ok(conn
        .query_row(&sql, params![response_id.0], application_from_row)
        .optional()?)
}

fn tally_in(conn: &Connection, response_id: &ResponseId) -> Result<Tally, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT polarity, COUNT(*) FROM application_votes WHERE response_id = ?1 GROUP BY polarity",
    )?;
    let rows = stmt.query_map(params![response_id.0], |row| {
        Ok((polarity_at(row, 0)?, row.get::<_, u32>(1)?))
    })?;

    let mut tally = Tally::default();
    for row in rows {
        match row? {
            (Polarity::Approve, count) => tally.approve = count,
            (Polarity::Deny, count) => tally.deny = count,
        }
    }
    Ok(tally)
}

impl ReviewStore for SqliteStore {
    fn is_processed(&self, response_id: &ResponseId) -> Result<bool, StoreError> {
        self.with_conn("is_processed", |conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM processed_responses WHERE response_id = ?1",
                    params![response_id.0],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    fn mark_processed(&self, response_id: &ResponseId) -> Result<(), StoreError> {
        self.with_conn("mark_processed", |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO processed_responses (response_id, processed_at) VALUES (?1, ?2)",
                params![response_id.0, Utc::now()],
            )?;
            Ok(())
        })
    }

    fn sweep_processed(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.with_conn("sweep_processed", |conn| {
            let removed = conn.execute(
                "DELETE FROM processed_responses
                 WHERE processed_at < ?1
                   AND response_id NOT IN (
                       SELECT response_id FROM applications WHERE status = 'pending'
                   )",
                params![cutoff],
            )?;
            Ok(removed)
        })
    }

    fn insert_application(&self, application: Application) -> Result<Application, StoreError> {
        self.with_conn("insert_application", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT OR IGNORE INTO applications
                 (response_id, applicant_id, submitted_at, message_ref, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    application.response_id.0,
                    application.applicant_id,
                    application.submitted_at,
                    application.external_message_ref,
                    application.status.label(),
                    application.created_at,
                    application.updated_at,
                ],
            )?;
            let stored = load_application(&tx, &application.response_id)?
                .ok_or(StoreError::NotFound)?;
            tx.commit()?;
            Ok(stored)
        })
    }

    fn attach_message_ref(
        &self,
        response_id: &ResponseId,
        message_ref: &str,
    ) -> Result<(), StoreError> {
        self.with_conn("attach_message_ref", |conn| {
            let changed = conn
                .execute(
                    "UPDATE applications SET message_ref = ?1, updated_at = ?2 WHERE response_id = ?3",
                    params![message_ref, Utc::now(), response_id.0],
                )
                .map_err(|err| match err {
                    rusqlite::Error::SqliteFailure(failure, _)
                        if failure.code == ErrorCode::ConstraintViolation =>
                    {
                        StoreError::DuplicateMessageRef(message_ref.to_string())
                    }
                    other => StoreError::from(other),
                })?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }

    fn application(&self, response_id: &ResponseId) -> Result<Option<Application>, StoreError> {
        self.with_conn("application", |conn| load_application(conn, response_id))
    }

    fn application_by_message_ref(
        &self,
        message_ref: &str,
    ) -> Result<Option<Application>, StoreError> {
        self.with_conn("application_by_message_ref", |conn| {
            let sql = format!("SELECT {APPLICATION_COLUMNS} FROM applications WHERE message_ref = ?1");
            Ok(conn
                .query_row(&sql, params![message_ref], application_from_row)
                .optional()?)
        })
    }

    fn pending_applications(&self, limit: usize) -> Result<Vec<Application>, StoreError> {
        self.with_conn("pending_applications", |conn| {
            let sql = format!(
                "SELECT {APPLICATION_COLUMNS} FROM applications
                 WHERE status = 'pending' ORDER BY created_at LIMIT ?1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows = stmt.query_map(params![limit], application_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    fn finalize(&self, response_id: &ResponseId, decision: Decision) -> Result<bool, StoreError> {
        self.with_conn("finalize", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let changed = tx.execute(
                "UPDATE applications SET status = ?1, updated_at = ?2
                 WHERE response_id = ?3 AND status = 'pending'",
                params![decision.label(), Utc::now(), response_id.0],
            )?;
            if changed == 0 && load_application(&tx, response_id)?.is_none() {
                return Err(StoreError::NotFound);
            }
            tx.commit()?;
            Ok(changed == 1)
        })
    }

    fn stats(&self) -> Result<ApplicationStats, StoreError> {
        self.with_conn("stats", |conn| {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM applications GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?;

            let mut stats = ApplicationStats::default();
            for row in rows {
                let (status, count) = row?;
                match ApplicationStatus::parse(&status) {
                    Some(ApplicationStatus::Pending) => stats.pending = count,
                    Some(ApplicationStatus::Accepted) => stats.accepted = count,
                    Some(ApplicationStatus::Denied) => stats.denied = count,
                    None => return Err(StoreError::Corrupt(format!("unknown status '{status}'"))),
                }
                stats.total += count;
            }
            Ok(stats)
        })
    }

    fn cast_vote(
        &self,
        response_id: &ResponseId,
        voter_id: &VoterId,
        polarity: Polarity,
    ) -> Result<VoteOutcome, StoreError> {
        self.with_conn("cast_vote", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing = tx
                .query_row(
                    "SELECT polarity FROM application_votes WHERE response_id = ?1 AND voter_id = ?2",
                    params![response_id.0, voter_id.0],
                    |row| polarity_at(row, 0),
                )
                .optional()?;

            let change = match existing {
                None => {
                    tx.execute(
                        "INSERT INTO application_votes (response_id, voter_id, polarity, cast_at)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![response_id.0, voter_id.0, polarity.label(), Utc::now()],
                    )?;
                    VoteChange::Added
                }
                Some(current) if current == polarity => {
                    tx.execute(
                        "DELETE FROM application_votes WHERE response_id = ?1 AND voter_id = ?2",
                        params![response_id.0, voter_id.0],
                    )?;
                    VoteChange::Retracted
                }
                Some(current) => {
                    tx.execute(
                        "UPDATE application_votes SET polarity = ?1, cast_at = ?2
                         WHERE response_id = ?3 AND voter_id = ?4",
                        params![polarity.label(), Utc::now(), response_id.0, voter_id.0],
                    )?;
                    VoteChange::Switched { from: current }
                }
            };

            let tally = tally_in(&tx, response_id)?;
            tx.commit()?;
            Ok(VoteOutcome { change, tally })
        })
    }

    fn current_vote(
        &self,
        response_id: &ResponseId,
        voter_id: &VoterId,
    ) -> Result<Option<Polarity>, StoreError> {
        self.with_conn("current_vote", |conn| {
            Ok(conn
                .query_row(
                    "SELECT polarity FROM application_votes WHERE response_id = ?1 AND voter_id = ?2",
                    params![response_id.0, voter_id.0],
                    |row| polarity_at(row, 0),
                )
                .optional()?)
        })
    }

    fn tally(&self, response_id: &ResponseId) -> Result<Tally, StoreError> {
        self.with_conn("tally", |conn| tally_in(conn, response_id))
    }

    fn clear_vote(
        &self,
        response_id: &ResponseId,
        voter_id: &VoterId,
    ) -> Result<Tally, StoreError> {
        self.with_conn("clear_vote", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "DELETE FROM application_votes WHERE response_id = ?1 AND voter_id = ?2",
                params![response_id.0, voter_id.0],
            )?;
            let tally = tally_in(&tx, response_id)?;
            tx.commit()?;
            Ok(tally)
        })
    }

    fn votes(&self, response_id: &ResponseId) -> Result<Vec<Vote>, StoreError> {
        self.with_conn("votes", |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT voter_id, polarity, cast_at FROM application_votes
                 WHERE response_id = ?1 ORDER BY cast_at, rowid",
            )?;
            let rows = stmt.query_map(params![response_id.0], |row| {
                Ok(Vote {
                    response_id: response_id.clone(),
                    voter_id: VoterId(row.get(0)?),
                    polarity: polarity_at(row, 1)?,
                    cast_at: row.get(2)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }
}
