//! SQLite-backed job store.
//!
//! All job state lives in a single SQLite database. The connection sits
//! behind a mutex that is only held for the duration of one statement or
//! transaction, never across an await point.
//!
//! The conditional status update (`UPDATE ... WHERE status = ?expected`) is
//! the primitive that keeps the executor and reaper race-free: exactly one
//! writer observes a changed row.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{EntityType, FailureKind, Job, JobStatus, ParentRef};

const DEFAULT_PAGE_SIZE: usize = 50;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    entity_id TEXT,
    job_type TEXT NOT NULL,
    parent_kind TEXT,
    parent_id TEXT,
    status TEXT NOT NULL CHECK(status IN ('pending', 'running', 'completed', 'failed')),
    priority INTEGER NOT NULL CHECK(priority BETWEEN 1 AND 10),
    search_query TEXT,
    search_filters TEXT,
    context TEXT,
    started_at INTEGER,
    completed_at INTEGER,
    error_message TEXT,
    failure_kind TEXT,
    reset_count INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_single_running
    ON jobs(status) WHERE status = 'running';
CREATE INDEX IF NOT EXISTS idx_jobs_eligible
    ON jobs(status, priority DESC, created_at);
CREATE INDEX IF NOT EXISTS idx_jobs_parent
    ON jobs(parent_kind, parent_id);

CREATE TABLE IF NOT EXISTS changes (
    id TEXT PRIMARY KEY,
    job_id TEXT,
    entity_type TEXT NOT NULL,
    entity_id TEXT,
    proposed_data TEXT NOT NULL,
    confidence REAL NOT NULL CHECK(confidence >= 0.0 AND confidence <= 1.0),
    parent_kind TEXT,
    parent_id TEXT,
    status TEXT NOT NULL CHECK(status IN ('pending', 'approved', 'rejected')),
    review_note TEXT,
    created_at INTEGER NOT NULL,
    reviewed_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_changes_parent
    ON changes(parent_kind, parent_id);
CREATE INDEX IF NOT EXISTS idx_changes_job
    ON changes(job_id);

CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    name TEXT NOT NULL,
    data TEXT NOT NULL,
    parent_id TEXT,
    source_change_id TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_entities_type
    ON entities(entity_type, name);
";

pub(crate) const JOB_COLUMNS: &str = "id, entity_type, entity_id, job_type, parent_kind, parent_id, \
     status, priority, search_query, search_filters, context, started_at, completed_at, \
     error_message, failure_kind, reset_count, created_at";

const ELIGIBLE_ORDER: &str = "ORDER BY priority DESC, created_at ASC, rowid ASC";

/// Errors from the persistence layer
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Filter for listing jobs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub entity_type: Option<EntityType>,
    /// Page size (defaults to 50 when zero)
    pub limit: usize,
    pub offset: usize,
}

impl JobFilter {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_entity_type(mut self, entity_type: EntityType) -> Self {
        self.entity_type = Some(entity_type);
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}

/// Job counts by entity type and status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStats {
    pub counts: BTreeMap<EntityType, BTreeMap<JobStatus, usize>>,
}

impl JobStats {
    pub fn count(&self, entity_type: EntityType, status: JobStatus) -> usize {
        self.counts
            .get(&entity_type)
            .and_then(|by_status| by_status.get(&status))
            .copied()
            .unwrap_or(0)
    }

    /// Total across entity types for one status
    pub fn by_status(&self, status: JobStatus) -> usize {
        self.counts
            .values()
            .filter_map(|by_status| by_status.get(&status))
            .sum()
    }

    pub fn total(&self) -> usize {
        self.counts.values().flat_map(|m| m.values()).sum()
    }
}

/// Result of a delete request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Job removed along with the changes it produced
    Deleted { changes_removed: usize },
    Running,
    NotFound,
}

/// SQLite job store (cheap to clone)
#[derive(Clone)]
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

impl JobStore {
    /// Open (or create) a database file
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Corrupt(format!(
                    "failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!(path = %path.display(), journal_mode = %mode, "Opened job store");

        Self::from_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Insert a new job
    pub fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let conn = self.lock()?;
        insert_job_row(&conn, job)?;
        Ok(())
    }

    /// Insert several jobs in one transaction
    pub fn insert_jobs(&self, jobs: &[Job]) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        for job in jobs {
            insert_job_row(&tx, job)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let conn = self.lock()?;
        let job = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id.to_string()],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// List jobs in eligibility order (priority desc, then oldest first)
    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let limit = if filter.limit == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            filter.limit
        };

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR entity_type = ?2)
             {} LIMIT ?3 OFFSET ?4",
            JOB_COLUMNS, ELIGIBLE_ORDER
        ))?;
        let jobs = stmt
            .query_map(
                params![
                    filter.status.map(|s| s.as_str()),
                    filter.entity_type.map(|t| t.as_str()),
                    limit as i64,
                    filter.offset as i64
                ],
                job_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn count_jobs(&self, status: JobStatus) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Highest-priority, oldest pending job
    pub fn next_pending(&self) -> Result<Option<Job>, StoreError> {
        let conn = self.lock()?;
        let job = conn
            .query_row(
                &format!(
                    "SELECT {} FROM jobs WHERE status = 'pending' {} LIMIT 1",
                    JOB_COLUMNS, ELIGIBLE_ORDER
                ),
                [],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    pub fn find_running(&self) -> Result<Option<Job>, StoreError> {
        let conn = self.lock()?;
        let job = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE status = 'running' LIMIT 1", JOB_COLUMNS),
                [],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// Atomically move a job from `expected` to `next`.
    ///
    /// Returns `false` when the job was not in `expected` (someone else got
    /// there first) or the transition is not allowed.
    pub fn transition(
        &self,
        id: Uuid,
        expected: JobStatus,
        next: JobStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if !expected.can_transition_to(next) {
            return Ok(false);
        }

        let conn = self.lock()?;
        let result = conn.execute(
            "UPDATE jobs SET
                status = ?3,
                started_at = CASE WHEN ?3 = 'running' THEN ?4 ELSE started_at END,
                completed_at = CASE WHEN ?3 IN ('completed', 'failed') THEN ?4 ELSE completed_at END
             WHERE id = ?1 AND status = ?2",
            params![id.to_string(), expected.as_str(), next.as_str(), to_millis(at)],
        );
        changed_unless_conflict(result)
    }

    /// Claim a pending job for execution.
    ///
    /// Succeeds only when the job is still pending and no other job is
    /// running, in a single statement.
    pub fn claim(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let result = conn.execute(
            "UPDATE jobs SET status = 'running', started_at = ?2
             WHERE id = ?1 AND status = 'pending'
               AND NOT EXISTS (SELECT 1 FROM jobs WHERE status = 'running')",
            params![id.to_string(), to_millis(at)],
        );
        changed_unless_conflict(result)
    }

    /// Mark a running job completed
    pub fn complete(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.transition(id, JobStatus::Running, JobStatus::Completed, at)
    }

    /// Mark a running job failed with a diagnostic message
    pub fn fail(
        &self,
        id: Uuid,
        kind: FailureKind,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE jobs SET status = 'failed', completed_at = ?2, error_message = ?3, failure_kind = ?4
             WHERE id = ?1 AND status = 'running'",
            params![id.to_string(), to_millis(at), message, kind.as_str()],
        )?;
        Ok(rows > 0)
    }

    /// Force-fail every running job that started before `cutoff`.
    ///
    /// Returns the ids of the jobs that were failed.
    pub fn fail_stuck(
        &self,
        cutoff: DateTime<Utc>,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        let stuck: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM jobs WHERE status = 'running' AND started_at < ?1 ORDER BY started_at",
            )?;
            let rows = stmt.query_map(params![to_millis(cutoff)], |row| row.get(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut failed = Vec::with_capacity(stuck.len());
        for id in stuck {
            let rows = tx.execute(
                "UPDATE jobs SET status = 'failed', completed_at = ?2, error_message = ?3,
                    failure_kind = 'timeout', reset_count = reset_count + 1
                 WHERE id = ?1 AND status = 'running'",
                params![id, to_millis(at), message],
            )?;
            if rows > 0 {
                failed.push(parse_uuid_str(&id)?);
            }
        }

        tx.commit()?;
        Ok(failed)
    }

    /// Delete a job that is not running, along with the changes it produced
    pub fn delete_job(&self, id: Uuid) -> Result<DeleteOutcome, StoreError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        match status.as_deref() {
            None => return Ok(DeleteOutcome::NotFound),
            Some("running") => return Ok(DeleteOutcome::Running),
            Some(_) => {}
        }

        let changes_removed = tx.execute(
            "DELETE FROM changes WHERE job_id = ?1",
            params![id.to_string()],
        )?;
        let rows = tx.execute(
            "DELETE FROM jobs WHERE id = ?1 AND status != 'running'",
            params![id.to_string()],
        )?;
        if rows == 0 {
            return Ok(DeleteOutcome::Running);
        }

        tx.commit()?;
        Ok(DeleteOutcome::Deleted { changes_removed })
    }

    /// Counts by entity type × status
    pub fn stats(&self) -> Result<JobStats, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT entity_type, status, COUNT(*) FROM jobs GROUP BY entity_type, status",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                parse_text::<EntityType>(row, 0)?,
                parse_text::<JobStatus>(row, 1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut stats = JobStats::default();
        for row in rows {
            let (entity_type, status, count) = row?;
            stats
                .counts
                .entry(entity_type)
                .or_default()
                .insert(status, count as usize);
        }
        Ok(stats)
    }

    /// Whether an equivalent job is already waiting
    pub fn has_pending_duplicate(
        &self,
        entity_type: EntityType,
        search_query: Option<&str>,
        parent_ref: Option<&ParentRef>,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM jobs
                WHERE status = 'pending' AND entity_type = ?1
                  AND search_query IS ?2 AND parent_kind IS ?3 AND parent_id IS ?4)",
            params![
                entity_type.as_str(),
                search_query,
                parent_ref.map(|p| p.kind()),
                parent_ref.map(|p| p.id().to_string())
            ],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Entity ids of a type that have no pending or running job
    pub fn entities_without_open_job(
        &self,
        entity_type: EntityType,
    ) -> Result<Vec<Uuid>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT e.id FROM entities e
             WHERE e.entity_type = ?1
               AND NOT EXISTS (
                   SELECT 1 FROM jobs j
                   WHERE j.entity_id = e.id AND j.status IN ('pending', 'running'))
             ORDER BY e.created_at, e.rowid",
        )?;
        let ids = stmt
            .query_map(params![entity_type.as_str()], |row| parse_uuid(row, 0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

pub(crate) fn insert_job_row(conn: &Connection, job: &Job) -> Result<(), StoreError> {
    conn.execute(
        &format!(
            "INSERT INTO jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            JOB_COLUMNS
        ),
        params![
            job.id.to_string(),
            job.entity_type.as_str(),
            job.entity_id.map(|id| id.to_string()),
            job.job_type.as_str(),
            job.parent_ref.map(|p| p.kind()),
            job.parent_ref.map(|p| p.id().to_string()),
            job.status.as_str(),
            job.priority as i64,
            job.search_query,
            job.search_filters
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            job.context.as_ref().map(serde_json::to_string).transpose()?,
            job.started_at.map(to_millis),
            job.completed_at.map(to_millis),
            job.error_message,
            job.failure_kind.map(|k| k.as_str()),
            job.reset_count as i64,
            to_millis(job.created_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let parent_kind: Option<String> = row.get(4)?;
    let parent_id = parse_opt_uuid(row, 5)?;
    let parent_ref = ParentRef::from_parts(parent_kind.as_deref(), parent_id)
        .map_err(|e| conversion_error(4, e))?;

    let failure_kind: Option<String> = row.get(14)?;
    let failure_kind = failure_kind
        .map(|k| FailureKind::from_str(&k))
        .transpose()
        .map_err(|e| conversion_error(14, e))?;

    Ok(Job {
        id: parse_uuid(row, 0)?,
        entity_type: parse_text(row, 1)?,
        entity_id: parse_opt_uuid(row, 2)?,
        job_type: parse_text(row, 3)?,
        parent_ref,
        status: parse_text(row, 6)?,
        priority: row.get::<_, i64>(7)? as u8,
        search_query: row.get(8)?,
        search_filters: parse_opt_json(row, 9)?,
        context: parse_opt_json(row, 10)?,
        started_at: parse_opt_millis(row, 11)?,
        completed_at: parse_opt_millis(row, 12)?,
        error_message: row.get(13)?,
        failure_kind,
        reset_count: row.get::<_, i64>(15)? as u32,
        created_at: parse_millis(row, 16)?,
    })
}

/// Treat a uniqueness conflict on the single-running index as "not changed"
fn changed_unless_conflict(result: rusqlite::Result<usize>) -> Result<bool, StoreError> {
    match result {
        Ok(rows) => Ok(rows > 0),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// Column helpers
// ============================================================================

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

pub(crate) fn parse_text<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

pub(crate) fn parse_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_opt_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        Uuid::parse_str(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

pub(crate) fn parse_uuid_str(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt(format!("bad id '{}': {}", raw, e)))
}

pub(crate) fn parse_millis(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| conversion_error(idx, format!("timestamp out of range: {}", ms)))
}

pub(crate) fn parse_opt_millis(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let ms: Option<i64> = row.get(idx)?;
    ms.map(|ms| {
        Utc.timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| conversion_error(idx, format!("timestamp out of range: {}", ms)))
    })
    .transpose()
}

pub(crate) fn parse_json<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_opt_json<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: serde::de::DeserializeOwned,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        serde_json::from_str(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}
