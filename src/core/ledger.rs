//! Change ledger and committed entities.
//!
//! Extends [`JobStore`] with the change records produced by collectors and
//! the transactional commit that turns an approved change into an entity and
//! resolves every pending reference to it.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Change, ChangeStatus, Entity, EntityType, Job, ParentRef};

use super::error::{CoreError, CoreResult};
use super::store::{
    insert_job_row, job_from_row, parse_json, parse_millis, parse_opt_millis, parse_opt_uuid,
    parse_text, parse_uuid, to_millis, JobStore, StoreError, JOB_COLUMNS,
};

const CHANGE_COLUMNS: &str = "id, job_id, entity_type, entity_id, proposed_data, confidence, \
     parent_kind, parent_id, status, review_note, created_at, reviewed_at";

const ENTITY_COLUMNS: &str =
    "id, entity_type, name, data, parent_id, source_change_id, created_at, updated_at";

/// What a successful commit did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub change_id: Uuid,
    pub entity_id: Uuid,
    /// `false` when an existing entity was updated
    pub created: bool,
    pub jobs_relinked: usize,
    /// Pending changes whose parent reference now points at the new entity
    pub changes_relinked: Vec<Uuid>,
}

/// A job or change still pointing at a rejected (or vanished) change
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrandedDependent {
    Job { job: Job, parent_change: Uuid },
    Change { change: Change, parent_change: Uuid },
}

impl StrandedDependent {
    pub fn parent_change(&self) -> Uuid {
        match self {
            Self::Job { parent_change, .. } | Self::Change { parent_change, .. } => *parent_change,
        }
    }
}

impl JobStore {
    pub fn insert_change(&self, change: &Change) -> Result<(), StoreError> {
        let conn = self.lock()?;
        insert_change_row(&conn, change)?;
        Ok(())
    }

    pub fn get_change(&self, id: Uuid) -> Result<Option<Change>, StoreError> {
        let conn = self.lock()?;
        Ok(load_change(&conn, id)?)
    }

    /// Changes oldest first, optionally filtered by status
    pub fn list_changes(&self, status: Option<ChangeStatus>) -> Result<Vec<Change>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM changes WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at ASC, rowid ASC",
            CHANGE_COLUMNS
        ))?;
        let changes = stmt
            .query_map(params![status.map(|s| s.as_str())], change_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(changes)
    }

    /// Record a collector's results and complete the job, atomically.
    ///
    /// The change takes the job's parent reference as it stands at
    /// completion, so a parent committed while the collector ran is already
    /// resolved here.
    ///
    /// Returns `false` (and writes nothing) when the job is no longer
    /// running, e.g. because the reaper already failed it.
    pub fn complete_with_results(
        &self,
        job_id: Uuid,
        change: Option<&Change>,
        cascade: &[Job],
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        let rows = tx.execute(
            "UPDATE jobs SET status = 'completed', completed_at = ?2
             WHERE id = ?1 AND status = 'running'",
            params![job_id.to_string(), to_millis(at)],
        )?;
        if rows == 0 {
            return Ok(false);
        }

        if let Some(change) = change {
            let current = tx
                .query_row(
                    &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                    params![job_id.to_string()],
                    job_from_row,
                )?
                .parent_ref;
            if current == change.parent_ref {
                insert_change_row(&tx, change)?;
            } else {
                let mut change = change.clone();
                change.parent_ref = current;
                insert_change_row(&tx, &change)?;
            }
        }
        for job in cascade {
            insert_job_row(&tx, job)?;
        }

        tx.commit()?;
        Ok(true)
    }

    /// Commit an approved change as one atomic unit.
    ///
    /// 1. validate the payload and create or update the target entity,
    ///    linked to `parent_entity`
    /// 2. rewrite every `PendingChange(change)` reference on jobs and
    ///    changes to `CommittedEntity(entity)`
    /// 3. mark the change approved
    ///
    /// Any failure rolls back the whole unit and leaves the change pending.
    pub fn commit_change(
        &self,
        change_id: Uuid,
        parent_entity: Option<Uuid>,
        note: Option<&str>,
        at: DateTime<Utc>,
    ) -> CoreResult<CommitReceipt> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        let change =
            load_change(&tx, change_id)?.ok_or_else(|| CoreError::change_not_found(change_id))?;
        if !change.is_pending() {
            return Err(CoreError::InvalidTransition {
                id: change_id,
                from: change.status.to_string(),
                to: ChangeStatus::Approved.to_string(),
            });
        }

        change
            .proposed_data
            .validate()
            .map_err(CoreError::Validation)?;
        if change.proposed_data.entity_type() != change.entity_type {
            return Err(CoreError::Validation(format!(
                "change {} is for a {} but carries a {} payload",
                change.id,
                change.entity_type,
                change.proposed_data.entity_type()
            )));
        }

        if let Some(parent_id) = parent_entity {
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM entities WHERE id = ?1)",
                params![parent_id.to_string()],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(CoreError::Linkage(format!(
                    "parent entity {} of change {} does not exist",
                    parent_id, change.id
                )));
            }
        }

        // (a) create or update the entity
        let data = serde_json::to_string(&change.proposed_data)?;
        let (entity_id, created) = match change.entity_id {
            Some(entity_id) => {
                let rows = tx.execute(
                    "UPDATE entities SET name = ?3, data = ?4, updated_at = ?5,
                        parent_id = COALESCE(?6, parent_id)
                     WHERE id = ?1 AND entity_type = ?2",
                    params![
                        entity_id.to_string(),
                        change.entity_type.as_str(),
                        change.proposed_data.display_name(),
                        data,
                        to_millis(at),
                        parent_entity.map(|id| id.to_string())
                    ],
                )?;
                if rows == 0 {
                    return Err(CoreError::Linkage(format!(
                        "change {} updates {} {} which does not exist",
                        change.id, change.entity_type, entity_id
                    )));
                }
                (entity_id, false)
            }
            None => {
                let entity_id = Uuid::new_v4();
                tx.execute(
                    &format!(
                        "INSERT INTO entities ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                        ENTITY_COLUMNS
                    ),
                    params![
                        entity_id.to_string(),
                        change.entity_type.as_str(),
                        change.proposed_data.display_name(),
                        data,
                        parent_entity.map(|id| id.to_string()),
                        change.id.to_string(),
                        to_millis(at)
                    ],
                )?;
                (entity_id, true)
            }
        };

        // (b) resolve pending references
        let changes_relinked: Vec<Uuid> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM changes
                 WHERE parent_kind = 'pending_change' AND parent_id = ?1
                 ORDER BY created_at, rowid",
            )?;
            let ids = stmt.query_map(params![change.id.to_string()], |row| parse_uuid(row, 0))?;
            ids.collect::<Result<Vec<_>, _>>()?
        };
        tx.execute(
            "UPDATE changes SET parent_kind = 'committed_entity', parent_id = ?2
             WHERE parent_kind = 'pending_change' AND parent_id = ?1",
            params![change.id.to_string(), entity_id.to_string()],
        )?;
        let jobs_relinked = tx.execute(
            "UPDATE jobs SET parent_kind = 'committed_entity', parent_id = ?2
             WHERE parent_kind = 'pending_change' AND parent_id = ?1",
            params![change.id.to_string(), entity_id.to_string()],
        )?;

        if let Some(job_id) = change.job_id {
            tx.execute(
                "UPDATE jobs SET entity_id = ?2 WHERE id = ?1 AND entity_id IS NULL",
                params![job_id.to_string(), entity_id.to_string()],
            )?;
        }

        // (c) mark approved, only if nobody reviewed it meanwhile
        let rows = tx.execute(
            "UPDATE changes SET status = 'approved', entity_id = ?2, reviewed_at = ?3,
                review_note = COALESCE(?4, review_note)
             WHERE id = ?1 AND status = 'pending'",
            params![change.id.to_string(), entity_id.to_string(), to_millis(at), note],
        )?;
        if rows == 0 {
            return Err(CoreError::InvalidTransition {
                id: change.id,
                from: "reviewed".to_string(),
                to: ChangeStatus::Approved.to_string(),
            });
        }

        tx.commit()?;

        Ok(CommitReceipt {
            change_id: change.id,
            entity_id,
            created,
            jobs_relinked,
            changes_relinked,
        })
    }

    /// Reject a pending change.
    ///
    /// Returns the number of jobs and changes left pointing at it.
    pub fn reject_change(
        &self,
        change_id: Uuid,
        note: Option<&str>,
        at: DateTime<Utc>,
    ) -> CoreResult<usize> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        let change =
            load_change(&tx, change_id)?.ok_or_else(|| CoreError::change_not_found(change_id))?;
        let rows = tx.execute(
            "UPDATE changes SET status = 'rejected', reviewed_at = ?2, review_note = ?3
             WHERE id = ?1 AND status = 'pending'",
            params![change_id.to_string(), to_millis(at), note],
        )?;
        if rows == 0 {
            return Err(CoreError::InvalidTransition {
                id: change_id,
                from: change.status.to_string(),
                to: ChangeStatus::Rejected.to_string(),
            });
        }

        let stranded = count_pending_refs(&tx, change_id)?;
        tx.commit()?;
        Ok(stranded)
    }

    /// Jobs and changes whose parent is the given pending change
    pub fn find_referencing(&self, change_id: Uuid) -> Result<(Vec<Job>, Vec<Change>), StoreError> {
        let conn = self.lock()?;

        let jobs = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM jobs WHERE parent_kind = 'pending_change' AND parent_id = ?1
                 ORDER BY created_at, rowid",
                JOB_COLUMNS
            ))?;
            let rows = stmt.query_map(params![change_id.to_string()], job_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let changes = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM changes WHERE parent_kind = 'pending_change' AND parent_id = ?1
                 ORDER BY created_at, rowid",
                CHANGE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![change_id.to_string()], change_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        Ok((jobs, changes))
    }

    /// Jobs and changes whose pending parent was rejected or deleted
    pub fn stranded_dependents(&self) -> Result<Vec<StrandedDependent>, StoreError> {
        let conn = self.lock()?;
        let orphaned = "parent_kind = 'pending_change' AND (
                parent_id IN (SELECT id FROM changes WHERE status = 'rejected')
                OR parent_id NOT IN (SELECT id FROM changes))";

        let mut stranded = Vec::new();
        {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM jobs WHERE {} ORDER BY created_at, rowid",
                JOB_COLUMNS, orphaned
            ))?;
            let rows = stmt.query_map([], job_from_row)?;
            for job in rows {
                let job = job?;
                if let Some(ParentRef::PendingChange(parent_change)) = job.parent_ref {
                    stranded.push(StrandedDependent::Job { job, parent_change });
                }
            }
        }
        {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM changes WHERE status = 'pending' AND {} ORDER BY created_at, rowid",
                CHANGE_COLUMNS, orphaned
            ))?;
            let rows = stmt.query_map([], change_from_row)?;
            for change in rows {
                let change = change?;
                if let Some(ParentRef::PendingChange(parent_change)) = change.parent_ref {
                    stranded.push(StrandedDependent::Change {
                        change,
                        parent_change,
                    });
                }
            }
        }

        Ok(stranded)
    }

    /// Point everything that references `from_change` at a committed entity.
    ///
    /// Refused while `from_change` is still pending, since approving it will
    /// resolve the references on its own.
    pub fn relink(&self, from_change: Uuid, entity_id: Uuid) -> CoreResult<(usize, usize)> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        if let Some(change) = load_change(&tx, from_change)? {
            if change.is_pending() {
                return Err(CoreError::Linkage(format!(
                    "change {} is still pending; review it instead of relinking",
                    from_change
                )));
            }
        }

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM entities WHERE id = ?1)",
            params![entity_id.to_string()],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(CoreError::entity_not_found(entity_id));
        }

        let jobs = tx.execute(
            "UPDATE jobs SET parent_kind = 'committed_entity', parent_id = ?2
             WHERE parent_kind = 'pending_change' AND parent_id = ?1",
            params![from_change.to_string(), entity_id.to_string()],
        )?;
        let changes = tx.execute(
            "UPDATE changes SET parent_kind = 'committed_entity', parent_id = ?2
             WHERE parent_kind = 'pending_change' AND parent_id = ?1 AND status = 'pending'",
            params![from_change.to_string(), entity_id.to_string()],
        )?;

        tx.commit()?;
        Ok((jobs, changes))
    }

    pub fn get_entity(&self, id: Uuid) -> Result<Option<Entity>, StoreError> {
        let conn = self.lock()?;
        let entity = conn
            .query_row(
                &format!("SELECT {} FROM entities WHERE id = ?1", ENTITY_COLUMNS),
                params![id.to_string()],
                entity_from_row,
            )
            .optional()?;
        Ok(entity)
    }

    pub fn list_entities(&self, entity_type: Option<EntityType>) -> Result<Vec<Entity>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM entities WHERE (?1 IS NULL OR entity_type = ?1)
             ORDER BY created_at, rowid",
            ENTITY_COLUMNS
        ))?;
        let entities = stmt
            .query_map(params![entity_type.map(|t| t.as_str())], entity_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entities)
    }

    /// Whether a committed entity exists
    pub fn entity_exists(&self, id: Uuid) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM entities WHERE id = ?1)",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }
}

fn insert_change_row(conn: &Connection, change: &Change) -> Result<(), StoreError> {
    conn.execute(
        &format!(
            "INSERT INTO changes ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            CHANGE_COLUMNS
        ),
        params![
            change.id.to_string(),
            change.job_id.map(|id| id.to_string()),
            change.entity_type.as_str(),
            change.entity_id.map(|id| id.to_string()),
            serde_json::to_string(&change.proposed_data)?,
            change.confidence,
            change.parent_ref.map(|p| p.kind()),
            change.parent_ref.map(|p| p.id().to_string()),
            change.status.as_str(),
            change.review_note,
            to_millis(change.created_at),
            change.reviewed_at.map(to_millis),
        ],
    )?;
    Ok(())
}

fn load_change(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<Change>> {
    conn.query_row(
        &format!("SELECT {} FROM changes WHERE id = ?1", CHANGE_COLUMNS),
        params![id.to_string()],
        change_from_row,
    )
    .optional()
}

fn count_pending_refs(conn: &Connection, change_id: Uuid) -> rusqlite::Result<usize> {
    let jobs: i64 = conn.query_row(
        "SELECT COUNT(*) FROM jobs WHERE parent_kind = 'pending_change' AND parent_id = ?1",
        params![change_id.to_string()],
        |row| row.get(0),
    )?;
    let changes: i64 = conn.query_row(
        "SELECT COUNT(*) FROM changes WHERE parent_kind = 'pending_change' AND parent_id = ?1",
        params![change_id.to_string()],
        |row| row.get(0),
    )?;
    Ok((jobs + changes) as usize)
}

fn change_from_row(row: &Row<'_>) -> rusqlite::Result<Change> {
    let parent_kind: Option<String> = row.get(6)?;
    let parent_id = parse_opt_uuid(row, 7)?;
    let parent_ref = ParentRef::from_parts(parent_kind.as_deref(), parent_id).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, e.into())
    })?;

    Ok(Change {
        id: parse_uuid(row, 0)?,
        job_id: parse_opt_uuid(row, 1)?,
        entity_type: parse_text(row, 2)?,
        entity_id: parse_opt_uuid(row, 3)?,
        proposed_data: parse_json(row, 4)?,
        confidence: row.get(5)?,
        parent_ref,
        status: parse_text(row, 8)?,
        review_note: row.get(9)?,
        created_at: parse_millis(row, 10)?,
        reviewed_at: parse_opt_millis(row, 11)?,
    })
}

fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<Entity> {
    Ok(Entity {
        id: parse_uuid(row, 0)?,
        entity_type: parse_text(row, 1)?,
        name: row.get(2)?,
        data: parse_json(row, 3)?,
        parent_id: parse_opt_uuid(row, 4)?,
        source_change_id: parse_opt_uuid(row, 5)?,
        created_at: parse_millis(row, 6)?,
        updated_at: parse_millis(row, 7)?,
    })
}
