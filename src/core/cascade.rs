//! Cascade job factory.
//!
//! When a collector working on one job discovers a related entity (a
//! community page naming its builders, a builder listing sales reps), the
//! factory turns that discovery into a new job linked to its parent.
//!
//! Linkage rules for a job spawned from parent job J:
//! - J produced a change that is not committed yet → `PendingChange(change)`
//! - J targets a committed entity → `CommittedEntity(entity)`
//! - otherwise the new job has no parent
//!
//! The pending-change link is never dropped; approving the change later
//! rewrites it to the committed entity.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{
    EntityType, Job, JobContext, JobType, NewJob, ParentRef, MAX_PRIORITY, MIN_PRIORITY,
};

use super::store::{JobStore, StoreError};

/// A related entity a collector wants collected next
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeRequest {
    pub entity_type: EntityType,

    #[serde(default)]
    pub job_type: JobType,

    /// Name of the discovered entity
    pub name: String,

    #[serde(default)]
    pub location: Option<String>,

    /// Defaults to one below the parent job's priority
    #[serde(default)]
    pub priority: Option<u8>,

    /// Defaults to "{name} {location}"
    #[serde(default)]
    pub search_query: Option<String>,

    #[serde(default)]
    pub search_filters: Option<serde_json::Value>,
}

impl CascadeRequest {
    pub fn new(entity_type: EntityType, name: impl Into<String>) -> Self {
        Self {
            entity_type,
            job_type: JobType::Discovery,
            name: name.into(),
            location: None,
            priority: None,
            search_query: None,
            search_filters: None,
        }
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    fn default_query(&self) -> String {
        match &self.location {
            Some(location) => format!("{} {}", self.name.trim(), location.trim()),
            None => self.name.trim().to_string(),
        }
    }
}

/// Builds follow-on jobs for a parent job
pub struct CascadeFactory {
    store: JobStore,
}

impl CascadeFactory {
    pub fn new(store: JobStore) -> Self {
        Self { store }
    }

    /// Linkage a job spawned from `parent` should carry
    pub fn linkage_for(parent: &Job, parent_change: Option<Uuid>) -> Option<ParentRef> {
        match (parent_change, parent.entity_id) {
            (Some(change_id), _) => Some(ParentRef::PendingChange(change_id)),
            (None, Some(entity_id)) => Some(ParentRef::CommittedEntity(entity_id)),
            (None, None) => None,
        }
    }

    /// Turn cascade requests into pending jobs (not yet persisted).
    ///
    /// Invalid requests and duplicates of already-pending jobs are skipped.
    pub fn plan(
        &self,
        parent: &Job,
        parent_change: Option<Uuid>,
        requests: Vec<CascadeRequest>,
    ) -> Result<Vec<Job>, StoreError> {
        let parent_ref = Self::linkage_for(parent, parent_change);
        if parent_ref.is_none() && !requests.is_empty() {
            debug!(
                parent_job = %parent.id,
                "Parent job has no change or entity; cascade jobs will be unlinked"
            );
        }

        let default_priority = parent.priority.saturating_sub(1).clamp(MIN_PRIORITY, MAX_PRIORITY);
        let mut planned: Vec<Job> = Vec::with_capacity(requests.len());

        for request in requests {
            if request.name.trim().is_empty() {
                warn!(parent_job = %parent.id, "Dropping cascade request without a name");
                continue;
            }

            let search_query = request
                .search_query
                .clone()
                .unwrap_or_else(|| request.default_query());

            let new = NewJob {
                entity_type: request.entity_type,
                job_type: request.job_type,
                priority: request.priority.unwrap_or(default_priority),
                entity_id: None,
                parent_ref,
                search_query: Some(search_query),
                search_filters: request.search_filters.clone(),
                context: Some(JobContext {
                    name: request.name.trim().to_string(),
                    location: request.location.clone(),
                }),
            };

            if let Err(reason) = new.validate() {
                warn!(parent_job = %parent.id, name = %request.name, %reason, "Dropping invalid cascade request");
                continue;
            }

            let duplicate_in_batch = planned.iter().any(|job| {
                job.entity_type == new.entity_type
                    && job.search_query == new.search_query
                    && job.parent_ref == new.parent_ref
            });
            if duplicate_in_batch
                || self.store.has_pending_duplicate(
                    new.entity_type,
                    new.search_query.as_deref(),
                    new.parent_ref.as_ref(),
                )?
            {
                debug!(parent_job = %parent.id, name = %request.name, "Skipping duplicate cascade request");
                continue;
            }

            planned.push(Job::from_new(new));
        }

        Ok(planned)
    }
}
