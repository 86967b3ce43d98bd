//! Control surface for job orchestration.
//!
//! Ties the store, executor, reaper and review engine together behind the
//! operations exposed to callers (the CLI, or an API layer embedding this
//! crate).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::adapters::Collector;
use crate::domain::{
    Change, ChangeStatus, Decision, Entity, EntityType, Job, NewJob, ParentRef,
};

use super::error::{CoreError, CoreResult};
use super::executor::{Executor, StartOutcome};
use super::ledger::StrandedDependent;
use super::reaper::{self, Reaper, ReaperConfig};
use super::review::{ReviewEngine, ReviewOutcome, ReviewSummary, DEFAULT_APPROVAL_THRESHOLD};
use super::store::{DeleteOutcome, JobFilter, JobStats, JobStore};

/// Tunables for an [`Orchestrator`]
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub approval_threshold: f64,
    pub reaper: ReaperConfig,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            approval_threshold: DEFAULT_APPROVAL_THRESHOLD,
            reaper: ReaperConfig::default(),
        }
    }
}

/// Main orchestrator
#[derive(Clone)]
pub struct Orchestrator {
    store: JobStore,
    executor: Executor,
    review: ReviewEngine,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        store: JobStore,
        collector: Arc<dyn Collector>,
        settings: OrchestratorSettings,
    ) -> Self {
        let review = ReviewEngine::new(store.clone(), settings.approval_threshold);
        let executor = Executor::new(store.clone(), collector, review.clone());
        Self {
            store,
            executor,
            review,
            settings,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Validate and queue a job
    #[instrument(skip(self, new), fields(entity_type = %new.entity_type))]
    pub fn create_job(&self, new: NewJob) -> CoreResult<Uuid> {
        new.validate().map_err(CoreError::Validation)?;
        self.check_references(&new)?;

        let job = Job::from_new(new);
        self.store.insert_job(&job)?;
        info!(job_id = %job.id, priority = job.priority, "Job created");
        Ok(job.id)
    }

    /// Start the next pending job unless one is already running
    pub fn start_next(&self) -> CoreResult<StartOutcome> {
        self.executor.start_next()
    }

    /// Same as [`start_next`](Self::start_next), with the execution handle
    pub fn start_next_tracked(&self) -> CoreResult<(StartOutcome, Option<JoinHandle<()>>)> {
        self.executor.start_next_tracked()
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> CoreResult<Vec<Job>> {
        Ok(self.store.list_jobs(filter)?)
    }

    pub fn get_job(&self, id: Uuid) -> CoreResult<Job> {
        self.store
            .get_job(id)?
            .ok_or_else(|| CoreError::job_not_found(id))
    }

    /// Delete a job that is not running; returns how many of its changes
    /// were removed with it
    #[instrument(skip(self))]
    pub fn delete_job(&self, id: Uuid) -> CoreResult<usize> {
        match self.store.delete_job(id)? {
            DeleteOutcome::Deleted { changes_removed } => {
                info!(job_id = %id, changes_removed, "Job deleted");
                Ok(changes_removed)
            }
            DeleteOutcome::Running => Err(CoreError::JobRunning(id)),
            DeleteOutcome::NotFound => Err(CoreError::job_not_found(id)),
        }
    }

    /// One reaper pass with the given timeout
    #[instrument(skip(self))]
    pub fn reset_stuck_jobs(&self, timeout_minutes: u64) -> CoreResult<Vec<Uuid>> {
        let secs = timeout_minutes.checked_mul(60).ok_or_else(|| {
            CoreError::Validation(format!("timeout of {} minutes is too large", timeout_minutes))
        })?;
        let ids = reaper::sweep(&self.store, Duration::from_secs(secs))?;
        if !ids.is_empty() {
            info!(count = ids.len(), "Reset stuck jobs");
        }
        Ok(ids)
    }

    pub fn get_stats(&self) -> CoreResult<JobStats> {
        Ok(self.store.stats()?)
    }

    /// Operator decision on a change
    pub fn review_change(&self, change_id: Uuid, decision: Decision) -> CoreResult<ReviewOutcome> {
        self.review.review(change_id, decision)
    }

    /// Auto-review every pending change
    pub fn review_pending(&self) -> CoreResult<ReviewSummary> {
        self.review.review_pending()
    }

    pub fn list_changes(&self, status: Option<ChangeStatus>) -> CoreResult<Vec<Change>> {
        Ok(self.store.list_changes(status)?)
    }

    pub fn get_change(&self, id: Uuid) -> CoreResult<Change> {
        self.store
            .get_change(id)?
            .ok_or_else(|| CoreError::change_not_found(id))
    }

    pub fn list_entities(&self, entity_type: Option<EntityType>) -> CoreResult<Vec<Entity>> {
        Ok(self.store.list_entities(entity_type)?)
    }

    /// Queue one discovery job per query.
    ///
    /// All queries are validated before anything is stored; queries that
    /// repeat or match an already pending job are skipped.
    #[instrument(skip(self, queries), fields(count = queries.len()))]
    pub fn bulk_discover(
        &self,
        entity_type: EntityType,
        queries: &[String],
        priority: u8,
    ) -> CoreResult<Vec<Uuid>> {
        let mut jobs: Vec<Job> = Vec::with_capacity(queries.len());

        for query in queries {
            let new = NewJob::discovery(entity_type, query.trim()).with_priority(priority);
            new.validate()
                .map_err(|e| CoreError::Validation(format!("query '{}': {}", query, e)))?;

            let seen = jobs.iter().any(|j| j.search_query == new.search_query);
            if seen
                || self
                    .store
                    .has_pending_duplicate(entity_type, new.search_query.as_deref(), None)?
            {
                continue;
            }
            jobs.push(Job::from_new(new));
        }

        self.store.insert_jobs(&jobs)?;
        info!(queued = jobs.len(), skipped = queries.len() - jobs.len(), "Discovery jobs queued");
        Ok(jobs.into_iter().map(|j| j.id).collect())
    }

    /// Queue an update job for every entity of a type that has none open
    #[instrument(skip(self))]
    pub fn queue_updates(&self, entity_type: EntityType, priority: u8) -> CoreResult<Vec<Uuid>> {
        let jobs = self
            .store
            .entities_without_open_job(entity_type)?
            .into_iter()
            .map(|entity_id| -> CoreResult<Job> {
                let new = NewJob::update(entity_type, entity_id).with_priority(priority);
                new.validate().map_err(CoreError::Validation)?;
                Ok(Job::from_new(new))
            })
            .collect::<CoreResult<Vec<_>>>()?;

        self.store.insert_jobs(&jobs)?;
        info!(queued = jobs.len(), "Update jobs queued");
        Ok(jobs.into_iter().map(|j| j.id).collect())
    }

    /// Jobs and changes still pointing at a rejected or missing change
    pub fn stranded_dependents(&self) -> CoreResult<Vec<StrandedDependent>> {
        Ok(self.store.stranded_dependents()?)
    }

    /// Point the dependents of a reviewed change at a committed entity.
    ///
    /// Returns the number of jobs and changes relinked.
    #[instrument(skip(self))]
    pub fn relink(&self, change_id: Uuid, entity_id: Uuid) -> CoreResult<(usize, usize)> {
        let (jobs, changes) = self.store.relink(change_id, entity_id)?;
        info!(jobs, changes, "Dependents relinked");
        Ok((jobs, changes))
    }

    /// Start the background reaper; stops when `shutdown` becomes `true`
    pub fn spawn_reaper(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        Reaper::new(self.store.clone(), self.settings.reaper).spawn(shutdown)
    }

    /// Refuse jobs whose references cannot resolve
    fn check_references(&self, new: &NewJob) -> CoreResult<()> {
        if let Some(entity_id) = new.entity_id {
            match self.store.get_entity(entity_id)? {
                None => return Err(CoreError::entity_not_found(entity_id)),
                Some(entity) if entity.entity_type != new.entity_type => {
                    return Err(CoreError::Validation(format!(
                        "entity {} is a {}, not a {}",
                        entity_id, entity.entity_type, new.entity_type
                    )));
                }
                Some(_) => {}
            }
        }

        match new.parent_ref {
            Some(ParentRef::CommittedEntity(id)) => {
                if !self.store.entity_exists(id)? {
                    return Err(CoreError::Linkage(format!(
                        "parent entity {} does not exist",
                        id
                    )));
                }
            }
            Some(ParentRef::PendingChange(id)) => {
                match self.store.get_change(id)?.map(|c| c.status) {
                    Some(ChangeStatus::Pending) => {}
                    None => {
                        return Err(CoreError::Linkage(format!(
                            "parent change {} does not exist",
                            id
                        )))
                    }
                    Some(ChangeStatus::Approved) => {
                        return Err(CoreError::Linkage(format!(
                            "parent change {} is already approved; reference its entity instead",
                            id
                        )))
                    }
                    Some(ChangeStatus::Rejected) => {
                        warn!(change_id = %id, "Refusing job under a rejected change");
                        return Err(CoreError::Linkage(format!(
                            "parent change {} was rejected",
                            id
                        )));
                    }
                }
            }
            None => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{CollectorError, CollectorOutput};
    use crate::domain::{JobStatus, JobType};
    use async_trait::async_trait;

    struct Idle;

    #[async_trait]
    impl Collector for Idle {
        fn name(&self) -> &str {
            "idle"
        }

        async fn run(&self, _job: &Job) -> Result<CollectorOutput, CollectorError> {
            Ok(CollectorOutput::default())
        }
    }

    fn orchestrator() -> Orchestrator {
        let store = JobStore::open_in_memory().unwrap();
        Orchestrator::new(store, Arc::new(Idle), OrchestratorSettings::default())
    }

    #[test]
    fn test_create_job_validation() {
        let orch = orchestrator();

        let err = orch
            .create_job(NewJob::discovery(EntityType::Community, "Kyle TX").with_priority(11))
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        let err = orch
            .create_job(NewJob::update(EntityType::Builder, Uuid::new_v4()))
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { kind: "Entity", .. }));

        let err = orch
            .create_job(
                NewJob::discovery(EntityType::Builder, "Kyle builders")
                    .with_parent(ParentRef::PendingChange(Uuid::new_v4())),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::Linkage(_)));

        assert_eq!(orch.get_stats().unwrap().total(), 0);
    }

    #[test]
    fn test_get_and_delete() {
        let orch = orchestrator();
        let id = orch
            .create_job(NewJob::discovery(EntityType::Property, "Buda TX homes"))
            .unwrap();

        let job = orch.get_job(id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.job_type, JobType::Discovery);

        assert_eq!(orch.delete_job(id).unwrap(), 0);
        assert!(matches!(
            orch.get_job(id).unwrap_err(),
            CoreError::NotFound { kind: "Job", .. }
        ));
        assert!(matches!(
            orch.delete_job(id).unwrap_err(),
            CoreError::NotFound { .. }
        ));
    }

    #[test]
    fn test_reset_stuck_rejects_oversized_timeout() {
        let orch = orchestrator();
        let id = orch
            .create_job(NewJob::discovery(EntityType::Community, "Taylor TX"))
            .unwrap();
        orch.store().claim(id, chrono::Utc::now()).unwrap();

        let err = orch.reset_stuck_jobs(u64::MAX / 2).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        // Representable but longer than any job has run
        assert!(orch.reset_stuck_jobs(1_000_000_000_000).unwrap().is_empty());
        assert!(orch.get_job(id).unwrap().is_running());
    }

    #[test]
    fn test_bulk_discover_skips_duplicates() {
        let orch = orchestrator();
        orch.create_job(NewJob::discovery(EntityType::Community, "Cedar Park TX"))
            .unwrap();

        let queries = vec![
            "Cedar Park TX".to_string(),
            "Hutto TX".to_string(),
            " Hutto TX ".to_string(),
            "Manor TX".to_string(),
        ];
        let ids = orch
            .bulk_discover(EntityType::Community, &queries, 7)
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(orch.get_job(ids[0]).unwrap().priority, 7);
    }

    #[test]
    fn test_bulk_discover_is_all_or_nothing() {
        let orch = orchestrator();
        let queries = vec!["Pflugerville TX".to_string(), "   ".to_string()];

        assert!(orch
            .bulk_discover(EntityType::Community, &queries, 5)
            .is_err());
        assert_eq!(orch.get_stats().unwrap().total(), 0);
    }
}
