//! Reaper Integration Tests
//!
//! Tests for forced failure of stuck jobs and its race with completion.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Notify};

use common::{community, orchestrator, Script, ScriptedCollector};
use landscout::core::{JobStore, Orchestrator, OrchestratorSettings, ReaperConfig};
use landscout::domain::{EntityType, FailureKind, Job, JobStatus, NewJob};
use landscout::CollectorOutput;

fn stuck_job(store: &JobStore, minutes: i64) -> Job {
    let job = Job::from_new(NewJob::discovery(EntityType::Community, "San Marcos TX"));
    store.insert_job(&job).unwrap();
    assert!(store
        .claim(job.id, Utc::now() - chrono::Duration::minutes(minutes))
        .unwrap());
    job
}

#[tokio::test]
async fn test_reset_fails_job_past_timeout() {
    let orch = orchestrator(ScriptedCollector::new());
    let job = stuck_job(orch.store(), 40);

    let reset = orch.reset_stuck_jobs(30).unwrap();
    assert_eq!(reset, vec![job.id]);

    let job = orch.get_job(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::Timeout));
    assert_eq!(job.reset_count, 1);
    assert!(job.error_message.unwrap().contains("30 minutes"));
}

#[tokio::test]
async fn test_reset_is_idempotent() {
    let orch = orchestrator(ScriptedCollector::new());
    stuck_job(orch.store(), 40);

    assert_eq!(orch.reset_stuck_jobs(30).unwrap().len(), 1);
    assert!(orch.reset_stuck_jobs(30).unwrap().is_empty());
    assert_eq!(
        orch.get_stats().unwrap().by_status(JobStatus::Failed),
        1
    );
}

#[tokio::test]
async fn test_reset_frees_the_running_slot() {
    let orch = orchestrator(ScriptedCollector::new());
    stuck_job(orch.store(), 45);
    let next = orch
        .create_job(NewJob::discovery(EntityType::Builder, "Kyle builders"))
        .unwrap();

    assert!(!orch.start_next().unwrap().started);
    orch.reset_stuck_jobs(30).unwrap();

    let outcome = orch.start_next().unwrap();
    assert!(outcome.started);
    assert_eq!(outcome.job_id, Some(next));
}

#[tokio::test]
async fn test_late_results_are_discarded() {
    let collector = ScriptedCollector::new();
    let gate = Arc::new(Notify::new());
    collector.script(
        "Hays County TX",
        Script::Gated(
            gate.clone(),
            CollectorOutput::with_change(community("Plum Creek", 0.95)),
        ),
    );
    let orch = orchestrator(collector);

    let id = orch
        .create_job(NewJob::discovery(EntityType::Community, "Hays County TX"))
        .unwrap();
    let (outcome, handle) = orch.start_next_tracked().unwrap();
    assert!(outcome.started);

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(orch.reset_stuck_jobs(0).unwrap(), vec![id]);

    gate.notify_one();
    handle.unwrap().await.unwrap();

    // The reaper's failure stands and nothing from the collector landed
    let job = orch.get_job(id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::Timeout));
    assert!(orch.list_changes(None).unwrap().is_empty());
    assert!(orch.list_entities(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_background_reaper() {
    let store = JobStore::open_in_memory().unwrap();
    let orch = Orchestrator::new(
        store.clone(),
        ScriptedCollector::new(),
        OrchestratorSettings {
            reaper: ReaperConfig {
                interval: Duration::from_millis(20),
                timeout: Duration::from_secs(30 * 60),
            },
            ..Default::default()
        },
    );
    let job = stuck_job(&store, 31);

    let (shutdown, rx) = watch::channel(false);
    let handle = orch.spawn_reaper(rx);

    tokio::time::timeout(Duration::from_secs(2), async {
        while store.get_job(job.id).unwrap().unwrap().status != JobStatus::Failed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Dropping the sender also stops the loop
    drop(shutdown);
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}
