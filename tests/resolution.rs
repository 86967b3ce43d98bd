//! Change Resolution Integration Tests
//!
//! Tests for confidence-gated review, cascade linkage, and rewriting of
//! pending-change references when a change commits.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    builder, cascade_builder, community, orchestrator, run_next, sales_rep, Script,
    ScriptedCollector,
};
use landscout::core::{CoreError, HoldReason, ReviewOutcome, StrandedDependent};
use landscout::domain::{ChangeStatus, Decision, EntityType, JobStatus, NewJob, ParentRef};
use landscout::CollectorOutput;
use tokio::sync::Notify;

#[tokio::test]
async fn test_confident_change_commits_and_rewrites_dependents() {
    let collector = ScriptedCollector::new();
    collector.script(
        "Austin TX",
        Script::Output(
            CollectorOutput::with_change(community("Mueller", 0.82))
                .and_cascade(cascade_builder("David Weekley Homes")),
        ),
    );
    let orch = orchestrator(collector);

    let job_id = orch
        .create_job(NewJob::discovery(EntityType::Community, "Austin TX").with_priority(6))
        .unwrap();
    run_next(&orch).await;

    let job = orch.get_job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let changes = orch.list_changes(None).unwrap();
    assert_eq!(changes.len(), 1);
    let change = &changes[0];
    assert_eq!(change.status, ChangeStatus::Approved);
    assert_eq!(change.job_id, Some(job_id));

    let entity_id = change.entity_id.unwrap();
    assert_eq!(job.entity_id, Some(entity_id));
    let entity = orch.store().get_entity(entity_id).unwrap().unwrap();
    assert_eq!(entity.name, "Mueller");
    assert_eq!(entity.source_change_id, Some(change.id));

    // The cascade job was created against the pending change and rewritten
    let cascade: Vec<_> = orch
        .list_jobs(&Default::default())
        .unwrap()
        .into_iter()
        .filter(|j| j.id != job_id)
        .collect();
    assert_eq!(cascade.len(), 1);
    assert_eq!(cascade[0].entity_type, EntityType::Builder);
    assert_eq!(cascade[0].priority, 5);
    assert_eq!(
        cascade[0].search_query.as_deref(),
        Some("David Weekley Homes Austin TX")
    );
    assert_eq!(
        cascade[0].parent_ref,
        Some(ParentRef::CommittedEntity(entity_id))
    );
}

#[tokio::test]
async fn test_low_confidence_change_stays_pending() {
    let collector = ScriptedCollector::new();
    collector.script(
        "Round Rock TX",
        Script::Output(
            CollectorOutput::with_change(community("Teravista", 0.40))
                .and_cascade(cascade_builder("Toll Brothers")),
        ),
    );
    let orch = orchestrator(collector);

    orch.create_job(NewJob::discovery(EntityType::Community, "Round Rock TX"))
        .unwrap();
    run_next(&orch).await;

    let pending = orch.list_changes(Some(ChangeStatus::Pending)).unwrap();
    assert_eq!(pending.len(), 1);
    assert!(orch.list_entities(None).unwrap().is_empty());

    let dependents = orch
        .list_jobs(&landscout::core::JobFilter::status(JobStatus::Pending))
        .unwrap();
    assert_eq!(dependents.len(), 1);
    assert_eq!(
        dependents[0].parent_ref,
        Some(ParentRef::PendingChange(pending[0].id))
    );

    // A later pass with the same threshold changes nothing
    let summary = orch.review_pending().unwrap();
    assert_eq!(summary.approved, 0);
    assert_eq!(summary.held, 1);
}

#[tokio::test]
async fn test_child_never_commits_before_parent() {
    let collector = ScriptedCollector::new();
    collector.script(
        "Leander TX",
        Script::Output(
            CollectorOutput::with_change(community("Travisso", 0.50))
                .and_cascade(cascade_builder("Sitterle Homes")),
        ),
    );
    collector.script(
        "Sitterle Homes Austin TX",
        Script::Output(CollectorOutput::with_change(builder("Sitterle Homes", 0.97))),
    );
    let orch = orchestrator(collector);

    orch.create_job(NewJob::discovery(EntityType::Community, "Leander TX"))
        .unwrap();
    run_next(&orch).await;
    run_next(&orch).await;

    let pending = orch.list_changes(Some(ChangeStatus::Pending)).unwrap();
    assert_eq!(pending.len(), 2);
    let parent = pending
        .iter()
        .find(|c| c.entity_type == EntityType::Community)
        .unwrap();
    let child = pending
        .iter()
        .find(|c| c.entity_type == EntityType::Builder)
        .unwrap();
    assert_eq!(child.parent_ref, Some(ParentRef::PendingChange(parent.id)));

    // High confidence is not enough while the parent is pending
    assert!(orch.list_entities(Some(EntityType::Builder)).unwrap().is_empty());
    let err = orch.review_change(child.id, Decision::Approve).unwrap_err();
    assert!(matches!(err, CoreError::Linkage(_)));
    assert!(orch.list_entities(None).unwrap().is_empty());

    // Approving the parent commits both, linked
    let outcome = orch.review_change(parent.id, Decision::Approve).unwrap();
    let ReviewOutcome::Approved { receipt, cascaded } = outcome else {
        panic!("parent should be approved");
    };
    assert_eq!(cascaded, vec![child.id]);

    let builders = orch.list_entities(Some(EntityType::Builder)).unwrap();
    assert_eq!(builders.len(), 1);
    assert_eq!(builders[0].parent_id, Some(receipt.entity_id));
    assert!(orch.list_changes(Some(ChangeStatus::Pending)).unwrap().is_empty());
}

#[tokio::test]
async fn test_three_level_chain_resolves_in_one_pass() {
    let orch = orchestrator(ScriptedCollector::new());
    let store = orch.store();

    let community_change = landscout::Change::from_proposal(
        None,
        community("Palmera Ridge", 0.60),
        None,
    )
    .unwrap();
    let builder_change = landscout::Change::from_proposal(
        None,
        builder("Coventry Homes", 0.90),
        Some(ParentRef::PendingChange(community_change.id)),
    )
    .unwrap();
    let rep_change = landscout::Change::from_proposal(
        None,
        sales_rep("Dana Ortiz", 0.88),
        Some(ParentRef::PendingChange(builder_change.id)),
    )
    .unwrap();
    for change in [&community_change, &builder_change, &rep_change] {
        store.insert_change(change).unwrap();
    }

    let outcome = orch
        .review_change(community_change.id, Decision::Approve)
        .unwrap();
    let ReviewOutcome::Approved { cascaded, .. } = outcome else {
        panic!("expected approval");
    };
    assert_eq!(cascaded, vec![builder_change.id, rep_change.id]);

    let rep = store.get_change(rep_change.id).unwrap().unwrap();
    let builder = store.get_change(builder_change.id).unwrap().unwrap();
    assert_eq!(rep.status, ChangeStatus::Approved);
    assert_eq!(
        rep.parent_ref,
        Some(ParentRef::CommittedEntity(builder.entity_id.unwrap()))
    );
}

/// Run the community job, then start the gated builder job it cascaded.
/// Returns the parent change and the in-flight execution.
async fn start_gated_child(
    orch: &landscout::Orchestrator,
    collector: &ScriptedCollector,
    gate: &Arc<Notify>,
) -> (landscout::Change, tokio::task::JoinHandle<()>) {
    collector.script(
        "Hutto TX",
        Script::Output(
            CollectorOutput::with_change(community("Star Ranch", 0.40))
                .and_cascade(cascade_builder("Castle Rock Homes")),
        ),
    );
    collector.script(
        "Castle Rock Homes Austin TX",
        Script::Gated(
            gate.clone(),
            CollectorOutput::with_change(builder("Castle Rock Homes", 0.50)),
        ),
    );

    orch.create_job(NewJob::discovery(EntityType::Community, "Hutto TX"))
        .unwrap();
    run_next(orch).await;
    let parent = orch.list_changes(Some(ChangeStatus::Pending)).unwrap()[0].clone();

    let (outcome, handle) = orch.start_next_tracked().unwrap();
    assert!(outcome.started);
    (parent, handle.unwrap())
}

#[tokio::test]
async fn test_parent_approved_while_child_runs() {
    let collector = ScriptedCollector::new();
    let gate = Arc::new(Notify::new());
    let orch = orchestrator(collector.clone());
    let (parent, handle) = start_gated_child(&orch, &collector, &gate).await;

    let ReviewOutcome::Approved { receipt, .. } =
        orch.review_change(parent.id, Decision::Approve).unwrap()
    else {
        panic!("parent should be approved");
    };

    gate.notify_one();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    let committed = Some(ParentRef::CommittedEntity(receipt.entity_id));
    let child = orch.list_changes(Some(ChangeStatus::Pending)).unwrap();
    assert_eq!(child.len(), 1);
    assert_eq!(child[0].entity_type, EntityType::Builder);
    assert_eq!(child[0].parent_ref, committed);
    assert_eq!(orch.get_job(child[0].job_id.unwrap()).unwrap().parent_ref, committed);
    assert!(orch.stranded_dependents().unwrap().is_empty());
}

#[tokio::test]
async fn test_parent_rejected_while_child_runs() {
    let collector = ScriptedCollector::new();
    let gate = Arc::new(Notify::new());
    let orch = orchestrator(collector.clone());
    let (parent, handle) = start_gated_child(&orch, &collector, &gate).await;

    let outcome = orch
        .review_change(parent.id, Decision::Reject { reason: None })
        .unwrap();
    assert_eq!(outcome, ReviewOutcome::Rejected { stranded: 1 });

    gate.notify_one();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    let child = orch.list_changes(Some(ChangeStatus::Pending)).unwrap();
    assert_eq!(child.len(), 1);
    assert_eq!(child[0].parent_ref, Some(ParentRef::PendingChange(parent.id)));

    let stranded = orch.stranded_dependents().unwrap();
    assert_eq!(stranded.len(), 2);
    assert!(stranded.iter().all(|d| d.parent_change() == parent.id));
    assert!(stranded.iter().any(
        |d| matches!(d, StrandedDependent::Change { change, .. } if change.id == child[0].id)
    ));
}

#[tokio::test]
async fn test_rejected_parent_strands_dependents_until_relinked() {
    let collector = ScriptedCollector::new();
    collector.script(
        "Manor TX",
        Script::Output(
            CollectorOutput::with_change(community("ShadowGlen", 0.30))
                .and_cascade(cascade_builder("Lennar")),
        ),
    );
    let orch = orchestrator(collector);

    orch.create_job(NewJob::discovery(EntityType::Community, "Manor TX"))
        .unwrap();
    run_next(&orch).await;
    let rejected = orch.list_changes(Some(ChangeStatus::Pending)).unwrap()[0].clone();

    let outcome = orch
        .review_change(
            rejected.id,
            Decision::Reject {
                reason: Some("wrong city".to_string()),
            },
        )
        .unwrap();
    assert_eq!(outcome, ReviewOutcome::Rejected { stranded: 1 });

    let stranded = orch.stranded_dependents().unwrap();
    assert_eq!(stranded.len(), 1);
    let StrandedDependent::Job { job, parent_change } = &stranded[0] else {
        panic!("expected a stranded job");
    };
    assert_eq!(*parent_change, rejected.id);
    assert_eq!(job.context.as_ref().unwrap().name, "Lennar");

    // Relinking needs a committed entity
    let other = landscout::Change::from_proposal(None, community("ShadowGlen Manor", 0.9), None)
        .unwrap();
    orch.store().insert_change(&other).unwrap();
    let approved = orch.review_change(other.id, Decision::Approve).unwrap();
    let ReviewOutcome::Approved { receipt, .. } = approved else {
        panic!("expected approval");
    };

    assert_eq!(orch.relink(rejected.id, receipt.entity_id).unwrap(), (1, 0));
    assert!(orch.stranded_dependents().unwrap().is_empty());
    assert_eq!(
        orch.get_job(job.id).unwrap().parent_ref,
        Some(ParentRef::CommittedEntity(receipt.entity_id))
    );
}

#[tokio::test]
async fn test_auto_review_holds_child_of_rejected_parent() {
    let orch = orchestrator(ScriptedCollector::new());
    let store = orch.store();

    let parent = landscout::Change::from_proposal(None, community("Blackhawk", 0.2), None)
        .unwrap();
    let child = landscout::Change::from_proposal(
        None,
        builder("Ashton Woods", 0.99),
        Some(ParentRef::PendingChange(parent.id)),
    )
    .unwrap();
    store.insert_change(&parent).unwrap();
    store.insert_change(&child).unwrap();

    orch.review_change(parent.id, Decision::Reject { reason: None })
        .unwrap();
    let summary = orch.review_pending().unwrap();
    assert_eq!(summary.approved, 0);
    assert_eq!(summary.held, 1);

    let err = orch.review_change(child.id, Decision::Approve).unwrap_err();
    assert!(matches!(err, CoreError::Linkage(_)));
    assert!(matches!(
        landscout::core::ReviewEngine::new(store.clone(), 0.75)
            .auto_review(child.id)
            .unwrap(),
        ReviewOutcome::Held(HoldReason::Unlinked { .. })
    ));
}

#[tokio::test]
async fn test_update_job_updates_existing_entity() {
    let collector = ScriptedCollector::new();
    collector.script(
        "Pflugerville TX",
        Script::Output(CollectorOutput::with_change(community("Falcon Pointe", 0.9))),
    );
    let orch = orchestrator(collector.clone());

    orch.create_job(NewJob::discovery(EntityType::Community, "Pflugerville TX"))
        .unwrap();
    run_next(&orch).await;
    let entity = orch.list_entities(Some(EntityType::Community)).unwrap()[0].clone();

    let queued = orch.queue_updates(EntityType::Community, 4).unwrap();
    assert_eq!(queued.len(), 1);
    // No duplicate while one is open
    assert!(orch.queue_updates(EntityType::Community, 4).unwrap().is_empty());

    let update = orch.get_job(queued[0]).unwrap();
    assert_eq!(update.entity_id, Some(entity.id));
    run_next(&orch).await;

    // The update job has no search query, so the collector returned nothing
    assert_eq!(orch.get_job(update.id).unwrap().status, JobStatus::Completed);
    assert_eq!(collector.seen().last().unwrap().entity_id, Some(entity.id));

    let change = landscout::Change::from_proposal(
        Some(update.id),
        community("Falcon Pointe", 0.95).for_entity(entity.id),
        None,
    )
    .unwrap();
    orch.store().insert_change(&change).unwrap();
    let summary = orch.review_pending().unwrap();
    assert_eq!(summary.approved, 1);

    let entities = orch.list_entities(Some(EntityType::Community)).unwrap();
    assert_eq!(entities.len(), 1);
    assert!(entities[0].updated_at >= entity.updated_at);
}
