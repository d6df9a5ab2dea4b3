use crate::workflows::underwriting::domain::ApplicationId;
use crate::workflows::underwriting::fusion::{
    DecisionOrigin, DecisionRecord, DecisionStatus, DecisionThresholds, FusedDecision,
    ModelLineage, RiskRating,
};
use crate::workflows::underwriting::run::{RunSettings, RunStatus, StepName, WorkflowRun};
use crate::workflows::underwriting::store::{
    AuditAction, AuditEntry, InMemoryRunStore, JsonFileRunStore, RunStore, StoreCommit,
    StoreError,
};

use super::common::{application, reference_date, APPLICATION};

fn fresh_run() -> WorkflowRun {
    WorkflowRun::new(
        application(APPLICATION),
        RunSettings {
            thresholds: DecisionThresholds::default(),
            reference_date: reference_date(),
        },
    )
}

fn decision_for(run: &WorkflowRun) -> DecisionRecord {
    DecisionRecord::new(
        run.application_id.clone(),
        Some(run.run_id.clone()),
        FusedDecision {
            rule_pass: true,
            violations: Vec::new(),
            risk_score: 0.78,
            reasoning_score: 0.8,
            reasoning_advisory: false,
            composite_score: 852,
            rating: RiskRating::AAA,
            status: DecisionStatus::Approve,
            reason: "Composite score 852 (AAA) meets approve threshold 700".to_string(),
            escalated: false,
        },
        ModelLineage::default(),
        DecisionOrigin::Automated,
    )
}

#[test]
fn commits_bump_revision_and_refuse_stale_snapshots() {
    let store = InMemoryRunStore::new();
    let run = fresh_run();

    let revision = store
        .apply(StoreCommit::run(run.clone()).with_audit(AuditEntry::system(
            &run,
            AuditAction::RunStarted,
            "started",
        )))
        .expect("first commit");
    assert_eq!(revision, Some(1));

    let mut current = store
        .fetch_run(&run.run_id)
        .expect("readable")
        .expect("persisted");
    current.status = RunStatus::Running;
    assert_eq!(store.apply(StoreCommit::run(current)).expect("commit"), Some(2));

    let err = store
        .apply(StoreCommit::run(run.clone()))
        .expect_err("stale revision refused");
    assert_eq!(
        err,
        StoreError::RevisionConflict {
            run_id: run.run_id.clone(),
            expected: 0,
            found: 2,
        }
    );
    let stored = store.fetch_run(&run.run_id).expect("readable").expect("persisted");
    assert_eq!(stored.status, RunStatus::Running);
}

#[test]
fn cancelled_runs_refuse_further_writes() {
    let store = InMemoryRunStore::new();
    let mut run = fresh_run();
    run.touch_terminal(RunStatus::Cancelled);
    store.apply(StoreCommit::run(run.clone())).expect("cancel commit");

    let mut latest = store.fetch_run(&run.run_id).expect("readable").expect("persisted");
    latest.current_stage = 3;
    let err = store
        .apply(StoreCommit::run(latest).with_audit(AuditEntry::system(
            &run,
            AuditAction::StepCompleted,
            "late write",
        )))
        .expect_err("cancelled run is frozen");
    assert_eq!(err, StoreError::RunCancelled(run.run_id.clone()));
    assert!(
        store.audit_trail(&run.run_id).expect("readable").is_empty(),
        "a refused commit writes nothing"
    );
}

#[test]
fn audit_sequences_are_monotonic_across_runs() {
    let store = InMemoryRunStore::new();
    let first = fresh_run();
    let second = fresh_run();

    store
        .apply(
            StoreCommit::run(first.clone())
                .with_audit(AuditEntry::system(&first, AuditAction::RunStarted, "a"))
                .with_audit(AuditEntry::for_step(
                    &first,
                    StepName::DocumentValidation,
                    AuditAction::StepStarted,
                    "b",
                )),
        )
        .expect("commit first");
    store
        .apply(
            StoreCommit::run(second.clone())
                .with_audit(AuditEntry::system(&second, AuditAction::RunStarted, "c")),
        )
        .expect("commit second");

    let trail = store.audit_trail(&first.run_id).expect("readable");
    let sequences: Vec<u64> = trail.iter().map(|entry| entry.sequence).collect();
    assert_eq!(sequences, vec![1, 2]);
    assert_eq!(trail[1].step, Some(StepName::DocumentValidation));

    let by_application = store
        .application_audit(&ApplicationId(APPLICATION.to_string()))
        .expect("readable");
    assert_eq!(by_application.len(), 3);
    assert_eq!(by_application[2].sequence, 3);
}

#[test]
fn decisions_are_appended_once() {
    let store = InMemoryRunStore::new();
    let run = fresh_run();
    let record = decision_for(&run);

    store
        .apply(StoreCommit::default().with_decision(record.clone()))
        .expect("first decision");
    let err = store
        .apply(StoreCommit::default().with_decision(record.clone()))
        .expect_err("duplicate refused");
    assert_eq!(err, StoreError::DuplicateDecision(record.decision_id.clone()));

    let newer = decision_for(&run);
    store
        .apply(StoreCommit::default().with_decision(newer.clone()))
        .expect("second decision");
    let history = store.decisions_for(&run.application_id).expect("readable");
    assert_eq!(history.len(), 2);
    assert_eq!(
        store.latest_decision(&run.application_id).expect("readable"),
        Some(newer)
    );
}

#[test]
fn active_runs_exclude_finished_ones() {
    let store = InMemoryRunStore::new();
    let waiting = {
        let mut run = fresh_run();
        run.status = RunStatus::AwaitingReview;
        run
    };
    let failed = {
        let mut run = fresh_run();
        run.status = RunStatus::Failed;
        run
    };
    store.apply(StoreCommit::run(waiting.clone())).expect("commit");
    store.apply(StoreCommit::run(failed)).expect("commit");

    let active = store.active_runs().expect("readable");
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].run_id, waiting.run_id);
    assert_eq!(
        store
            .active_run_for(&waiting.application_id)
            .expect("readable")
            .map(|run| run.run_id),
        Some(waiting.run_id)
    );
}

#[test]
fn resumable_failed_run_still_blocks_the_application() {
    let store = InMemoryRunStore::new();
    let mut run = fresh_run();
    run.status = RunStatus::Failed;
    store.apply(StoreCommit::run(run.clone())).expect("commit");

    assert!(store.active_runs().expect("readable").is_empty());
    assert_eq!(
        store
            .active_run_for(&run.application_id)
            .expect("readable")
            .map(|found| found.run_id),
        Some(run.run_id.clone())
    );

    let mut abandoned = store
        .fetch_run(&run.run_id)
        .expect("readable")
        .expect("stored");
    abandoned.status = RunStatus::Cancelled;
    store.apply(StoreCommit::run(abandoned)).expect("commit");
    assert_eq!(store.active_run_for(&run.application_id).expect("readable"), None);
}

#[test]
fn json_file_store_survives_reopen() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("state").join("underwriting.json");
    let run = fresh_run();
    let record = decision_for(&run);

    {
        let store = JsonFileRunStore::open(&path).expect("open empty");
        store
            .apply(
                StoreCommit::run(run.clone())
                    .with_audit(AuditEntry::system(&run, AuditAction::RunStarted, "started"))
                    .with_decision(record.clone()),
            )
            .expect("commit");
    }

    let reopened = JsonFileRunStore::open(&path).expect("reopen");
    let stored = reopened
        .fetch_run(&run.run_id)
        .expect("readable")
        .expect("persisted");
    assert_eq!(stored.revision, 1);
    assert_eq!(stored.application, run.application);
    assert_eq!(reopened.audit_trail(&run.run_id).expect("readable").len(), 1);
    assert_eq!(
        reopened.latest_decision(&run.application_id).expect("readable"),
        Some(record)
    );

    reopened
        .apply(StoreCommit::default().with_audit(
            AuditEntry::system(&stored, AuditAction::RunResumed, "after restart").by_actor("ops"),
        ))
        .expect("commit after reopen");
    let trail = reopened.audit_trail(&run.run_id).expect("readable");
    assert_eq!(trail[1].sequence, 2);
    assert_eq!(trail[1].actor, "ops");
}

#[test]
fn json_file_store_rejects_corrupt_state() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("underwriting.json");
    std::fs::write(&path, b"{not json").expect("write corrupt file");

    let err = JsonFileRunStore::open(&path).expect_err("corrupt state refused");
    assert!(matches!(err, StoreError::Serialization(_)));
}
