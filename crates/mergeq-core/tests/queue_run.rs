//! End-to-end queue runs over the in-memory fakes.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use mergeq_core::fakes::{FakeVcs, InMemoryReview, RecordingLedger, ScriptedTree};
use mergeq_core::{
    ActionKind, ChangeId, DepRef, FailureKind, MergeState, QueueConfig, QueueOrchestrator,
    RemoteChange, RunOutcome,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mergeq_core=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

fn remote(number: u64, project: &str, hard: &[u64]) -> RemoteChange {
    RemoteChange {
        id: ChangeId::new("r", number, 1),
        review_key: Some(format!("I{number}")),
        sha: Some(format!("{number:040x}")),
        project: project.to_string(),
        branch: "main".to_string(),
        owner: "dev@example.org".to_string(),
        subject: format!("change {number}"),
        ready: true,
        // Approved long ago and in submission order, so grace-period
        // suppression and query ordering stay out of the way.
        approved_at: Utc::now() - Duration::hours(4) + Duration::minutes(number as i64),
        merge_state: MergeState::Mergeable,
        hard_deps: hard.iter().map(|n| DepRef::Number(*n)).collect(),
        soft_deps: Vec::new(),
    }
}

struct Harness {
    review: Arc<InMemoryReview>,
    vcs: Arc<FakeVcs>,
    ledger: Arc<RecordingLedger>,
}

impl Harness {
    fn new(projects: &[&str]) -> Self {
        init_tracing();
        Self {
            review: Arc::new(InMemoryReview::new()),
            vcs: Arc::new(FakeVcs::new(projects)),
            ledger: Arc::new(RecordingLedger::new()),
        }
    }

    fn orchestrator(&self, config: QueueConfig) -> QueueOrchestrator {
        QueueOrchestrator::new(
            config,
            self.review.clone(),
            self.vcs.clone(),
            Arc::new(ScriptedTree::open()),
            self.ledger.clone(),
        )
    }
}

#[tokio::test(start_paused = true)]
async fn test_full_run_pushes_a_dependency_chain() -> Result<()> {
    let harness = Harness::new(&["p"]);
    for (number, deps) in [(1, vec![]), (2, vec![1]), (3, vec![2])] {
        harness.review.add_change(remote(number, "p", &deps));
    }
    let mut orch = harness.orchestrator(QueueConfig::default());

    let outcome = orch.run().await?;
    assert!(matches!(outcome, RunOutcome::Complete { submitted: 3 }));

    // One batched push for the whole repository, after all three applied in
    // dependency order.
    assert_eq!(harness.vcs.pushes(), vec![("p".to_string(), "main".to_string())]);
    let head = harness.vcs.head("p");
    assert_eq!(head, "base-p+r:1/1+r:2/1+r:3/1");

    assert_eq!(harness.ledger.actions_of(ActionKind::PickedUp).len(), 3);
    assert_eq!(harness.ledger.actions_of(ActionKind::Submitted).len(), 3);
    assert!(harness.review.readiness_removed().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_api_submission_follows_dependency_order() -> Result<()> {
    // No checkout for "svc", so both changes go through the review API.
    let harness = Harness::new(&[]);
    harness.review.add_change(remote(1, "svc", &[]));
    harness.review.add_change(remote(2, "svc", &[1]));
    let mut orch = harness.orchestrator(QueueConfig::default());

    let outcome = orch.run().await?;
    assert!(matches!(outcome, RunOutcome::Complete { submitted: 2 }));

    let order: Vec<u64> = harness
        .review
        .submit_order()
        .iter()
        .map(|id| id.number)
        .collect();
    assert_eq!(order, vec![1, 2]);
    assert!(harness.vcs.pushes().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_push_retries_with_resync_then_succeeds() -> Result<()> {
    let harness = Harness::new(&["p"]);
    harness.review.add_change(remote(1, "p", &[]));
    harness.vcs.fail_push_times("p", "main", 2);
    let mut orch = harness.orchestrator(QueueConfig::default());

    let outcome = orch.run().await?;
    assert!(matches!(outcome, RunOutcome::Complete { submitted: 1 }));
    assert_eq!(harness.vcs.resyncs().len(), 2);
    assert_eq!(harness.vcs.pushes().len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_push_retries_fail_the_batch() -> Result<()> {
    let harness = Harness::new(&["p"]);
    for (number, deps) in [(1, vec![]), (2, vec![1])] {
        harness.review.add_change(remote(number, "p", &deps));
    }
    harness.vcs.fail_push_times("p", "main", 10);
    let mut orch = harness.orchestrator(QueueConfig::default());

    let outcome = orch.run().await?;
    match outcome {
        RunOutcome::SubmitFailure { submitted, failures } => {
            assert_eq!(submitted, 0);
            assert_eq!(failures.len(), 2);
            for failure in &failures {
                assert!(matches!(failure.kind, FailureKind::SubmitFailed { .. }));
            }
        }
        other => panic!("expected submit failure, got {other:?}"),
    }
    // Both authors lose their readiness flag and get told why.
    assert_eq!(harness.review.readiness_removed().len(), 2);
    assert!(!harness.review.comments(&ChangeId::new("r", 1, 1)).is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failed_api_submit_rejects_dependents() -> Result<()> {
    let harness = Harness::new(&[]);
    harness.review.add_change(remote(1, "svc", &[]));
    harness.review.add_change(remote(2, "svc", &[1]));
    harness.review.fail_submit(&ChangeId::new("r", 1, 1));
    let mut orch = harness.orchestrator(QueueConfig::default());

    let outcome = orch.run().await?;
    match outcome {
        RunOutcome::SubmitFailure { submitted, failures } => {
            assert_eq!(submitted, 0);
            assert_eq!(failures.len(), 2);
            let dependent = failures
                .iter()
                .find(|f| f.change.number == 2)
                .expect("dependent rejected");
            assert!(dependent.is_dependency());
            assert_eq!(dependent.root_cause().change.number, 1);
        }
        other => panic!("expected submit failure, got {other:?}"),
    }
    // The dependent is never submitted against a broken base.
    assert_eq!(harness.review.submit_count(&ChangeId::new("r", 2, 1)), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_submitted_but_not_merged_is_accepted() -> Result<()> {
    let harness = Harness::new(&[]);
    harness.review.add_change(remote(1, "svc", &[]));
    harness.review.stick_at_submitted(&ChangeId::new("r", 1, 1));
    let mut orch = harness.orchestrator(QueueConfig::default());

    let outcome = orch.run().await?;
    assert!(matches!(outcome, RunOutcome::Complete { submitted: 1 }));
    assert!(harness.review.readiness_removed().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_conflicting_change_is_kicked_out_and_rest_lands() -> Result<()> {
    let harness = Harness::new(&["p", "q"]);
    harness.review.add_change(remote(1, "p", &[]));
    harness.review.add_change(remote(2, "q", &[]));
    harness.vcs.fail_apply(&ChangeId::new("r", 2, 1));
    let mut orch = harness.orchestrator(QueueConfig::default());

    let outcome = orch.run().await?;
    assert!(matches!(outcome, RunOutcome::Complete { submitted: 1 }));

    assert_eq!(harness.review.readiness_removed(), vec![ChangeId::new("r", 2, 1)]);
    assert_eq!(harness.ledger.actions_of(ActionKind::KickedOut).len(), 1);
    // The untouched project still pushed; the conflicting one did not.
    assert_eq!(harness.vcs.pushes(), vec![("p".to_string(), "main".to_string())]);
    assert_eq!(harness.vcs.head("q"), "base-q");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_mixed_local_and_api_candidates_both_land() -> Result<()> {
    let harness = Harness::new(&["p"]);
    harness.review.add_change(remote(1, "p", &[]));
    harness.review.add_change(remote(2, "svc", &[]));
    let mut orch = harness.orchestrator(QueueConfig::default());

    let outcome = orch.run().await?;
    assert!(matches!(outcome, RunOutcome::Complete { submitted: 2 }));
    assert_eq!(harness.vcs.pushes().len(), 1);
    assert_eq!(harness.review.submit_count(&ChangeId::new("r", 2, 1)), 1);
    Ok(())
}
