//! Applies resolved transactions to project checkouts with scoped rollback.
//!
//! The apply phase is strictly sequential: exactly one transaction mutates
//! checkout state at a time, so a failed transaction can restore every
//! affected checkout and the committed set to their pre-attempt state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use crate::change::{Change, ChangeId, ChangeKey};
use crate::error::{ChangeFailure, FailureKind, QueueError, Result};
use crate::index::PatchIndex;
use crate::resolver::{DependencyResolver, ResolveMode, DEFAULT_RESOLVE_DEPTH};
use crate::service::ReviewService;
use crate::transaction::Transaction;
use crate::vcs::{VcsBackend, VcsError};

/// Outcome of one apply pass over a candidate set.
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Changes newly applied to a checkout, in apply order.
    pub applied: Vec<Change>,
    /// Failures against the current branch tip; retrying without a rebase
    /// cannot succeed.
    pub failed_tot: Vec<ChangeFailure>,
    /// Failures caused by other changes under test in this run; a later run
    /// with different company may succeed.
    pub failed_inflight: Vec<ChangeFailure>,
}

/// Sequential applier owning the resolution index and committed-set cache
/// for one queue run.
pub struct TransactionApplier {
    vcs: Arc<dyn VcsBackend>,
    review: Arc<dyn ReviewService>,
    index: PatchIndex,
    committed: HashSet<ChangeId>,
    /// Changes that conflicted against the tip; later transactions containing
    /// them short-circuit without touching the checkout.
    known_bad: HashMap<ChangeId, ChangeFailure>,
    /// Projects some applied transaction has already modified in this run.
    dirty_projects: HashSet<String>,
    frozen: bool,
    honor_ordering: bool,
    max_depth: u32,
}

impl TransactionApplier {
    /// `frozen` restricts resolution to the given candidates plus the
    /// committed set (production queue mode); open resolution may pull in
    /// anything the index can reach (ad hoc mode).
    pub fn new(vcs: Arc<dyn VcsBackend>, review: Arc<dyn ReviewService>, frozen: bool) -> Self {
        Self {
            vcs,
            review,
            index: PatchIndex::new(),
            committed: HashSet::new(),
            known_bad: HashMap::new(),
            dirty_projects: HashSet::new(),
            frozen,
            honor_ordering: false,
            max_depth: DEFAULT_RESOLVE_DEPTH,
        }
    }

    /// Keep the caller-supplied order instead of sorting larger transactions
    /// first.
    pub fn with_honor_ordering(mut self, honor: bool) -> Self {
        self.honor_ordering = honor;
        self
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Mark changes as already committed so resolution treats their
    /// dependents as satisfied and apply skips them.
    pub fn inject_committed<I: IntoIterator<Item = ChangeId>>(&mut self, ids: I) {
        self.committed.extend(ids);
    }

    pub fn index(&self) -> &PatchIndex {
        &self.index
    }

    pub fn committed(&self) -> &HashSet<ChangeId> {
        &self.committed
    }

    /// Reload every change from the review service, download its revision
    /// into the checkout, and register it in the index. With open resolution
    /// the index is then expanded to the dependency closure so later
    /// resolution can reach changes outside the candidate set.
    pub async fn fetch_changes(
        &mut self,
        changes: &[Change],
        concurrency: usize,
    ) -> Result<Vec<Change>> {
        let review = self.review.clone();
        let vcs = self.vcs.clone();
        let mut fetched: Vec<(usize, Change)> = stream::iter(changes.iter().cloned().enumerate())
            .map(|(position, change)| {
                let review = review.clone();
                let vcs = vcs.clone();
                async move {
                    let normalized = match &change {
                        Change::Remote(rc) => Change::Remote(review.fetch_change(&rc.id).await?),
                        Change::LocalStub(_) => change.clone(),
                    };
                    vcs.fetch_change(&normalized).await?;
                    Ok::<_, QueueError>((position, normalized))
                }
            })
            .buffer_unordered(concurrency.max(1))
            .try_collect()
            .await?;
        fetched.sort_by_key(|(position, _)| *position);

        let normalized: Vec<Change> = fetched.into_iter().map(|(_, change)| change).collect();
        for change in &normalized {
            self.index.insert(change.clone());
        }
        if !self.frozen {
            self.expand_index().await?;
        }
        Ok(normalized)
    }

    /// Pull declared dependencies into the index until a fixpoint, bounded by
    /// the resolution depth.
    async fn expand_index(&mut self) -> Result<()> {
        for _ in 0..self.max_depth {
            let mut missing: Vec<ChangeKey> = Vec::new();
            let mut seen: HashSet<ChangeKey> = HashSet::new();
            for change in self.index.changes() {
                for dep in change.hard_deps().iter().chain(change.soft_deps()) {
                    let key = ChangeKey::from_dep(change.remote(), dep);
                    if !self.index.contains(&key) && seen.insert(key.clone()) {
                        missing.push(key);
                    }
                }
            }
            if missing.is_empty() {
                return Ok(());
            }
            for key in missing {
                if let Some(found) = self.review.lookup(&key).await? {
                    self.index.insert(Change::Remote(found));
                }
            }
        }
        Ok(())
    }

    /// Resolve and apply the candidate set, returning applied changes and
    /// classified failures. Infrastructure errors abort the whole pass.
    pub async fn apply(&mut self, candidates: &[Change]) -> Result<ApplyReport> {
        let limit_to: Option<HashSet<ChangeId>> = if self.frozen {
            Some(candidates.iter().map(|c| c.id().clone()).collect())
        } else {
            None
        };

        let mut plans: Vec<Transaction> = Vec::new();
        let mut report = ApplyReport::default();
        {
            let resolver =
                DependencyResolver::new(&self.index, &self.committed, ResolveMode::Normal)
                    .with_max_depth(self.max_depth);
            for outcome in resolver.resolve_transactions(candidates, limit_to.as_ref()) {
                match outcome.result {
                    Ok(plan) => plans.push(plan),
                    Err(failure) => {
                        warn!(change = %outcome.change.id(), %failure, "resolution failed");
                        report.failed_tot.push(failure);
                    }
                }
            }
        }

        // Larger transactions surface conflicts earlier; stable sort keeps
        // input order among equals.
        if !self.honor_ordering {
            plans.sort_by(|a, b| b.len().cmp(&a.len()));
        }

        for plan in &plans {
            match self.apply_transaction(plan).await? {
                None => {
                    for change in plan {
                        if !report.applied.iter().any(|c| c.id() == change.id()) {
                            report.applied.push(change.clone());
                        }
                    }
                }
                Some(failure) => {
                    debug!(%failure, inflight = failure.inflight, "transaction failed");
                    // The plan belongs to its root; a failure elsewhere in
                    // the plan is a dependency failure of the root. The
                    // failing change reports its own failure when its own
                    // plan runs.
                    let record = match plan.root() {
                        Some(root) if failure.change != *root.id() => {
                            ChangeFailure::dependency(root.id().clone(), failure)
                        }
                        _ => failure,
                    };
                    if record.inflight {
                        report.failed_inflight.push(record);
                    } else {
                        report.failed_tot.push(record);
                    }
                }
            }
        }

        info!(
            applied = report.applied.len(),
            failed_tot = report.failed_tot.len(),
            failed_inflight = report.failed_inflight.len(),
            "apply pass complete"
        );
        Ok(report)
    }

    /// Apply one transaction under scoped rollback. `Ok(None)` means the
    /// whole plan landed; `Ok(Some(failure))` means the checkout and the
    /// committed set were restored to their pre-attempt state.
    async fn apply_transaction(&mut self, plan: &Transaction) -> Result<Option<ChangeFailure>> {
        let root = match plan.root() {
            Some(root) => root,
            None => return Ok(None),
        };

        for change in plan {
            if let Some(bad) = self.known_bad.get(change.id()) {
                let failure = if change.id() == root.id() {
                    bad.clone()
                } else {
                    ChangeFailure::dependency(root.id().clone(), bad.clone())
                };
                return Ok(Some(failure));
            }
        }

        let mut snapshots: HashMap<String, String> = HashMap::new();
        for change in plan {
            if self.committed.contains(change.id()) {
                continue;
            }
            if !snapshots.contains_key(change.project()) {
                let head = self.vcs.current_head(change.project()).await?;
                snapshots.insert(change.project().to_string(), head);
            }
        }

        let committed_before = self.committed.clone();
        let mut touched: HashSet<String> = HashSet::new();
        for change in plan {
            if self.committed.contains(change.id()) {
                continue;
            }
            match self.vcs.apply_change(change).await {
                Ok(()) => {
                    self.committed.insert(change.id().clone());
                    touched.insert(change.project().to_string());
                }
                Err(VcsError::ApplyConflict { detail, .. }) => {
                    self.rollback(&snapshots).await?;
                    self.committed = committed_before;

                    let inflight = self.dirty_projects.contains(change.project())
                        || touched.contains(change.project());
                    debug!(change = %change.id(), inflight, detail, "apply conflict");
                    let failure = ChangeFailure::new(change.id().clone(), FailureKind::Conflict)
                        .with_inflight(inflight);
                    if !inflight {
                        self.known_bad.insert(change.id().clone(), failure.clone());
                    }
                    return Ok(Some(failure));
                }
                Err(other) => {
                    self.rollback(&snapshots).await?;
                    self.committed = committed_before;
                    return Err(other.into());
                }
            }
        }

        self.dirty_projects.extend(touched);
        Ok(None)
    }

    async fn rollback(&self, snapshots: &HashMap<String, String>) -> Result<()> {
        for (project, sha) in snapshots {
            self.vcs.reset_hard(project, sha).await?;
        }
        Ok(())
    }

    /// Replay an already-ordered list without re-resolving dependencies.
    /// Used by follower roles working from a shared manifest; any failure is
    /// fatal because the order was fixed elsewhere.
    pub async fn apply_serial(&mut self, changes: &[Change]) -> Result<Vec<Change>> {
        let mut applied = Vec::new();
        for change in changes {
            if self.committed.contains(change.id()) {
                continue;
            }
            match self.vcs.apply_change(change).await {
                Ok(()) => {
                    self.committed.insert(change.id().clone());
                    self.dirty_projects.insert(change.project().to_string());
                    applied.push(change.clone());
                }
                Err(VcsError::ApplyConflict { detail, .. }) => {
                    warn!(change = %change.id(), detail, "manifest replay conflict");
                    let failure =
                        ChangeFailure::new(change.id().clone(), FailureKind::Conflict);
                    return Err(QueueError::ManifestReplay(failure));
                }
                Err(other) => return Err(other.into()),
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{DepRef, MergeState, RemoteChange};
    use crate::fakes::{FakeVcs, InMemoryReview};
    use chrono::Utc;

    fn change(number: u64, project: &str, hard: &[u64]) -> RemoteChange {
        RemoteChange {
            id: ChangeId::new("r", number, 1),
            review_key: Some(format!("I{number}")),
            sha: Some(format!("{number:040x}")),
            project: project.to_string(),
            branch: "main".to_string(),
            owner: "dev".to_string(),
            subject: String::new(),
            ready: true,
            approved_at: Utc::now(),
            merge_state: MergeState::Mergeable,
            hard_deps: hard.iter().map(|n| DepRef::Number(*n)).collect(),
            soft_deps: Vec::new(),
        }
    }

    fn setup(changes: &[RemoteChange]) -> (Arc<FakeVcs>, Arc<InMemoryReview>, Vec<Change>) {
        let vcs = Arc::new(FakeVcs::new(&["p", "q"]));
        let review = Arc::new(InMemoryReview::new());
        let mut candidates = Vec::new();
        for rc in changes {
            review.add_change(rc.clone());
            candidates.push(Change::Remote(rc.clone()));
        }
        (vcs, review, candidates)
    }

    #[tokio::test]
    async fn test_chain_applies_in_dependency_order() {
        let (vcs, review, candidates) = setup(&[
            change(1, "p", &[]),
            change(2, "p", &[1]),
            change(3, "p", &[2]),
        ]);
        let mut applier = TransactionApplier::new(vcs, review, true);
        let candidates = applier.fetch_changes(&candidates, 4).await.expect("fetch");

        let report = applier.apply(&candidates).await.expect("apply");
        let order: Vec<u64> = report.applied.iter().map(|c| c.id().number).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(report.failed_tot.is_empty());
        assert!(report.failed_inflight.is_empty());
    }

    #[tokio::test]
    async fn test_larger_transactions_apply_first_by_default() {
        let (vcs, review, candidates) = setup(&[
            change(1, "p", &[]),
            change(3, "q", &[2]),
            change(2, "q", &[]),
        ]);
        let mut applier = TransactionApplier::new(vcs, review, true);
        let candidates = applier.fetch_changes(&candidates, 4).await.expect("fetch");

        let report = applier.apply(&candidates).await.expect("apply");
        let order: Vec<u64> = report.applied.iter().map(|c| c.id().number).collect();
        // The two-change plan jumps ahead of the lone change listed first.
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[tokio::test]
    async fn test_honor_ordering_keeps_caller_supplied_order() {
        let (vcs, review, candidates) = setup(&[
            change(1, "p", &[]),
            change(3, "q", &[2]),
            change(2, "q", &[]),
        ]);
        let mut applier =
            TransactionApplier::new(vcs, review, true).with_honor_ordering(true);
        let candidates = applier.fetch_changes(&candidates, 4).await.expect("fetch");

        let report = applier.apply(&candidates).await.expect("apply");
        let order: Vec<u64> = report.applied.iter().map(|c| c.id().number).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_missing_candidate_blocks_dependents_when_frozen() {
        let a = change(1, "p", &[]);
        let b = change(2, "p", &[1]);
        let c = change(3, "p", &[2]);
        let (vcs, review, all) = setup(&[a, b, c]);
        let mut applier = TransactionApplier::new(vcs, review, true);
        let all = applier.fetch_changes(&all, 4).await.expect("fetch");

        // The middle change is known but not a candidate this cycle.
        let report = applier
            .apply(&[all[0].clone(), all[2].clone()])
            .await
            .expect("apply");
        let applied: Vec<u64> = report.applied.iter().map(|c| c.id().number).collect();
        assert_eq!(applied, vec![1]);
        assert_eq!(report.failed_tot.len(), 1);
        assert_eq!(report.failed_tot[0].change.number, 3);
        assert_eq!(
            report.failed_tot[0].root_cause().kind,
            FailureKind::NotEligible
        );
    }

    #[tokio::test]
    async fn test_rollback_restores_every_touched_project() {
        let vcs = Arc::new(FakeVcs::new(&["p", "q", "w"]));
        let review = Arc::new(InMemoryReview::new());
        let mut all = Vec::new();
        for rc in [change(1, "p", &[]), change(2, "q", &[1]), change(3, "w", &[2])] {
            review.add_change(rc.clone());
            all.push(Change::Remote(rc));
        }
        vcs.fail_apply(&ChangeId::new("r", 3, 1));
        let head_p = vcs.head("p");
        let head_q = vcs.head("q");

        // Open resolution so the single candidate pulls in its whole chain.
        let mut applier = TransactionApplier::new(vcs.clone(), review, false);
        let all = applier.fetch_changes(&all, 4).await.expect("fetch");
        let report = applier.apply(&[all[2].clone()]).await.expect("apply");

        assert!(report.applied.is_empty());
        assert_eq!(vcs.head("p"), head_p);
        assert_eq!(vcs.head("q"), head_q);
        assert_eq!(vcs.head("w"), "base-w");
        assert!(applier.committed().is_empty());
        assert_eq!(report.failed_tot.len(), 1);
        assert_eq!(report.failed_tot[0].change.number, 3);
    }

    #[tokio::test]
    async fn test_committed_changes_are_never_reapplied() {
        let a = change(1, "p", &[]);
        let b = change(2, "p", &[1]);
        let (vcs, review, candidates) = setup(&[a, b]);
        let mut applier = TransactionApplier::new(vcs.clone(), review, true);
        applier.inject_committed([ChangeId::new("r", 1, 1)]);
        let candidates = applier.fetch_changes(&candidates, 4).await.expect("fetch");

        let report = applier.apply(&candidates).await.expect("apply");
        let applied: Vec<u64> = report.applied.iter().map(|c| c.id().number).collect();
        assert_eq!(applied, vec![2]);
        assert_eq!(vcs.apply_count(&ChangeId::new("r", 1, 1)), 0);
        assert_eq!(vcs.apply_count(&ChangeId::new("r", 2, 1)), 1);
    }

    #[tokio::test]
    async fn test_known_bad_change_short_circuits_later_plans() {
        let a = change(1, "p", &[]);
        let b = change(2, "q", &[1]);
        let (vcs, review, candidates) = setup(&[a, b]);
        vcs.fail_apply(&ChangeId::new("r", 1, 1));

        let mut applier = TransactionApplier::new(vcs.clone(), review, true);
        let candidates = applier.fetch_changes(&candidates, 4).await.expect("fetch");
        let report = applier.apply(&candidates).await.expect("apply");

        assert!(report.applied.is_empty());
        assert_eq!(report.failed_tot.len(), 2);
        // The bad change is only ever attempted once.
        assert_eq!(vcs.apply_count(&ChangeId::new("r", 1, 1)), 1);
        let dependent = report
            .failed_tot
            .iter()
            .find(|f| f.change.number == 2)
            .expect("dependent failed");
        assert_eq!(dependent.root_cause().change.number, 1);
    }

    #[tokio::test]
    async fn test_conflict_on_dirty_project_is_inflight() {
        let a = change(1, "p", &[]);
        let b = change(2, "p", &[]);
        let (vcs, review, candidates) = setup(&[a, b]);
        vcs.fail_apply(&ChangeId::new("r", 2, 1));

        let mut applier = TransactionApplier::new(vcs, review, true);
        let candidates = applier.fetch_changes(&candidates, 4).await.expect("fetch");
        let report = applier.apply(&candidates).await.expect("apply");

        assert_eq!(report.applied.len(), 1);
        assert!(report.failed_tot.is_empty());
        assert_eq!(report.failed_inflight.len(), 1);
        assert!(report.failed_inflight[0].inflight);
    }

    #[tokio::test]
    async fn test_serial_replay_fails_fast_on_conflict() {
        let a = change(1, "p", &[]);
        let b = change(2, "p", &[]);
        let (vcs, review, candidates) = setup(&[a, b]);
        vcs.fail_apply(&ChangeId::new("r", 2, 1));

        let mut applier = TransactionApplier::new(vcs, review, true);
        let err = applier.apply_serial(&candidates).await.expect_err("replay fails");
        assert!(matches!(err, QueueError::ManifestReplay(_)));
    }
}
