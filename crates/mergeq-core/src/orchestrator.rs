//! Top-level queue control loop: acquire, apply, submit, notify.
//!
//! One [`QueueOrchestrator::run`] drives a full queue cycle. Acquisition is
//! gated by tree health; the apply phase delegates to the sequential
//! [`TransactionApplier`]; submission batches checkout-backed changes into
//! one push per repository and branch, and walks the rest through the review
//! API in disjoint dependency groups.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::applier::TransactionApplier;
use crate::change::{Change, ChangeId, MergeState};
use crate::error::{ChangeFailure, FailureKind, QueueError, Result};
use crate::index::PatchIndex;
use crate::notify::{filter_dependency_failures, BlameAll, BlameClassifier, Notifier};
use crate::partition::partition;
use crate::pool::Pool;
use crate::resolver::{DependencyResolver, ResolveMode, DEFAULT_RESOLVE_DEPTH};
use crate::service::{BuildLedger, ReviewService, ReviewStatus, ServiceError, TreeHealth, TreeStatus};
use crate::transaction::Transaction;
use crate::vcs::{VcsBackend, VcsError};

/// Run configuration. Defaults match production queue behavior; tests and ad
/// hoc runs override what they need.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub queue_name: String,
    /// Readiness query used while the tree is open.
    pub ready_query: String,
    /// Stricter readiness query used while the tree is throttled.
    pub throttled_ready_query: String,
    /// Restrict resolution to acquired candidates plus the committed set.
    pub frozen: bool,
    /// Suppress every side-effecting remote call.
    pub dry_run: bool,
    /// Coordinators resolve and order; followers replay a shared manifest.
    pub is_coordinator: bool,
    /// Apply plans in caller-supplied order instead of largest-first.
    pub honor_ordering: bool,
    pub max_resolve_depth: u32,
    pub acquire_timeout_secs: u64,
    pub poll_interval_secs: u64,
    /// How long to wait for a submitted change to report merged.
    pub submitted_wait_secs: u64,
    pub submitted_poll_secs: u64,
    /// Dependency failures within this window of approval are suppressed.
    pub rejection_grace_secs: u64,
    /// How long a throttled tree may still acquire with the stricter query.
    pub throttle_grace_secs: u64,
    pub push_attempts: u32,
    /// Cap on interdependent group size; `None` disables partition capping.
    pub max_txn_length: Option<usize>,
    /// Consecutive prior runs that did not pass; drives throttled sampling.
    pub fail_streak: u32,
    pub fetch_concurrency: usize,
    pub submit_concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_name: "commit queue".to_string(),
            ready_query: "status:open label:ready".to_string(),
            throttled_ready_query: "status:open label:ready label:priority".to_string(),
            frozen: true,
            dry_run: false,
            is_coordinator: true,
            honor_ordering: false,
            max_resolve_depth: DEFAULT_RESOLVE_DEPTH,
            acquire_timeout_secs: 4 * 60 * 60,
            poll_interval_secs: 30,
            submitted_wait_secs: 180,
            submitted_poll_secs: 1,
            rejection_grace_secs: 30 * 60,
            throttle_grace_secs: 30 * 60,
            push_attempts: 3,
            max_txn_length: None,
            fail_streak: 0,
            fetch_concurrency: 8,
            submit_concurrency: 4,
        }
    }
}

/// Terminal state of one queue run.
#[derive(Debug)]
pub enum RunOutcome {
    Complete { submitted: usize },
    NothingToDo,
    TreeClosedAbort,
    SubmitFailure {
        submitted: usize,
        failures: Vec<ChangeFailure>,
    },
}

impl RunOutcome {
    /// Collapse into a result for callers that treat partial submission as
    /// an error.
    pub fn into_result(self) -> Result<usize> {
        match self {
            RunOutcome::Complete { submitted } => Ok(submitted),
            RunOutcome::NothingToDo => Ok(0),
            RunOutcome::TreeClosedAbort => Err(QueueError::TreeClosed),
            RunOutcome::SubmitFailure { submitted, failures } => {
                Err(QueueError::SubmitIncomplete {
                    submitted,
                    total: submitted + failures.len(),
                })
            }
        }
    }
}

type EarlyExit = Arc<dyn Fn() -> bool + Send + Sync>;

pub struct QueueOrchestrator {
    config: QueueConfig,
    review: Arc<dyn ReviewService>,
    vcs: Arc<dyn VcsBackend>,
    tree: Arc<dyn TreeHealth>,
    notifier: Notifier,
    applier: TransactionApplier,
    run_id: String,
    early_exit: Option<EarlyExit>,
    blame: Arc<dyn BlameClassifier>,
}

impl QueueOrchestrator {
    pub fn new(
        config: QueueConfig,
        review: Arc<dyn ReviewService>,
        vcs: Arc<dyn VcsBackend>,
        tree: Arc<dyn TreeHealth>,
        ledger: Arc<dyn BuildLedger>,
    ) -> Self {
        let run_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let notifier = Notifier::new(
            review.clone(),
            ledger,
            config.queue_name.clone(),
            run_id.clone(),
            config.dry_run,
        );
        let applier = TransactionApplier::new(vcs.clone(), review.clone(), config.frozen)
            .with_honor_ordering(config.honor_ordering)
            .with_max_depth(config.max_resolve_depth);
        Self {
            config,
            review,
            vcs,
            tree,
            notifier,
            applier,
            run_id,
            early_exit: None,
            blame: Arc::new(BlameAll),
        }
    }

    /// Hook polled during acquisition; returning true aborts the poll loop
    /// before its deadline.
    pub fn with_early_exit(mut self, hook: EarlyExit) -> Self {
        self.early_exit = Some(hook);
        self
    }

    pub fn with_blame_classifier(mut self, blame: Arc<dyn BlameClassifier>) -> Self {
        self.blame = blame;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Drive one full acquire/apply/submit cycle.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        let mut pool = self.acquire().await?;
        if pool.is_empty() {
            info!(run = %self.run_id, "no qualifying changes");
            return Ok(RunOutcome::NothingToDo);
        }
        self.apply(&mut pool).await?;

        match self.submit(&mut pool).await {
            Ok((submitted, failures)) if failures.is_empty() => {
                info!(run = %self.run_id, submitted, "run complete");
                Ok(RunOutcome::Complete { submitted })
            }
            Ok((submitted, failures)) => {
                error!(
                    run = %self.run_id,
                    submitted,
                    failed = failures.len(),
                    "run finished with submit failures"
                );
                Ok(RunOutcome::SubmitFailure { submitted, failures })
            }
            Err(QueueError::TreeClosed) => {
                warn!(run = %self.run_id, "tree closed before submission");
                Ok(RunOutcome::TreeClosedAbort)
            }
            Err(err) => Err(err),
        }
    }

    /// Poll the review service for ready changes, honoring tree health.
    ///
    /// Returns an empty pool when the deadline elapses, the early-exit hook
    /// fires, or a dry run finds nothing on its first pass.
    pub async fn acquire(&self) -> Result<Pool> {
        let deadline =
            Instant::now() + Duration::from_secs(self.config.acquire_timeout_secs);
        let throttle_grace = Duration::from_secs(self.config.throttle_grace_secs);
        let mut throttled_since: Option<Instant> = None;

        loop {
            if let Some(hook) = &self.early_exit {
                if hook() {
                    info!("early exit requested; abandoning acquisition");
                    return Ok(self.empty_pool());
                }
            }

            let status = self.tree.status().await?;
            let attempt = match status {
                TreeStatus::Open => {
                    throttled_since = None;
                    Some((self.config.ready_query.as_str(), true))
                }
                TreeStatus::Throttled => {
                    let since = *throttled_since.get_or_insert_with(Instant::now);
                    if Instant::now().duration_since(since) <= throttle_grace {
                        Some((self.config.throttled_ready_query.as_str(), false))
                    } else {
                        // Grace window spent; require a fully open tree.
                        None
                    }
                }
                TreeStatus::Closed => None,
            };

            if let Some((query, tree_open)) = attempt {
                let found = self.review.query(query).await?;
                if !found.is_empty() {
                    debug!(count = found.len(), tree_open, "acquired candidates");
                    return Ok(self.build_pool(found, tree_open));
                }
            }

            if self.config.dry_run || Instant::now() >= deadline {
                return Ok(self.empty_pool());
            }
            sleep(Duration::from_secs(self.config.poll_interval_secs)).await;
        }
    }

    fn empty_pool(&self) -> Pool {
        Pool::new(self.config.frozen, self.config.dry_run, true, self.config.fail_streak)
    }

    fn build_pool(&self, found: Vec<crate::change::RemoteChange>, tree_open: bool) -> Pool {
        let mut pool = Pool::new(
            self.config.frozen,
            self.config.dry_run,
            tree_open,
            self.config.fail_streak,
        );
        for rc in found {
            let change = Change::Remote(rc);
            if self.vcs.local_repo(change.project()).is_some() {
                pool.candidates.push(change);
            } else {
                pool.non_checkout.push(change);
            }
        }
        pool.sample_for_throttle();
        pool
    }

    /// Apply the pool's candidates. Coordinators resolve and order;
    /// followers replay the already-ordered candidate list serially.
    ///
    /// An unexpected error during coordinator resolution rejects the entire
    /// candidate set before propagating; the queue must never be left in an
    /// ambiguously tested state.
    pub async fn apply(&mut self, pool: &mut Pool) -> Result<()> {
        if !self.config.is_coordinator {
            let replay = pool.pending_candidates();
            let applied = self.applier.apply_serial(&replay).await?;
            pool.applied.extend(applied);
            return Ok(());
        }

        let fetched = self
            .applier
            .fetch_changes(&pool.candidates, self.config.fetch_concurrency)
            .await?;
        pool.candidates = fetched;

        let pickups: Vec<ChangeId> = pool
            .candidates
            .iter()
            .chain(&pool.non_checkout)
            .map(|c| c.id().clone())
            .collect();
        let notifier = &self.notifier;
        stream::iter(&pickups)
            .for_each_concurrent(self.config.submit_concurrency.max(1), |id| async move {
                notifier.handle_pickup(id).await;
            })
            .await;

        let mut pending = pool.pending_candidates();
        if let Some(cap) = self.config.max_txn_length {
            pending = self.cap_candidates(pool, pending, cap).await;
        }

        match self.applier.apply(&pending).await {
            Ok(report) => {
                let now = Utc::now();
                let grace = ChronoDuration::seconds(self.config.rejection_grace_secs as i64);
                let failed_tot = filter_dependency_failures(
                    report.failed_tot,
                    self.applier.index(),
                    grace,
                    now,
                    &pool.filtered,
                );
                let failed_inflight = filter_dependency_failures(
                    report.failed_inflight,
                    self.applier.index(),
                    grace,
                    now,
                    &pool.filtered,
                );

                for failure in &failed_tot {
                    self.notifier.handle_apply_failure(failure).await;
                }
                for failure in &failed_inflight {
                    self.notifier.handle_inflight_conflict(failure).await;
                }
                pool.applied.extend(report.applied);
                pool.conflicting.extend(failed_tot);
                pool.conflicting.extend(failed_inflight);
                Ok(())
            }
            Err(err) => {
                error!(%err, "apply pass aborted; rejecting every candidate");
                let all: Vec<ChangeId> = pool
                    .candidates
                    .iter()
                    .chain(&pool.non_checkout)
                    .map(|c| c.id().clone())
                    .collect();
                for id in all {
                    let failure =
                        ChangeFailure::new(id, FailureKind::Internal(err.to_string()));
                    self.notifier.handle_apply_failure(&failure).await;
                    pool.conflicting.push(failure);
                }
                Err(err)
            }
        }
    }

    /// Resolve plans and cap interdependent groups, dropping candidates past
    /// the cut and failing groups that cannot fit at all.
    async fn cap_candidates(
        &self,
        pool: &mut Pool,
        pending: Vec<Change>,
        cap: usize,
    ) -> Vec<Change> {
        let limit: HashSet<ChangeId> = pending.iter().map(|c| c.id().clone()).collect();
        let mut plans = Vec::new();
        {
            let resolver = DependencyResolver::new(
                self.applier.index(),
                self.applier.committed(),
                ResolveMode::Normal,
            )
            .with_max_depth(self.config.max_resolve_depth);
            for outcome in resolver.resolve_transactions(&pending, Some(&limit)) {
                if let Ok(plan) = outcome.result {
                    plans.push(plan);
                }
                // Resolution failures resurface during the apply pass.
            }
        }

        let (groups, failures) = partition(&plans, Some(cap), false);
        for failure in failures {
            self.notifier.handle_apply_failure(&failure).await;
            pool.conflicting.push(failure);
        }

        let kept: HashSet<ChangeId> = groups
            .iter()
            .flat_map(|g| g.ids().cloned())
            .collect();
        pending
            .into_iter()
            .filter(|c| kept.contains(c.id()))
            .collect()
    }

    /// Submit everything that applied (plus non-checkout candidates),
    /// returning the submitted count and per-change failures.
    pub async fn submit(&self, pool: &mut Pool) -> Result<(usize, Vec<ChangeFailure>)> {
        if self.tree.status().await? == TreeStatus::Closed {
            // The changes themselves are fine; record why each was stranded.
            for change in pool.applied.iter().chain(&pool.non_checkout) {
                pool.conflicting.push(ChangeFailure::new(
                    change.id().clone(),
                    FailureKind::TreeClosed,
                ));
            }
            return Err(QueueError::TreeClosed);
        }

        let targets: Vec<Change> = pool
            .applied
            .iter()
            .chain(&pool.non_checkout)
            .cloned()
            .collect();
        if targets.is_empty() {
            return Ok((0, Vec::new()));
        }

        let (current, mut failures, already_merged) = self.reload_changes(&targets).await?;
        let mut submitted = already_merged;

        let (local, api): (Vec<Change>, Vec<Change>) = current
            .into_iter()
            .partition(|c| self.vcs.local_repo(c.project()).is_some());

        let (local_submitted, mut local_failures) = self.submit_local(&local).await;
        submitted += local_submitted;
        failures.append(&mut local_failures);

        let (api_submitted, mut api_failures) = self.submit_api(&api).await;
        submitted += api_submitted;
        failures.append(&mut api_failures);

        for failure in &failures {
            self.notifier.handle_could_not_submit(failure).await;
        }
        if submitted > 0 && !failures.is_empty() {
            warn!(submitted, failed = failures.len(), "partial submission");
        }
        Ok((submitted, failures))
    }

    /// Reload every change to detect edits since approval. Already-merged
    /// changes count as submitted; a bumped patch set is rejected.
    async fn reload_changes(
        &self,
        targets: &[Change],
    ) -> Result<(Vec<Change>, Vec<ChangeFailure>, usize)> {
        enum Reload {
            Keep(Change),
            AlreadyMerged,
            Failed(ChangeFailure),
        }

        let review = self.review.clone();
        let mut outcomes: Vec<(usize, Reload)> =
            stream::iter(targets.iter().cloned().enumerate())
                .map(|(position, change)| {
                    let review = review.clone();
                    async move {
                        let outcome = match &change {
                            Change::LocalStub(_) => Reload::Keep(change.clone()),
                            Change::Remote(rc) => {
                                let fresh = review.fetch_change(&rc.id).await?;
                                if fresh.merge_state == MergeState::Merged {
                                    Reload::AlreadyMerged
                                } else if fresh.id.patch_set != rc.id.patch_set {
                                    Reload::Failed(ChangeFailure::new(
                                        rc.id.clone(),
                                        FailureKind::ModifiedDuringRun {
                                            new_patch_set: fresh.id.patch_set,
                                        },
                                    ))
                                } else {
                                    Reload::Keep(Change::Remote(fresh))
                                }
                            }
                        };
                        Ok::<_, QueueError>((position, outcome))
                    }
                })
                .buffer_unordered(self.config.submit_concurrency.max(1))
                .try_collect()
                .await?;
        outcomes.sort_by_key(|(position, _)| *position);

        let mut current = Vec::new();
        let mut failures = Vec::new();
        let mut already_merged = 0usize;
        for (_, outcome) in outcomes {
            match outcome {
                Reload::Keep(change) => current.push(change),
                Reload::AlreadyMerged => already_merged += 1,
                Reload::Failed(failure) => {
                    warn!(%failure, "change modified during run");
                    failures.push(failure);
                }
            }
        }
        Ok((current, failures, already_merged))
    }

    /// One push per repository and branch, with bounded retry-with-resync.
    /// Within a repository, changes were applied in resolved order, so the
    /// batch push preserves it.
    async fn submit_local(&self, local: &[Change]) -> (usize, Vec<ChangeFailure>) {
        let mut by_repo: BTreeMap<(String, String), Vec<Change>> = BTreeMap::new();
        for change in local {
            by_repo
                .entry((change.project().to_string(), change.branch().to_string()))
                .or_default()
                .push(change.clone());
        }

        let results = join_all(by_repo.into_iter().map(
            |((project, branch), changes)| async move {
                if self.config.dry_run {
                    info!(%project, %branch, count = changes.len(), "dry run: would push");
                    return (changes, Ok(()));
                }
                let result = self.push_with_retry(&project, &branch).await;
                (changes, result)
            },
        ))
        .await;

        let mut submitted = 0usize;
        let mut failures = Vec::new();
        for (changes, result) in results {
            match result {
                Ok(()) => {
                    for change in &changes {
                        self.notifier.handle_submitted(change.id()).await;
                    }
                    submitted += changes.len();
                }
                Err(err) => {
                    for change in &changes {
                        failures.push(ChangeFailure::new(
                            change.id().clone(),
                            FailureKind::SubmitFailed {
                                reason: err.to_string(),
                            },
                        ));
                    }
                }
            }
        }
        (submitted, failures)
    }

    async fn push_with_retry(&self, project: &str, branch: &str) -> std::result::Result<(), VcsError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.vcs.push(project, branch).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.config.push_attempts.max(1) => {
                    warn!(project, branch, attempt, %err, "push failed; resyncing");
                    self.vcs.resync(project, branch).await?;
                    sleep(Duration::from_secs(1 << attempt.min(5))).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Submit API-only changes in disjoint dependency groups, each group in
    /// resolved order, groups in parallel.
    async fn submit_api(&self, api: &[Change]) -> (usize, Vec<ChangeFailure>) {
        if api.is_empty() {
            return (0, Vec::new());
        }

        let (plans, mut failures) = self.api_plans(api);
        let plan_by_root: HashMap<ChangeId, Transaction> = plans
            .iter()
            .filter_map(|p| p.root().map(|r| (r.id().clone(), p.clone())))
            .collect();
        let (groups, too_long) = partition(&plans, None, true);
        failures.extend(too_long);

        let results = join_all(
            groups
                .iter()
                .map(|group| self.submit_group(group, &plan_by_root)),
        )
        .await;

        let mut submitted = 0usize;
        for (count, mut group_failures) in results {
            submitted += count;
            failures.append(&mut group_failures);
        }
        (submitted, failures)
    }

    /// Resolve submission-order plans for the API changes. Dependencies
    /// satisfied by this run's applied set resolve through the committed
    /// cache; anything else outside the API set is a rejection.
    fn api_plans(&self, api: &[Change]) -> (Vec<Transaction>, Vec<ChangeFailure>) {
        let mut index = PatchIndex::new();
        for change in self.applier.index().changes() {
            index.insert(change.clone());
        }
        for change in api {
            index.insert(change.clone());
        }
        let limit: HashSet<ChangeId> = api.iter().map(|c| c.id().clone()).collect();
        let committed = self.applier.committed();

        let resolver = DependencyResolver::new(&index, committed, ResolveMode::Submitting)
            .with_max_depth(self.config.max_resolve_depth);
        let mut plans = Vec::new();
        let mut failures = Vec::new();
        for outcome in resolver.resolve_transactions(api, Some(&limit)) {
            match outcome.result {
                Ok(plan) => plans.push(plan),
                Err(failure) => failures.push(failure),
            }
        }
        (plans, failures)
    }

    /// Submit one disjoint group in order, skipping changes whose
    /// dependencies already failed.
    async fn submit_group(
        &self,
        group: &Transaction,
        plan_by_root: &HashMap<ChangeId, Transaction>,
    ) -> (usize, Vec<ChangeFailure>) {
        let mut submitted = 0usize;
        let mut submitted_ids: HashSet<ChangeId> = HashSet::new();
        let mut failures: Vec<ChangeFailure> = Vec::new();
        let mut failed_ids: HashSet<ChangeId> = HashSet::new();

        for change in group {
            let failed_dep = plan_by_root.get(change.id()).and_then(|plan| {
                plan.ids()
                    .find(|id| *id != change.id() && failed_ids.contains(*id))
                    .cloned()
            });
            if let Some(dep_id) = failed_dep {
                let landed = plan_by_root
                    .get(change.id())
                    .map(|plan| plan.ids().filter(|id| submitted_ids.contains(*id)).count())
                    .unwrap_or(0);
                let failure = if landed > 0 {
                    let total = plan_by_root
                        .get(change.id())
                        .map(Transaction::len)
                        .unwrap_or(0);
                    ChangeFailure::new(
                        change.id().clone(),
                        FailureKind::PartialSubmitFailure { submitted: landed, total },
                    )
                } else {
                    let cause = failures
                        .iter()
                        .find(|f| f.change == dep_id)
                        .cloned()
                        .unwrap_or_else(|| {
                            ChangeFailure::new(dep_id.clone(), FailureKind::Rejected)
                        });
                    ChangeFailure::dependency(change.id().clone(), cause)
                };
                failed_ids.insert(change.id().clone());
                failures.push(failure);

                // A change that landed anyway left the branch in a state we
                // did not verify.
                if let Ok(status) = self.review.change_status(change.id()).await {
                    if matches!(status, ReviewStatus::Merged | ReviewStatus::Submitted) {
                        self.notifier.handle_incorrect_submission(change.id()).await;
                    }
                }
                continue;
            }

            if self.config.dry_run {
                info!(change = %change.id(), "dry run: would submit");
                submitted += 1;
                submitted_ids.insert(change.id().clone());
                continue;
            }

            match self.review.submit(change.id()).await {
                Ok(()) => match self.confirm_submitted(change.id()).await {
                    None => {
                        self.notifier.handle_submitted(change.id()).await;
                        submitted += 1;
                        submitted_ids.insert(change.id().clone());
                    }
                    Some(failure) => {
                        failed_ids.insert(change.id().clone());
                        failures.push(failure);
                    }
                },
                Err(ServiceError::Conflict {
                    change_closed: true, ..
                }) => {
                    debug!(change = %change.id(), "already closed; counting as submitted");
                    submitted += 1;
                    submitted_ids.insert(change.id().clone());
                }
                Err(err) => {
                    failed_ids.insert(change.id().clone());
                    failures.push(ChangeFailure::new(
                        change.id().clone(),
                        FailureKind::SubmitFailed {
                            reason: err.to_string(),
                        },
                    ));
                }
            }
        }
        (submitted, failures)
    }

    /// Bounded poll for the review service to converge a submitted change.
    /// Submitted-but-not-merged after the wait is accepted; it reliably
    /// converges on the service side.
    async fn confirm_submitted(&self, change: &ChangeId) -> Option<ChangeFailure> {
        let deadline = Instant::now() + Duration::from_secs(self.config.submitted_wait_secs);
        let mut last = None;
        loop {
            match self.review.change_status(change).await {
                Ok(ReviewStatus::Merged) => return None,
                Ok(status) => last = Some(status),
                Err(err) => warn!(%change, %err, "status poll failed"),
            }
            if Instant::now() >= deadline {
                break;
            }
            sleep(Duration::from_secs(self.config.submitted_poll_secs)).await;
        }
        if last == Some(ReviewStatus::Submitted) {
            warn!(%change, "accepting submitted-but-not-merged after bounded wait");
            return None;
        }
        Some(ChangeFailure::new(
            change.clone(),
            FailureKind::SubmitFailed {
                reason: "did not reach merged state".to_string(),
            },
        ))
    }

    /// Map a validation timeout over the given changes through the blame
    /// classifier: strip readiness or forgive and retry.
    pub async fn handle_validation_timeout(&self, changes: &[Change]) {
        self.notifier
            .handle_validation_timeout(changes, self.blame.as_ref())
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{DepRef, RemoteChange};
    use crate::fakes::{FakeVcs, InMemoryReview, RecordingLedger, ScriptedTree};
    use crate::service::ActionKind;

    fn remote(number: u64, project: &str, hard: &[u64]) -> RemoteChange {
        RemoteChange {
            id: ChangeId::new("r", number, 1),
            review_key: Some(format!("I{number}")),
            sha: Some(format!("{number:040x}")),
            project: project.to_string(),
            branch: "main".to_string(),
            owner: "dev".to_string(),
            subject: String::new(),
            ready: true,
            approved_at: Utc::now() - ChronoDuration::hours(2),
            merge_state: MergeState::Mergeable,
            hard_deps: hard.iter().map(|n| DepRef::Number(*n)).collect(),
            soft_deps: Vec::new(),
        }
    }

    fn orchestrator(
        config: QueueConfig,
        review: Arc<InMemoryReview>,
        vcs: Arc<FakeVcs>,
        tree: Arc<ScriptedTree>,
        ledger: Arc<RecordingLedger>,
    ) -> QueueOrchestrator {
        QueueOrchestrator::new(config, review, vcs, tree, ledger)
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_the_tree_to_open() {
        let review = Arc::new(InMemoryReview::new());
        review.add_change(remote(1, "p", &[]));
        let vcs = Arc::new(FakeVcs::new(&["p"]));
        let tree = Arc::new(ScriptedTree::new(
            vec![TreeStatus::Closed, TreeStatus::Closed],
            TreeStatus::Open,
        ));
        let ledger = Arc::new(RecordingLedger::new());
        let orch = orchestrator(QueueConfig::default(), review.clone(), vcs, tree, ledger);

        let pool = orch.acquire().await.expect("acquire");
        assert_eq!(pool.candidates.len(), 1);
        assert!(pool.tree_was_open);
        assert_eq!(review.queries().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_tree_uses_the_stricter_query() {
        let review = Arc::new(InMemoryReview::new());
        review.add_change(remote(1, "p", &[]));
        let vcs = Arc::new(FakeVcs::new(&["p"]));
        let tree = Arc::new(ScriptedTree::throttled());
        let ledger = Arc::new(RecordingLedger::new());
        let config = QueueConfig::default();
        let throttled_query = config.throttled_ready_query.clone();
        let orch = orchestrator(config, review.clone(), vcs, tree, ledger);

        let pool = orch.acquire().await.expect("acquire");
        assert!(!pool.tree_was_open);
        assert_eq!(review.queries(), vec![throttled_query]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_exit_abandons_acquisition() {
        let review = Arc::new(InMemoryReview::new());
        review.add_change(remote(1, "p", &[]));
        let vcs = Arc::new(FakeVcs::new(&["p"]));
        let tree = Arc::new(ScriptedTree::open());
        let ledger = Arc::new(RecordingLedger::new());
        let orch = orchestrator(QueueConfig::default(), review, vcs, tree, ledger)
            .with_early_exit(Arc::new(|| true));

        let pool = orch.acquire().await.expect("acquire");
        assert!(pool.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_deadline_returns_empty_pool() {
        let review = Arc::new(InMemoryReview::new());
        let vcs = Arc::new(FakeVcs::new(&["p"]));
        let tree = Arc::new(ScriptedTree::open());
        let ledger = Arc::new(RecordingLedger::new());
        let config = QueueConfig {
            acquire_timeout_secs: 60,
            poll_interval_secs: 10,
            ..QueueConfig::default()
        };
        let orch = orchestrator(config, review, vcs, tree, ledger);

        let pool = orch.acquire().await.expect("acquire");
        assert!(pool.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_refuses_a_closed_tree() {
        let review = Arc::new(InMemoryReview::new());
        let vcs = Arc::new(FakeVcs::new(&["p"]));
        let tree = Arc::new(ScriptedTree::closed());
        let ledger = Arc::new(RecordingLedger::new());
        let orch = orchestrator(QueueConfig::default(), review, vcs, tree, ledger);

        let mut pool = Pool::new(true, false, true, 0);
        pool.applied.push(Change::Remote(remote(1, "p", &[])));
        let err = orch.submit(&mut pool).await.expect_err("closed tree");
        assert!(matches!(err, QueueError::TreeClosed));
        // Each stranded change carries its own tree-closed failure.
        assert_eq!(pool.conflicting.len(), 1);
        assert_eq!(pool.conflicting[0].change, ChangeId::new("r", 1, 1));
        assert_eq!(pool.conflicting[0].kind, FailureKind::TreeClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_modified_change_is_rejected_not_submitted() {
        let review = Arc::new(InMemoryReview::new());
        let vcs = Arc::new(FakeVcs::new(&["p"]));
        let tree = Arc::new(ScriptedTree::open());
        let ledger = Arc::new(RecordingLedger::new());
        let orch = orchestrator(QueueConfig::default(), review.clone(), vcs, tree, ledger);

        // The author uploaded patch set 2 after we applied patch set 1.
        let mut fresh = remote(1, "p", &[]);
        fresh.id.patch_set = 2;
        review.add_change(fresh);

        let mut pool = Pool::new(true, false, true, 0);
        pool.applied.push(Change::Remote(remote(1, "p", &[])));
        let (submitted, failures) = orch.submit(&mut pool).await.expect("submit");
        assert_eq!(submitted, 0);
        assert_eq!(failures.len(), 1);
        assert_eq!(
            failures[0].kind,
            FailureKind::ModifiedDuringRun { new_patch_set: 2 }
        );
        assert_eq!(review.readiness_removed(), vec![ChangeId::new("r", 1, 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_txn_length_cap_fails_oversized_cycles() {
        let review = Arc::new(InMemoryReview::new());
        let vcs = Arc::new(FakeVcs::new(&["p"]));
        for n in 1..=5u64 {
            review.add_change(remote(n, "p", &[if n == 1 { 5 } else { n - 1 }]));
        }
        let tree = Arc::new(ScriptedTree::open());
        let ledger = Arc::new(RecordingLedger::new());
        let config = QueueConfig {
            max_txn_length: Some(3),
            ..QueueConfig::default()
        };
        let mut orch = orchestrator(config, review, vcs, tree, ledger);

        let mut pool = orch.acquire().await.expect("acquire");
        assert_eq!(pool.candidates.len(), 5);
        orch.apply(&mut pool).await.expect("apply");
        assert!(pool.applied.is_empty());
        assert_eq!(pool.conflicting.len(), 5);
        for failure in &pool.conflicting {
            assert_eq!(
                failure.kind,
                FailureKind::TransactionTooLong { actual: 5, cap: 3 }
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_submits_nothing_remotely() {
        let review = Arc::new(InMemoryReview::new());
        review.add_change(remote(1, "p", &[]));
        let vcs = Arc::new(FakeVcs::new(&["p"]));
        let tree = Arc::new(ScriptedTree::open());
        let ledger = Arc::new(RecordingLedger::new());
        let config = QueueConfig {
            dry_run: true,
            ..QueueConfig::default()
        };
        let mut orch = orchestrator(config, review.clone(), vcs.clone(), tree, ledger.clone());

        let outcome = orch.run().await.expect("run");
        assert!(matches!(outcome, RunOutcome::Complete { submitted: 1 }));
        assert!(vcs.pushes().is_empty());
        assert_eq!(review.submit_count(&ChangeId::new("r", 1, 1)), 0);
        assert!(ledger.actions().is_empty());
        assert!(review.comments(&ChangeId::new("r", 1, 1)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_replays_the_manifest_order() {
        let review = Arc::new(InMemoryReview::new());
        let vcs = Arc::new(FakeVcs::new(&["p"]));
        let tree = Arc::new(ScriptedTree::open());
        let ledger = Arc::new(RecordingLedger::new());
        let config = QueueConfig {
            is_coordinator: false,
            ..QueueConfig::default()
        };
        let mut orch = orchestrator(config, review, vcs.clone(), tree, ledger.clone());

        let mut pool = Pool::new(true, false, true, 0);
        pool.candidates = vec![
            Change::Remote(remote(2, "p", &[])),
            Change::Remote(remote(1, "p", &[])),
        ];
        orch.apply(&mut pool).await.expect("replay");
        let order: Vec<u64> = pool.applied.iter().map(|c| c.id().number).collect();
        assert_eq!(order, vec![2, 1]);
        assert_eq!(ledger.actions_of(ActionKind::PickedUp).len(), 0);
    }
}
