//! Author-facing notification and the failure-to-action mapping.
//!
//! Every reject/forgive/retry decision produces a comment on the change with
//! a template specific to the failure kind. Notification failures are logged
//! and swallowed; a flaky comment post must never abort a queue run.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::change::{Change, ChangeId};
use crate::error::{ChangeFailure, FailureKind};
use crate::index::PatchIndex;
use crate::service::{ActionKind, BuildLedger, ReviewService};

/// Splits validation timeouts into "the change is to blame" vs "forgive and
/// retry" (e.g. an infrastructure failure took the run down).
pub trait BlameClassifier: Send + Sync {
    fn blames_change(&self, change: &Change) -> bool;
}

/// Default classifier: without evidence of an infrastructure failure, the
/// changes under test are to blame.
pub struct BlameAll;

impl BlameClassifier for BlameAll {
    fn blames_change(&self, _change: &Change) -> bool {
        true
    }
}

/// Posts author-facing notifications and records ledger actions.
pub struct Notifier {
    review: Arc<dyn ReviewService>,
    ledger: Arc<dyn BuildLedger>,
    queue_name: String,
    run_label: String,
    dry_run: bool,
}

impl Notifier {
    pub fn new(
        review: Arc<dyn ReviewService>,
        ledger: Arc<dyn BuildLedger>,
        queue_name: impl Into<String>,
        run_label: impl Into<String>,
        dry_run: bool,
    ) -> Self {
        Self {
            review,
            ledger,
            queue_name: queue_name.into(),
            run_label: run_label.into(),
            dry_run,
        }
    }

    pub async fn handle_pickup(&self, change: &ChangeId) {
        let message = format!(
            "{} has picked up your change in run {}.",
            self.queue_name, self.run_label
        );
        self.comment(change, &message).await;
        self.record(change, ActionKind::PickedUp, None).await;
    }

    /// A change failed to apply against the tip; strip readiness so the
    /// author rebases before re-queueing.
    pub async fn handle_apply_failure(&self, failure: &ChangeFailure) {
        let message = format!(
            "{}: your change {}. It has been removed from the queue; please \
             resolve the problem and mark it ready again.",
            self.queue_name, failure
        );
        self.comment(&failure.change, &message).await;
        self.remove_ready(&failure.change, &failure.kind.to_string())
            .await;
    }

    /// An in-flight conflict; the change stays in the queue and will be
    /// retried with different company.
    pub async fn handle_inflight_conflict(&self, failure: &ChangeFailure) {
        let message = format!(
            "{}: your change {}. This may have been caused by other changes \
             under test in the same run; it will be retried automatically.",
            self.queue_name, failure
        );
        self.comment(&failure.change, &message).await;
    }

    pub async fn handle_could_not_submit(&self, failure: &ChangeFailure) {
        let message = format!(
            "{}: your change passed testing but {}. It has been removed from \
             the queue.",
            self.queue_name, failure
        );
        self.comment(&failure.change, &message).await;
        self.record(
            &failure.change,
            ActionKind::SubmitFailed,
            Some(&failure.kind.to_string()),
        )
        .await;
        self.remove_ready(&failure.change, &failure.kind.to_string())
            .await;
    }

    /// A change reported submitted even though one of its dependencies
    /// failed; the review service merged something we did not expect it to.
    pub async fn handle_incorrect_submission(&self, change: &ChangeId) {
        warn!(%change, "change submitted despite a failed dependency");
        let message = format!(
            "{}: your change was submitted even though a dependency failed. \
             Please verify the state of the target branch.",
            self.queue_name
        );
        self.comment(change, &message).await;
    }

    /// Map a validation timeout to blame or forgiveness per change.
    pub async fn handle_validation_timeout(
        &self,
        changes: &[Change],
        classifier: &dyn BlameClassifier,
    ) {
        for change in changes {
            if classifier.blames_change(change) {
                let message = format!(
                    "{}: validation timed out while testing your change. It \
                     has been removed from the queue.",
                    self.queue_name
                );
                self.comment(change.id(), &message).await;
                self.remove_ready(change.id(), "validation timeout").await;
            } else {
                self.mark_forgiven(change.id()).await;
            }
        }
    }

    /// Strip the readiness flag. Suppressed under dry-run, which still logs
    /// what would have happened.
    pub async fn remove_ready(&self, change: &ChangeId, reason: &str) {
        if self.dry_run {
            info!(%change, reason, "dry run: would remove readiness");
            return;
        }
        if let Err(err) = self.review.set_readiness(change, false).await {
            warn!(%change, %err, "failed to remove readiness");
        }
        self.record(change, ActionKind::KickedOut, Some(reason)).await;
    }

    pub async fn handle_submitted(&self, change: &ChangeId) {
        self.record(change, ActionKind::Submitted, None).await;
    }

    /// Leave the change queued and note that it was not at fault.
    pub async fn mark_forgiven(&self, change: &ChangeId) {
        let message = format!(
            "{}: the previous run failed through no fault of your change; it \
             will be retried automatically.",
            self.queue_name
        );
        self.comment(change, &message).await;
        self.record(change, ActionKind::Forgiven, None).await;
    }

    async fn comment(&self, change: &ChangeId, message: &str) {
        if self.dry_run {
            info!(%change, message, "dry run: would comment");
            return;
        }
        if let Err(err) = self.review.post_comment(change, message).await {
            warn!(%change, %err, "failed to post comment");
        }
    }

    async fn record(&self, change: &ChangeId, action: ActionKind, reason: Option<&str>) {
        if self.dry_run {
            return;
        }
        if let Err(err) = self
            .ledger
            .record_action(change, action, reason, Utc::now())
            .await
        {
            warn!(%change, %err, "failed to record ledger action");
        }
    }
}

/// Suppress dependency failures the author cannot act on yet.
///
/// A failure is dropped when its root cause was removed by throttled-tree
/// sampling, when the blocking dependency simply is not marked ready, or
/// when the failing change was approved within `grace` of `now` (authors
/// marking a stack ready in quick succession race the queue's view of it).
pub fn filter_dependency_failures(
    failures: Vec<ChangeFailure>,
    index: &PatchIndex,
    grace: Duration,
    now: DateTime<Utc>,
    filtered: &HashSet<ChangeId>,
) -> Vec<ChangeFailure> {
    failures
        .into_iter()
        .filter(|failure| {
            if !failure.is_dependency() {
                return true;
            }
            let root = failure.root_cause();
            if filtered.contains(&root.change) {
                info!(change = %failure.change, "suppressing failure on sampled-out dependency");
                return false;
            }
            if root.kind == FailureKind::NotEligible {
                if let Some(dep) = index.get_by_id(&root.change) {
                    if !dep.is_ready() {
                        return false;
                    }
                }
            }
            if let Some(change) = index.get_by_id(&failure.change) {
                if let Some(approved) = change.approved_at() {
                    if now - approved < grace {
                        info!(change = %failure.change, "suppressing failure within grace period");
                        return false;
                    }
                }
            }
            true
        })
        .collect()
}
