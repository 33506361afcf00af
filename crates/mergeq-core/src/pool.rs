//! The unit of work for one queue run, with durable snapshots.
//!
//! A pool captures the candidate set at acquisition time plus run
//! configuration, and accumulates applied/conflicting outcomes as the run
//! progresses. Snapshots let one pipeline stage capture the pool and a later
//! stage resume it.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::change::{Change, ChangeId};
use crate::error::{ChangeFailure, QueueError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    /// Candidates backed by a local checkout; applied then pushed.
    pub candidates: Vec<Change>,
    /// Candidates without a checkout; submitted through the review API.
    pub non_checkout: Vec<Change>,
    /// Changes applied to a checkout so far in this run.
    pub applied: Vec<Change>,
    /// Failures accumulated so far in this run.
    pub conflicting: Vec<ChangeFailure>,
    pub frozen: bool,
    pub dry_run: bool,
    /// Whether the tree was fully open at acquisition time.
    pub tree_was_open: bool,
    /// Consecutive prior runs that did not pass.
    pub fail_streak: u32,
    /// Changes dropped by throttled-tree sampling; dependency failures that
    /// bottom out here are suppressed rather than reported.
    pub filtered: HashSet<ChangeId>,
    sampled: bool,
}

impl Pool {
    pub fn new(frozen: bool, dry_run: bool, tree_was_open: bool, fail_streak: u32) -> Self {
        Self {
            candidates: Vec::new(),
            non_checkout: Vec::new(),
            applied: Vec::new(),
            conflicting: Vec::new(),
            frozen,
            dry_run,
            tree_was_open,
            fail_streak,
            filtered: HashSet::new(),
            sampled: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty() && self.non_checkout.is_empty()
    }

    /// Candidates not yet applied and not yet failed.
    pub fn pending_candidates(&self) -> Vec<Change> {
        let applied: HashSet<&ChangeId> = self.applied.iter().map(|c| c.id()).collect();
        let failed: HashSet<&ChangeId> = self.conflicting.iter().map(|f| &f.change).collect();
        self.candidates
            .iter()
            .filter(|c| !applied.contains(c.id()) && !failed.contains(c.id()))
            .cloned()
            .collect()
    }

    /// Downsample the candidate set to `max(1, N / 2^fail_streak)` when the
    /// tree was not open at acquisition. Keeps the oldest-approved changes.
    /// Runs at most once per pool; resampling never happens mid-run.
    pub fn sample_for_throttle(&mut self) {
        if self.sampled {
            return;
        }
        self.sampled = true;
        if self.tree_was_open {
            return;
        }
        let total = self.candidates.len() + self.non_checkout.len();
        if total == 0 {
            return;
        }
        let shift = self.fail_streak.min(63);
        let keep = std::cmp::max(1, (total as u64) >> shift) as usize;
        if keep >= total {
            return;
        }

        let mut combined: Vec<&Change> =
            self.candidates.iter().chain(&self.non_checkout).collect();
        combined.sort_by_key(|c| sample_rank(c));
        let kept: HashSet<ChangeId> = combined
            .iter()
            .take(keep)
            .map(|c| c.id().clone())
            .collect();

        for change in combined.into_iter().skip(keep) {
            self.filtered.insert(change.id().clone());
        }
        self.candidates.retain(|c| kept.contains(c.id()));
        self.non_checkout.retain(|c| kept.contains(c.id()));
        info!(
            fail_streak = self.fail_streak,
            kept = keep,
            dropped = total - keep,
            "downsampled throttled pool"
        );
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| QueueError::Snapshot(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| QueueError::Snapshot(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json =
            std::fs::read_to_string(path).map_err(|e| QueueError::Snapshot(e.to_string()))?;
        serde_json::from_str(&json).map_err(|e| QueueError::Snapshot(e.to_string()))
    }
}

/// Stubs carry no approval time; they sort first so replayed commits are
/// never sampled away from under the changes that depend on them.
fn sample_rank(change: &Change) -> (DateTime<Utc>, u64) {
    (
        change.approved_at().unwrap_or(DateTime::<Utc>::MIN_UTC),
        change.id().number,
    )
}
