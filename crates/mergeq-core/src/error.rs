//! Failure taxonomy for the queue.
//!
//! Failures attached to individual changes ([`ChangeFailure`]) drive
//! author-facing notification and are distinct from run-level errors
//! ([`QueueError`]) that abort or degrade a queue run.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::change::ChangeId;
use crate::service::ServiceError;
use crate::vcs::VcsError;

/// What went wrong with one change. Variants carry the detail shown to the
/// change's author.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// A declared dependency could not be resolved to any known change.
    #[error("depends on {dep}, which could not be found")]
    DependencyUnsatisfied { dep: String },

    /// A dependency itself failed; the change is rejected transitively.
    #[error("depends on {dep}, which failed: {summary}")]
    DependencyFailed { dep: String, summary: String },

    /// The change did not apply cleanly to the checkout.
    #[error("conflicts with the current tree and must be rebased")]
    Conflict,

    /// The review service refused to submit the change.
    #[error("could not be submitted: {reason}")]
    SubmitFailed { reason: String },

    /// The author uploaded a new patch set while the run was in progress.
    #[error("was updated to patch set {new_patch_set} while being tested")]
    ModifiedDuringRun { new_patch_set: u32 },

    /// A dependency is outside the set being submitted.
    #[error("depends on a change that is not being submitted")]
    Rejected,

    /// A dependency is outside the set under consideration.
    #[error("depends on a change that is not ready to be picked up")]
    NotEligible,

    /// A mutually dependent group exceeds the per-transaction cap.
    #[error("is part of a group of {actual} interdependent changes, which exceeds the limit of {cap}")]
    TransactionTooLong { actual: usize, cap: usize },

    /// Dependency expansion exceeded the depth limit.
    #[error("has a dependency chain deeper than the supported limit")]
    RecursionLimitExceeded,

    /// The tree closed before the change could be processed.
    #[error("could not be processed because the tree is closed")]
    TreeClosed,

    /// Part of a batch submitted before a later member failed.
    #[error("was in a batch where only {submitted} of {total} changes could be submitted")]
    PartialSubmitFailure { submitted: usize, total: usize },

    /// An unexpected internal error; the change is not to blame.
    #[error("hit an internal error: {0}")]
    Internal(String),
}

/// A failure attached to a specific change, optionally chaining to the
/// failure of the dependency that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFailure {
    pub change: ChangeId,
    pub kind: FailureKind,
    /// True when the failing state arose during this run (the change may be
    /// innocent), false when the change is bad against the tip as-is.
    pub inflight: bool,
    pub cause: Option<Box<ChangeFailure>>,
}

impl ChangeFailure {
    pub fn new(change: ChangeId, kind: FailureKind) -> Self {
        Self {
            change,
            kind,
            inflight: false,
            cause: None,
        }
    }

    /// Wrap a dependency's failure as a transitive failure of `change`.
    pub fn dependency(change: ChangeId, cause: ChangeFailure) -> Self {
        Self {
            change,
            kind: FailureKind::DependencyFailed {
                dep: cause.change.to_string(),
                summary: cause.kind.to_string(),
            },
            inflight: cause.inflight,
            cause: Some(Box::new(cause)),
        }
    }

    pub fn with_inflight(mut self, inflight: bool) -> Self {
        self.inflight = inflight;
        self
    }

    /// Walk the cause chain to the failure that started it.
    pub fn root_cause(&self) -> &ChangeFailure {
        match &self.cause {
            Some(cause) => cause.root_cause(),
            None => self,
        }
    }

    /// Whether this failure is transitive (the change itself may be fine).
    pub fn is_dependency(&self) -> bool {
        matches!(
            self.kind,
            FailureKind::DependencyFailed { .. } | FailureKind::DependencyUnsatisfied { .. }
        )
    }
}

impl fmt::Display for ChangeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "change {} {}", self.change, self.kind)
    }
}

impl std::error::Error for ChangeFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as _)
    }
}

/// Run-level errors.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("the tree is closed")]
    TreeClosed,

    #[error("only {submitted} of {total} changes were submitted")]
    SubmitIncomplete { submitted: usize, total: usize },

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error("pool snapshot error: {0}")]
    Snapshot(String),

    #[error("manifest replay failed: {0}")]
    ManifestReplay(ChangeFailure),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
