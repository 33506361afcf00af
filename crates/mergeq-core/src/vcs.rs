//! Seam to the version-control backend that owns the working checkouts.

use std::path::PathBuf;

use thiserror::Error;

use crate::change::{Change, ChangeId};

/// Errors from the version-control backend.
#[derive(Debug, Clone, Error)]
pub enum VcsError {
    /// The change does not apply cleanly on top of the current head.
    #[error("change {change} does not apply cleanly: {detail}")]
    ApplyConflict { change: ChangeId, detail: String },

    /// A backend command failed for a reason other than a merge conflict.
    #[error("vcs command failed: {0}")]
    Command(String),

    /// The named project has no local checkout.
    #[error("no checkout for project {0}")]
    UnknownProject(String),

    #[error("push to {project}:{branch} failed: {detail}")]
    PushFailed {
        project: String,
        branch: String,
        detail: String,
    },
}

pub type VcsResult<T> = std::result::Result<T, VcsError>;

/// The version-control backend the queue applies changes through.
///
/// Implementations manage a set of project checkouts keyed by project name.
/// All mutating operations act on the checkout of the change's project.
#[async_trait::async_trait]
pub trait VcsBackend: Send + Sync {
    /// Download the change's revision into the project checkout so it can be
    /// applied later without network access.
    async fn fetch_change(&self, change: &Change) -> VcsResult<()>;

    /// Current head commit of the project checkout.
    async fn current_head(&self, project: &str) -> VcsResult<String>;

    /// Apply (cherry-pick) the change onto the project checkout's head.
    async fn apply_change(&self, change: &Change) -> VcsResult<()>;

    /// Hard-reset the project checkout to `sha`, discarding local commits.
    async fn reset_hard(&self, project: &str, sha: &str) -> VcsResult<()>;

    /// Refresh the project checkout from the remote branch.
    async fn resync(&self, project: &str, branch: &str) -> VcsResult<()>;

    /// Push the project checkout's local commits to the remote branch.
    async fn push(&self, project: &str, branch: &str) -> VcsResult<()>;

    /// Path to the local checkout for `project`, if one exists. Changes whose
    /// project has no checkout are submitted through the review API instead
    /// of being applied locally.
    fn local_repo(&self, project: &str) -> Option<PathBuf>;
}
