//! Collaborator seams for the review service, tree health, and build ledger.
//!
//! Query semantics are opaque configuration-supplied strings; the engine
//! never interprets them. Inject real implementations that speak the review
//! service's protocol, or the in-memory fakes from [`crate::fakes`] in tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::change::{ChangeId, ChangeKey, RemoteChange};

/// Errors surfaced by remote collaborators.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// The service could not be reached or returned a transient error.
    #[error("review service unavailable: {0}")]
    Unavailable(String),

    /// A referenced change does not exist on the service.
    #[error("change not found: {0}")]
    NotFound(String),

    /// The service rejected a submit with a conflict. `change_closed` marks
    /// the "change already closed" case, which counts as submitted.
    #[error("submit conflict (change closed: {change_closed}): {detail}")]
    Conflict { change_closed: bool, detail: String },

    /// The service answered with something the client could not interpret.
    #[error("malformed service response: {0}")]
    Malformed(String),
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Review-service status of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    New,
    Submitted,
    Merged,
    Abandoned,
}

/// Tree health signal gating acquisition and submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeStatus {
    Open,
    Throttled,
    Closed,
}

/// Audit actions recorded against the build ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    PickedUp,
    Submitted,
    SubmitFailed,
    KickedOut,
    Forgiven,
}

/// The review service the queue acquires from and submits to.
#[async_trait::async_trait]
pub trait ReviewService: Send + Sync {
    /// Run an opaque readiness query and return matching changes.
    async fn query(&self, criteria: &str) -> ServiceResult<Vec<RemoteChange>>;

    /// Resolve a single change by any alias key, if it exists.
    async fn lookup(&self, key: &ChangeKey) -> ServiceResult<Option<RemoteChange>>;

    /// Reload a change, returning its current server-side state (the returned
    /// patch-set number may differ from the requested one).
    async fn fetch_change(&self, id: &ChangeId) -> ServiceResult<RemoteChange>;

    /// Submit a change through the review API.
    async fn submit(&self, id: &ChangeId) -> ServiceResult<()>;

    /// Set or strip the author-facing readiness flag.
    async fn set_readiness(&self, id: &ChangeId, ready: bool) -> ServiceResult<()>;

    /// Post an author-facing comment on a change.
    async fn post_comment(&self, id: &ChangeId, message: &str) -> ServiceResult<()>;

    /// Current review status of a change.
    async fn change_status(&self, id: &ChangeId) -> ServiceResult<ReviewStatus>;
}

/// Tree health provider.
#[async_trait::async_trait]
pub trait TreeHealth: Send + Sync {
    async fn status(&self) -> ServiceResult<TreeStatus>;
}

/// Fire-and-forget audit ledger. The queue's control flow never reads this
/// back; recording failures are logged and swallowed by callers.
#[async_trait::async_trait]
pub trait BuildLedger: Send + Sync {
    async fn record_action(
        &self,
        change: &ChangeId,
        action: ActionKind,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> ServiceResult<()>;
}
