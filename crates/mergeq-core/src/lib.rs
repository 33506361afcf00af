//! Merge-queue orchestration engine.
//!
//! The queue decides which reviewed changes are ready, resolves each one's
//! dependency transaction, applies candidates to working checkouts as
//! atomic rollback-safe transactions, partitions large batches into
//! independently testable groups, and submits verified changes back to the
//! review service.
//!
//! Components, leaf first:
//! - [`index::PatchIndex`]: alias-resolving map over change identities.
//! - [`resolver::DependencyResolver`]: depth-bounded expansion of a change
//!   into an ordered [`transaction::Transaction`].
//! - [`partition::partition`]: strongly-connected-component grouping of
//!   plans into disjoint, size-bounded units.
//! - [`applier::TransactionApplier`]: sequential scoped-rollback apply.
//! - [`orchestrator::QueueOrchestrator`]: the acquire/apply/submit loop.
//!
//! External collaborators (review service, version control, tree health,
//! build ledger) are trait seams in [`service`] and [`vcs`]; in-memory
//! implementations live in [`fakes`].

pub mod applier;
pub mod change;
pub mod error;
pub mod fakes;
pub mod index;
pub mod notify;
pub mod orchestrator;
pub mod partition;
pub mod pool;
pub mod resolver;
pub mod service;
pub mod transaction;
pub mod vcs;

pub use applier::{ApplyReport, TransactionApplier};
pub use change::{Change, ChangeId, ChangeKey, DepRef, LocalStubChange, MergeState, RemoteChange};
pub use error::{ChangeFailure, FailureKind, QueueError, Result};
pub use index::PatchIndex;
pub use notify::{BlameAll, BlameClassifier, Notifier};
pub use orchestrator::{QueueConfig, QueueOrchestrator, RunOutcome};
pub use partition::partition;
pub use pool::Pool;
pub use resolver::{DependencyResolver, ResolveMode, Resolution, DEFAULT_RESOLVE_DEPTH};
pub use service::{
    ActionKind, BuildLedger, ReviewService, ReviewStatus, ServiceError, TreeHealth, TreeStatus,
};
pub use transaction::Transaction;
pub use vcs::{VcsBackend, VcsError};
