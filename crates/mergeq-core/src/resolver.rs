//! Dependency resolution: expands one change into an ordered apply plan.
//!
//! Resolution is depth-first with two passes per node: hard parent
//! dependencies first, then soft cross-reference dependencies, each kind
//! expanded at most once per change. The resulting [`Transaction`] lists
//! every dependency strictly before its dependents, with the requested
//! change last.

use std::collections::HashSet;

use tracing::debug;

use crate::change::{Change, ChangeId, ChangeKey, DepRef, MergeState};
use crate::error::{ChangeFailure, FailureKind};
use crate::index::PatchIndex;
use crate::transaction::Transaction;

/// Depth bound on dependency expansion. Real change stacks are far
/// shallower; hitting this means a pathological or adversarial graph.
pub const DEFAULT_RESOLVE_DEPTH: u32 = 150;

/// Which failure kind an out-of-set dependency produces.
///
/// During submission an unmet dependency must tell the author their change
/// was rejected, not merely skipped for this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    Normal,
    Submitting,
}

/// Outcome of resolving one change.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub change: Change,
    pub result: Result<Transaction, ChangeFailure>,
}

/// Per-call resolution state threaded through the recursion.
#[derive(Debug, Default)]
struct ResolveState {
    plan: Vec<Change>,
    in_plan: HashSet<ChangeId>,
    hard_expanded: HashSet<ChangeId>,
    soft_expanded: HashSet<ChangeId>,
}

/// Resolves transactions against a pre-populated [`PatchIndex`].
///
/// The index must already contain every change the resolution is allowed to
/// reach; the resolver itself performs no I/O.
pub struct DependencyResolver<'a> {
    index: &'a PatchIndex,
    committed: &'a HashSet<ChangeId>,
    mode: ResolveMode,
    max_depth: u32,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(
        index: &'a PatchIndex,
        committed: &'a HashSet<ChangeId>,
        mode: ResolveMode,
    ) -> Self {
        Self {
            index,
            committed,
            mode,
            max_depth: DEFAULT_RESOLVE_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Expand `change` and its transitive dependencies into an ordered plan.
    ///
    /// With a `limit_to` set, any dependency outside it fails the resolution
    /// (not-eligible or rejected depending on mode). Dependencies that are
    /// already merged or in the committed set are satisfied and omitted.
    pub fn resolve_transaction(
        &self,
        change: &Change,
        limit_to: Option<&HashSet<ChangeId>>,
    ) -> Result<Transaction, ChangeFailure> {
        let mut state = ResolveState::default();
        self.add_with_deps(change, limit_to, self.max_depth, &mut state)?;
        let mut plan = state.plan;
        // A cycle through the requested change pushes it during its own
        // expansion; within a cycle any order is valid, so move it last to
        // keep the plan rooted at the change it was resolved for.
        if let Some(position) = plan.iter().position(|c| c.id() == change.id()) {
            if position + 1 != plan.len() {
                let own = plan.remove(position);
                plan.push(own);
            }
        }
        debug!(change = %change.id(), plan_len = plan.len(), "resolved transaction");
        Ok(Transaction::from_ordered(plan))
    }

    /// Resolve each change independently; one change's failure never blocks
    /// the others.
    pub fn resolve_transactions(
        &self,
        changes: &[Change],
        limit_to: Option<&HashSet<ChangeId>>,
    ) -> Vec<Resolution> {
        changes
            .iter()
            .map(|change| Resolution {
                change: change.clone(),
                result: self.resolve_transaction(change, limit_to),
            })
            .collect()
    }

    fn add_with_deps(
        &self,
        change: &Change,
        limit_to: Option<&HashSet<ChangeId>>,
        depth: u32,
        state: &mut ResolveState,
    ) -> Result<(), ChangeFailure> {
        if depth == 0 {
            return Err(ChangeFailure::new(
                change.id().clone(),
                FailureKind::RecursionLimitExceeded,
            ));
        }

        if state.hard_expanded.insert(change.id().clone()) {
            for dep in change.hard_deps() {
                self.expand_dep(change, dep, limit_to, depth, state)?;
            }
        }
        if state.soft_expanded.insert(change.id().clone()) {
            for dep in change.soft_deps() {
                self.expand_dep(change, dep, limit_to, depth, state)?;
            }
        }

        if state.in_plan.insert(change.id().clone()) {
            state.plan.push(change.clone());
        }
        Ok(())
    }

    fn expand_dep(
        &self,
        parent: &Change,
        dep: &DepRef,
        limit_to: Option<&HashSet<ChangeId>>,
        depth: u32,
        state: &mut ResolveState,
    ) -> Result<(), ChangeFailure> {
        let key = ChangeKey::from_dep(parent.remote(), dep);
        let resolved = match self.index.get(&key) {
            Some(change) => change.clone(),
            None => {
                return Err(ChangeFailure::new(
                    parent.id().clone(),
                    FailureKind::DependencyUnsatisfied {
                        dep: dep.to_string(),
                    },
                ));
            }
        };

        // Merged or externally committed dependencies are satisfied as-is.
        if resolved.merge_state() == MergeState::Merged
            || self.committed.contains(resolved.id())
        {
            return Ok(());
        }

        if let Some(allowed) = limit_to {
            if !allowed.contains(resolved.id()) {
                let kind = match self.mode {
                    ResolveMode::Normal => FailureKind::NotEligible,
                    ResolveMode::Submitting => FailureKind::Rejected,
                };
                let cause = ChangeFailure::new(resolved.id().clone(), kind);
                return Err(ChangeFailure::dependency(parent.id().clone(), cause));
            }
        }

        self.add_with_deps(&resolved, limit_to, depth - 1, state)
            .map_err(|failure| {
                if failure.change == *resolved.id() {
                    ChangeFailure::dependency(parent.id().clone(), failure)
                } else {
                    // Already attributed below the dependency.
                    failure
                }
            })
    }
}
