//! In-memory collaborator fakes for tests and local experiments.
//!
//! These are deliberately simple: state behind a mutex, scripted failures,
//! and enough inspection hooks to assert on side effects.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::change::{Change, ChangeId, ChangeKey, MergeState, RemoteChange};
use crate::service::{
    ActionKind, BuildLedger, ReviewService, ReviewStatus, ServiceError, ServiceResult,
    TreeHealth, TreeStatus,
};
use crate::vcs::{VcsBackend, VcsError, VcsResult};

fn number_key(id: &ChangeId) -> (String, u64) {
    (id.remote.clone(), id.number)
}

#[derive(Default)]
struct ReviewState {
    changes: HashMap<(String, u64), RemoteChange>,
    statuses: HashMap<(String, u64), ReviewStatus>,
    comments: HashMap<(String, u64), Vec<String>>,
    readiness_removed: Vec<ChangeId>,
    submits: HashMap<(String, u64), usize>,
    submit_log: Vec<ChangeId>,
    fail_submit: HashSet<(String, u64)>,
    stick_submitted: HashSet<(String, u64)>,
    queries: Vec<String>,
}

/// Review service over an in-memory change table.
#[derive(Default)]
pub struct InMemoryReview {
    state: Mutex<ReviewState>,
}

impl InMemoryReview {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a change; replacing simulates an author upload.
    pub fn add_change(&self, change: RemoteChange) {
        let mut state = self.state.lock().unwrap();
        state.changes.insert(number_key(&change.id), change);
    }

    /// Make submits of this change fail with a conflict.
    pub fn fail_submit(&self, id: &ChangeId) {
        self.state.lock().unwrap().fail_submit.insert(number_key(id));
    }

    /// Keep this change reporting submitted-but-not-merged after submit.
    pub fn stick_at_submitted(&self, id: &ChangeId) {
        self.state
            .lock()
            .unwrap()
            .stick_submitted
            .insert(number_key(id));
    }

    pub fn comments(&self, id: &ChangeId) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .comments
            .get(&number_key(id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn readiness_removed(&self) -> Vec<ChangeId> {
        self.state.lock().unwrap().readiness_removed.clone()
    }

    pub fn submit_count(&self, id: &ChangeId) -> usize {
        self.state
            .lock()
            .unwrap()
            .submits
            .get(&number_key(id))
            .copied()
            .unwrap_or(0)
    }

    pub fn queries(&self) -> Vec<String> {
        self.state.lock().unwrap().queries.clone()
    }

    /// Every submit call in order, including failed ones.
    pub fn submit_order(&self) -> Vec<ChangeId> {
        self.state.lock().unwrap().submit_log.clone()
    }
}

#[async_trait::async_trait]
impl ReviewService for InMemoryReview {
    async fn query(&self, criteria: &str) -> ServiceResult<Vec<RemoteChange>> {
        let mut state = self.state.lock().unwrap();
        state.queries.push(criteria.to_string());
        let mut ready: Vec<RemoteChange> = state
            .changes
            .values()
            .filter(|c| c.ready && c.merge_state != MergeState::Merged)
            .cloned()
            .collect();
        ready.sort_by_key(|c| (c.approved_at, c.id.number));
        Ok(ready)
    }

    async fn lookup(&self, key: &ChangeKey) -> ServiceResult<Option<RemoteChange>> {
        let state = self.state.lock().unwrap();
        let found = state.changes.values().find(|c| match key {
            ChangeKey::Number { remote, number } => {
                c.id.remote == *remote && c.id.number == *number
            }
            ChangeKey::ReviewKey { remote, key } => {
                c.id.remote == *remote && c.review_key.as_deref() == Some(key.as_str())
            }
            ChangeKey::Sha { remote, sha } => {
                c.id.remote == *remote && c.sha.as_deref() == Some(sha.as_str())
            }
        });
        Ok(found.cloned())
    }

    async fn fetch_change(&self, id: &ChangeId) -> ServiceResult<RemoteChange> {
        let state = self.state.lock().unwrap();
        state
            .changes
            .get(&number_key(id))
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }

    async fn submit(&self, id: &ChangeId) -> ServiceResult<()> {
        let mut state = self.state.lock().unwrap();
        let key = number_key(id);
        *state.submits.entry(key.clone()).or_insert(0) += 1;
        state.submit_log.push(id.clone());
        if state.fail_submit.contains(&key) {
            return Err(ServiceError::Conflict {
                change_closed: false,
                detail: "merge conflict".to_string(),
            });
        }
        let status = if state.stick_submitted.contains(&key) {
            ReviewStatus::Submitted
        } else {
            ReviewStatus::Merged
        };
        state.statuses.insert(key.clone(), status);
        if status == ReviewStatus::Merged {
            if let Some(change) = state.changes.get_mut(&key) {
                change.merge_state = MergeState::Merged;
            }
        }
        Ok(())
    }

    async fn set_readiness(&self, id: &ChangeId, ready: bool) -> ServiceResult<()> {
        let mut state = self.state.lock().unwrap();
        if !ready {
            state.readiness_removed.push(id.clone());
        }
        if let Some(change) = state.changes.get_mut(&number_key(id)) {
            change.ready = ready;
        }
        Ok(())
    }

    async fn post_comment(&self, id: &ChangeId, message: &str) -> ServiceResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .comments
            .entry(number_key(id))
            .or_default()
            .push(message.to_string());
        Ok(())
    }

    async fn change_status(&self, id: &ChangeId) -> ServiceResult<ReviewStatus> {
        let state = self.state.lock().unwrap();
        Ok(state
            .statuses
            .get(&number_key(id))
            .copied()
            .unwrap_or(ReviewStatus::New))
    }
}

#[derive(Default)]
struct VcsState {
    heads: HashMap<String, String>,
    apply_counts: HashMap<(String, u64), usize>,
    conflicts: HashSet<(String, u64)>,
    pushes: Vec<(String, String)>,
    resyncs: Vec<(String, String)>,
    fail_push: HashMap<(String, String), usize>,
}

/// Version-control backend over in-memory per-project head strings.
/// Applying a change appends its identity to the head, so rollback can be
/// asserted by string comparison.
#[derive(Default)]
pub struct FakeVcs {
    state: Mutex<VcsState>,
}

impl FakeVcs {
    pub fn new(projects: &[&str]) -> Self {
        let fake = Self::default();
        {
            let mut state = fake.state.lock().unwrap();
            for project in projects {
                state
                    .heads
                    .insert(project.to_string(), format!("base-{project}"));
            }
        }
        fake
    }

    /// Make every apply of this change conflict.
    pub fn fail_apply(&self, id: &ChangeId) {
        self.state.lock().unwrap().conflicts.insert(number_key(id));
    }

    /// Make the next `times` pushes to this project/branch fail.
    pub fn fail_push_times(&self, project: &str, branch: &str, times: usize) {
        self.state
            .lock()
            .unwrap()
            .fail_push
            .insert((project.to_string(), branch.to_string()), times);
    }

    pub fn head(&self, project: &str) -> String {
        self.state
            .lock()
            .unwrap()
            .heads
            .get(project)
            .cloned()
            .unwrap_or_default()
    }

    pub fn apply_count(&self, id: &ChangeId) -> usize {
        self.state
            .lock()
            .unwrap()
            .apply_counts
            .get(&number_key(id))
            .copied()
            .unwrap_or(0)
    }

    pub fn pushes(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().pushes.clone()
    }

    pub fn resyncs(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().resyncs.clone()
    }
}

#[async_trait::async_trait]
impl VcsBackend for FakeVcs {
    async fn fetch_change(&self, _change: &Change) -> VcsResult<()> {
        Ok(())
    }

    async fn current_head(&self, project: &str) -> VcsResult<String> {
        let state = self.state.lock().unwrap();
        state
            .heads
            .get(project)
            .cloned()
            .ok_or_else(|| VcsError::UnknownProject(project.to_string()))
    }

    async fn apply_change(&self, change: &Change) -> VcsResult<()> {
        let mut state = self.state.lock().unwrap();
        let key = number_key(change.id());
        *state.apply_counts.entry(key.clone()).or_insert(0) += 1;
        if state.conflicts.contains(&key) {
            return Err(VcsError::ApplyConflict {
                change: change.id().clone(),
                detail: "patch does not apply".to_string(),
            });
        }
        let project = change.project().to_string();
        let head = state
            .heads
            .get(&project)
            .cloned()
            .ok_or(VcsError::UnknownProject(project.clone()))?;
        state
            .heads
            .insert(project, format!("{head}+{}", change.id()));
        Ok(())
    }

    async fn reset_hard(&self, project: &str, sha: &str) -> VcsResult<()> {
        let mut state = self.state.lock().unwrap();
        state.heads.insert(project.to_string(), sha.to_string());
        Ok(())
    }

    async fn resync(&self, project: &str, branch: &str) -> VcsResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .resyncs
            .push((project.to_string(), branch.to_string()));
        Ok(())
    }

    async fn push(&self, project: &str, branch: &str) -> VcsResult<()> {
        let mut state = self.state.lock().unwrap();
        let key = (project.to_string(), branch.to_string());
        if let Some(remaining) = state.fail_push.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(VcsError::PushFailed {
                    project: project.to_string(),
                    branch: branch.to_string(),
                    detail: "remote rejected push".to_string(),
                });
            }
        }
        state.pushes.push(key);
        Ok(())
    }

    fn local_repo(&self, project: &str) -> Option<PathBuf> {
        let state = self.state.lock().unwrap();
        if state.heads.contains_key(project) {
            Some(PathBuf::from(format!("/checkouts/{project}")))
        } else {
            None
        }
    }
}

/// Tree health that plays back a scripted sequence, then a fallback.
pub struct ScriptedTree {
    sequence: Mutex<VecDeque<TreeStatus>>,
    fallback: TreeStatus,
}

impl ScriptedTree {
    pub fn new(sequence: Vec<TreeStatus>, fallback: TreeStatus) -> Self {
        Self {
            sequence: Mutex::new(sequence.into()),
            fallback,
        }
    }

    pub fn open() -> Self {
        Self::new(Vec::new(), TreeStatus::Open)
    }

    pub fn throttled() -> Self {
        Self::new(Vec::new(), TreeStatus::Throttled)
    }

    pub fn closed() -> Self {
        Self::new(Vec::new(), TreeStatus::Closed)
    }
}

#[async_trait::async_trait]
impl TreeHealth for ScriptedTree {
    async fn status(&self) -> ServiceResult<TreeStatus> {
        let mut sequence = self.sequence.lock().unwrap();
        Ok(sequence.pop_front().unwrap_or(self.fallback))
    }
}

/// One recorded ledger entry.
#[derive(Debug, Clone)]
pub struct RecordedAction {
    pub change: ChangeId,
    pub action: ActionKind,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Ledger that records every action for later assertions.
#[derive(Default)]
pub struct RecordingLedger {
    actions: Mutex<Vec<RecordedAction>>,
}

impl RecordingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actions(&self) -> Vec<RecordedAction> {
        self.actions.lock().unwrap().clone()
    }

    pub fn actions_of(&self, kind: ActionKind) -> Vec<ChangeId> {
        self.actions
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.action == kind)
            .map(|a| a.change.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl BuildLedger for RecordingLedger {
    async fn record_action(
        &self,
        change: &ChangeId,
        action: ActionKind,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> ServiceResult<()> {
        self.actions.lock().unwrap().push(RecordedAction {
            change: change.clone(),
            action,
            reason: reason.map(str::to_string),
            at,
        });
        Ok(())
    }
}
