//! Change identity and the closed set of change variants.
//!
//! A [`Change`] is a proposed, reviewable unit of modification. Changes can
//! be discovered through different lookup paths (by review number, by
//! review-service key, by commit SHA); two changes are the same change iff
//! their normalized identities match, regardless of how they were found.

use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Normalized change identity: remote host, change number, and patch-set
/// (revision) number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeId {
    /// Review-service host the change lives on, e.g. `"review.example.org"`.
    pub remote: String,
    /// Stable change number assigned by the review service.
    pub number: u64,
    /// Patch-set number; bumps whenever the author uploads a new revision.
    pub patch_set: u32,
}

impl ChangeId {
    pub fn new(remote: impl Into<String>, number: u64, patch_set: u32) -> Self {
        Self {
            remote: remote.into(),
            number,
            patch_set,
        }
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.remote, self.number, self.patch_set)
    }
}

/// How a dependency is declared by a change.
///
/// Hard (parent) dependencies usually name a commit SHA or change number from
/// the VCS ancestry; soft cross-reference dependencies in the change
/// description typically name a change number or review key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepRef {
    /// Dependency named by review-service change number.
    Number(u64),
    /// Dependency named by the review-service change key (e.g. `I6a7f…`).
    ReviewKey(String),
    /// Dependency named by commit SHA.
    Sha(String),
}

impl fmt::Display for DepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DepRef::Number(n) => write!(f, "{n}"),
            DepRef::ReviewKey(k) => write!(f, "{k}"),
            DepRef::Sha(s) => write!(f, "{s}"),
        }
    }
}

/// Index lookup key, scoped to a remote.
///
/// Every change registers one key per alias it can be found under; the
/// [`crate::index::PatchIndex`] resolves all of them to the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKey {
    Number { remote: String, number: u64 },
    ReviewKey { remote: String, key: String },
    Sha { remote: String, sha: String },
}

impl ChangeKey {
    /// Build the lookup key for a dependency declared by `dep`, scoped to the
    /// declaring change's remote.
    pub fn from_dep(remote: &str, dep: &DepRef) -> Self {
        match dep {
            DepRef::Number(number) => ChangeKey::Number {
                remote: remote.to_string(),
                number: *number,
            },
            DepRef::ReviewKey(key) => ChangeKey::ReviewKey {
                remote: remote.to_string(),
                key: key.clone(),
            },
            DepRef::Sha(sha) => ChangeKey::Sha {
                remote: remote.to_string(),
                sha: sha.clone(),
            },
        }
    }
}

/// Merge state as reported by the review service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    Mergeable,
    NotMergeable,
    Merged,
}

/// A change fetched from the review service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteChange {
    pub id: ChangeId,
    /// Review-service change key, when known.
    pub review_key: Option<String>,
    /// Commit SHA of the current patch set, when fetched.
    pub sha: Option<String>,
    /// Project (repository) the change targets.
    pub project: String,
    /// Target branch.
    pub branch: String,
    pub owner: String,
    pub subject: String,
    /// Whether the author has marked the change ready for the queue.
    pub ready: bool,
    /// When the readiness approval was granted.
    pub approved_at: DateTime<Utc>,
    pub merge_state: MergeState,
    /// Hard parent dependencies from the VCS ancestry.
    pub hard_deps: Vec<DepRef>,
    /// Soft cross-reference dependencies declared in the description.
    pub soft_deps: Vec<DepRef>,
}

/// A locally constructed stand-in for a change that was never fetched from
/// the review service (e.g. a commit replayed from a shared manifest).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStubChange {
    pub id: ChangeId,
    pub project: String,
    pub branch: String,
    pub sha: String,
}

impl LocalStubChange {
    /// Build a stub with a deterministic pseudo change number derived from a
    /// content hash. The high bit is set so stub numbers never collide with
    /// real review-service numbers.
    pub fn from_content(
        remote: impl Into<String>,
        project: impl Into<String>,
        branch: impl Into<String>,
        content: &[u8],
    ) -> Self {
        let digest = Sha256::digest(content);
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let number = u64::from_be_bytes(prefix) | (1 << 63);
        Self {
            id: ChangeId::new(remote, number, 1),
            project: project.into(),
            branch: branch.into(),
            sha: hex::encode(digest),
        }
    }
}

/// The closed set of change variants.
///
/// All queue logic goes through this one capability surface; nothing
/// downstream distinguishes the variants except the few operations that only
/// make sense for remote changes (owner, readiness, dependency lists).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    Remote(RemoteChange),
    LocalStub(LocalStubChange),
}

impl Change {
    pub fn id(&self) -> &ChangeId {
        match self {
            Change::Remote(c) => &c.id,
            Change::LocalStub(c) => &c.id,
        }
    }

    pub fn remote(&self) -> &str {
        &self.id().remote
    }

    pub fn project(&self) -> &str {
        match self {
            Change::Remote(c) => &c.project,
            Change::LocalStub(c) => &c.project,
        }
    }

    pub fn branch(&self) -> &str {
        match self {
            Change::Remote(c) => &c.branch,
            Change::LocalStub(c) => &c.branch,
        }
    }

    pub fn hard_deps(&self) -> &[DepRef] {
        match self {
            Change::Remote(c) => &c.hard_deps,
            Change::LocalStub(_) => &[],
        }
    }

    pub fn soft_deps(&self) -> &[DepRef] {
        match self {
            Change::Remote(c) => &c.soft_deps,
            Change::LocalStub(_) => &[],
        }
    }

    pub fn merge_state(&self) -> MergeState {
        match self {
            Change::Remote(c) => c.merge_state,
            // Stubs replay commits that already exist locally.
            Change::LocalStub(_) => MergeState::Mergeable,
        }
    }

    pub fn is_ready(&self) -> bool {
        match self {
            Change::Remote(c) => c.ready,
            Change::LocalStub(_) => true,
        }
    }

    pub fn approved_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Change::Remote(c) => Some(c.approved_at),
            Change::LocalStub(_) => None,
        }
    }

    pub fn owner(&self) -> Option<&str> {
        match self {
            Change::Remote(c) => Some(&c.owner),
            Change::LocalStub(_) => None,
        }
    }

    /// Every index key this change can be found under.
    pub fn lookup_keys(&self) -> Vec<ChangeKey> {
        let remote = self.remote().to_string();
        let mut keys = vec![ChangeKey::Number {
            remote: remote.clone(),
            number: self.id().number,
        }];
        match self {
            Change::Remote(c) => {
                if let Some(key) = &c.review_key {
                    keys.push(ChangeKey::ReviewKey {
                        remote: remote.clone(),
                        key: key.clone(),
                    });
                }
                if let Some(sha) = &c.sha {
                    keys.push(ChangeKey::Sha { remote, sha: sha.clone() });
                }
            }
            Change::LocalStub(c) => {
                keys.push(ChangeKey::Sha {
                    remote,
                    sha: c.sha.clone(),
                });
            }
        }
        keys
    }
}

// Identity-based equality: a change reloaded through a different lookup path
// is still the same change.
impl PartialEq for Change {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Change {}

impl Hash for Change {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}
