//! Alias-resolving index over changes.
//!
//! Changes are discovered through different lookup paths (review number,
//! review key, commit SHA). The [`PatchIndex`] registers every alias a change
//! carries, so that a dependency declared by SHA and a candidate fetched by
//! number resolve to the same identity.

use std::collections::HashMap;

use crate::change::{Change, ChangeId, ChangeKey};

/// Mapping from every known alias of a change to the resolved change.
#[derive(Debug, Clone, Default)]
pub struct PatchIndex {
    by_key: HashMap<ChangeKey, Change>,
}

impl PatchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a change under every alias it can be found by. Re-inserting
    /// an identity replaces the stored change (e.g. after a reload).
    pub fn insert(&mut self, change: Change) {
        for key in change.lookup_keys() {
            self.by_key.insert(key, change.clone());
        }
    }

    pub fn get(&self, key: &ChangeKey) -> Option<&Change> {
        self.by_key.get(key)
    }

    /// Look a change up by its normalized identity.
    pub fn get_by_id(&self, id: &ChangeId) -> Option<&Change> {
        self.by_key.get(&ChangeKey::Number {
            remote: id.remote.clone(),
            number: id.number,
        })
    }

    pub fn contains(&self, key: &ChangeKey) -> bool {
        self.by_key.contains_key(key)
    }

    /// Remove a change and every alias pointing at it.
    pub fn remove(&mut self, change: &Change) {
        for key in change.lookup_keys() {
            self.by_key.remove(&key);
        }
    }

    /// Iterate unique changes (each change registers exactly one number key).
    pub fn changes(&self) -> impl Iterator<Item = &Change> {
        self.by_key
            .iter()
            .filter(|(key, _)| matches!(key, ChangeKey::Number { .. }))
            .map(|(_, change)| change)
    }

    /// Number of unique changes in the index.
    pub fn len(&self) -> usize {
        self.changes().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeId, DepRef, LocalStubChange, MergeState, RemoteChange};
    use chrono::Utc;

    fn change(number: u64) -> Change {
        Change::Remote(RemoteChange {
            id: ChangeId::new("r", number, 1),
            review_key: Some(format!("I{number}")),
            sha: Some(format!("{number:040x}")),
            project: "p".to_string(),
            branch: "main".to_string(),
            owner: "dev".to_string(),
            subject: String::new(),
            ready: true,
            approved_at: Utc::now(),
            merge_state: MergeState::Mergeable,
            hard_deps: Vec::new(),
            soft_deps: Vec::new(),
        })
    }

    #[test]
    fn test_all_aliases_resolve_to_same_change() {
        let mut index = PatchIndex::new();
        index.insert(change(5));

        let by_number = index.get(&ChangeKey::from_dep("r", &DepRef::Number(5)));
        let by_key = index.get(&ChangeKey::from_dep("r", &DepRef::ReviewKey("I5".into())));
        let by_sha = index.get(&ChangeKey::from_dep("r", &DepRef::Sha(format!("{:040x}", 5))));

        assert!(by_number.is_some());
        assert_eq!(by_number, by_key);
        assert_eq!(by_key, by_sha);
    }

    #[test]
    fn test_reinsert_replaces_stored_change() {
        let mut index = PatchIndex::new();
        index.insert(change(5));
        let mut updated = change(5);
        if let Change::Remote(rc) = &mut updated {
            rc.id.patch_set = 2;
        }
        index.insert(updated.clone());

        let stored = index.get_by_id(updated.id()).expect("present");
        assert_eq!(stored.id().patch_set, 2);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove_clears_all_aliases() {
        let mut index = PatchIndex::new();
        let c = change(5);
        index.insert(c.clone());
        index.remove(&c);
        assert!(index.is_empty());
        assert!(index
            .get(&ChangeKey::from_dep("r", &DepRef::ReviewKey("I5".into())))
            .is_none());
    }

    #[test]
    fn test_stub_found_by_sha() {
        let mut index = PatchIndex::new();
        let stub = LocalStubChange::from_content("r", "p", "main", b"payload");
        let sha = stub.sha.clone();
        index.insert(Change::LocalStub(stub));
        assert!(index
            .get(&ChangeKey::from_dep("r", &DepRef::Sha(sha)))
            .is_some());
    }
}
