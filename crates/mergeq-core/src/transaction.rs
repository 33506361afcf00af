//! Ordered, duplicate-free apply plans.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::change::{Change, ChangeId};

/// An ordered plan of changes where every change appears after all of its
/// in-plan dependencies. The change the plan was resolved for sits last.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    changes: Vec<Change>,
}

impl Transaction {
    /// Build a transaction from an already-ordered, duplicate-free list.
    pub fn from_ordered(changes: Vec<Change>) -> Self {
        Self { changes }
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    /// The change this plan was resolved for.
    pub fn root(&self) -> Option<&Change> {
        self.changes.last()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn contains(&self, id: &ChangeId) -> bool {
        self.changes.iter().any(|c| c.id() == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ChangeId> {
        self.changes.iter().map(|c| c.id())
    }
}

impl IntoIterator for Transaction {
    type Item = Change;
    type IntoIter = std::vec::IntoIter<Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

impl<'a> IntoIterator for &'a Transaction {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for change in &self.changes {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}", change.id())?;
            first = false;
        }
        Ok(())
    }
}
