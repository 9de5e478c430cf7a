//! Git reference management.

use crate::{ObjectId, Result, StorageError};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// A git reference (branch, tag, or symbolic ref).
#[derive(Debug, Clone)]
pub enum Reference {
    /// Direct reference to an object.
    Direct(ObjectId),
    /// Symbolic reference (e.g., HEAD -> refs/heads/main).
    Symbolic(String),
}

impl Reference {
    /// Returns the object ID if this is a direct reference.
    pub fn as_direct(&self) -> Option<ObjectId> {
        match self {
            Self::Direct(id) => Some(*id),
            Self::Symbolic(_) => None,
        }
    }
}

/// A compare-and-swap request for one ref: move `name` from `old` to `new`.
///
/// A null `old` requires the ref to be absent; a null `new` deletes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    /// Full ref name, e.g. `refs/heads/main`.
    pub name: String,
    /// Value the ref must currently hold.
    pub old: ObjectId,
    /// Value the ref should hold afterwards.
    pub new: ObjectId,
}

impl RefUpdate {
    /// Creates an update request.
    pub fn new(name: impl Into<String>, old: ObjectId, new: ObjectId) -> Self {
        Self {
            name: name.into(),
            old,
            new,
        }
    }

    /// True if the ref is expected not to exist yet.
    pub fn is_create(&self) -> bool {
        self.old.is_null()
    }

    /// True if the ref is to be removed.
    pub fn is_delete(&self) -> bool {
        self.new.is_null()
    }
}

/// Why a single ref update was refused by the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefUpdateError {
    /// The ref does not hold the expected old value.
    #[error("expected {expected}, found {}", display_current(.actual))]
    Stale {
        /// The old value named by the request.
        expected: ObjectId,
        /// What the ref actually pointed at.
        actual: Option<ObjectId>,
    },

    /// Another writer holds the ref lock.
    #[error("failed to lock")]
    Locked,

    /// The update was valid but its atomic batch was rolled back.
    #[error("transaction aborted")]
    Aborted,
}

fn display_current(actual: &Option<ObjectId>) -> String {
    match actual {
        Some(id) => id.to_hex(),
        None => "nothing".to_string(),
    }
}

/// Thread-safe reference store.
#[derive(Debug, Default)]
pub struct RefStore {
    refs: RwLock<HashMap<String, Reference>>,
    locks: RwLock<HashSet<String>>,
}

impl RefStore {
    /// Creates a new empty reference store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets a reference by name.
    pub fn get(&self, name: &str) -> Result<Reference> {
        self.refs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::RefNotFound(name.to_string()))
    }

    /// Returns the object a direct ref points at, if it exists.
    pub fn get_direct(&self, name: &str) -> Option<ObjectId> {
        self.refs.read().get(name).and_then(Reference::as_direct)
    }

    /// Sets a reference to point to an object.
    pub fn set(&self, name: &str, target: ObjectId) {
        self.refs
            .write()
            .insert(name.to_string(), Reference::Direct(target));
    }

    /// Sets a symbolic reference.
    pub fn set_symbolic(&self, name: &str, target: &str) {
        self.refs
            .write()
            .insert(name.to_string(), Reference::Symbolic(target.to_string()));
    }

    /// Marks a ref as held by another writer until [`RefStore::unlock`].
    /// Batches touching it fail with [`RefUpdateError::Locked`]. Returns
    /// false if it already was.
    pub fn lock(&self, name: &str) -> bool {
        self.locks.write().insert(name.to_string())
    }

    /// Releases a lock taken with [`RefStore::lock`].
    pub fn unlock(&self, name: &str) {
        self.locks.write().remove(name);
    }

    /// Applies a batch of compare-and-swaps under one write lock.
    ///
    /// Updates are checked and applied in order, so a later update of the same
    /// ref sees the effect of an earlier one. Without `atomic` each update
    /// succeeds or fails on its own; with `atomic` a single failure leaves
    /// every ref untouched and turns the other results into
    /// [`RefUpdateError::Aborted`].
    pub fn apply_batch(
        &self,
        updates: &[RefUpdate],
        atomic: bool,
    ) -> Vec<std::result::Result<(), RefUpdateError>> {
        let mut refs = self.refs.write();
        let locks = self.locks.read();
        let mut staged = refs.clone();

        let mut results = Vec::with_capacity(updates.len());
        for update in updates {
            let outcome = Self::check(&staged, &locks, update);
            if outcome.is_ok() {
                if update.is_delete() {
                    staged.remove(&update.name);
                } else {
                    staged.insert(update.name.clone(), Reference::Direct(update.new));
                }
            }
            results.push(outcome);
        }

        if atomic && results.iter().any(|r| r.is_err()) {
            tracing::debug!(updates = updates.len(), "atomic ref transaction rolled back");
            return results
                .into_iter()
                .map(|r| r.and(Err(RefUpdateError::Aborted)))
                .collect();
        }

        *refs = staged;
        results
    }

    fn check(
        refs: &HashMap<String, Reference>,
        locks: &HashSet<String>,
        update: &RefUpdate,
    ) -> std::result::Result<(), RefUpdateError> {
        if locks.contains(&update.name) {
            return Err(RefUpdateError::Locked);
        }
        let actual = refs.get(&update.name).and_then(Reference::as_direct);
        let matches = match actual {
            Some(current) => !update.old.is_null() && current == update.old,
            None => update.old.is_null(),
        };
        if matches {
            Ok(())
        } else {
            Err(RefUpdateError::Stale {
                expected: update.old,
                actual,
            })
        }
    }

    /// Lists all references with a given prefix.
    pub fn list(&self, prefix: &str) -> Vec<(String, Reference)> {
        self.refs
            .read()
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, refr)| (name.clone(), refr.clone()))
            .collect()
    }
}
