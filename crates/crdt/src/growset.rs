//! Monotonic grow-only set, used for deletion tombstones.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A set that only ever grows; merging is union. There is no removal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrowSet<T: Ord> {
    entries: BTreeSet<T>,
}

impl<T: Ord> Default for GrowSet<T> {
    fn default() -> Self {
        Self {
            entries: BTreeSet::new(),
        }
    }
}

/// Outcome of [`GrowSet::merge`]: the union, plus what each side was
/// missing. `local` is what the local side did not yet know (to be applied
/// locally); `remote` is what the remote side did not yet know (to be pushed
/// remote-wards).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrowSetMerge<T: Ord> {
    pub resolved: GrowSet<T>,
    pub local: Vec<T>,
    pub remote: Vec<T>,
}

impl<T: Ord + Clone> GrowSet<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeSet::new(),
        }
    }

    pub fn insert(&mut self, value: T) -> bool {
        self.entries.insert(value)
    }

    pub fn contains(&self, value: &T) -> bool {
        self.entries.contains(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn merge(&self, remote: &Self) -> GrowSetMerge<T> {
        let resolved = Self {
            entries: self.entries.union(&remote.entries).cloned().collect(),
        };
        let local = remote.entries.difference(&self.entries).cloned().collect();
        let remote = self.entries.difference(&remote.entries).cloned().collect();

        GrowSetMerge {
            resolved,
            local,
            remote,
        }
    }
}

impl<T: Ord> FromIterator<T> for GrowSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
