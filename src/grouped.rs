//! Dependency lists that remember how dependencies were batched.
//!
//! A node function may request its dependencies in several calls, where a later call
//! is only made because of what an earlier one returned. Re-verifying such a node has
//! to replay the calls in the same order, one batch at a time, so the batches are kept
//! as explicit groups rather than flattened into a set.

use std::collections::HashSet;
use std::fmt;
use std::hash::{BuildHasher, Hash};

/// An ordered list of keys split into non-empty groups.
///
/// Keys are stored flat; `group_ends[i]` is the exclusive end offset of group `i`, so the
/// last key of every group carries the group boundary. Two lists are equal only if they
/// hold the same keys in the same order with the same grouping.
#[derive(Clone, PartialEq, Eq)]
pub struct GroupedList<K> {
    elements: Vec<K>,
    group_ends: Vec<usize>,
}

impl<K> Default for GroupedList<K> {
    fn default() -> Self {
        Self {
            elements: Vec::new(),
            group_ends: Vec::new(),
        }
    }
}

impl<K> GroupedList<K> {
    /// Create an empty list.
    pub fn new() -> Self {
        Default::default()
    }

    /// Number of keys, counted across all groups.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Returns true if there are no keys.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Number of groups.
    pub fn num_groups(&self) -> usize {
        self.group_ends.len()
    }

    /// Get the group at `index`.
    pub fn group(&self, index: usize) -> Option<&[K]> {
        let end = *self.group_ends.get(index)?;
        let start = match index {
            0 => 0,
            _ => self.group_ends[index - 1],
        };
        Some(&self.elements[start..end])
    }

    /// Iterate over the groups in order.
    pub fn groups(&self) -> impl Iterator<Item = &[K]> + '_ {
        (0..self.num_groups()).filter_map(|i| self.group(i))
    }

    /// Iterate over all keys in order, ignoring group boundaries.
    pub fn iter(&self) -> impl Iterator<Item = &K> + '_ {
        self.elements.iter()
    }

    /// Append every group of `builder` after the existing groups.
    pub fn append(&mut self, builder: GroupedListBuilder<K>) {
        for group in builder.groups {
            if group.is_empty() {
                continue;
            }
            self.elements.extend(group);
            self.group_ends.push(self.elements.len());
        }
    }
}

impl<K: Eq + Hash> GroupedList<K> {
    /// Returns true if `key` is in any group.
    ///
    /// This scans every element; use [`GroupedList::to_set`] for repeated lookups.
    pub fn contains(&self, key: &K) -> bool {
        self.elements.contains(key)
    }

    /// Remove every key in `to_remove`, keeping group boundaries consistent.
    ///
    /// When the key that ended a group is removed, the last surviving key of that group
    /// ends it instead. Groups left empty disappear.
    pub fn remove<S: BuildHasher>(&mut self, to_remove: &HashSet<K, S>) {
        if to_remove.is_empty() {
            return;
        }
        let mut elements = std::mem::take(&mut self.elements).into_iter();
        let mut group_ends = Vec::with_capacity(self.group_ends.len());
        let mut kept = Vec::with_capacity(elements.len());
        let mut start = 0;
        for end in self.group_ends.drain(..) {
            for key in elements.by_ref().take(end - start) {
                if !to_remove.contains(&key) {
                    kept.push(key);
                }
            }
            start = end;
            if group_ends.last() != Some(&kept.len()) && !kept.is_empty() {
                group_ends.push(kept.len());
            }
        }
        self.elements = kept;
        self.group_ends = group_ends;
    }
}

impl<K: Eq + Hash + Clone> GroupedList<K> {
    /// Collect all keys into a set.
    pub fn to_set(&self) -> ahash::HashSet<K> {
        self.elements.iter().cloned().collect()
    }
}

impl<K: fmt::Debug> fmt::Debug for GroupedList<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.groups()).finish()
    }
}

impl<K, G> FromIterator<G> for GroupedList<K>
where
    G: IntoIterator<Item = K>,
{
    fn from_iter<T: IntoIterator<Item = G>>(iter: T) -> Self {
        let mut list = GroupedList::new();
        for group in iter {
            list.elements.extend(group);
            if list.group_ends.last().copied().unwrap_or(0) != list.elements.len() {
                list.group_ends.push(list.elements.len());
            }
        }
        list
    }
}

/// Collects the groups requested during one call of a node function.
///
/// A key is kept only the first time it is added, so the same dependency never appears
/// twice in the resulting list.
#[derive(Clone)]
pub struct GroupedListBuilder<K> {
    groups: Vec<Vec<K>>,
    seen: ahash::HashSet<K>,
}

impl<K> Default for GroupedListBuilder<K> {
    fn default() -> Self {
        Self {
            groups: Vec::new(),
            seen: Default::default(),
        }
    }
}

impl<K: Clone + Eq + Hash> GroupedListBuilder<K> {
    /// Create an empty builder.
    pub fn new() -> Self {
        Default::default()
    }

    /// Create a builder holding a single group.
    pub fn from_group(keys: impl IntoIterator<Item = K>) -> Self {
        let mut builder = Self::new();
        builder.add_group(keys);
        builder
    }

    /// Add a key as a group of its own.
    pub fn add(&mut self, key: K) {
        self.add_group([key]);
    }

    /// Add keys requested together as one group. Keys added before are skipped.
    pub fn add_group(&mut self, keys: impl IntoIterator<Item = K>) {
        let group: Vec<K> = keys
            .into_iter()
            .filter(|key| self.seen.insert(key.clone()))
            .collect();
        if !group.is_empty() {
            self.groups.push(group);
        }
    }

    /// Returns true if `key` was added.
    pub fn contains(&self, key: &K) -> bool {
        self.seen.contains(key)
    }

    /// Number of keys across all groups.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Returns true if no key was added.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Drop every key in `to_remove`; groups left empty disappear.
    pub fn remove<S: BuildHasher>(&mut self, to_remove: &HashSet<K, S>) {
        for group in &mut self.groups {
            group.retain(|key| !to_remove.contains(key));
        }
        self.groups.retain(|group| !group.is_empty());
        self.seen.retain(|key| !to_remove.contains(key));
    }

    /// Iterate over all keys in order.
    pub fn iter(&self) -> impl Iterator<Item = &K> + '_ {
        self.groups.iter().flatten()
    }
}

impl<K: fmt::Debug> fmt::Debug for GroupedListBuilder<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.groups).finish()
    }
}
