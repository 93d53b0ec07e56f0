//! Registry of the dependents waiting on a node.

use std::fmt;
use std::hash::Hash;

use tracing::trace;

use crate::error::ProtocolError;

/// Storage shape of the registered dependents.
///
/// Most nodes have exactly one dependent, so that case does not allocate.
#[derive(Clone, PartialEq, Eq)]
enum Repr<K> {
    Empty,
    Single(K),
    Many(Vec<K>),
}

/// ReverseDeps records which nodes depend on a node.
///
/// Removals are not applied immediately: they are queued and reconciled together the
/// next time the registry is read or added to, so a burst of removals costs a single
/// pass over the stored dependents.
#[derive(Clone)]
pub struct ReverseDeps<K> {
    repr: Repr<K>,
    pending_removals: Vec<K>,
}

impl<K> Default for ReverseDeps<K> {
    fn default() -> Self {
        Self {
            repr: Repr::Empty,
            pending_removals: Vec::new(),
        }
    }
}

impl<K> ReverseDeps<K>
where
    K: Clone + Eq + Hash + fmt::Debug,
{
    /// Create an empty registry.
    pub fn new() -> Self {
        Default::default()
    }

    /// Register a dependent.
    pub fn add(&mut self, key: K) -> Result<(), ProtocolError> {
        self.consolidate()?;
        self.repr = match std::mem::replace(&mut self.repr, Repr::Empty) {
            Repr::Empty => Repr::Single(key),
            Repr::Single(existing) => Repr::Many(vec![existing, key]),
            Repr::Many(mut keys) => {
                keys.push(key);
                Repr::Many(keys)
            }
        };
        Ok(())
    }

    /// Register several dependents at once.
    pub fn add_all(&mut self, keys: impl IntoIterator<Item = K>) -> Result<(), ProtocolError> {
        for key in keys {
            self.add(key)?;
        }
        Ok(())
    }

    /// Unregister a dependent.
    ///
    /// Removing the only registered dependent takes effect at once; anything else is
    /// deferred until the registry is next read.
    pub fn remove(&mut self, key: K) {
        if self.pending_removals.is_empty() && matches!(&self.repr, Repr::Single(k) if *k == key) {
            self.repr = Repr::Empty;
            return;
        }
        self.pending_removals.push(key);
    }

    /// Apply queued removals.
    ///
    /// Fails if a removed dependent was never registered, leaving the registry as it was.
    pub fn consolidate(&mut self) -> Result<(), ProtocolError> {
        if self.pending_removals.is_empty() {
            return Ok(());
        }
        let removals: ahash::HashSet<K> = self.pending_removals.iter().cloned().collect();
        trace!(count = removals.len(), "consolidating reverse dep removals");
        let mut found: ahash::HashSet<&K> = Default::default();
        let repr = match &self.repr {
            Repr::Empty => Repr::Empty,
            Repr::Single(key) => {
                if removals.contains(key) {
                    found.insert(key);
                    Repr::Empty
                } else {
                    Repr::Single(key.clone())
                }
            }
            Repr::Many(keys) => {
                let mut kept: Vec<K> = Vec::with_capacity(keys.len());
                for key in keys {
                    if removals.contains(key) {
                        found.insert(key);
                    } else {
                        kept.push(key.clone());
                    }
                }
                match kept.len() {
                    0 => Repr::Empty,
                    1 => Repr::Single(kept.remove(0)),
                    _ => Repr::Many(kept),
                }
            }
        };
        if let Some(missing) = removals.iter().find(|key| !found.contains(key)) {
            return Err(ProtocolError::UnknownReverseDep {
                key: format!("{missing:?}"),
            });
        }
        self.pending_removals.clear();
        self.repr = repr;
        Ok(())
    }

    /// Consolidate and return every registered dependent exactly once.
    pub fn get(&mut self) -> Result<ahash::HashSet<K>, ProtocolError> {
        self.consolidate()?;
        Ok(match &self.repr {
            Repr::Empty => Default::default(),
            Repr::Single(key) => std::iter::once(key.clone()).collect(),
            Repr::Many(keys) => keys.iter().cloned().collect(),
        })
    }
}

impl<K: fmt::Debug> fmt::Debug for ReverseDeps<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ReverseDeps");
        match &self.repr {
            Repr::Empty => s.field("deps", &[] as &[K; 0]),
            Repr::Single(key) => s.field("deps", &[key]),
            Repr::Many(keys) => s.field("deps", keys),
        };
        if !self.pending_removals.is_empty() {
            s.field("pending_removals", &self.pending_removals);
        }
        s.finish()
    }
}
