use std::sync::Arc;

use papaya::HashMap;

use crate::{NodeEntry, NodeKey, NodeOutcome, NodeValue};

/// InMemoryGraph maps keys to their [`NodeEntry`].
///
/// The map is lock-free for readers. Entries are shared behind `Arc`, so a worker keeps
/// using an entry it looked up even while other workers insert new nodes.
pub struct InMemoryGraph<K, V>
where
    K: std::fmt::Debug,
{
    nodes: HashMap<K, Arc<NodeEntry<K, V>>, ahash::RandomState>,
}

impl<K: NodeKey, V: NodeValue> Default for InMemoryGraph<K, V> {
    fn default() -> Self {
        Self {
            nodes: Default::default(),
        }
    }
}

#[test]
fn test_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<InMemoryGraph<u32, String>>();
    assert_sync::<InMemoryGraph<u32, String>>();
}

impl<K: NodeKey, V: NodeValue> InMemoryGraph<K, V> {
    /// Create an empty graph.
    pub fn new() -> Self {
        Default::default()
    }

    /// Get the entry for `key`.
    pub fn get(&self, key: &K) -> Option<Arc<NodeEntry<K, V>>> {
        self.nodes.pin().get(key).cloned()
    }

    /// Get the entry for `key`, inserting a fresh one if there is none.
    ///
    /// Concurrent callers for the same key all receive the same entry.
    pub fn create_if_absent(&self, key: K) -> Arc<NodeEntry<K, V>> {
        self.nodes
            .pin()
            .get_or_insert_with(key, || Arc::new(NodeEntry::new()))
            .clone()
    }

    /// Remove the entry for `key`. Returns true if there was one.
    pub fn remove(&self, key: &K) -> bool {
        self.nodes.pin().remove(key).is_some()
    }

    /// All keys currently in the graph.
    pub fn keys(&self) -> Vec<K> {
        self.nodes.pin().keys().cloned().collect()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The value of `key` if it is done.
    pub fn done_value(&self, key: &K) -> Option<NodeOutcome<K, V>> {
        self.get(key)?.value()
    }
}

impl<K: NodeKey, V: NodeValue> std::fmt::Debug for InMemoryGraph<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pinned = self.nodes.pin();
        let mut entries: Vec<_> = pinned.iter().collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        f.debug_map().entries(entries).finish()
    }
}
