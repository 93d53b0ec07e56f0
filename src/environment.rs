use std::sync::Arc;

use crate::{GroupedListBuilder, InMemoryGraph, NodeKey, NodeOutcome, NodeValue};

/// Environment is what a node function uses to request its dependencies.
///
/// Each request is recorded as one group of dependencies. A request for a dependency that
/// is not done yet returns `None` and marks the environment as missing values; the
/// function should then return `Ok(None)` and will be called again, with the same
/// environment contents, once everything it asked for is done.
pub struct Environment<'a, K, V>
where
    K: std::fmt::Debug,
{
    graph: &'a InMemoryGraph<K, V>,
    /// Dependencies recorded for the node before this call.
    previous_deps: ahash::HashSet<K>,
    newly_requested: GroupedListBuilder<K>,
    values_missing: bool,
}

impl<'a, K: NodeKey, V: NodeValue> Environment<'a, K, V> {
    pub(crate) fn new(graph: &'a InMemoryGraph<K, V>, previous_deps: ahash::HashSet<K>) -> Self {
        Self {
            graph,
            previous_deps,
            newly_requested: GroupedListBuilder::new(),
            values_missing: false,
        }
    }

    /// Request `keys` as one group.
    ///
    /// Returns the outcome of every key that is done, in order, and `None` for the rest.
    pub fn get_values(&mut self, keys: impl IntoIterator<Item = K>) -> Vec<Option<NodeOutcome<K, V>>> {
        let keys: Vec<K> = keys.into_iter().collect();
        self.newly_requested.add_group(
            keys.iter()
                .filter(|key| !self.previous_deps.contains(*key))
                .cloned(),
        );
        keys.iter()
            .map(|key| {
                let outcome = self.graph.done_value(key);
                if outcome.is_none() {
                    self.values_missing = true;
                }
                outcome
            })
            .collect()
    }

    /// Request a single key.
    pub fn get_value(&mut self, key: K) -> Option<NodeOutcome<K, V>> {
        self.get_values([key]).pop().flatten()
    }

    /// Request a single key, turning its failure into an error of this computation.
    ///
    /// The dependency's [`ErrorInfo`](crate::ErrorInfo) is carried inside the returned
    /// error, so propagating it with `?` keeps the original root causes.
    pub fn get_value_or_err(&mut self, key: K) -> anyhow::Result<Option<Arc<V>>> {
        match self.get_value(key) {
            None => Ok(None),
            Some(outcome) => Ok(Some(outcome.into_result()?)),
        }
    }

    /// Returns true if any request so far returned a dependency that is not done.
    pub fn values_missing(&self) -> bool {
        self.values_missing
    }

    pub(crate) fn into_newly_requested(self) -> GroupedListBuilder<K> {
        self.newly_requested
    }
}
