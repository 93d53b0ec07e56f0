use tracing::{debug, trace};

use crate::error::ProtocolError;
use crate::{InMemoryGraph, InvalidationReason, NodeKey, NodeValue, Tracer};

/// Counts of what an [`invalidate`] call touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationStats {
    /// Nodes reported as changed that were marked dirty.
    pub changed: usize,
    /// Dependents marked dirty because something below them was.
    pub dirtied: usize,
}

/// Mark every key in `changed` as changed, and its transitive dependents as dirty.
///
/// Keys not in the graph are ignored. The walk stops at nodes that are already dirty,
/// except that a dirty node reported as changed is upgraded to changed. A node that is
/// dirtied unregisters itself from its previous dependencies; it registers again when it
/// re-checks them.
///
/// Must not run concurrently with an evaluation of the same graph.
pub fn invalidate<K, V>(
    graph: &InMemoryGraph<K, V>,
    changed: impl IntoIterator<Item = K>,
    tracer: &impl Tracer<K>,
) -> Result<InvalidationStats, ProtocolError>
where
    K: NodeKey,
    V: NodeValue,
{
    let mut stats = InvalidationStats::default();
    let mut stack: Vec<(K, InvalidationReason)> = changed
        .into_iter()
        .map(|key| (key, InvalidationReason::Changed))
        .collect();
    while let Some((key, reason)) = stack.pop() {
        let Some(entry) = graph.get(&key) else {
            trace!(?key, "invalidated node is not in the graph");
            continue;
        };
        let Some(dirtied) = entry.mark_dirty(reason == InvalidationReason::Changed)? else {
            continue;
        };
        trace!(?key, ?reason, "marked dirty");
        tracer.on_invalidate(&key, reason);
        match reason {
            InvalidationReason::Changed => stats.changed += 1,
            InvalidationReason::DependencyInvalidated => stats.dirtied += 1,
        }
        for dep in dirtied.direct_deps {
            if let Some(dep_entry) = graph.get(&dep) {
                dep_entry.remove_reverse_dep(key.clone());
            }
        }
        stack.extend(
            dirtied
                .reverse_deps
                .into_iter()
                .map(|parent| (parent, InvalidationReason::DependencyInvalidated)),
        );
    }
    debug!(changed = stats.changed, dirtied = stats.dirtied, "invalidation done");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{DirtyState, GroupedListBuilder, NodeOutcome, NoopTracer, Version};

    /// Build `key` on top of deps that are already done.
    fn build(graph: &InMemoryGraph<&'static str, i32>, key: &'static str, deps: &[&'static str]) {
        let entry = graph.create_if_absent(key);
        entry.add_reverse_dep_and_check_if_done(None).unwrap();
        entry
            .add_temporary_direct_deps(GroupedListBuilder::from_group(deps.iter().copied()))
            .unwrap();
        for dep in deps {
            let state = graph
                .get(dep)
                .unwrap()
                .add_reverse_dep_and_check_if_done(Some(key))
                .unwrap();
            let crate::DependencyState::Done(version) = state else {
                panic!("{dep} is not done");
            };
            entry.signal_dep(version).unwrap();
        }
        entry
            .set_value(NodeOutcome::Value(Arc::new(0)), Version(1))
            .unwrap();
    }

    /// leaf <- mid <- top, and leaf <- side
    fn diamond() -> InMemoryGraph<&'static str, i32> {
        let graph = InMemoryGraph::new();
        build(&graph, "leaf", &[]);
        build(&graph, "mid", &["leaf"]);
        build(&graph, "side", &["leaf"]);
        build(&graph, "top", &["mid", "side"]);
        graph
    }

    #[test]
    fn test_transitive_invalidation() {
        let graph = diamond();
        let stats = invalidate(&graph, ["leaf"], &NoopTracer).unwrap();
        assert_eq!(stats, InvalidationStats { changed: 1, dirtied: 3 });

        let leaf = graph.get(&"leaf").unwrap();
        assert!(leaf.is_changed());
        for key in ["mid", "side", "top"] {
            let entry = graph.get(&key).unwrap();
            assert!(entry.is_dirty(), "{key} should be dirty");
            assert!(!entry.is_changed(), "{key} should only be dirty");
        }
        // Dirty dependents unregister from their previous dependencies.
        let mid = graph.get(&"mid").unwrap();
        assert!(mid.reverse_deps().unwrap().is_empty());
    }

    #[test]
    fn test_walk_stops_at_dirty_nodes() {
        let graph = diamond();
        invalidate(&graph, ["mid"], &NoopTracer).unwrap();
        let stats = invalidate(&graph, ["leaf"], &NoopTracer).unwrap();
        // `mid` and `top` already unregistered from their dependencies.
        assert_eq!(stats, InvalidationStats { changed: 1, dirtied: 1 });
        assert!(graph.get(&"side").unwrap().is_dirty());
    }

    #[test]
    fn test_dirty_node_upgraded_to_changed() {
        let graph = diamond();
        invalidate(&graph, ["leaf"], &NoopTracer).unwrap();
        let stats = invalidate(&graph, ["mid"], &NoopTracer).unwrap();
        assert_eq!(stats, InvalidationStats::default());
        let mid = graph.get(&"mid").unwrap();
        assert!(mid.is_changed());
        mid.add_reverse_dep_and_check_if_done(None).unwrap();
        assert_eq!(mid.dirty_state().unwrap(), DirtyState::Rebuilding);
    }

    #[test]
    fn test_missing_keys_are_ignored() {
        let graph = diamond();
        let stats = invalidate(&graph, ["nope"], &NoopTracer).unwrap();
        assert_eq!(stats, InvalidationStats::default());
    }
}
