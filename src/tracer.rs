//! Tracer trait for observing evaluations.
//!
//! This module defines the [`Tracer`] trait and the types it reports. The default
//! [`NoopTracer`] discards every event and compiles away.
//!
//! # Example
//!
//! ```
//! use skein::{NodeDone, Tracer};
//!
//! struct PrintTracer;
//!
//! impl Tracer<String> for PrintTracer {
//!     fn on_node_done(&self, key: &String, result: &NodeDone) {
//!         println!("{key}: {result:?}");
//!     }
//! }
//! ```

use crate::DirtyState;

/// How a node's round ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeDone {
    /// The node computed a new value.
    Changed,
    /// The node was recomputed and produced the value and dependencies it had before.
    Unchanged,
    /// Every dependency was unchanged, so the node kept its value without running.
    VerifiedClean,
    /// The node's computation failed, or it inherited a dependency's failure.
    Failed {
        /// Rendered failure.
        message: String,
    },
}

/// Why a node was marked dirty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidationReason {
    /// The node was reported as changed.
    Changed,
    /// A dependency of the node was marked dirty.
    DependencyInvalidated,
}

/// Tracer trait for observing evaluations.
///
/// All methods have default empty implementations, so only the events of interest need
/// to be overridden. Implementations must be `Send + Sync`, as every worker thread
/// reports to the same tracer.
pub trait Tracer<K>: Send + Sync + 'static {
    /// Called each time a worker picks up a node.
    #[inline]
    fn on_evaluate(&self, _key: &K) {}

    /// Called when a dirty node's re-verification state is consulted.
    #[inline]
    fn on_dirty_check(&self, _key: &K, _state: DirtyState) {}

    /// Called when a node function stopped early to wait for dependencies; `requested`
    /// counts the dependencies it newly asked for in that call.
    #[inline]
    fn on_restart(&self, _key: &K, _requested: usize) {}

    /// Called when a node's round is committed.
    #[inline]
    fn on_node_done(&self, _key: &K, _result: &NodeDone) {}

    /// Called when a node is marked dirty.
    #[inline]
    fn on_invalidate(&self, _key: &K, _reason: InvalidationReason) {}
}

/// Tracer that discards all events.
///
/// This is the default tracer of [`EvaluatorBuilder`](crate::EvaluatorBuilder).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl<K> Tracer<K> for NoopTracer {}

impl<K, T: Tracer<K>> Tracer<K> for std::sync::Arc<T> {
    fn on_evaluate(&self, key: &K) {
        (**self).on_evaluate(key)
    }

    fn on_dirty_check(&self, key: &K, state: DirtyState) {
        (**self).on_dirty_check(key, state)
    }

    fn on_restart(&self, key: &K, requested: usize) {
        (**self).on_restart(key, requested)
    }

    fn on_node_done(&self, key: &K, result: &NodeDone) {
        (**self).on_node_done(key, result)
    }

    fn on_invalidate(&self, key: &K, reason: InvalidationReason) {
        (**self).on_invalidate(key, reason)
    }
}
