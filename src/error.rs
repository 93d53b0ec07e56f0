//! Error types for the node-state protocol and for whole evaluations.

/// A caller broke the node-state protocol.
///
/// These indicate a bug in whatever drives the state machine. They are never
/// retried; the running build is aborted and the error surfaced as is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// A precondition of a state-machine operation did not hold.
    #[error("`{operation}` requires {condition}; state: {state}")]
    Precondition {
        /// The operation that was called.
        operation: &'static str,
        /// The condition that did not hold.
        condition: &'static str,
        /// Debug rendering of the state at the time of the call.
        state: String,
    },

    /// A dependent was removed from a reverse-dependency registry it was never added to.
    #[error("reverse dependency {key} was removed but never registered")]
    UnknownReverseDep {
        /// Debug rendering of the dependent.
        key: String,
    },

    /// An operation referred to a node that is not in the graph.
    #[error("node {key} is not present in the graph")]
    MissingNode {
        /// Debug rendering of the key.
        key: String,
    },
}

impl ProtocolError {
    pub(crate) fn precondition(
        operation: &'static str,
        condition: &'static str,
        state: &impl std::fmt::Debug,
    ) -> Self {
        ProtocolError::Precondition {
            operation,
            condition,
            state: format!("{state:?}"),
        }
    }
}

/// Returns `Err(ProtocolError::Precondition)` unless `$cond` holds.
macro_rules! ensure_state {
    ($cond:expr, $operation:expr, $state:expr) => {
        if !$cond {
            return Err($crate::error::ProtocolError::precondition(
                $operation,
                stringify!($cond),
                $state,
            ));
        }
    };
}

pub(crate) use ensure_state;

/// Errors that end an evaluation without a result.
///
/// Failures of individual node functions are not reported here; they are recorded as
/// [`NodeOutcome::Error`](crate::NodeOutcome::Error) on the failing node.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// The evaluator misused the node-state protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The evaluation was interrupted before the requested nodes finished.
    #[error("evaluation interrupted")]
    Interrupted,

    /// The worker pool could not be started.
    #[error("failed to start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// Requested nodes never became ready, which happens when they depend on themselves.
    #[error("evaluation finished with incomplete nodes: {}", keys.join(", "))]
    Incomplete {
        /// Debug renderings of the requested keys that did not finish.
        keys: Vec<String>,
    },
}
