use std::fmt::Debug;
use std::sync::Arc;

/// ErrorInfo records a failed node computation.
///
/// Equality compares the root causes and the rendered message, so a node that fails the
/// same way twice counts as unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ErrorInfo<K: Debug> {
    root_causes: Vec<K>,
    message: Arc<str>,
}

impl<K> ErrorInfo<K>
where
    K: Clone + Ord + Debug + Send + Sync + 'static,
{
    /// Record the failure of `key`'s own computation.
    ///
    /// If the failure is a dependency's `ErrorInfo` propagated with `?`, its root causes are
    /// kept instead of blaming `key`.
    pub fn from_failure(key: &K, error: anyhow::Error) -> Self {
        if let Some(child) = error.downcast_ref::<ErrorInfo<K>>() {
            return child.clone();
        }
        Self {
            root_causes: vec![key.clone()],
            message: format!("{error:#}").into(),
        }
    }

    /// Record a failure inherited from dependencies, merging their root causes.
    pub fn from_children<'a>(children: impl IntoIterator<Item = &'a ErrorInfo<K>>) -> Self {
        let mut root_causes = Vec::new();
        let mut messages: Vec<&str> = Vec::new();
        for child in children {
            root_causes.extend(child.root_causes.iter().cloned());
            if !messages.contains(&&*child.message) {
                messages.push(&child.message);
            }
        }
        root_causes.sort();
        root_causes.dedup();
        Self {
            root_causes,
            message: messages.join("; ").into(),
        }
    }

    /// The nodes whose own computation failed.
    pub fn root_causes(&self) -> &[K] {
        &self.root_causes
    }

    /// The rendered failure message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// NodeOutcome is what a finished node holds: a value, or the failure that replaced it.
#[derive(Debug, PartialEq)]
pub enum NodeOutcome<K: Debug, V> {
    /// The computation produced a value.
    Value(Arc<V>),
    /// The computation failed.
    Error(ErrorInfo<K>),
}

// Not derived: values are shared behind `Arc` and need not be `Clone` themselves.
impl<K: Debug + Clone, V> Clone for NodeOutcome<K, V> {
    fn clone(&self) -> Self {
        match self {
            NodeOutcome::Value(value) => NodeOutcome::Value(value.clone()),
            NodeOutcome::Error(error) => NodeOutcome::Error(error.clone()),
        }
    }
}

impl<K: Debug, V> NodeOutcome<K, V> {
    /// Returns the value, if any.
    pub fn value(&self) -> Option<&Arc<V>> {
        match self {
            NodeOutcome::Value(value) => Some(value),
            NodeOutcome::Error(_) => None,
        }
    }

    /// Returns the failure, if any.
    pub fn error(&self) -> Option<&ErrorInfo<K>> {
        match self {
            NodeOutcome::Value(_) => None,
            NodeOutcome::Error(error) => Some(error),
        }
    }

    /// Convert into a `Result`.
    pub fn into_result(self) -> Result<Arc<V>, ErrorInfo<K>> {
        match self {
            NodeOutcome::Value(value) => Ok(value),
            NodeOutcome::Error(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_failure_blames_key() {
        let info = ErrorInfo::from_failure(&"a", anyhow::anyhow!("boom").context("reading a"));
        assert_eq!(info.root_causes(), &["a"]);
        assert_eq!(info.message(), "reading a: boom");
    }

    #[test]
    fn test_from_failure_keeps_propagated_root_causes() {
        let child = ErrorInfo::from_failure(&"leaf", anyhow::anyhow!("missing file"));
        let propagated = ErrorInfo::from_failure(&"parent", anyhow::Error::new(child.clone()));
        assert_eq!(propagated, child);
    }

    #[test]
    fn test_from_children_merges() {
        let a = ErrorInfo::from_failure(&"b", anyhow::anyhow!("one"));
        let b = ErrorInfo::from_failure(&"a", anyhow::anyhow!("two"));
        let merged = ErrorInfo::from_children([&a, &b, &a]);
        assert_eq!(merged.root_causes(), &["a", "b"]);
        assert_eq!(merged.message(), "one; two");
    }

    #[test]
    fn test_outcome_equality() {
        let one: NodeOutcome<&str, i32> = NodeOutcome::Value(Arc::new(1));
        assert_eq!(one, NodeOutcome::Value(Arc::new(1)));
        assert_ne!(one, NodeOutcome::Value(Arc::new(2)));
        let failed = NodeOutcome::<&str, i32>::Error(ErrorInfo::from_failure(
            &"a",
            anyhow::anyhow!("x"),
        ));
        assert_ne!(one, failed);
        assert!(failed.value().is_none());
        assert_eq!(one.into_result().ok().as_deref(), Some(&1));
    }
}
