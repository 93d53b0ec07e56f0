use std::fmt::Debug;
use std::hash::Hash;

/// NodeKey identifies a node in the graph.
///
/// This is automatically implemented for every type that is cheap enough to
/// clone, hashable, totally ordered and shareable across worker threads.
pub trait NodeKey: Clone + Eq + Hash + Ord + Debug + Send + Sync + 'static {}

impl<T> NodeKey for T where T: Clone + Eq + Hash + Ord + Debug + Send + Sync + 'static {}

/// NodeValue is the memoized result of a node's computation.
///
/// Equality is used to detect a node that was recomputed but is logically unchanged.
pub trait NodeValue: PartialEq + Debug + Send + Sync + 'static {}

impl<T> NodeValue for T where T: PartialEq + Debug + Send + Sync + 'static {}

/// Version is a monotonically increasing graph-wide number, bumped once per evaluation.
///
/// A node remembers the version at which its value last changed; dependents compare it
/// with the version at which they were last evaluated to learn whether the child changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Version(pub u64);

impl Version {
    /// The version of a node that has never been evaluated.
    pub const MINIMAL: Version = Version(0);

    /// Returns the version following this one.
    #[must_use]
    pub fn next(self) -> Self {
        Version(self.0 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering() {
        let v = Version::MINIMAL;
        assert!(v.next() > v);
        assert_eq!(v.next().next(), Version(2));
    }
}
