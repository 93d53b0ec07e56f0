use std::fmt;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{ensure_state, ProtocolError};
use crate::{
    BuildingState, DirtyState, GroupedList, GroupedListBuilder, NodeKey, NodeOutcome, NodeValue,
    ReverseDeps, Version,
};

/// What a caller registering itself on a node has to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyState {
    /// The node is done at the given version; the caller can signal itself right away.
    Done(Version),
    /// The caller started this node's evaluation and must schedule it.
    NeedsScheduling,
    /// Someone else is evaluating the node; the caller will be signaled when it is done.
    AlreadyEvaluating,
}

/// Result of committing a finished round.
#[derive(Debug, Clone)]
pub struct Committed<K> {
    /// Dependents that registered during the round, each to be signaled once.
    pub reverse_deps: ahash::HashSet<K>,
    /// Version dependents must be signaled with.
    pub version: Version,
    /// False if the round kept the previous value.
    pub changed: bool,
}

/// Result of marking a done node dirty.
#[derive(Debug, Clone)]
pub struct MarkedDirty<K> {
    /// Dependencies of the last build, in order.
    pub direct_deps: Vec<K>,
    /// Dependents of the node, which have to be marked dirty in turn.
    pub reverse_deps: ahash::HashSet<K>,
}

type Building<K, V> = BuildingState<K, NodeOutcome<K, V>>;

struct Inner<K: fmt::Debug, V> {
    /// Present until the node is done.
    building: Option<Box<Building<K, V>>>,
    /// Value of the last finished round. Moved into `building` while the node is dirty.
    value: Option<NodeOutcome<K, V>>,
    /// Dependencies of the last finished round. Moved into `building` while dirty.
    direct_deps: GroupedList<K>,
    /// Version at which the value last changed.
    version: Version,
    /// Version at which the node was last evaluated or verified.
    last_evaluated_version: Version,
    /// Dependents recorded once the node was done.
    reverse_deps: ReverseDeps<K>,
}

impl<K: NodeKey, V: NodeValue> Inner<K, V> {
    fn in_flight_mut(&mut self, operation: &'static str) -> Result<&mut Building<K, V>, ProtocolError> {
        match self.building.as_deref_mut() {
            Some(building) => Ok(building),
            None => Err(ProtocolError::precondition(
                operation,
                "node is not done",
                &self.value,
            )),
        }
    }

    fn in_flight(&self, operation: &'static str) -> Result<&Building<K, V>, ProtocolError> {
        self.building.as_deref().ok_or_else(|| {
            ProtocolError::precondition(operation, "node is not done", &self.value)
        })
    }

    /// Discard the building state and record its dependencies and dependents.
    ///
    /// Both registries are consolidated before the state is taken apart, so an error
    /// leaves the entry in flight and untouched.
    fn finish(
        &mut self,
        operation: &'static str,
    ) -> Result<(ahash::HashSet<K>, Option<NodeOutcome<K, V>>), ProtocolError> {
        self.in_flight_mut(operation)?.reverse_deps_to_signal()?;
        self.reverse_deps.consolidate()?;
        let building = self.building.take().ok_or_else(|| {
            ProtocolError::precondition(operation, "node is not done", &self.value)
        })?;
        let (direct_deps, reverse_deps, last_value) = building.into_finished()?;
        self.direct_deps = direct_deps;
        self.reverse_deps.add_all(reverse_deps.iter().cloned())?;
        Ok((reverse_deps, last_value))
    }
}

/// NodeEntry is the graph's record of one node.
///
/// It is either done, holding only its value, dependencies and dependents, or in flight,
/// owning a [`BuildingState`]. Every method takes the entry's lock exactly once, so each
/// call is atomic with respect to every other call on the same node, and unrelated nodes
/// never contend.
pub struct NodeEntry<K: fmt::Debug, V> {
    inner: Mutex<Inner<K, V>>,
}

impl<K: NodeKey, V: NodeValue> Default for NodeEntry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: NodeKey, V: NodeValue> NodeEntry<K, V> {
    /// A node that was never built.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                building: Some(Box::new(BuildingState::new())),
                value: None,
                direct_deps: GroupedList::new(),
                version: Version::MINIMAL,
                last_evaluated_version: Version::MINIMAL,
                reverse_deps: ReverseDeps::new(),
            }),
        }
    }

    /// Returns true if the node's value is final for the current evaluation.
    pub fn is_done(&self) -> bool {
        self.inner.lock().building.is_none()
    }

    /// Returns true if the node was built before and is suspected stale.
    pub fn is_dirty(&self) -> bool {
        self.inner
            .lock()
            .building
            .as_ref()
            .is_some_and(|building| building.is_dirty())
    }

    /// Returns true if the node is known to require recomputation.
    pub fn is_changed(&self) -> bool {
        self.inner
            .lock()
            .building
            .as_ref()
            .is_some_and(|building| building.is_changed())
    }

    /// Returns true if some caller claimed the node's current round.
    pub fn is_evaluating(&self) -> bool {
        self.inner
            .lock()
            .building
            .as_ref()
            .is_some_and(|building| building.is_evaluating())
    }

    /// Returns true if every dependency of the current round has signaled.
    pub fn is_ready(&self) -> Result<bool, ProtocolError> {
        Ok(self.inner.lock().in_flight("is_ready")?.is_ready())
    }

    /// Version at which the value last changed.
    pub fn version(&self) -> Version {
        self.inner.lock().version
    }

    /// Version at which the node was last evaluated or verified.
    pub fn last_evaluated_version(&self) -> Version {
        self.inner.lock().last_evaluated_version
    }

    /// The value, if the node is done.
    pub fn value(&self) -> Option<NodeOutcome<K, V>> {
        let inner = self.inner.lock();
        match inner.building {
            Some(_) => None,
            None => inner.value.clone(),
        }
    }

    /// The dependencies of the last finished round, if the node is done.
    pub fn direct_deps(&self) -> Option<GroupedList<K>> {
        let inner = self.inner.lock();
        match inner.building {
            Some(_) => None,
            None => Some(inner.direct_deps.clone()),
        }
    }

    /// Register `reverse_dep` as waiting on this node and report what it has to do.
    ///
    /// `None` registers nobody, which is how the roots of an evaluation are requested. The
    /// first registration on a node that is not done starts its evaluation.
    pub fn add_reverse_dep_and_check_if_done(
        &self,
        reverse_dep: Option<K>,
    ) -> Result<DependencyState, ProtocolError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.building.as_deref_mut() {
            None => {
                if let Some(key) = reverse_dep {
                    inner.reverse_deps.add(key)?;
                }
                Ok(DependencyState::Done(inner.version))
            }
            Some(building) => {
                if let Some(key) = reverse_dep {
                    building.add_reverse_dep_to_signal(key)?;
                }
                Ok(if building.start_evaluating() {
                    DependencyState::NeedsScheduling
                } else {
                    DependencyState::AlreadyEvaluating
                })
            }
        }
    }

    /// Signal that a dependency finished at `child_version`. Returns true for the one
    /// call that made the node ready.
    pub fn signal_dep(&self, child_version: Version) -> Result<bool, ProtocolError> {
        let mut inner = self.inner.lock();
        let child_changed = child_version > inner.last_evaluated_version;
        inner.in_flight_mut("signal_dep")?.signal_dep(child_changed)
    }

    /// See [`BuildingState::dirty_state`].
    pub fn dirty_state(&self) -> Result<DirtyState, ProtocolError> {
        self.inner.lock().in_flight("dirty_state")?.dirty_state()
    }

    /// See [`BuildingState::next_dirty_direct_deps`].
    pub fn next_dirty_direct_deps(&self) -> Result<Vec<K>, ProtocolError> {
        self.inner
            .lock()
            .in_flight_mut("next_dirty_direct_deps")?
            .next_dirty_direct_deps()
    }

    /// Append dependencies requested by the current round.
    ///
    /// Must be called before registering on any of them.
    pub fn add_temporary_direct_deps(
        &self,
        deps: GroupedListBuilder<K>,
    ) -> Result<(), ProtocolError> {
        self.inner
            .lock()
            .in_flight_mut("add_temporary_direct_deps")?
            .add_direct_deps(deps);
        Ok(())
    }

    /// Dependencies requested so far by the current round.
    pub fn temporary_direct_deps(&self) -> Result<ahash::HashSet<K>, ProtocolError> {
        Ok(self
            .inner
            .lock()
            .in_flight("temporary_direct_deps")?
            .direct_deps_for_build())
    }

    /// See [`BuildingState::remove_direct_deps`].
    pub fn remove_unfinished_deps(
        &self,
        unfinished: &ahash::HashSet<K>,
    ) -> Result<(), ProtocolError> {
        self.inner
            .lock()
            .in_flight_mut("remove_unfinished_deps")?
            .remove_direct_deps(unfinished)
    }

    /// See [`BuildingState::force_changed`].
    pub fn force_changed(&self) -> Result<(), ProtocolError> {
        self.inner.lock().in_flight_mut("force_changed")?.force_changed()
    }

    /// Mark the node dirty, or changed if `is_changed`.
    ///
    /// Returns `None` if the node was not done; a dirty node is upgraded to changed if
    /// requested. Otherwise the last value and dependencies move into a fresh dirty
    /// building state and the previous dependencies and current dependents are returned.
    pub fn mark_dirty(&self, is_changed: bool) -> Result<Option<MarkedDirty<K>>, ProtocolError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(building) = inner.building.as_deref_mut() {
            if is_changed && building.is_dirty() && !building.is_changed() {
                building.mark_changed()?;
            }
            return Ok(None);
        }
        let Some(value) = inner.value.as_ref() else {
            return Err(ProtocolError::precondition(
                "mark_dirty",
                "done node has a value",
                &inner.direct_deps,
            ));
        };
        let building = BuildingState::new_dirty(is_changed, inner.direct_deps.clone(), value.clone())?;
        trace!(is_changed, "marked dirty");
        let direct_deps = std::mem::take(&mut inner.direct_deps).iter().cloned().collect();
        inner.value = None;
        inner.building = Some(Box::new(building));
        Ok(Some(MarkedDirty {
            direct_deps,
            reverse_deps: inner.reverse_deps.get()?,
        }))
    }

    /// Commit the current round with `value`, computed at `version`.
    ///
    /// A dirty node whose new value and dependencies match its last build keeps the old
    /// value and version, so its dependents see it as unchanged.
    pub fn set_value(
        &self,
        value: NodeOutcome<K, V>,
        version: Version,
    ) -> Result<Committed<K>, ProtocolError> {
        let mut inner = self.inner.lock();
        let unchanged = inner
            .in_flight("set_value")?
            .unchanged_from_last_build(&value)?;
        let (reverse_deps, last_value) = inner.finish("set_value")?;
        inner.value = match last_value {
            Some(last_value) if unchanged => Some(last_value),
            _ => Some(value),
        };
        inner.last_evaluated_version = version;
        if !unchanged {
            inner.version = version;
        }
        Ok(Committed {
            reverse_deps,
            version: inner.version,
            changed: !unchanged,
        })
    }

    /// Commit a round that verified the last build's value as still valid.
    pub fn mark_clean(&self, version: Version) -> Result<Committed<K>, ProtocolError> {
        let mut inner = self.inner.lock();
        let building = inner.in_flight("mark_clean")?;
        ensure_state!(
            building.dirty_state()? == DirtyState::VerifiedClean,
            "mark_clean",
            building
        );
        ensure_state!(building.last_build_value().is_some(), "mark_clean", building);
        let (reverse_deps, last_value) = inner.finish("mark_clean")?;
        inner.value = last_value;
        inner.last_evaluated_version = version;
        Ok(Committed {
            reverse_deps,
            version: inner.version,
            changed: false,
        })
    }

    /// Dependents of a done node, each exactly once.
    pub fn reverse_deps(&self) -> Result<ahash::HashSet<K>, ProtocolError> {
        self.inner.lock().reverse_deps.get()
    }

    /// Unregister a dependent recorded on the done node.
    pub fn remove_reverse_dep(&self, reverse_dep: K) {
        self.inner.lock().reverse_deps.remove(reverse_dep);
    }

    /// Dependents waiting on the current round, each exactly once.
    pub fn reverse_deps_to_signal(&self) -> Result<ahash::HashSet<K>, ProtocolError> {
        self.inner
            .lock()
            .in_flight_mut("reverse_deps_to_signal")?
            .reverse_deps_to_signal()
    }

    /// Unregister a dependent that registered during the current round.
    pub fn remove_reverse_dep_to_signal(&self, reverse_dep: K) -> Result<(), ProtocolError> {
        self.inner
            .lock()
            .in_flight_mut("remove_reverse_dep_to_signal")?
            .remove_reverse_dep_to_signal(reverse_dep);
        Ok(())
    }
}

impl<K: NodeKey, V: NodeValue> fmt::Debug for NodeEntry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("NodeEntry")
            .field("version", &inner.version)
            .field("last_evaluated_version", &inner.last_evaluated_version)
            .field("value", &inner.value)
            .field("direct_deps", &inner.direct_deps)
            .field("reverse_deps", &inner.reverse_deps)
            .field("building", &inner.building)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    type Entry = NodeEntry<&'static str, i32>;

    fn value(v: i32) -> NodeOutcome<&'static str, i32> {
        NodeOutcome::Value(Arc::new(v))
    }

    /// Build `entry` at `version` with a single group of already-done deps.
    fn build(entry: &Entry, deps: &[&'static str], v: i32, version: Version) -> Committed<&'static str> {
        entry.add_temporary_direct_deps(GroupedListBuilder::from_group(deps.iter().copied())).unwrap();
        for _ in deps {
            entry.signal_dep(version).unwrap();
        }
        entry.set_value(value(v), version).unwrap()
    }

    #[test]
    fn test_first_registration_schedules() {
        let entry = Entry::new();
        assert_eq!(
            entry.add_reverse_dep_and_check_if_done(Some("p")).unwrap(),
            DependencyState::NeedsScheduling
        );
        assert_eq!(
            entry.add_reverse_dep_and_check_if_done(Some("q")).unwrap(),
            DependencyState::AlreadyEvaluating
        );
        assert_eq!(
            entry.add_reverse_dep_and_check_if_done(None).unwrap(),
            DependencyState::AlreadyEvaluating
        );

        let committed = build(&entry, &["a"], 1, Version(1));
        assert!(committed.changed);
        assert_eq!(committed.version, Version(1));
        let mut signaled: Vec<_> = committed.reverse_deps.into_iter().collect();
        signaled.sort();
        assert_eq!(signaled, vec!["p", "q"]);

        assert!(entry.is_done());
        assert_eq!(entry.value(), Some(value(1)));
        assert_eq!(
            entry.add_reverse_dep_and_check_if_done(Some("r")).unwrap(),
            DependencyState::Done(Version(1))
        );
        assert_eq!(entry.reverse_deps().unwrap().len(), 3);
    }

    #[test]
    fn test_set_value_requires_ready() {
        let entry = Entry::new();
        entry.add_reverse_dep_and_check_if_done(None).unwrap();
        entry
            .add_temporary_direct_deps(GroupedListBuilder::from_group(["a"]))
            .unwrap();
        assert!(entry.set_value(value(1), Version(1)).is_err());
        assert!(!entry.is_done());
    }

    #[test]
    fn test_failed_commit_leaves_entry_in_flight() {
        let entry = Entry::new();
        entry.add_reverse_dep_and_check_if_done(Some("p")).unwrap();
        entry.remove_reverse_dep_to_signal("stranger").unwrap();
        assert!(matches!(
            entry.set_value(value(1), Version(1)),
            Err(ProtocolError::UnknownReverseDep { .. })
        ));
        assert!(!entry.is_done());
        assert!(entry.is_evaluating());
        assert!(entry.is_ready().unwrap());
        assert_eq!(entry.value(), None);
    }

    #[test]
    fn test_done_entry_rejects_building_operations() {
        let entry = Entry::new();
        entry.add_reverse_dep_and_check_if_done(None).unwrap();
        build(&entry, &[], 1, Version(1));
        assert!(entry.signal_dep(Version(1)).is_err());
        assert!(entry.dirty_state().is_err());
        assert!(entry.set_value(value(2), Version(2)).is_err());
    }

    #[test]
    fn test_unchanged_rebuild_keeps_version() {
        let entry = Entry::new();
        entry.add_reverse_dep_and_check_if_done(None).unwrap();
        build(&entry, &["a"], 5, Version(1));

        let dirty = entry.mark_dirty(true).unwrap().unwrap();
        assert_eq!(dirty.direct_deps, vec!["a"]);
        assert!(entry.is_changed());
        entry.add_reverse_dep_and_check_if_done(Some("p")).unwrap();
        assert_eq!(entry.dirty_state().unwrap(), DirtyState::Rebuilding);

        let committed = build(&entry, &["a"], 5, Version(3));
        assert!(!committed.changed);
        assert_eq!(committed.version, Version(1));
        assert_eq!(entry.version(), Version(1));
        assert_eq!(entry.last_evaluated_version(), Version(3));
    }

    #[test]
    fn test_changed_rebuild_bumps_version() {
        let entry = Entry::new();
        entry.add_reverse_dep_and_check_if_done(None).unwrap();
        build(&entry, &["a"], 5, Version(1));
        entry.mark_dirty(true).unwrap();
        entry.add_reverse_dep_and_check_if_done(None).unwrap();
        let committed = build(&entry, &["a", "b"], 5, Version(2));
        assert!(committed.changed);
        assert_eq!(entry.version(), Version(2));
        assert_eq!(
            entry.direct_deps(),
            Some([vec!["a", "b"]].into_iter().collect())
        );
    }

    #[test]
    fn test_dirty_check_and_mark_clean() {
        let entry = Entry::new();
        entry.add_reverse_dep_and_check_if_done(None).unwrap();
        build(&entry, &["a"], 5, Version(1));
        assert!(entry.mark_dirty(false).unwrap().is_some());
        assert!(entry.is_dirty());
        assert!(!entry.is_changed());
        assert!(entry.mark_clean(Version(2)).is_err());

        entry.add_reverse_dep_and_check_if_done(Some("p")).unwrap();
        let group = entry.next_dirty_direct_deps().unwrap();
        entry
            .add_temporary_direct_deps(GroupedListBuilder::from_group(group))
            .unwrap();
        // The dependency is older than this node's last evaluation.
        assert!(entry.signal_dep(Version(1)).unwrap());
        assert_eq!(entry.dirty_state().unwrap(), DirtyState::VerifiedClean);

        let committed = entry.mark_clean(Version(2)).unwrap();
        assert!(!committed.changed);
        assert_eq!(committed.version, Version(1));
        assert_eq!(entry.value(), Some(value(5)));
        assert_eq!(entry.last_evaluated_version(), Version(2));
    }

    #[test]
    fn test_newer_dependency_means_changed() {
        let entry = Entry::new();
        entry.add_reverse_dep_and_check_if_done(None).unwrap();
        build(&entry, &["a"], 5, Version(1));
        entry.mark_dirty(false).unwrap();
        entry.add_reverse_dep_and_check_if_done(None).unwrap();
        let group = entry.next_dirty_direct_deps().unwrap();
        entry
            .add_temporary_direct_deps(GroupedListBuilder::from_group(group))
            .unwrap();
        assert!(entry.signal_dep(Version(2)).unwrap());
        assert_eq!(entry.dirty_state().unwrap(), DirtyState::Rebuilding);
    }

    #[test]
    fn test_mark_dirty_twice() {
        let entry = Entry::new();
        entry.add_reverse_dep_and_check_if_done(None).unwrap();
        build(&entry, &["a"], 5, Version(1));
        assert!(entry.mark_dirty(false).unwrap().is_some());
        assert!(entry.mark_dirty(false).unwrap().is_none());
        assert!(!entry.is_changed());
        assert!(entry.mark_dirty(true).unwrap().is_none());
        assert!(entry.is_changed());
    }

    #[test]
    fn test_mark_dirty_without_deps_must_be_changed() {
        let entry = Entry::new();
        entry.add_reverse_dep_and_check_if_done(None).unwrap();
        build(&entry, &[], 5, Version(1));
        assert!(entry.mark_dirty(false).is_err());
        // The failed attempt leaves the node done.
        assert!(entry.is_done());
        assert!(entry.mark_dirty(true).unwrap().is_some());
    }

    #[test]
    fn test_reverse_dep_removal() {
        let entry = Entry::new();
        entry.add_reverse_dep_and_check_if_done(Some("x")).unwrap();
        entry.add_reverse_dep_and_check_if_done(Some("y")).unwrap();
        entry.remove_reverse_dep_to_signal("y").unwrap();
        let committed = build(&entry, &[], 1, Version(1));
        assert_eq!(committed.reverse_deps.into_iter().collect::<Vec<_>>(), vec!["x"]);

        entry.remove_reverse_dep("x");
        assert!(entry.reverse_deps().unwrap().is_empty());
    }
}
