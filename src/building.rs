//! Transient state of a node that is not done.
//!
//! A [`BuildingState`] exists from the moment a node is created or invalidated until the
//! moment its round is committed, at which point it is discarded. It is never shared on
//! its own: a [`NodeEntry`](crate::NodeEntry) owns it behind the entry's lock, which is
//! what makes [`BuildingState::signal_dep`] atomic with respect to concurrent callers.
//!
//! During its life a node goes through these states:
//!
//! 1. just created (`evaluating` is false)
//! 2. evaluating (`evaluating` is true)
//! 3. done (the building state is gone)
//! 4. just created again, when a done node is marked dirty
//! 5. evaluating
//! 6. done
//!
//! A node is put into the evaluating state as soon as it is scheduled, so even a dirty
//! node that turns out to be clean is "evaluating" until it is done.

use std::fmt;
use std::hash::Hash;

use tracing::trace;

use crate::error::{ensure_state, ProtocolError};
use crate::{GroupedList, GroupedListBuilder, ReverseDeps};

/// Progress of re-verifying a node that was built before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirtyState {
    /// The dependencies from the last build have to be checked, one group at a time, via
    /// [`BuildingState::next_dirty_direct_deps`].
    CheckDependencies,
    /// Every dependency from the last build is unchanged and the node was not itself
    /// changed, so the last value still stands.
    VerifiedClean,
    /// The node must be recomputed, because it was changed or a dependency was.
    Rebuilding,
}

/// BuildingState drives one evaluation or re-verification round of a node.
pub struct BuildingState<K, V> {
    /// Set by the single caller that claims this round.
    evaluating: bool,
    /// `None` for a node that was never built.
    dirty_state: Option<DirtyState>,
    /// Number of entries of `direct_deps` that reported completion.
    ///
    /// Only ever compared with `direct_deps.len()` by the call that incremented it, so the
    /// node is found ready exactly once. New deps are appended to `direct_deps` before this
    /// node registers with them, which keeps the counter short of the length while the
    /// registering thread is still working on the node.
    signaled_deps: usize,
    /// Dependencies requested this round, with their batching.
    direct_deps: GroupedList<K>,
    /// Dependents that registered before this node finished.
    reverse_deps_to_signal: ReverseDeps<K>,
    /// Snapshot of the last successful build; `None` for a node never built.
    last_build: Option<LastBuild<K, V>>,
    /// Index of the next group of `last_build.direct_deps` to check, `None` once the last
    /// group was handed out.
    dirty_dep_cursor: Option<usize>,
}

struct LastBuild<K, V> {
    direct_deps: GroupedList<K>,
    value: V,
}

impl<K, V> Default for BuildingState<K, V> {
    fn default() -> Self {
        Self {
            evaluating: false,
            dirty_state: None,
            signaled_deps: 0,
            direct_deps: GroupedList::new(),
            reverse_deps_to_signal: ReverseDeps::default(),
            last_build: None,
            dirty_dep_cursor: None,
        }
    }
}

impl<K, V> BuildingState<K, V>
where
    K: Clone + Eq + Hash + fmt::Debug,
    V: PartialEq + fmt::Debug,
{
    /// State for a node that was never built.
    pub fn new() -> Self {
        Default::default()
    }

    /// State for a node that was built before and is now suspected stale.
    ///
    /// A node that is dirty but not changed must have dependencies from its last build,
    /// otherwise nothing could have dirtied it.
    pub fn new_dirty(
        is_changed: bool,
        last_build_direct_deps: GroupedList<K>,
        last_build_value: V,
    ) -> Result<Self, ProtocolError> {
        let (dirty_state, dirty_dep_cursor) = if is_changed {
            (DirtyState::Rebuilding, None)
        } else {
            (DirtyState::CheckDependencies, Some(0))
        };
        let state = Self {
            dirty_state: Some(dirty_state),
            dirty_dep_cursor,
            last_build: Some(LastBuild {
                direct_deps: last_build_direct_deps,
                value: last_build_value,
            }),
            ..Default::default()
        };
        ensure_state!(is_changed || !state.no_deps_last_build(), "new_dirty", &state);
        Ok(state)
    }

    /// Force a dirty node to rebuild before its evaluation starts.
    pub fn mark_changed(&mut self) -> Result<(), ProtocolError> {
        ensure_state!(self.is_dirty(), "mark_changed", self);
        ensure_state!(!self.is_changed(), "mark_changed", self);
        ensure_state!(!self.evaluating, "mark_changed", self);
        self.set_rebuilding();
        Ok(())
    }

    /// Force a dirty node that is being evaluated, and has no outstanding dependencies,
    /// to rebuild.
    pub fn force_changed(&mut self) -> Result<(), ProtocolError> {
        ensure_state!(self.is_dirty(), "force_changed", self);
        ensure_state!(!self.is_changed(), "force_changed", self);
        ensure_state!(self.evaluating, "force_changed", self);
        ensure_state!(self.is_ready(), "force_changed", self);
        self.set_rebuilding();
        Ok(())
    }

    fn set_rebuilding(&mut self) {
        self.dirty_state = Some(DirtyState::Rebuilding);
        self.dirty_dep_cursor = None;
    }

    /// Returns true if every dependency known so far has signaled.
    pub fn is_ready(&self) -> bool {
        self.signaled_deps == self.direct_deps.len()
    }

    /// Returns true if the node was built before and is suspected stale.
    pub fn is_dirty(&self) -> bool {
        self.dirty_state.is_some()
    }

    /// Returns true if the node is known to require recomputation.
    pub fn is_changed(&self) -> bool {
        self.dirty_state == Some(DirtyState::Rebuilding)
    }

    /// Returns true once some caller claimed this round.
    pub fn is_evaluating(&self) -> bool {
        self.evaluating
    }

    /// Claim this round.
    ///
    /// Returns true only for the call that started the evaluation. That caller must drive
    /// the node; every other caller must leave it alone.
    pub fn start_evaluating(&mut self) -> bool {
        let started = !self.evaluating;
        self.evaluating = true;
        started
    }

    /// Count one more dependency as done and return whether the node is now ready.
    ///
    /// For a dirty node that is still checking its dependencies, a changed child moves it
    /// to [`DirtyState::Rebuilding`]. An unchanged child that completes the last group
    /// moves it to [`DirtyState::VerifiedClean`].
    pub fn signal_dep(&mut self, child_changed: bool) -> Result<bool, ProtocolError> {
        ensure_state!(
            self.signaled_deps < self.direct_deps.len(),
            "signal_dep",
            self
        );
        self.signaled_deps += 1;
        let dirty_state = self.dirty_state;
        match dirty_state {
            Some(DirtyState::CheckDependencies | DirtyState::VerifiedClean) if child_changed => {
                trace!("dependency changed, rebuilding");
                self.set_rebuilding();
            }
            Some(DirtyState::CheckDependencies)
                if self.is_ready() && self.dirty_dep_cursor.is_none() =>
            {
                trace!("all dependencies unchanged, verified clean");
                self.dirty_state = Some(DirtyState::VerifiedClean);
            }
            _ => {}
        }
        Ok(self.is_ready())
    }

    /// Checks that the round has finished as far as this state can tell.
    pub(crate) fn ensure_finished(&self, operation: &'static str) -> Result<(), ProtocolError> {
        ensure_state!(self.evaluating, operation, self);
        ensure_state!(
            !matches!(self.dirty_state, Some(DirtyState::CheckDependencies)),
            operation,
            self
        );
        ensure_state!(self.is_ready(), operation, self);
        Ok(())
    }

    /// Returns true if `new_value` equals the last build's value and the dependencies
    /// requested this round are exactly those of the last build, in the same groups and
    /// the same order.
    ///
    /// A node that was never built is never unchanged.
    pub fn unchanged_from_last_build(&self, new_value: &V) -> Result<bool, ProtocolError> {
        self.ensure_finished("unchanged_from_last_build")?;
        Ok(self.last_build.as_ref().is_some_and(|last| {
            last.value == *new_value && last.direct_deps == self.direct_deps
        }))
    }

    /// Returns true if the node had no dependencies on its last build.
    pub fn no_deps_last_build(&self) -> bool {
        self.last_build
            .as_ref()
            .map_or(true, |last| last.direct_deps.is_empty())
    }

    /// The value of the last build, if the node was built before.
    pub fn last_build_value(&self) -> Option<&V> {
        self.last_build.as_ref().map(|last| &last.value)
    }

    /// Current progress of re-verification.
    ///
    /// Must be asked each time evaluation of a dirty node resumes, to pick the next step.
    pub fn dirty_state(&self) -> Result<DirtyState, ProtocolError> {
        ensure_state!(self.evaluating, "dirty_state", self);
        match self.dirty_state {
            Some(state) => Ok(state),
            None => Err(ProtocolError::precondition(
                "dirty_state",
                "self.is_dirty()",
                self,
            )),
        }
    }

    /// Hand out the next group of last-build dependencies to check.
    ///
    /// Handing out the final group clears the cursor, so the signal completing that group
    /// can mark the node verified clean.
    pub fn next_dirty_direct_deps(&mut self) -> Result<Vec<K>, ProtocolError> {
        ensure_state!(self.evaluating, "next_dirty_direct_deps", self);
        ensure_state!(
            self.dirty_state == Some(DirtyState::CheckDependencies),
            "next_dirty_direct_deps",
            self
        );
        let (Some(cursor), Some(last)) = (self.dirty_dep_cursor, self.last_build.as_ref()) else {
            return Err(ProtocolError::precondition(
                "next_dirty_direct_deps",
                "self.dirty_dep_cursor.is_some()",
                self,
            ));
        };
        let group = last.direct_deps.group(cursor).map(<[K]>::to_vec);
        let num_groups = last.direct_deps.num_groups();
        let Some(group) = group else {
            return Err(ProtocolError::precondition(
                "next_dirty_direct_deps",
                "cursor < num_groups",
                self,
            ));
        };
        self.dirty_dep_cursor = (cursor + 1 < num_groups).then_some(cursor + 1);
        Ok(group)
    }

    /// Append a batch of dependencies requested this round.
    pub fn add_direct_deps(&mut self, deps: GroupedListBuilder<K>) {
        self.direct_deps.append(deps);
    }

    /// The dependencies requested so far this round.
    pub fn direct_deps(&self) -> &GroupedList<K> {
        &self.direct_deps
    }

    /// The dependencies requested so far this round, as a set.
    pub fn direct_deps_for_build(&self) -> ahash::HashSet<K> {
        self.direct_deps.to_set()
    }

    /// Drop dependencies that never completed, such as those of an aborted evaluation.
    ///
    /// Only dependencies that have not signaled may be removed.
    pub fn remove_direct_deps(
        &mut self,
        unfinished: &ahash::HashSet<K>,
    ) -> Result<(), ProtocolError> {
        let removed = self
            .direct_deps
            .iter()
            .filter(|key| unfinished.contains(*key))
            .count();
        ensure_state!(
            self.signaled_deps + removed <= self.direct_deps.len(),
            "remove_direct_deps",
            self
        );
        self.direct_deps.remove(unfinished);
        Ok(())
    }

    /// Register a dependent to signal when this node is done.
    pub fn add_reverse_dep_to_signal(&mut self, key: K) -> Result<(), ProtocolError> {
        self.reverse_deps_to_signal.add(key)
    }

    /// Unregister a dependent added with [`Self::add_reverse_dep_to_signal`].
    pub fn remove_reverse_dep_to_signal(&mut self, key: K) {
        self.reverse_deps_to_signal.remove(key);
    }

    /// The dependents to signal, each exactly once.
    pub fn reverse_deps_to_signal(&mut self) -> Result<ahash::HashSet<K>, ProtocolError> {
        self.reverse_deps_to_signal.get()
    }

    /// Take the finished round apart into its dependencies, its dependents to signal and
    /// the last build's value.
    pub(crate) fn into_finished(
        mut self,
    ) -> Result<(GroupedList<K>, ahash::HashSet<K>, Option<V>), ProtocolError> {
        let reverse_deps = self.reverse_deps_to_signal.get()?;
        Ok((
            self.direct_deps,
            reverse_deps,
            self.last_build.map(|last| last.value),
        ))
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for BuildingState<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildingState")
            .field("evaluating", &self.evaluating)
            .field("dirty_state", &self.dirty_state)
            .field("signaled_deps", &self.signaled_deps)
            .field("direct_deps", &self.direct_deps)
            .field("reverse_deps_to_signal", &self.reverse_deps_to_signal)
            .field(
                "last_build_direct_deps",
                &self.last_build.as_ref().map(|last| &last.direct_deps),
            )
            .field(
                "last_build_value",
                &self.last_build.as_ref().map(|last| &last.value),
            )
            .field("dirty_dep_cursor", &self.dirty_dep_cursor)
            .finish()
    }
}
