//! Evaluation of requested nodes over a worker pool.
//!
//! A [`MemoizingEvaluator`] owns the graph across builds. Each call to
//! [`MemoizingEvaluator::evaluate`] applies pending invalidations, bumps the graph version
//! and runs one build in which every node that is not done is driven through the
//! node-state protocol:
//!
//! - a dirty node checks its previous dependencies one group at a time, and is either
//!   verified clean or rebuilt;
//! - a node being built runs its [`NodeFunction`], which may stop early while its
//!   dependencies are built and is then run again from the start;
//! - a finished node signals every dependent that registered on it, and the single
//!   signal that makes a dependent ready schedules it.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{ensure_state, EvalError, ProtocolError};
use crate::{
    invalidate, Committed, DependencyState, DirtyState, Environment, ErrorInfo, GroupedListBuilder,
    InMemoryGraph, NodeDone, NodeEntry, NodeKey, NodeOutcome, NodeValue, NoopTracer, Tracer,
    Version,
};

/// NodeFunction computes the value of a node from its key and its dependencies.
///
/// Returning `Ok(None)` means some dependency requested through the [`Environment`] is
/// not done yet; the function is called again from the start once it is. Returning
/// `Ok(None)` while nothing is missing, or `Ok(Some(_))` while something is, breaks the
/// protocol and aborts the evaluation.
///
/// Closures with the matching signature implement this trait.
pub trait NodeFunction<K: NodeKey, V: NodeValue>: Send + Sync {
    /// Compute the value of `key`.
    fn compute(&self, key: &K, env: &mut Environment<'_, K, V>) -> anyhow::Result<Option<V>>;
}

impl<K, V, F> NodeFunction<K, V> for F
where
    K: NodeKey,
    V: NodeValue,
    F: Fn(&K, &mut Environment<'_, K, V>) -> anyhow::Result<Option<V>> + Send + Sync,
{
    fn compute(&self, key: &K, env: &mut Environment<'_, K, V>) -> anyhow::Result<Option<V>> {
        self(key, env)
    }
}

/// Interrupt is a shared flag that stops a running evaluation.
///
/// This is cheap to clone; every clone controls the same flag. Once set, the flag stays
/// set until [`Interrupt::clear`] is called, and every evaluation started meanwhile
/// stops immediately.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    /// Create a flag that is not set.
    pub fn new() -> Self {
        Default::default()
    }

    /// Ask running evaluations to stop.
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Allow evaluations to run again.
    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Returns true if the flag is set.
    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Builder for [`MemoizingEvaluator`].
///
/// # Example
///
/// ```
/// use skein::{Environment, EvaluatorBuilder};
///
/// fn length(key: &String, _env: &mut Environment<'_, String, usize>) -> anyhow::Result<Option<usize>> {
///     Ok(Some(key.len()))
/// }
///
/// let mut evaluator = EvaluatorBuilder::new().threads(2).build(length).unwrap();
/// let result = evaluator.evaluate(["hello".to_string()]).unwrap();
/// assert_eq!(result.get(&"hello".to_string()).map(|v| **v), Some(5));
/// ```
pub struct EvaluatorBuilder<T = NoopTracer> {
    threads: usize,
    keep_going: bool,
    tracer: T,
    interrupt: Interrupt,
}

impl Default for EvaluatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EvaluatorBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            threads: 0,
            keep_going: false,
            tracer: NoopTracer,
            interrupt: Interrupt::new(),
        }
    }
}

impl<T> EvaluatorBuilder<T> {
    /// Set the number of worker threads. Zero, the default, uses one per CPU.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Keep building after a node fails.
    ///
    /// With `false`, the default, the first failure stops the evaluation and is reported
    /// on every requested node that was waiting on it. With `true`, dependents of a failed
    /// node still run and see the failure through their [`Environment`].
    pub fn keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    /// Use `interrupt` to stop evaluations from another thread.
    pub fn interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Report evaluation events to `tracer`.
    pub fn tracer<U>(self, tracer: U) -> EvaluatorBuilder<U> {
        EvaluatorBuilder {
            threads: self.threads,
            keep_going: self.keep_going,
            tracer,
            interrupt: self.interrupt,
        }
    }

    /// Build the evaluator, starting its worker pool.
    pub fn build<K, V, F>(self, function: F) -> Result<MemoizingEvaluator<K, V, F, T>, EvalError>
    where
        K: NodeKey,
        V: NodeValue,
        F: NodeFunction<K, V>,
        T: Tracer<K>,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(|index| format!("skein-worker-{index}"))
            .build()?;
        Ok(MemoizingEvaluator {
            graph: InMemoryGraph::new(),
            function,
            tracer: self.tracer,
            pool,
            keep_going: self.keep_going,
            interrupt: self.interrupt,
            version: Version::MINIMAL,
            pending_invalidations: Vec::new(),
        })
    }
}

/// MemoizingEvaluator keeps a graph of node values up to date across evaluations.
pub struct MemoizingEvaluator<K, V, F, T = NoopTracer>
where
    K: Debug,
{
    graph: InMemoryGraph<K, V>,
    function: F,
    tracer: T,
    pool: rayon::ThreadPool,
    keep_going: bool,
    interrupt: Interrupt,
    version: Version,
    pending_invalidations: Vec<K>,
}

impl<K, V, F, T> MemoizingEvaluator<K, V, F, T>
where
    K: NodeKey,
    V: NodeValue,
    F: NodeFunction<K, V>,
    T: Tracer<K>,
{
    /// The graph of every node built so far.
    pub fn graph(&self) -> &InMemoryGraph<K, V> {
        &self.graph
    }

    /// Version of the last evaluation.
    pub fn version(&self) -> Version {
        self.version
    }

    /// A handle on the flag that interrupts this evaluator.
    pub fn interrupt_handle(&self) -> Interrupt {
        self.interrupt.clone()
    }

    /// Record that `keys` changed. Takes effect at the start of the next evaluation.
    pub fn invalidate(&mut self, keys: impl IntoIterator<Item = K>) {
        self.pending_invalidations.extend(keys);
    }

    /// Bring `roots` up to date and return their outcomes.
    pub fn evaluate(
        &mut self,
        roots: impl IntoIterator<Item = K>,
    ) -> Result<EvaluationResult<K, V>, EvalError> {
        let pending = std::mem::take(&mut self.pending_invalidations);
        if !pending.is_empty() {
            invalidate(&self.graph, pending, &self.tracer)?;
        }
        self.version = self.version.next();

        let mut roots: Vec<K> = roots.into_iter().collect();
        roots.sort();
        roots.dedup();
        debug!(version = self.version.0, roots = roots.len(), "starting evaluation");

        let evaluator = ParallelEvaluator {
            graph: &self.graph,
            function: &self.function,
            tracer: &self.tracer,
            interrupt: &self.interrupt,
            version: self.version,
            keep_going: self.keep_going,
            stopping: AtomicBool::new(false),
            first_failure: Mutex::new(None),
            protocol_error: Mutex::new(None),
        };
        evaluator.run(&self.pool, &roots)
    }
}

/// Outcomes of the requested nodes of one evaluation.
///
/// When an evaluation stops at the first failure, requested nodes that were not waiting
/// on the failed node may be missing from both values and errors.
#[derive(Debug)]
pub struct EvaluationResult<K: Debug, V> {
    values: ahash::HashMap<K, Arc<V>>,
    errors: ahash::HashMap<K, ErrorInfo<K>>,
}

impl<K: Debug, V> Default for EvaluationResult<K, V> {
    fn default() -> Self {
        Self {
            values: Default::default(),
            errors: Default::default(),
        }
    }
}

impl<K: NodeKey, V: NodeValue> EvaluationResult<K, V> {
    /// The value of a requested node.
    pub fn get(&self, key: &K) -> Option<&Arc<V>> {
        self.values.get(key)
    }

    /// The failure of a requested node.
    pub fn error(&self, key: &K) -> Option<&ErrorInfo<K>> {
        self.errors.get(key)
    }

    /// Returns true if any requested node failed.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Iterate over the requested nodes that have a value.
    pub fn values(&self) -> impl Iterator<Item = (&K, &Arc<V>)> + '_ {
        self.values.iter()
    }

    /// Iterate over the requested nodes that failed.
    pub fn errors(&self) -> impl Iterator<Item = (&K, &ErrorInfo<K>)> + '_ {
        self.errors.iter()
    }
}

fn missing_node(key: &impl Debug) -> ProtocolError {
    ProtocolError::MissingNode {
        key: format!("{key:?}"),
    }
}

/// One build over a worker pool, at a fixed graph version.
struct ParallelEvaluator<'a, K: Debug, V, F, T> {
    graph: &'a InMemoryGraph<K, V>,
    function: &'a F,
    tracer: &'a T,
    interrupt: &'a Interrupt,
    version: Version,
    keep_going: bool,
    /// Set once nothing new may be scheduled.
    stopping: AtomicBool,
    /// The node whose failure stopped the build.
    first_failure: Mutex<Option<K>>,
    protocol_error: Mutex<Option<ProtocolError>>,
}

impl<'a, K, V, F, T> ParallelEvaluator<'a, K, V, F, T>
where
    K: NodeKey,
    V: NodeValue,
    F: NodeFunction<K, V>,
    T: Tracer<K>,
{
    fn run(
        &self,
        pool: &rayon::ThreadPool,
        roots: &[K],
    ) -> Result<EvaluationResult<K, V>, EvalError> {
        pool.scope(|scope| {
            for root in roots {
                if let Err(error) = self.request_root(scope, root) {
                    self.fail(error);
                    break;
                }
            }
        });

        if let Some(error) = self.protocol_error.lock().take() {
            return Err(self.abort(error));
        }

        let first_failure = self.first_failure.lock().take();
        let mut bubbled: ahash::HashMap<K, ErrorInfo<K>> = ahash::HashMap::default();
        if let Some(failed) = &first_failure {
            bubbled = self.bubble_error(failed).map_err(|error| self.abort(error))?;
        }

        let mut result = EvaluationResult::default();
        let mut incomplete = Vec::new();
        for root in roots {
            match self.graph.done_value(root) {
                Some(NodeOutcome::Value(value)) => {
                    result.values.insert(root.clone(), value);
                }
                Some(NodeOutcome::Error(error)) => {
                    result.errors.insert(root.clone(), error);
                }
                None => match bubbled.get(root) {
                    Some(error) => {
                        result.errors.insert(root.clone(), error.clone());
                    }
                    None => incomplete.push(root),
                },
            }
        }
        if incomplete.is_empty() && !self.should_stop() {
            debug!(version = self.version.0, "evaluation done");
            return Ok(result);
        }

        self.clean_up_unfinished()?;
        if incomplete.is_empty() || first_failure.is_some() {
            return Ok(result);
        }
        if self.interrupt.is_interrupted() {
            debug!(incomplete = incomplete.len(), "evaluation interrupted");
            return Err(EvalError::Interrupted);
        }
        Err(EvalError::Incomplete {
            keys: incomplete.iter().map(|key| format!("{key:?}")).collect(),
        })
    }

    fn abort(&self, error: ProtocolError) -> EvalError {
        warn!(%error, "evaluation aborted");
        if let Err(cleanup) = self.clean_up_unfinished() {
            warn!(error = %cleanup, "failed to remove unfinished nodes");
        }
        error.into()
    }

    fn should_stop(&self) -> bool {
        self.stopping.load(Ordering::SeqCst) || self.interrupt.is_interrupted()
    }

    fn fail(&self, error: ProtocolError) {
        let mut slot = self.protocol_error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
        self.stopping.store(true, Ordering::SeqCst);
    }

    fn stop_at_failure(&self, key: &K) {
        let mut slot = self.first_failure.lock();
        if slot.is_none() {
            *slot = Some(key.clone());
        }
        self.stopping.store(true, Ordering::SeqCst);
    }

    fn request_root<'s>(&'s self, scope: &rayon::Scope<'s>, root: &K) -> Result<(), ProtocolError> {
        let entry = self.graph.create_if_absent(root.clone());
        if entry.add_reverse_dep_and_check_if_done(None)? == DependencyState::NeedsScheduling {
            self.enqueue(scope, root.clone());
        }
        Ok(())
    }

    fn enqueue<'s>(&'s self, scope: &rayon::Scope<'s>, key: K) {
        if self.should_stop() {
            trace!(?key, "evaluation stopping, not scheduling");
            return;
        }
        scope.spawn(move |scope| {
            if self.should_stop() {
                return;
            }
            if let Err(error) = self.process(scope, &key) {
                self.fail(error);
            }
        });
    }

    /// Take the next step for a node that was just scheduled.
    fn process<'s>(&'s self, scope: &rayon::Scope<'s>, key: &K) -> Result<(), ProtocolError> {
        let entry = self.graph.get(key).ok_or_else(|| missing_node(key))?;
        self.tracer.on_evaluate(key);
        if entry.is_dirty() {
            let state = entry.dirty_state()?;
            self.tracer.on_dirty_check(key, state);
            match state {
                DirtyState::CheckDependencies => {
                    let group = entry.next_dirty_direct_deps()?;
                    trace!(?key, ?group, "checking dependency group");
                    entry.add_temporary_direct_deps(GroupedListBuilder::from_group(
                        group.iter().cloned(),
                    ))?;
                    return self.register_deps(scope, key, &entry, group);
                }
                DirtyState::VerifiedClean => {
                    let committed = entry.mark_clean(self.version)?;
                    trace!(?key, "verified clean");
                    self.tracer.on_node_done(key, &NodeDone::VerifiedClean);
                    return self.signal_parents(scope, committed.reverse_deps, committed.version);
                }
                DirtyState::Rebuilding => {}
            }
        }
        self.compute(scope, key, &entry)
    }

    fn compute<'s>(
        &'s self,
        scope: &rayon::Scope<'s>,
        key: &K,
        entry: &NodeEntry<K, V>,
    ) -> Result<(), ProtocolError> {
        let mut env = Environment::new(self.graph, entry.temporary_direct_deps()?);
        let result = self.function.compute(key, &mut env);
        let values_missing = env.values_missing();
        let newly_requested = env.into_newly_requested();

        match result {
            Ok(Some(value)) => {
                ensure_state!(!values_missing, "compute", key);
                let outcome = NodeOutcome::Value(Arc::new(value));
                let committed = self.commit(key, entry, outcome, newly_requested)?;
                self.signal_parents(scope, committed.reverse_deps, committed.version)
            }
            Ok(None) => {
                ensure_state!(values_missing && !newly_requested.is_empty(), "compute", key);
                let deps: Vec<K> = newly_requested.iter().cloned().collect();
                trace!(?key, requested = deps.len(), "waiting for dependencies");
                self.tracer.on_restart(key, deps.len());
                entry.add_temporary_direct_deps(newly_requested)?;
                self.register_deps(scope, key, entry, deps)
            }
            Err(error) => {
                let error = ErrorInfo::from_failure(key, error);
                debug!(?key, %error, "node failed");
                let committed = self.commit(key, entry, NodeOutcome::Error(error), newly_requested)?;
                if !self.keep_going {
                    self.stop_at_failure(key);
                }
                self.signal_parents(scope, committed.reverse_deps, committed.version)
            }
        }
    }

    /// Commit the outcome of running the node function, with the dependencies it requested
    /// in that run.
    fn commit(
        &self,
        key: &K,
        entry: &NodeEntry<K, V>,
        outcome: NodeOutcome<K, V>,
        newly_requested: GroupedListBuilder<K>,
    ) -> Result<Committed<K>, ProtocolError> {
        self.register_done_deps(key, entry, newly_requested)?;
        let message = outcome.error().map(|error| error.message().to_owned());
        let committed = entry.set_value(outcome, self.version)?;
        let done = match message {
            Some(message) => NodeDone::Failed { message },
            None if committed.changed => NodeDone::Changed,
            None => NodeDone::Unchanged,
        };
        trace!(?key, ?done, "computed");
        self.tracer.on_node_done(key, &done);
        Ok(committed)
    }

    /// Register `key` on each of `deps`, which were already appended to its direct deps.
    fn register_deps<'s>(
        &'s self,
        scope: &rayon::Scope<'s>,
        key: &K,
        entry: &NodeEntry<K, V>,
        deps: Vec<K>,
    ) -> Result<(), ProtocolError> {
        for dep in deps {
            let dep_entry = self.graph.create_if_absent(dep.clone());
            match dep_entry.add_reverse_dep_and_check_if_done(Some(key.clone()))? {
                DependencyState::Done(version) => {
                    if entry.signal_dep(version)? {
                        self.enqueue(scope, key.clone());
                    }
                }
                DependencyState::NeedsScheduling => self.enqueue(scope, dep),
                DependencyState::AlreadyEvaluating => {}
            }
        }
        Ok(())
    }

    /// Record the dependencies of a round that is about to be committed.
    ///
    /// Requested dependencies that are not done are dropped, since the round will not wait
    /// for them.
    fn register_done_deps(
        &self,
        key: &K,
        entry: &NodeEntry<K, V>,
        mut deps: GroupedListBuilder<K>,
    ) -> Result<(), ProtocolError> {
        let unfinished: ahash::HashSet<K> = deps
            .iter()
            .filter(|dep| !self.graph.get(dep).is_some_and(|entry| entry.is_done()))
            .cloned()
            .collect();
        if !unfinished.is_empty() {
            trace!(?key, ?unfinished, "dropping dependencies that are not done");
            deps.remove(&unfinished);
        }
        let keys: Vec<K> = deps.iter().cloned().collect();
        entry.add_temporary_direct_deps(deps)?;
        for dep in keys {
            let dep_entry = self.graph.get(&dep).ok_or_else(|| missing_node(&dep))?;
            match dep_entry.add_reverse_dep_and_check_if_done(Some(key.clone()))? {
                DependencyState::Done(version) => {
                    entry.signal_dep(version)?;
                }
                _ => {
                    return Err(ProtocolError::precondition(
                        "register_done_deps",
                        "dependency is done",
                        &dep,
                    ))
                }
            }
        }
        Ok(())
    }

    fn signal_parents<'s>(
        &'s self,
        scope: &rayon::Scope<'s>,
        parents: ahash::HashSet<K>,
        version: Version,
    ) -> Result<(), ProtocolError> {
        for parent in parents {
            let parent_entry = self.graph.get(&parent).ok_or_else(|| missing_node(&parent))?;
            if parent_entry.signal_dep(version)? {
                self.enqueue(scope, parent);
            }
        }
        Ok(())
    }

    /// Settle every node that was waiting, directly or transitively, on the failure that
    /// stopped the build.
    ///
    /// Runs after the pool is drained, so nothing else touches the graph. Waiting nodes are
    /// settled one at a time, ready ones first. Returns the failures of nodes that could
    /// not be settled; those commit nothing and are removed with the rest of the
    /// unfinished work.
    fn bubble_error(&self, failed: &K) -> Result<ahash::HashMap<K, ErrorInfo<K>>, ProtocolError> {
        let failed_entry = self.graph.get(failed).ok_or_else(|| missing_node(failed))?;
        let mut bubbled: ahash::HashMap<K, ErrorInfo<K>> = ahash::HashMap::default();
        let mut settled: ahash::HashSet<K> = ahash::HashSet::default();
        let mut waiting: Vec<K> = failed_entry.reverse_deps()?.into_iter().collect();
        loop {
            waiting.retain(|key| {
                !settled.contains(key)
                    && self
                        .graph
                        .get(key)
                        .is_some_and(|entry| !entry.is_done() && entry.is_evaluating())
            });
            waiting.sort();
            waiting.dedup();
            if waiting.is_empty() {
                break;
            }
            let mut next = 0;
            for (index, key) in waiting.iter().enumerate() {
                let entry = self.graph.get(key).ok_or_else(|| missing_node(key))?;
                if entry.is_ready()? {
                    next = index;
                    break;
                }
            }
            let key = waiting.swap_remove(next);
            self.settle(&key, &mut bubbled, &mut waiting)?;
            settled.insert(key);
        }
        debug!(unsettled = bubbled.len(), "failure propagated");
        Ok(bubbled)
    }

    /// Settle one node waiting on a failure.
    ///
    /// Dependencies that never finished are dropped. A node verified clean keeps its last
    /// value; any other node runs its function once more, with the failures it depends on
    /// visible, and commits whatever that returns. If the function still asks for
    /// dependencies that are not done, the node's inherited failures are recorded in
    /// `bubbled` instead.
    fn settle(
        &self,
        key: &K,
        bubbled: &mut ahash::HashMap<K, ErrorInfo<K>>,
        waiting: &mut Vec<K>,
    ) -> Result<(), ProtocolError> {
        let entry = self.graph.get(key).ok_or_else(|| missing_node(key))?;
        let mut inherited: Vec<ErrorInfo<K>> = Vec::new();
        let mut unfinished: ahash::HashSet<K> = ahash::HashSet::default();
        for dep in entry.temporary_direct_deps()? {
            match self.graph.done_value(&dep) {
                Some(NodeOutcome::Error(error)) => inherited.push(error),
                Some(NodeOutcome::Value(_)) => {}
                None => {
                    inherited.extend(bubbled.get(&dep).cloned());
                    unfinished.insert(dep);
                }
            }
        }
        if !unfinished.is_empty() {
            trace!(?key, ?unfinished, "dropping dependencies that did not finish");
            entry.remove_unfinished_deps(&unfinished)?;
            for dep in &unfinished {
                if let Some(dep_entry) = self.graph.get(dep) {
                    dep_entry.remove_reverse_dep_to_signal(key.clone())?;
                }
            }
        }

        if entry.is_dirty() {
            let state = entry.dirty_state()?;
            self.tracer.on_dirty_check(key, state);
            match state {
                DirtyState::VerifiedClean => {
                    let committed = entry.mark_clean(self.version)?;
                    trace!(?key, "verified clean");
                    self.tracer.on_node_done(key, &NodeDone::VerifiedClean);
                    return self.signal_waiting(committed, waiting);
                }
                DirtyState::CheckDependencies => entry.force_changed()?,
                DirtyState::Rebuilding => {}
            }
        }

        self.tracer.on_evaluate(key);
        let mut env = Environment::new(self.graph, entry.temporary_direct_deps()?);
        let result = self.function.compute(key, &mut env);
        let values_missing = env.values_missing();
        let newly_requested = env.into_newly_requested();
        let committed = match result {
            Ok(Some(value)) => {
                ensure_state!(!values_missing, "bubble_error", key);
                let outcome = NodeOutcome::Value(Arc::new(value));
                self.commit(key, &entry, outcome, newly_requested)?
            }
            Err(error) => {
                let error = ErrorInfo::from_failure(key, error);
                self.commit(key, &entry, NodeOutcome::Error(error), newly_requested)?
            }
            Ok(None) => {
                ensure_state!(
                    values_missing && !newly_requested.is_empty(),
                    "bubble_error",
                    key
                );
                if !inherited.is_empty() {
                    trace!(?key, "left unfinished, failure reported only");
                    bubbled.insert(key.clone(), ErrorInfo::from_children(inherited.iter()));
                    waiting.extend(entry.reverse_deps_to_signal()?);
                }
                return Ok(());
            }
        };
        self.signal_waiting(committed, waiting)
    }

    /// Signal the dependents of a node settled after the build stopped, and queue them to
    /// be settled in turn.
    fn signal_waiting(&self, committed: Committed<K>, waiting: &mut Vec<K>) -> Result<(), ProtocolError> {
        for parent in committed.reverse_deps {
            let Some(parent_entry) = self.graph.get(&parent) else {
                continue;
            };
            if !parent_entry.is_done() {
                parent_entry.signal_dep(committed.version)?;
                waiting.push(parent);
            }
        }
        Ok(())
    }

    /// Remove every node that started evaluating in this build but did not finish.
    ///
    /// Such a node is unregistered from its dependencies that are done, and dropped from
    /// the graph; the next build creates it afresh.
    fn clean_up_unfinished(&self) -> Result<(), ProtocolError> {
        let mut removed = 0usize;
        for key in self.graph.keys() {
            let Some(entry) = self.graph.get(&key) else {
                continue;
            };
            if entry.is_done() || !entry.is_evaluating() {
                continue;
            }
            for dep in entry.temporary_direct_deps()? {
                if let Some(dep_entry) = self.graph.get(&dep) {
                    if dep_entry.is_done() {
                        dep_entry.remove_reverse_dep(key.clone());
                    }
                }
            }
            self.graph.remove(&key);
            removed += 1;
        }
        debug!(removed, "removed unfinished nodes");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn double(key: &u32, env: &mut Environment<'_, u32, u64>) -> anyhow::Result<Option<u64>> {
        if *key == 0 {
            return Ok(Some(1));
        }
        let Some(below) = env.get_value_or_err(key - 1)? else {
            return Ok(None);
        };
        Ok(Some(*below * 2))
    }

    #[test]
    fn test_chain() {
        let mut evaluator = EvaluatorBuilder::new().threads(2).build(double).unwrap();
        let result = evaluator.evaluate([10]).unwrap();
        assert_eq!(result.get(&10).map(|v| **v), Some(1024));
        assert!(!result.has_errors());
        assert_eq!(evaluator.graph().len(), 11);
        assert_eq!(evaluator.version(), Version(1));
    }

    #[test]
    fn test_interrupt_flag() {
        let interrupt = Interrupt::new();
        let clone = interrupt.clone();
        assert!(!interrupt.is_interrupted());
        clone.interrupt();
        assert!(interrupt.is_interrupted());
        interrupt.clear();
        assert!(!clone.is_interrupted());
    }

    #[test]
    fn test_interrupted_before_start() {
        let mut evaluator = EvaluatorBuilder::new().threads(2).build(double).unwrap();
        evaluator.interrupt_handle().interrupt();
        assert!(matches!(evaluator.evaluate([3]), Err(EvalError::Interrupted)));
        assert!(evaluator.graph().is_empty());

        evaluator.interrupt_handle().clear();
        let result = evaluator.evaluate([3]).unwrap();
        assert_eq!(result.get(&3).map(|v| **v), Some(8));
    }

    #[test]
    fn test_ok_none_without_missing_values_is_a_protocol_error() {
        fn broken(_key: &u32, _env: &mut Environment<'_, u32, u64>) -> anyhow::Result<Option<u64>> {
            Ok(None)
        }
        let mut evaluator = EvaluatorBuilder::new().threads(1).build(broken).unwrap();
        let err = evaluator.evaluate([1]).unwrap_err();
        assert!(matches!(
            err,
            EvalError::Protocol(ProtocolError::Precondition {
                operation: "compute",
                ..
            })
        ));
        assert!(evaluator.graph().is_empty());
    }

    #[test]
    fn test_ok_some_with_missing_values_is_a_protocol_error() {
        fn careless(key: &u32, env: &mut Environment<'_, u32, u64>) -> anyhow::Result<Option<u64>> {
            if *key > 0 {
                env.get_value(key - 1);
            }
            Ok(Some(0))
        }
        let mut evaluator = EvaluatorBuilder::new().threads(1).build(careless).unwrap();
        assert!(matches!(
            evaluator.evaluate([1]),
            Err(EvalError::Protocol(_))
        ));
    }

    /// 2 waits on 0, which fails, and on 3, which waits on itself.
    fn hasty(key: &u32, env: &mut Environment<'_, u32, u64>) -> anyhow::Result<Option<u64>> {
        match key {
            0 => anyhow::bail!("zero"),
            2 => {
                let values = env.get_values([0, 3]);
                if let Some(NodeOutcome::Error(_)) = &values[0] {
                    // Answers before the rest of its dependencies are done.
                    return Ok(Some(0));
                }
                Ok(None)
            }
            _ => Ok(env.get_value(*key).map(|_| 0)),
        }
    }

    #[test]
    fn test_protocol_error_while_settling_failure_cleans_up() {
        let mut evaluator = EvaluatorBuilder::new().threads(1).build(hasty).unwrap();
        let err = evaluator.evaluate([2]).unwrap_err();
        assert!(matches!(
            err,
            EvalError::Protocol(ProtocolError::Precondition {
                operation: "bubble_error",
                ..
            })
        ));
        let graph = evaluator.graph();
        for key in graph.keys() {
            assert!(graph.get(&key).unwrap().is_done(), "{key} left unfinished");
        }
        assert!(graph.get(&2).is_none());

        evaluator.invalidate([0]);
        let result = evaluator.evaluate([0]).unwrap();
        assert_eq!(result.error(&0).unwrap().root_causes(), &[0]);
    }
}
