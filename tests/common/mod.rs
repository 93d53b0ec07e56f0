//! A small build used by the integration tests.
//!
//! Input nodes hold a number. Derived nodes request their dependencies one group at a
//! time, stopping as soon as a group is missing, and sum what they get.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use skein::{
    DirtyState, Environment, InvalidationReason, Interrupt, NodeDone, NodeFunction, Tracer,
};

pub type Key = &'static str;

#[derive(Debug, Clone, Default)]
pub struct Recipe {
    pub groups: Vec<Vec<Key>>,
    /// Clamp the sum to at most this value.
    pub cap: Option<i64>,
    /// Count failed dependencies as zero instead of failing.
    pub tolerate_errors: bool,
    /// Request the selector, then the first branch if it is zero and the second otherwise.
    pub switch: Option<(Key, Key, Key)>,
}

impl Recipe {
    pub fn sum(groups: &[&[Key]]) -> Self {
        Self {
            groups: groups.iter().map(|group| group.to_vec()).collect(),
            ..Default::default()
        }
    }

    pub fn switch(selector: Key, if_zero: Key, otherwise: Key) -> Self {
        Self {
            switch: Some((selector, if_zero, otherwise)),
            ..Default::default()
        }
    }

    pub fn capped(self, cap: i64) -> Self {
        Self {
            cap: Some(cap),
            ..self
        }
    }

    pub fn tolerant(self) -> Self {
        Self {
            tolerate_errors: true,
            ..self
        }
    }
}

#[derive(Default)]
pub struct World {
    pub inputs: RwLock<HashMap<Key, i64>>,
    pub recipes: RwLock<HashMap<Key, Recipe>>,
    pub failing: RwLock<HashSet<Key>>,
    /// Every call of the node function, in order.
    pub calls: Mutex<Vec<Key>>,
    /// Set the interrupt flag when this key is computed.
    pub trip: Mutex<Option<(Key, Interrupt)>>,
}

impl World {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn input(&self, key: Key, value: i64) {
        self.inputs.write().insert(key, value);
    }

    pub fn recipe(&self, key: Key, recipe: Recipe) {
        self.recipes.write().insert(key, recipe);
    }

    pub fn fail(&self, key: Key) {
        self.failing.write().insert(key);
    }

    pub fn heal(&self, key: Key) {
        self.failing.write().remove(&key);
    }

    /// Calls recorded since the last call to this method.
    pub fn take_calls(&self) -> Vec<Key> {
        std::mem::take(&mut *self.calls.lock())
    }

    pub fn calls_of(&self, key: Key) -> usize {
        self.calls.lock().iter().filter(|call| **call == key).count()
    }
}

/// The node function over a shared [`World`].
pub struct Build(pub Arc<World>);

impl NodeFunction<Key, i64> for Build {
    fn compute(&self, key: &Key, env: &mut Environment<'_, Key, i64>) -> anyhow::Result<Option<i64>> {
        let world = &self.0;
        world.calls.lock().push(*key);
        if let Some((trip, interrupt)) = &*world.trip.lock() {
            if trip == key {
                interrupt.interrupt();
            }
        }
        if world.failing.read().contains(key) {
            anyhow::bail!("{key} is broken");
        }
        if let Some(value) = world.inputs.read().get(key) {
            return Ok(Some(*value));
        }
        let recipe = world
            .recipes
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no recipe for {key}"))?;

        if let Some((selector, if_zero, otherwise)) = recipe.switch {
            let Some(selected) = env.get_value_or_err(selector)? else {
                return Ok(None);
            };
            let branch = if *selected == 0 { if_zero } else { otherwise };
            return Ok(env.get_value_or_err(branch)?.map(|value| *value));
        }

        let mut total = 0;
        for group in &recipe.groups {
            let values = env.get_values(group.iter().copied());
            if env.values_missing() {
                return Ok(None);
            }
            for outcome in values.into_iter().flatten() {
                match outcome.into_result() {
                    Ok(value) => total += *value,
                    Err(_) if recipe.tolerate_errors => {}
                    Err(error) => return Err(error.into()),
                }
            }
        }
        Ok(Some(match recipe.cap {
            Some(cap) => total.min(cap),
            None => total,
        }))
    }
}

/// Records what the evaluator reports.
#[derive(Default)]
pub struct Recorder {
    pub done: Mutex<Vec<(Key, NodeDone)>>,
    pub dirty_checks: Mutex<Vec<(Key, DirtyState)>>,
    pub invalidated: Mutex<Vec<(Key, InvalidationReason)>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// How `key` finished, the last time it did.
    pub fn last_done(&self, key: Key) -> Option<NodeDone> {
        self.done
            .lock()
            .iter()
            .rev()
            .find(|(done, _)| *done == key)
            .map(|(_, result)| result.clone())
    }

    pub fn clear(&self) {
        self.done.lock().clear();
        self.dirty_checks.lock().clear();
        self.invalidated.lock().clear();
    }
}

impl Tracer<Key> for Recorder {
    fn on_dirty_check(&self, key: &Key, state: DirtyState) {
        self.dirty_checks.lock().push((*key, state));
    }

    fn on_node_done(&self, key: &Key, result: &NodeDone) {
        self.done.lock().push((*key, result.clone()));
    }

    fn on_invalidate(&self, key: &Key, reason: InvalidationReason) {
        self.invalidated.lock().push((*key, reason));
    }
}
