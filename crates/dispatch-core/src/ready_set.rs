use std::collections::HashSet;
use std::sync::Mutex;

use crate::workunit::WorkUnit;

/// Deduplicated set of expanded, not-yet-assigned work units. Not a strict
/// queue: assignment draws arbitrarily, insertion is a no-op for units
/// already present.
#[derive(Default)]
pub struct ReadySet {
    inner: Mutex<HashSet<WorkUnit>>,
}

impl ReadySet {
    pub fn new() -> Self {
        ReadySet::default()
    }

    pub fn insert(&self, unit: WorkUnit) {
        self.inner.lock().unwrap().insert(unit);
    }

    pub fn remove(&self, unit: &WorkUnit) -> bool {
        self.inner.lock().unwrap().remove(unit)
    }

    pub fn contains(&self, unit: &WorkUnit) -> bool {
        self.inner.lock().unwrap().contains(unit)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns up to `n` arbitrary units, for assignment.
    pub fn take(&self, n: usize) -> Vec<WorkUnit> {
        let mut guard = self.inner.lock().unwrap();
        let taken: Vec<WorkUnit> = guard.iter().take(n).cloned().collect();
        for unit in &taken {
            guard.remove(unit);
        }
        taken
    }

    /// Removes every unit for which `matches` returns true. Used by the
    /// dedup passes against the persistent database and prior output files.
    pub fn remove_matching(&self, mut matches: impl FnMut(&WorkUnit) -> bool) -> usize {
        let mut guard = self.inner.lock().unwrap();
        let before = guard.len();
        guard.retain(|u| !matches(u));
        before - guard.len()
    }
}
