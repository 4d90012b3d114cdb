use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use crate::workunit::WorkUnit;

/// Work units the engine failed on, bucketed by the memory cap at which they
/// last failed. Ordered on cap (a `BTreeMap`, not a hash map) so
/// `lowest_nonempty_cap` and the `extract_below`/`drain_at_or_above` range
/// scans are direct, not a linear cap search.
#[derive(Default)]
pub struct AbortedStore {
    inner: Mutex<BTreeMap<u64, VecDeque<WorkUnit>>>,
}

impl AbortedStore {
    pub fn new() -> Self {
        AbortedStore::default()
    }

    pub fn insert(&self, cap: u64, unit: WorkUnit) {
        self.inner.lock().unwrap().entry(cap).or_default().push_back(unit);
    }

    /// Removes and returns up to `n` units whose failure cap was strictly
    /// less than `cap`, oldest-first within each bucket, lowest caps first.
    pub fn extract_below(&self, cap: u64, n: usize) -> Vec<WorkUnit> {
        let mut guard = self.inner.lock().unwrap();
        let mut result = Vec::new();
        let keys: Vec<u64> = guard.range(..cap).map(|(&k, _)| k).collect();
        for key in keys {
            if result.len() >= n {
                break;
            }
            if let Some(bucket) = guard.get_mut(&key) {
                while result.len() < n {
                    match bucket.pop_front() {
                        Some(unit) => result.push(unit),
                        None => break,
                    }
                }
                if bucket.is_empty() {
                    guard.remove(&key);
                }
            }
        }
        result
    }

    /// Removes and returns every unit whose failure cap is `>= cap`. Used by
    /// the Giveup policy with `cap = total_limit`.
    pub fn drain_at_or_above(&self, cap: u64) -> Vec<WorkUnit> {
        let mut guard = self.inner.lock().unwrap();
        let keys: Vec<u64> = guard.range(cap..).map(|(&k, _)| k).collect();
        let mut result = Vec::new();
        for key in keys {
            if let Some(bucket) = guard.remove(&key) {
                result.extend(bucket);
            }
        }
        result
    }

    pub fn lowest_nonempty_cap(&self) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .find(|(_, bucket)| !bucket.is_empty())
            .map(|(&cap, _)| cap)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(cap, count)` pairs for every non-empty bucket, lowest cap first.
    pub fn summary(&self) -> Vec<(u64, usize)> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, b)| !b.is_empty())
            .map(|(&cap, b)| (cap, b.len()))
            .collect()
    }
}
