use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// The one privileged worker slot that may be granted the entire remaining
/// budget in a single allocation, versus every other ("normal") slot which
/// only ever asks for the per-thread baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Normal,
    Large,
}

struct State {
    allocated_mb: u64,
    total_limit_mb: u64,
    base_limit_mb: u64,
    suspended_threads: u32,
    finished: bool,
}

impl State {
    fn to_request(&self, lowest_effective: u64) -> Option<u64> {
        let max_request = self.total_limit_mb.saturating_sub(self.allocated_mb);
        let lowest = self.base_limit_mb.max(lowest_effective);
        if max_request <= lowest {
            return None;
        }
        if self.suspended_threads == 1 {
            return Some(max_request);
        }
        if lowest > self.total_limit_mb / 3 {
            return Some(max_request);
        }
        Some((lowest * 2).min(max_request))
    }
}

/// Allocates per-worker memory caps out of a shared megabyte budget,
/// following the allocation rule: grant the full remainder to the last
/// waiter or when the retry floor eats most of the budget, otherwise grant
/// twice the retry floor. Ported directly from the original memory manager's
/// decision algorithm (see DESIGN.md).
pub struct MemoryArbiter {
    state: Mutex<State>,
    condvar: Condvar,
    /// Supplies the current retry floor: the lowest cap any aborted unit is
    /// waiting to retry at, or 0 if nothing is aborted. Exposed as a
    /// callback so the arbiter does not need to depend on `AbortedStore`
    /// directly.
    lowest_effective_memory: Box<dyn Fn() -> u64 + Send + Sync>,
}

impl MemoryArbiter {
    pub fn new(
        total_limit_mb: u64,
        base_limit_mb: u64,
        lowest_effective_memory: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> Self {
        MemoryArbiter {
            state: Mutex::new(State {
                allocated_mb: 0,
                total_limit_mb,
                base_limit_mb,
                suspended_threads: 0,
                finished: false,
            }),
            condvar: Condvar::new(),
            lowest_effective_memory: Box::new(lowest_effective_memory),
        }
    }

    /// Blocks until the arbiter grants a cap, or returns `0` once shutdown
    /// has been signalled. A normal worker asks for the base per-thread
    /// limit; the large worker asks for whatever is currently unallocated
    /// (or the base limit, whichever is bigger). If that initial ask does
    /// not fit, falls back to the `to_request` retry-floor rule on a 10s
    /// re-poll loop.
    pub fn acquire(&self, role: Role) -> u64 {
        let mut guard = self.state.lock().unwrap();
        guard.suspended_threads += 1;
        if guard.finished {
            guard.suspended_threads -= 1;
            return 0;
        }
        let initial = match role {
            Role::Normal => guard.base_limit_mb,
            Role::Large => guard
                .base_limit_mb
                .max(guard.total_limit_mb.saturating_sub(guard.allocated_mb)),
        };
        if guard.allocated_mb + initial <= guard.total_limit_mb {
            guard.allocated_mb += initial;
            guard.suspended_threads -= 1;
            return initial;
        }
        loop {
            let (g, _timeout) = self
                .condvar
                .wait_timeout(guard, Duration::from_secs(10))
                .unwrap();
            guard = g;
            if guard.finished {
                guard.suspended_threads -= 1;
                return 0;
            }
            let lowest_effective = (self.lowest_effective_memory)();
            if let Some(mb) = guard.to_request(lowest_effective) {
                if guard.allocated_mb + mb <= guard.total_limit_mb {
                    guard.allocated_mb += mb;
                    guard.suspended_threads -= 1;
                    return mb;
                }
            }
        }
    }

    /// Returns `cap` MB to the pool and wakes one waiter.
    pub fn release(&self, cap_mb: u64) {
        let mut guard = self.state.lock().unwrap();
        guard.allocated_mb = guard.allocated_mb.saturating_sub(cap_mb);
        self.condvar.notify_one();
    }

    /// Releases `current_cap_mb` and immediately re-acquires, using the same
    /// decision rule, blocking until a new cap is granted or shutdown.
    pub fn resize(&self, current_cap_mb: u64, role: Role) -> u64 {
        self.release(current_cap_mb);
        self.acquire(role)
    }

    pub fn set_total_limit(&self, mb: u64) {
        let mut guard = self.state.lock().unwrap();
        guard.total_limit_mb = mb;
        self.condvar.notify_all();
    }

    pub fn set_base_limit(&self, mb: u64) {
        let mut guard = self.state.lock().unwrap();
        guard.base_limit_mb = mb;
        self.condvar.notify_all();
    }

    pub fn shutdown(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.finished = true;
        self.condvar.notify_all();
    }

    pub fn allocated_mb(&self) -> u64 {
        self.state.lock().unwrap().allocated_mb
    }

    pub fn total_limit_mb(&self) -> u64 {
        self.state.lock().unwrap().total_limit_mb
    }

    pub fn base_limit_mb(&self) -> u64 {
        self.state.lock().unwrap().base_limit_mb
    }

    /// True when `cap_mb` qualifies a worker as a large thread: more than
    /// twice the base limit and more than twice the current retry floor.
    pub fn large_thread_condition(&self, cap_mb: u64) -> bool {
        let guard = self.state.lock().unwrap();
        cap_mb > 2 * guard.base_limit_mb && cap_mb > 2 * (self.lowest_effective_memory)()
    }
}
