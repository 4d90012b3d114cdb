use std::sync::Mutex;

use tracing::{info, warn};

use crate::workunit::WorkUnit;

/// Progress events the core emits; the Observer never blocks the scheduler,
/// it only receives them. A tagged enum stands in for the original's
/// virtual Observer hierarchy.
#[derive(Debug, Clone)]
pub enum Event {
    ComputationsAdded { n: usize, cap_mb: u64 },
    ThreadStarted { cap_mb: u64 },
    ThreadStopped { cap_mb: u64 },
    BadComputation { unit: WorkUnit, cap_mb: u64, timed_out: bool },
    FinishedComputations { n: usize, cap_mb: u64 },
    Unpacking,
    Unpacked { n: usize },
    RemovedInDb { n: usize },
    RemovedPrecalculated { n: usize },
    LoadedComputations { path: String },
    AbortedToGiveup { n: usize },
    Resurrected { n: usize, cap_mb: u64 },
    Assigned { n: usize },
    Tick { packed: u64, unpacked: usize, bad: usize, abandoned: usize },
    UpdateBadSummary { buckets: Vec<(u64, usize)> },
    DisplayMemory { total_limit_mb: u64, base_limit_mb: u64, allocated_mb: u64, free_kb: u64 },
}

/// Passive sink for [`Event`]s. Implementations must not block the caller
/// for long; the scheduler never waits on an observer call completing
/// anything beyond the call itself.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: Event);
}

/// Discards every event; useful when no presentation layer is attached.
pub struct NullObserver;

impl Observer for NullObserver {
    fn on_event(&self, _event: Event) {}
}

/// Logs every event through `tracing` at a level appropriate to its
/// severity. This is the non-interactive stand-in for a TUI: a production
/// deployment would plug in a curses-based observer instead.
pub struct StreamObserver;

impl Observer for StreamObserver {
    fn on_event(&self, event: Event) {
        match event {
            Event::ThreadStarted { cap_mb } => info!(cap_mb, "thread started"),
            Event::ThreadStopped { cap_mb } => info!(cap_mb, "thread stopped"),
            Event::ComputationsAdded { n, cap_mb } => info!(n, cap_mb, "computations added"),
            Event::FinishedComputations { n, cap_mb } => info!(n, cap_mb, "computations finished"),
            Event::BadComputation { unit, cap_mb, timed_out } => {
                warn!(%unit, cap_mb, timed_out, "computation marked bad")
            }
            Event::Unpacking => info!("unpacking"),
            Event::Unpacked { n } => info!(n, "unpacked"),
            Event::RemovedInDb { n } => info!(n, "removed (already in db)"),
            Event::RemovedPrecalculated { n } => info!(n, "removed (precalculated)"),
            Event::LoadedComputations { path } => info!(path, "loaded computations"),
            Event::AbortedToGiveup { n } => warn!(n, "computations given up"),
            Event::Resurrected { n, cap_mb } => info!(n, cap_mb, "resurrected aborted computations"),
            Event::Assigned { n } => info!(n, "computations assigned"),
            Event::Tick { packed, unpacked, bad, abandoned } => {
                info!(packed, unpacked, bad, abandoned, "tick")
            }
            Event::UpdateBadSummary { buckets } => info!(?buckets, "aborted summary"),
            Event::DisplayMemory { total_limit_mb, base_limit_mb, allocated_mb, free_kb } => {
                info!(total_limit_mb, base_limit_mb, allocated_mb, free_kb, "memory status")
            }
        }
    }
}

/// Test/debug observer that records every event it receives, in order.
#[derive(Default)]
pub struct BufferedObserver {
    events: Mutex<Vec<Event>>,
}

impl BufferedObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Observer for BufferedObserver {
    fn on_event(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}
