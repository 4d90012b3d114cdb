use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::System;

use crate::aborted_store::AbortedStore;
use crate::config::Config;
use crate::dedup;
use crate::engine::EngineInvoker;
use crate::error::DispatchError;
use crate::giveup::GiveupWriter;
use crate::memory_arbiter::{MemoryArbiter, Role};
use crate::observer::{Event, Observer};
use crate::ready_set::ReadySet;
use crate::schema::Schema;
use crate::template_store::TemplateStore;
use crate::workunit::WorkUnit;

/// A worker's exclusive allotment of work for one engine invocation, built
/// from aborted-store resurrections followed by ready-set fills. Iteration
/// order is insertion order, which is what makes "the first leftover" a
/// well-defined, deterministic choice.
pub type AssignedBatch = Vec<WorkUnit>;

/// Composes every store, the memory arbiter, the engine invoker, the giveup
/// writer and the observer into one explicitly-owned value, replacing the
/// original's singleton-plus-inheritance design. Shared across worker
/// threads behind `Arc`.
pub struct Core {
    pub config: Config,
    pub schema: Box<dyn Schema>,
    pub template_store: TemplateStore,
    pub ready_set: ReadySet,
    pub aborted_store: Arc<AbortedStore>,
    pub arbiter: MemoryArbiter,
    pub engine: EngineInvoker,
    pub giveup: GiveupWriter,
    pub observer: Box<dyn Observer>,
    terminated: AtomicBool,
    next_process_id: AtomicU64,
    engine_version: String,
}

impl Core {
    pub fn new(
        config: Config,
        schema: Box<dyn Schema>,
        observer: Box<dyn Observer>,
        engine_version: String,
        starting_process_id: u64,
    ) -> Self {
        let aborted_store = Arc::new(AbortedStore::new());
        let aborted_for_arbiter = aborted_store.clone();
        let arbiter = MemoryArbiter::new(
            config.total_memory_limit_mb,
            config.base_memory_limit_mb,
            move || aborted_for_arbiter.lowest_nonempty_cap(),
        );
        let engine = EngineInvoker::new(config.engine_path.clone(), &config.engine_flags);
        let giveup = GiveupWriter::new(config.giveup_log.clone());
        let template_store = TemplateStore::new(config.max_per_template);

        Core {
            config,
            schema,
            template_store,
            ready_set: ReadySet::new(),
            aborted_store,
            arbiter,
            engine,
            giveup,
            observer,
            terminated: AtomicBool::new(false),
            next_process_id: AtomicU64::new(starting_process_id),
            engine_version,
        }
    }

    pub fn load_input(&self, text: &str) -> Result<(), DispatchError> {
        self.template_store.load(text, self.schema.as_ref())?;
        self.observer.on_event(Event::LoadedComputations {
            path: self.config.input_file.display().to_string(),
        });
        Ok(())
    }

    pub fn assign_process_id(&self) -> u64 {
        self.next_process_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.arbiter.shutdown();
        self.engine.processes().terminate_all();
    }

    pub fn is_terminating(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Whether a worker holding `cap_mb` should be treated as the large
    /// thread for batch-sizing purposes.
    pub fn large_thread(&self, cap_mb: u64) -> bool {
        self.arbiter.large_thread_condition(cap_mb)
    }

    /// Triggers an unpack pass if the ready set has fallen below the
    /// min-threshold, removing units already present in the db/output dir.
    fn maybe_unpack(&self) -> Result<(), DispatchError> {
        let min_threshold = self.config.computations_per_process * self.config.nthreads as u64;
        if (self.ready_set.len() as u64) >= min_threshold {
            return Ok(());
        }
        self.observer.on_event(Event::Unpacking);
        let before = self.ready_set.len();
        let touched = self.template_store.unpack_into(
            self.config.unpack_high_water,
            before as u64,
            |unit| self.ready_set.insert(unit),
        );
        let unpacked = self.ready_set.len() - before;
        self.observer.on_event(Event::Unpacked { n: unpacked });

        if let Some(db_dir) = &self.config.db_dir {
            let removed = dedup::remove_already_in_db(&self.ready_set, &touched, db_dir)?;
            self.observer.on_event(Event::RemovedInDb { n: removed });
        }
        let removed = dedup::remove_already_in_output_dir(
            &self.ready_set,
            &self.config.output_dir,
            self.schema.as_ref(),
        )?;
        self.observer.on_event(Event::RemovedPrecalculated { n: removed });
        Ok(())
    }

    /// Computes the assignment batch-size target for a worker holding
    /// `cap_mb`: first cap the configured per-process size against the
    /// ready set's own size, then shrink for the large thread, then apply
    /// the forward-progress floor.
    fn target_batch_size(&self, cap_mb: u64, has_carry_over: bool) -> u64 {
        let nthreads = self.config.nthreads as u64;
        let new_computations = self.ready_set.len() as u64;
        let mut target = if new_computations > 0 {
            self.config
                .computations_per_process
                .min(new_computations / nthreads.max(1))
        } else {
            self.config.computations_per_process
        };
        if self.large_thread(cap_mb) {
            target /= nthreads * nthreads;
        }
        if target == 0 && !has_carry_over {
            target = 1;
        }
        target
    }

    /// Builds one worker's assignment: resurrect aborted units below `cap_mb`
    /// first, then fill from the ready set, triggering an unpack pass if
    /// needed.
    pub fn assign(&self, cap_mb: u64, carry_over: AssignedBatch) -> Result<AssignedBatch, DispatchError> {
        self.maybe_unpack()?;
        let mut batch = carry_over;
        let target = self.target_batch_size(cap_mb, !batch.is_empty());
        if target as usize <= batch.len() {
            return Ok(batch);
        }
        let remaining = target as usize - batch.len();

        let resurrected = self.aborted_store.extract_below(cap_mb, remaining);
        if !resurrected.is_empty() {
            self.observer.on_event(Event::Resurrected {
                n: resurrected.len(),
                cap_mb,
            });
        }
        batch.extend(resurrected);

        let still_remaining = target as usize - batch.len().min(target as usize);
        if still_remaining > 0 {
            batch.extend(self.ready_set.take(still_remaining));
        }
        self.observer.on_event(Event::Assigned { n: batch.len() });
        Ok(batch)
    }

    /// Reports a unit as bad at the given cap: moves it to the aborted
    /// store so it can be retried at a higher budget (or given up, if the
    /// cap has already reached the total limit). `timed_out` records
    /// whether this particular failure was an engine timeout.
    pub fn mark_bad(&self, unit: WorkUnit, cap_mb: u64, timed_out: bool) {
        self.aborted_store.insert(cap_mb, unit.clone());
        self.observer.on_event(Event::BadComputation {
            unit,
            cap_mb,
            timed_out,
        });
        self.observer.on_event(Event::UpdateBadSummary {
            buckets: self.aborted_store.summary(),
        });
    }

    /// Runs one giveup sweep; returns the number of units permanently
    /// abandoned.
    pub fn giveup_tick(&self) -> Result<usize, DispatchError> {
        let n = self
            .giveup
            .sweep(&self.aborted_store, self.config.total_memory_limit_mb, &self.engine_version)?;
        if n > 0 {
            self.observer.on_event(Event::AbortedToGiveup { n });
        }
        Ok(n)
    }

    /// Checks the free-system-memory watchdog; returns `Err(OutOfMemory)` and
    /// triggers termination if the threshold is breached.
    pub fn check_out_of_memory(&self, system: &mut System) -> Result<(), DispatchError> {
        let threshold = self.config.free_memory_watchdog_kb;
        if threshold == 0 {
            return Ok(());
        }
        system.refresh_memory();
        let free_kb = system.available_memory() / 1024;
        if free_kb < threshold {
            self.terminate();
            return Err(DispatchError::OutOfMemory {
                free_kb,
                threshold_kb: threshold,
            });
        }
        Ok(())
    }

    /// True once there is nothing left to do anywhere in the system: no
    /// packed templates, no ready units, no aborted units, and termination
    /// has not otherwise been requested mid-flight.
    pub fn no_more_work(&self) -> bool {
        self.is_terminating()
            || (self.template_store.is_empty()
                && self.ready_set.is_empty()
                && self.aborted_store.is_empty())
    }

    pub fn acquire(&self, role: Role) -> u64 {
        self.arbiter.acquire(role)
    }

    pub fn release(&self, cap_mb: u64) {
        self.arbiter.release(cap_mb)
    }

    pub fn resize(&self, cap_mb: u64, role: Role) -> u64 {
        self.arbiter.resize(cap_mb, role)
    }

    pub fn base_timeout(&self) -> Option<Duration> {
        if self.config.base_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.config.base_timeout_secs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NullObserver;
    use crate::schema::SimpleSchema;
    use std::path::PathBuf;

    fn test_core(total_mb: u64, base_mb: u64) -> Core {
        let mut config = Config::default();
        config.total_memory_limit_mb = total_mb;
        config.base_memory_limit_mb = base_mb;
        config.nthreads = 2;
        config.computations_per_process = 4;
        config.input_file = PathBuf::from("in.csv");
        Core::new(config, Box::new(SimpleSchema), Box::new(NullObserver), "test-engine".into(), 1)
    }

    #[test]
    fn assign_enforces_forward_progress_guarantee() {
        let core = test_core(1024, 128);
        let batch = core.assign(128, Vec::new()).unwrap();
        assert!(batch.is_empty(), "ready set is empty, nothing to assign yet");
    }

    #[test]
    fn assign_resurrects_before_filling_from_ready_set() {
        let core = test_core(1024, 128);
        core.ready_set.insert(WorkUnit::new(1, vec!["a".into()]));
        core.ready_set.insert(WorkUnit::new(2, vec!["b".into()]));
        core.aborted_store.insert(64, WorkUnit::new(9, vec!["z".into()]));

        let batch = core.assign(128, Vec::new()).unwrap();
        assert_eq!(batch[0].primary(), 9);
    }

    #[test]
    fn mark_bad_moves_unit_into_aborted_store() {
        let core = test_core(1024, 128);
        let unit = WorkUnit::new(3, vec!["x".into()]);
        core.mark_bad(unit.clone(), 128, false);
        assert_eq!(core.aborted_store.len(), 1);
    }

    #[test]
    fn giveup_tick_sweeps_units_at_total_limit() {
        let core = test_core(256, 64);
        core.aborted_store.insert(256, WorkUnit::new(5, vec!["x".into()]));
        let n = core.giveup_tick().unwrap();
        assert_eq!(n, 1);
        assert!(core.aborted_store.is_empty());
    }

    #[test]
    fn no_more_work_true_only_when_all_stores_drained() {
        let core = test_core(256, 64);
        assert!(core.no_more_work());
        core.ready_set.insert(WorkUnit::new(1, vec![]));
        assert!(!core.no_more_work());
    }
}
