use std::fs::OpenOptions;
use std::io::Write as _;
use std::sync::Arc;

use tracing::{error, warn};

use crate::core::{AssignedBatch, Core};
use crate::engine::EngineOutcome;
use crate::error::DispatchError;
use crate::memory_arbiter::Role;
use crate::observer::Event;
use crate::workunit::WorkUnit;

/// Which way a worker's inner assignment loop ended, driving whether its cap
/// should grow or shrink on the next acquisition.
enum LoopExit {
    RaiseMemory,
    ReduceMemory,
}

/// One pool slot's thread body: acquires a cap, runs the inner
/// acquire-assign-invoke-reconcile loop until it needs to resize, and
/// repeats until the core signals termination. Grounded on the original
/// `WorkerThread::main_loop`/`loop_compute` (see DESIGN.md).
pub fn run(core: Arc<Core>, role: Role) {
    let mut cap_mb = core.acquire(role);
    while cap_mb > 0 {
        core.observer.on_event(Event::ThreadStarted { cap_mb });
        let exit = loop_compute(&core, cap_mb, role);
        core.observer.on_event(Event::ThreadStopped { cap_mb });
        cap_mb = match exit {
            LoopExit::RaiseMemory | LoopExit::ReduceMemory => core.resize(cap_mb, role),
        };
    }
}

fn loop_compute(core: &Core, cap_mb: u64, role: Role) -> LoopExit {
    let mut carry_over: AssignedBatch = Vec::new();
    loop {
        if core.is_terminating() {
            return LoopExit::RaiseMemory;
        }
        let batch = match core.assign(cap_mb, carry_over) {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "assignment failed");
                return LoopExit::RaiseMemory;
            }
        };
        if batch.is_empty() {
            return LoopExit::RaiseMemory;
        }
        core.observer.on_event(Event::ComputationsAdded { n: batch.len(), cap_mb });

        let requested = batch.len();
        let (leftover, timed_out) = match invoke_and_reconcile(core, &batch, cap_mb) {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "engine invocation failed");
                (batch, false)
            }
        };

        if leftover.is_empty() {
            core.observer.on_event(Event::FinishedComputations { n: requested, cap_mb });
            carry_over = Vec::new();
        } else {
            let mut leftover = leftover;
            let bad = leftover.remove(0);
            core.observer.on_event(Event::FinishedComputations {
                n: requested - leftover.len() - 1,
                cap_mb,
            });
            core.mark_bad(bad, cap_mb, timed_out);
            carry_over = leftover;
        }

        if role == Role::Large || core.large_thread(cap_mb) {
            return LoopExit::ReduceMemory;
        }
    }
}

/// Writes the batch to a staging data file, invokes the engine, reconciles
/// the result stream against `batch` by erasing matched units, and appends
/// every raw result line to the process's output file regardless of match.
/// Returns the leftover (unmatched) units plus whether the invocation timed
/// out, so the caller can record an accurate `bad_computation` event.
fn invoke_and_reconcile(
    core: &Core,
    batch: &[WorkUnit],
    cap_mb: u64,
) -> Result<(AssignedBatch, bool), DispatchError> {
    let process_id = core.assign_process_id().to_string();
    let data_file = core.config.staging_dir.join(format!("{process_id}.data"));
    let mut contents = String::new();
    for unit in batch {
        contents.push_str(&unit.to_line());
        contents.push('\n');
    }
    std::fs::write(&data_file, &contents).map_err(|e| DispatchError::io(data_file.display().to_string(), e))?;

    let outcome = core.engine.invoke(
        &process_id,
        &data_file,
        &core.config.output_dir,
        cap_mb,
        core.base_timeout(),
    )?;
    let (result_lines, timed_out) = match outcome {
        EngineOutcome::Completed(lines) => (lines, false),
        EngineOutcome::TimedOut => (Vec::new(), true),
    };

    let output_path = core
        .config
        .output_dir
        .join(format!("{process_id}{}", core.config.work_output_extension));
    let mut output_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&output_path)
        .map_err(|e| DispatchError::io(output_path.display().to_string(), e))?;

    let mut remaining: Vec<WorkUnit> = batch.to_vec();
    for line in &result_lines {
        let primary: Option<i64> = line.split(';').next().and_then(|s| s.parse().ok());
        let found = primary.and_then(|primary| {
            remaining.iter().position(|candidate| {
                candidate.primary() == primary
                    && core
                        .schema
                        .extract_work_unit(line, candidate.secondary().len())
                        .map(|extracted| &extracted == candidate)
                        .unwrap_or(false)
            })
        });
        match found {
            Some(idx) => {
                remaining.remove(idx);
            }
            None => warn!(%line, "cannot find computation for result line"),
        }
        writeln!(output_file, "{line}").map_err(|e| DispatchError::io(output_path.display().to_string(), e))?;
    }

    if core.is_terminating() {
        return Ok((Vec::new(), timed_out));
    }
    Ok((remaining, timed_out))
}
