use std::path::PathBuf;
use std::time::Duration;

use dispatch_core::config::Config;
use dispatch_core::core::Core;
use dispatch_core::engine::EngineOutcome;
use dispatch_core::memory_arbiter::Role;
use dispatch_core::observer::{BufferedObserver, NullObserver};
use dispatch_core::schema::SimpleSchema;
use dispatch_core::workunit::WorkUnit;

fn fake_engine(dir: &std::path::Path, body: &str) -> PathBuf {
    let path = dir.join("fake_engine.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
    }
    path
}

fn base_config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.input_file = PathBuf::from("in.csv");
    config.staging_dir = dir.to_path_buf();
    config.output_dir = dir.to_path_buf();
    config.giveup_log = dir.join("valhalla.log");
    config.nthreads = 1;
    config.computations_per_process = 10;
    config.max_per_template = 10_000;
    config.unpack_high_water = 10_000;
    config.total_memory_limit_mb = 1024;
    config.base_memory_limit_mb = 128;
    config
}

/// Loading a template, assigning it out, invoking a real (scripted) engine,
/// reconciling the leftover into the aborted store and sweeping it into the
/// giveup log once its cap reaches the total budget — exercised end to end
/// across template_store, ready_set, aborted_store, engine and giveup
/// without any single module mocked out.
#[test]
fn full_lifecycle_from_load_to_giveup() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.engine_path = fake_engine(dir.path(), "echo 'LINE 1;a;1'");

    let observer = BufferedObserver::new();
    let core = Core::new(config, Box::new(SimpleSchema), Box::new(observer), "v-test".into(), 1);

    core.load_input("1;a;1..2\n").unwrap();
    let batch = core.assign(128, Vec::new()).unwrap();
    assert_eq!(batch.len(), 2, "literal x two-value range template expands to two units");

    let process_id = core.assign_process_id().to_string();
    let data_file = core.config.staging_dir.join(format!("{process_id}.data"));
    let mut contents = String::new();
    for unit in &batch {
        contents.push_str(&unit.to_line());
        contents.push('\n');
    }
    std::fs::write(&data_file, contents).unwrap();

    let outcome = core
        .engine
        .invoke(&process_id, &data_file, &core.config.output_dir, 128, core.base_timeout())
        .unwrap();
    let lines = match outcome {
        EngineOutcome::Completed(lines) => lines,
        EngineOutcome::TimedOut => panic!("engine invocation unexpectedly timed out"),
    };
    assert_eq!(lines, vec!["1;a;1"]);

    let matched = WorkUnit::new(1, vec!["a".into(), "1".into()]);
    let leftover: Vec<WorkUnit> = batch.into_iter().filter(|u| u != &matched).collect();
    assert_eq!(leftover.len(), 1);
    core.mark_bad(leftover[0].clone(), 128, false);
    assert_eq!(core.aborted_store.len(), 1);

    // Bump the failure cap straight to the total budget and sweep: the unit
    // should be written to the giveup log and removed from the store.
    core.aborted_store.insert(1024, core.aborted_store.extract_below(u64::MAX, 1).remove(0));
    let given_up = core.giveup_tick().unwrap();
    assert_eq!(given_up, 1);
    assert!(core.aborted_store.is_empty());
    let log = std::fs::read_to_string(core.giveup.path()).unwrap();
    assert!(log.contains("v-test"));
}

/// No more work is reported only once every store is actually drained, and
/// never while the dispatcher is mid-flight with ready or aborted units.
#[test]
fn no_more_work_reflects_every_store() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.computations_per_process = 1;
    let core = Core::new(config, Box::new(SimpleSchema), Box::new(NullObserver), "v1".into(), 1);

    assert!(core.no_more_work());
    core.load_input("1;a;1..3\n").unwrap();
    let batch = core.assign(128, Vec::new()).unwrap();
    assert!(!core.no_more_work());

    core.mark_bad(batch[0].clone(), 128, false);
    assert!(!core.no_more_work(), "aborted store still holds a unit");

    core.aborted_store.extract_below(u64::MAX, core.aborted_store.len());
    assert!(core.aborted_store.is_empty());
    assert!(!core.no_more_work(), "ready set still holds the rest of the template's expansion");

    core.ready_set.take(core.ready_set.len());
    assert!(core.no_more_work());
}

/// Terminating the core makes every further memory acquisition return zero
/// immediately, matching the "stop handing out new work" contract workers
/// rely on to exit their loop.
#[test]
fn termination_stops_future_acquisitions() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(dir.path());
    let core = Core::new(config, Box::new(SimpleSchema), Box::new(NullObserver), "v1".into(), 1);

    let cap = core.acquire(Role::Normal);
    assert!(cap > 0);
    core.release(cap);

    core.terminate();
    assert!(core.is_terminating());
    assert_eq!(core.acquire(Role::Normal), 0);
}

/// An engine invocation that overruns its timeout yields a typed timeout
/// outcome rather than an error, and leaves every unit in the batch to be
/// marked bad by the caller on the next pass.
#[test]
fn engine_timeout_yields_timed_out_outcome_not_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.engine_path = fake_engine(dir.path(), "sleep 5\necho 'LINE never'");

    let core = Core::new(config, Box::new(SimpleSchema), Box::new(NullObserver), "v1".into(), 1);
    let data_file = core.config.staging_dir.join("1.data");
    std::fs::write(&data_file, "1;a\n").unwrap();

    let outcome = core
        .engine
        .invoke("1", &data_file, &core.config.output_dir, 128, Some(Duration::from_millis(200)))
        .unwrap();
    assert_eq!(outcome, EngineOutcome::TimedOut);
}
