use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dispatch_core::memory_arbiter::Role;
use dispatch_core::{Config, Core, Event, SimpleSchema, StreamObserver};
use tracing::{error, info};

/// Drives an external batch engine across a memory-budgeted worker pool.
#[derive(Parser, Debug)]
#[command(name = "dispatch-cli", about = "Memory-budgeted work-unit dispatcher")]
struct Args {
    /// Optional TOML config file; CLI flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    input: Option<PathBuf>,
    #[arg(long)]
    schema: Option<PathBuf>,
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long = "output-dir")]
    output_dir: Option<PathBuf>,
    #[arg(long = "staging-dir")]
    staging_dir: Option<PathBuf>,
    #[arg(long = "giveup-log")]
    giveup_log: Option<PathBuf>,
    #[arg(long)]
    engine: Option<PathBuf>,
    #[arg(long = "engine-flags")]
    engine_flags: Option<String>,

    #[arg(long)]
    nthreads: Option<usize>,
    #[arg(long = "batch-size")]
    batch_size: Option<u64>,
    #[arg(long = "max-per-template")]
    max_per_template: Option<u64>,
    #[arg(long = "total-memory-mb")]
    total_memory_mb: Option<u64>,
    #[arg(long = "base-memory-mb")]
    base_memory_mb: Option<u64>,
    #[arg(long = "timeout-secs")]
    timeout_secs: Option<u64>,
    #[arg(long = "free-memory-watchdog-kb")]
    free_memory_watchdog_kb: Option<u64>,
}

impl Args {
    fn merge_into(self, mut config: Config) -> Config {
        if let Some(v) = self.input {
            config.input_file = v;
        }
        if let Some(v) = self.schema {
            config.schema_file = v;
        }
        if let Some(v) = self.db {
            config.db_dir = Some(v);
        }
        if let Some(v) = self.output_dir {
            config.output_dir = v;
        }
        if let Some(v) = self.staging_dir {
            config.staging_dir = v;
        }
        if let Some(v) = self.giveup_log {
            config.giveup_log = v;
        }
        if let Some(v) = self.engine {
            config.engine_path = v;
        }
        if let Some(v) = self.engine_flags {
            config.engine_flags = v;
        }
        if let Some(v) = self.nthreads {
            config.nthreads = v;
        }
        if let Some(v) = self.batch_size {
            config.computations_per_process = v;
        }
        if let Some(v) = self.max_per_template {
            config.max_per_template = v;
        }
        if let Some(v) = self.total_memory_mb {
            config.total_memory_limit_mb = v;
        }
        if let Some(v) = self.base_memory_mb {
            config.base_memory_limit_mb = v;
        }
        if let Some(v) = self.timeout_secs {
            config.base_timeout_secs = v;
        }
        if let Some(v) = self.free_memory_watchdog_kb {
            config.free_memory_watchdog_kb = v;
        }
        config
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let base_config = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "failed to load config file");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    let config = args.merge_into(base_config);
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        std::process::exit(1);
    }

    let input_text = match std::fs::read_to_string(&config.input_file) {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, path = %config.input_file.display(), "failed to read input file");
            std::process::exit(1);
        }
    };

    for dir in [&config.output_dir, &config.staging_dir] {
        if let Err(e) = std::fs::create_dir_all(dir) {
            error!(error = %e, path = %dir.display(), "failed to create directory");
            std::process::exit(1);
        }
    }

    let starting_process_id = dispatch_core::dedup::last_used_process_id(&config.output_dir) + 1;
    let nthreads = config.nthreads;

    let probe = dispatch_core::engine::EngineInvoker::new(config.engine_path.clone(), &config.engine_flags);
    let engine_version = probe.version().unwrap_or_else(|e| {
        error!(error = %e, "failed to probe engine version, logging blank version in giveup entries");
        String::new()
    });

    let core = Arc::new(Core::new(
        config,
        Box::new(SimpleSchema),
        Box::new(StreamObserver),
        engine_version,
        starting_process_id,
    ));

    if let Err(e) = core.load_input(&input_text) {
        error!(error = %e, "failed to load input templates");
        std::process::exit(1);
    }

    {
        let core = core.clone();
        ctrlc::set_handler(move || {
            info!("termination requested, shutting down");
            core.terminate();
        })
        .expect("failed to install Ctrl-C handler");
    }

    let ticker_core = core.clone();
    let ticker = std::thread::Builder::new()
        .name("dispatch-ticker".to_string())
        .spawn(move || {
            let mut system = sysinfo::System::new();
            let mut abandoned_total: u64 = 0;
            while !ticker_core.is_terminating() {
                std::thread::sleep(Duration::from_secs(5));
                if let Err(e) = ticker_core.check_out_of_memory(&mut system) {
                    error!(error = %e, "out-of-memory watchdog tripped");
                    break;
                }
                let free_kb = system.available_memory() / 1024;
                ticker_core.observer.on_event(Event::DisplayMemory {
                    total_limit_mb: ticker_core.arbiter.total_limit_mb(),
                    base_limit_mb: ticker_core.arbiter.base_limit_mb(),
                    allocated_mb: ticker_core.arbiter.allocated_mb(),
                    free_kb,
                });
                match ticker_core.giveup_tick() {
                    Ok(n) => abandoned_total += n as u64,
                    Err(e) => error!(error = %e, "giveup sweep failed"),
                }
                ticker_core.observer.on_event(Event::Tick {
                    packed: ticker_core.template_store.size(),
                    unpacked: ticker_core.ready_set.len(),
                    bad: ticker_core.aborted_store.len(),
                    abandoned: abandoned_total as usize,
                });
                if ticker_core.no_more_work() {
                    ticker_core.terminate();
                    break;
                }
            }
        })
        .expect("failed to spawn ticker thread");

    let mut handles = Vec::new();
    for i in 0..nthreads.saturating_sub(1) {
        let core = core.clone();
        handles.push(
            std::thread::Builder::new()
                .name(format!("dispatch-worker-{i}"))
                .spawn(move || dispatch_core::worker::run(core, Role::Normal))
                .expect("failed to spawn worker thread"),
        );
    }
    {
        let core = core.clone();
        handles.push(
            std::thread::Builder::new()
                .name("dispatch-worker-large".to_string())
                .spawn(move || dispatch_core::worker::run(core, Role::Large))
                .expect("failed to spawn large worker thread"),
        );
    }

    for handle in handles {
        let _ = handle.join();
    }
    core.terminate();
    let _ = ticker.join();

    println!(
        "{}",
        serde_json::json!({
            "aborted_summary": core.aborted_store.summary(),
            "giveup_log": core.giveup.path().display().to_string(),
        })
    );
}
