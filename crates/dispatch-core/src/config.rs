use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::DispatchError;

/// Typed, serde-backed settings for a dispatcher run. Loaded once from an
/// optional TOML file and then overlaid with CLI overrides (CLI wins).
/// Defaults mirror the original tool's `ComputationParameters`/
/// `ScriptParameters`/`CommunicationParameters` command-line defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Number of worker threads, including the one large-memory worker.
    pub nthreads: usize,
    /// Target work units assigned per engine invocation (before large-thread
    /// and low-remaining-work adjustments).
    pub computations_per_process: u64,
    /// Cardinality above which a loaded template is split.
    pub max_per_template: u64,
    /// High-water mark for unpacking: ready set grows to at most this size
    /// per unpack pass.
    pub unpack_high_water: u64,
    /// Total memory budget across all workers, in megabytes.
    pub total_memory_limit_mb: u64,
    /// Per-thread baseline memory allocation, in megabytes.
    pub base_memory_limit_mb: u64,
    /// Engine invocation timeout in seconds; `0` means no timeout.
    pub base_timeout_secs: u64,
    /// Free-system-memory watchdog threshold in KB; `0` disables it.
    pub free_memory_watchdog_kb: u64,

    pub input_file: PathBuf,
    pub schema_file: PathBuf,
    pub db_dir: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub giveup_log: PathBuf,

    pub engine_path: PathBuf,
    pub engine_flags: String,
    pub work_output_extension: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            nthreads: 10,
            computations_per_process: 100,
            max_per_template: 512 * 1024,
            unpack_high_water: 1024 * 1024,
            total_memory_limit_mb: 4 * 1024,
            base_memory_limit_mb: 128,
            base_timeout_secs: 0,
            free_memory_watchdog_kb: 0,
            input_file: PathBuf::new(),
            schema_file: PathBuf::new(),
            db_dir: None,
            output_dir: PathBuf::from("."),
            staging_dir: PathBuf::from("."),
            giveup_log: PathBuf::from("valhalla.log"),
            engine_path: PathBuf::new(),
            engine_flags: String::new(),
            work_output_extension: ".out".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Config, DispatchError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| DispatchError::io(path.display().to_string(), e))?;
        let config: Config = toml::from_str(&text)
            .map_err(|e| DispatchError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.nthreads == 0 {
            return Err(DispatchError::Config("nthreads must be >= 1".into()));
        }
        if self.base_memory_limit_mb > self.total_memory_limit_mb {
            return Err(DispatchError::Config(
                "base_memory_limit_mb must not exceed total_memory_limit_mb".into(),
            ));
        }
        if self.input_file.as_os_str().is_empty() {
            return Err(DispatchError::Config("input_file is required".into()));
        }
        Ok(())
    }
}
