use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::aborted_store::AbortedStore;
use crate::error::DispatchError;
use crate::workunit::WorkUnit;

/// Appends permanently-failed work units to the "valhalla" giveup log and
/// removes them from the [`AbortedStore`]. A unit reaches here only once its
/// failure cap reaches the total memory budget.
pub struct GiveupWriter {
    path: PathBuf,
    // Serializes writers; the log is append-only and line order only needs
    // to reflect insertion order, not a global total order.
    lock: Mutex<()>,
}

impl GiveupWriter {
    pub fn new(path: PathBuf) -> Self {
        GiveupWriter {
            path,
            lock: Mutex::new(()),
        }
    }

    fn append_line(&self, unit: &WorkUnit, cap_mb: u64, engine_version: &str) -> Result<(), DispatchError> {
        let _guard = self.lock.lock().unwrap();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| DispatchError::io(self.path.display().to_string(), e))?;
        writeln!(file, "{};{};{}", unit.to_line(), cap_mb, engine_version)
            .map_err(|e| DispatchError::io(self.path.display().to_string(), e))
    }

    /// Drains every unit whose failure cap is `>= total_limit_mb` from
    /// `aborted` and appends it to the log. Returns the count written.
    pub fn sweep(
        &self,
        aborted: &AbortedStore,
        total_limit_mb: u64,
        engine_version: &str,
    ) -> Result<usize, DispatchError> {
        let units = aborted.drain_at_or_above(total_limit_mb);
        for unit in &units {
            self.append_line(unit, total_limit_mb, engine_version)?;
        }
        Ok(units.len())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_writes_and_drains_units_at_or_above_cap() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("valhalla.log");
        let writer = GiveupWriter::new(log_path.clone());
        let aborted = AbortedStore::new();
        aborted.insert(1024, WorkUnit::new(1, vec!["x".into()]));
        aborted.insert(512, WorkUnit::new(2, vec!["y".into()]));

        let written = writer.sweep(&aborted, 1024, "v1.2").unwrap();
        assert_eq!(written, 1);
        assert!(aborted.is_empty());

        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(contents.trim(), "1;x;1024;v1.2");
    }

    #[test]
    fn sweep_is_noop_when_nothing_qualifies() {
        let dir = tempfile::tempdir().unwrap();
        let writer = GiveupWriter::new(dir.path().join("valhalla.log"));
        let aborted = AbortedStore::new();
        aborted.insert(128, WorkUnit::new(1, vec![]));
        let written = writer.sweep(&aborted, 1024, "v1").unwrap();
        assert_eq!(written, 0);
        assert_eq!(aborted.len(), 1);
    }
}
