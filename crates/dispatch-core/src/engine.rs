use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::warn;

use crate::error::DispatchError;

enum LineKind<'a> {
    Line(&'a str),
    Part(&'a str),
    Over,
    Invalid,
}

fn classify(line: &str) -> LineKind<'_> {
    if let Some(rest) = line.strip_prefix("LINE ") {
        LineKind::Line(rest)
    } else if let Some(rest) = line.strip_prefix("PART ") {
        LineKind::Part(rest)
    } else if line.starts_with("OVER") {
        LineKind::Over
    } else {
        LineKind::Invalid
    }
}

/// Accumulates raw engine stdout lines into complete result records per the
/// `LINE`/`PART`/`OVER` grammar. `PART` fragments accumulate until the
/// next `OVER`; unrecognized lines are dropped with a warning.
#[derive(Default)]
pub struct LineGrammarAccumulator {
    lines: Vec<String>,
    pending: String,
}

impl LineGrammarAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, line: &str) {
        match classify(line) {
            LineKind::Line(payload) => self.lines.push(payload.to_string()),
            LineKind::Part(fragment) => self.pending.push_str(fragment),
            LineKind::Over => {
                self.lines.push(std::mem::take(&mut self.pending));
            }
            LineKind::Invalid => {
                if !line.is_empty() {
                    warn!(%line, "unrecognized engine result line");
                }
            }
        }
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

/// Registry of in-flight child processes, so a cooperative shutdown can
/// terminate every running engine invocation without the memory arbiter or
/// the work stores ever touching an OS process directly.
#[derive(Clone, Default)]
pub struct TrackedProcesses {
    children: Arc<Mutex<Vec<Arc<Mutex<Child>>>>>,
}

impl TrackedProcesses {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, child: Arc<Mutex<Child>>) {
        self.children.lock().unwrap().push(child);
    }

    fn remove(&self, child: &Arc<Mutex<Child>>) {
        self.children.lock().unwrap().retain(|c| !Arc::ptr_eq(c, child));
    }

    /// Sends a kill signal to every tracked child and clears the registry.
    pub fn terminate_all(&self) {
        let mut guard = self.children.lock().unwrap();
        for child in guard.drain(..) {
            let _ = child.lock().unwrap().kill();
        }
    }

    pub fn running(&self) -> usize {
        self.children.lock().unwrap().len()
    }
}

/// Outcome of one engine invocation: either it completed and handed back its
/// parsed result lines, or it overran its timeout and was killed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutcome {
    Completed(Vec<String>),
    TimedOut,
}

/// Owns invocation of the external engine binary: builds the command line,
/// enforces a per-call timeout by killing the child if it overruns, and
/// parses stdout via [`LineGrammarAccumulator`].
pub struct EngineInvoker {
    engine_path: PathBuf,
    extra_flags: Vec<String>,
    processes: TrackedProcesses,
}

impl EngineInvoker {
    pub fn new(engine_path: PathBuf, extra_flags: &str) -> Self {
        EngineInvoker {
            engine_path,
            extra_flags: extra_flags.split_whitespace().map(str::to_string).collect(),
            processes: TrackedProcesses::new(),
        }
    }

    pub fn processes(&self) -> &TrackedProcesses {
        &self.processes
    }

    fn build_command(&self, cap_mb: u64, output_dir: &Path, process_id: &str, data_file: &Path) -> Command {
        let mut cmd = Command::new(&self.engine_path);
        cmd.arg("-b")
            .arg(format!("megabytes:={cap_mb}"))
            .arg(format!("outputPath:={}", output_dir.display()))
            .arg(format!("processId:={process_id}"))
            .arg(format!("dataFile:={}", data_file.display()));
        for flag in &self.extra_flags {
            cmd.arg(flag);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        cmd
    }

    /// Invokes the engine against `data_file`, returning the parsed result
    /// lines on normal completion or `EngineOutcome::TimedOut` if the
    /// invocation overran its deadline and had to be killed.
    pub fn invoke(
        &self,
        process_id: &str,
        data_file: &Path,
        output_dir: &Path,
        cap_mb: u64,
        timeout: Option<Duration>,
    ) -> Result<EngineOutcome, DispatchError> {
        let mut cmd = self.build_command(cap_mb, output_dir, process_id, data_file);
        let mut child = cmd
            .spawn()
            .map_err(|e| DispatchError::EngineFailure(format!("failed to spawn engine: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DispatchError::EngineFailure("engine child has no stdout".into()))?;

        let child = Arc::new(Mutex::new(child));
        self.processes.add(child.clone());

        let (tx, rx) = mpsc::channel();
        let waiter_child = child.clone();
        let _handle = std::thread::Builder::new()
            .name(format!("dispatch-engine-{process_id}"))
            .spawn(move || {
                let mut accumulator = LineGrammarAccumulator::new();
                let reader = BufReader::new(stdout);
                for line in reader.lines().map_while(|l| l.ok()) {
                    accumulator.feed(&line);
                }
                let _ = waiter_child.lock().unwrap().wait();
                let _ = tx.send(accumulator.into_lines());
            })
            .map_err(|e| DispatchError::EngineFailure(format!("failed to spawn reader thread: {e}")))?;

        let result = match timeout {
            Some(t) => match rx.recv_timeout(t) {
                Ok(lines) => Some(lines),
                Err(_) => None,
            },
            None => rx.recv().ok(),
        };

        self.processes.remove(&child);
        match result {
            Some(lines) => Ok(EngineOutcome::Completed(lines)),
            None => {
                let _ = child.lock().unwrap().kill();
                Ok(EngineOutcome::TimedOut)
            }
        }
    }

    /// One-shot version-string capture: invokes the engine with
    /// `printVersion:=true` and returns the last non-empty stdout line.
    pub fn version(&self) -> Result<String, DispatchError> {
        let mut cmd = Command::new(&self.engine_path);
        cmd.arg("-b").arg("printVersion:=true");
        for flag in &self.extra_flags {
            cmd.arg(flag);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let output = cmd
            .output()
            .map_err(|e| DispatchError::EngineFailure(format!("failed to probe engine version: {e}")))?;
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text.lines().filter(|l| !l.is_empty()).last().unwrap_or("").to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_handles_line_part_over_and_invalid() {
        let mut acc = LineGrammarAccumulator::new();
        acc.feed("LINE full-record");
        acc.feed("PART fragment-a-");
        acc.feed("PART fragment-b");
        acc.feed("OVER");
        acc.feed("garbage");
        let lines = acc.into_lines();
        assert_eq!(lines, vec!["full-record", "fragment-a-fragment-b"]);
    }

    #[test]
    fn invoke_with_real_echo_like_binary_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let data_file = dir.path().join("data.txt");
        std::fs::write(&data_file, "1;a\n").unwrap();

        let script = dir.path().join("fake_engine.sh");
        std::fs::write(&script, "#!/bin/sh\necho 'LINE 1;a;done'\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script, perms).unwrap();
        }

        let invoker = EngineInvoker::new(script, "");
        let outcome = invoker
            .invoke("1", &data_file, dir.path(), 128, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(outcome, EngineOutcome::Completed(vec!["1;a;done".to_string()]));
        assert_eq!(invoker.processes().running(), 0);
    }

    #[test]
    fn invoke_kills_child_on_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let data_file = dir.path().join("data.txt");
        std::fs::write(&data_file, "1;a\n").unwrap();

        let script = dir.path().join("slow_engine.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 5\necho 'LINE never'\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script, perms).unwrap();
        }

        let invoker = EngineInvoker::new(script, "");
        let outcome = invoker
            .invoke("2", &data_file, dir.path(), 128, Some(Duration::from_millis(100)))
            .unwrap();
        assert_eq!(outcome, EngineOutcome::TimedOut);
    }
}
