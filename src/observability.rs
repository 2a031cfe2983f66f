//! Job log sinks.
//!
//! The pipeline writes one line per stage transition plus one line with the geometry tool's
//! exit code and output. Where those lines go is up to the caller: memory, a file, `tracing`,
//! or several of these at once.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Append-only sink for job log lines.
pub trait JobLog: Send + Sync {
    /// Append one line. Sinks must not fail the run; write errors are swallowed.
    fn append(&self, line: &str);
}

/// Keeps lines in memory; useful for tests and for returning the log to a caller.
#[derive(Debug, Default)]
pub struct MemoryJobLog {
    lines: Mutex<Vec<String>>,
}

impl MemoryJobLog {
    /// Copy of all lines appended so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Whether any line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines
            .lock()
            .map(|l| l.iter().any(|line| line.contains(needle)))
            .unwrap_or(false)
    }
}

impl JobLog for MemoryJobLog {
    fn append(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}

/// Forwards job lines to `tracing` at info level.
#[derive(Debug, Default)]
pub struct TracingJobLog;

impl JobLog for TracingJobLog {
    fn append(&self, line: &str) {
        tracing::info!(target: "geo_ingest::job", "{line}");
    }
}

/// Appends job lines to a local file, each prefixed with a unix timestamp.
#[derive(Debug)]
pub struct FileJobLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileJobLog {
    /// Create a sink that appends to `path`.
    ///
    /// Writes are best-effort; failures to open/write the log file are ignored.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }
}

impl JobLog for FileJobLog {
    fn append(&self, line: &str) {
        let _guard = self.lock.lock().ok();
        if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(&self.path) {
            let _ = writeln!(f, "{} {line}", unix_ts());
        }
    }
}

/// Fans lines out to several sinks.
#[derive(Default)]
pub struct CompositeJobLog {
    logs: Vec<Arc<dyn JobLog>>,
}

impl CompositeJobLog {
    pub fn new(logs: Vec<Arc<dyn JobLog>>) -> Self {
        Self { logs }
    }
}

impl fmt::Debug for CompositeJobLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeJobLog")
            .field("logs_len", &self.logs.len())
            .finish()
    }
}

impl JobLog for CompositeJobLog {
    fn append(&self, line: &str) {
        for log in &self.logs {
            log.append(line);
        }
    }
}

fn unix_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_fans_out_to_every_sink() {
        let a = Arc::new(MemoryJobLog::default());
        let b = Arc::new(MemoryJobLog::default());
        let composite = CompositeJobLog::new(vec![a.clone(), b.clone()]);
        composite.append("stage normalize started");
        assert_eq!(a.lines(), b.lines());
        assert!(a.contains("normalize"));
    }

    #[test]
    fn file_log_appends_timestamped_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.log");
        let log = FileJobLog::new(&path);
        log.append("first");
        log.append("second");
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" first"));
        assert!(lines[1].ends_with(" second"));
    }
}
