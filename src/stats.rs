//! End-of-run statistics and the sinks that persist them.

use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::error::Result;

/// Aggregate figures for one dispatch run, written once after the control loop ends.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunStats {
    pub total_tasks: usize,
    /// Assignments delivered, re-dispatches included.
    pub dispatched: u64,
    pub requeued: u64,
    /// Tasks whose holder asked for more work afterwards.
    pub implicit_completions: u64,
    /// Tasks still queued at termination.
    pub unexecuted: usize,
    pub workers_finished: usize,
    pub workers_dead: usize,
    pub elapsed_ms: f64,
    pub throughput_tasks_per_s: f64,
    pub cpu_user_s: Option<f64>,
    pub cpu_sys_s: Option<f64>,
}

impl RunStats {
    pub fn throughput(completed: u64, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 { completed as f64 / secs } else { 0.0 }
    }

    /// Plain `key: value` rendering used by the text sink.
    pub fn to_text(&self) -> String {
        let cpu = |v: Option<f64>| v.map(|v| format!("{v:.4}")).unwrap_or_else(|| "NA".to_string());
        let mut out = String::new();
        let _ = writeln!(out, "total_tasks: {}", self.total_tasks);
        let _ = writeln!(out, "dispatched: {}", self.dispatched);
        let _ = writeln!(out, "requeued: {}", self.requeued);
        let _ = writeln!(out, "implicit_completions: {}", self.implicit_completions);
        let _ = writeln!(out, "unexecuted: {}", self.unexecuted);
        let _ = writeln!(out, "workers_finished: {}", self.workers_finished);
        let _ = writeln!(out, "workers_dead: {}", self.workers_dead);
        let _ = writeln!(out, "elapsed_s: {:.2}", self.elapsed_ms / 1000.0);
        let _ = writeln!(out, "throughput_tasks_per_s: {:.2}", self.throughput_tasks_per_s);
        let _ = writeln!(out, "cpu_user_s: {}", cpu(self.cpu_user_s));
        let _ = writeln!(out, "cpu_sys_s: {}", cpu(self.cpu_sys_s));
        out
    }
}

/// Process CPU user/system time in seconds, sampled at start and end of a run.
#[derive(Clone, Copy, Debug)]
pub struct CpuSample {
    user: f64,
    sys: f64,
}

impl CpuSample {
    /// Best-effort snapshot; `None` where the platform offers no `getrusage`.
    #[cfg(unix)]
    pub fn now() -> Option<Self> {
        // SAFETY: rusage is plain old data and getrusage only writes into it.
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
        if rc != 0 {
            return None;
        }
        let user = usage.ru_utime.tv_sec as f64 + (usage.ru_utime.tv_usec as f64 / 1_000_000.0);
        let sys = usage.ru_stime.tv_sec as f64 + (usage.ru_stime.tv_usec as f64 / 1_000_000.0);
        Some(Self { user, sys })
    }

    #[cfg(not(unix))]
    pub fn now() -> Option<Self> {
        None
    }

    /// User and system seconds elapsed between two samples.
    pub fn delta(start: Option<Self>, end: Option<Self>) -> (Option<f64>, Option<f64>) {
        match (start, end) {
            (Some(start), Some(end)) => (Some(end.user - start.user), Some(end.sys - start.sys)),
            _ => (None, None),
        }
    }
}

/// Destination for the final statistics.
pub trait StatsSink {
    fn persist(&self, stats: &RunStats) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum StatsFormat {
    #[default]
    Text,
    Json,
}

/// Writes the statistics to a file, replacing any previous contents.
pub struct FileStatsSink {
    path: PathBuf,
    format: StatsFormat,
}

impl FileStatsSink {
    pub fn new(path: impl Into<PathBuf>, format: StatsFormat) -> Self {
        Self {
            path: path.into(),
            format,
        }
    }
}

impl StatsSink for FileStatsSink {
    fn persist(&self, stats: &RunStats) -> Result<()> {
        let body = match self.format {
            StatsFormat::Text => stats.to_text(),
            StatsFormat::Json => serde_json::to_string_pretty(stats)? + "\n",
        };
        fs::write(&self.path, body)?;
        info!(path = %self.path.display(), "statistics written");
        Ok(())
    }
}

/// Emits the statistics as a single log event.
pub struct LogStatsSink;

impl StatsSink for LogStatsSink {
    fn persist(&self, stats: &RunStats) -> Result<()> {
        info!(
            total_tasks = stats.total_tasks,
            dispatched = stats.dispatched,
            requeued = stats.requeued,
            unexecuted = stats.unexecuted,
            workers_dead = stats.workers_dead,
            elapsed_ms = stats.elapsed_ms,
            throughput = stats.throughput_tasks_per_s,
            "run statistics"
        );
        Ok(())
    }
}

/// Keeps persisted statistics in memory; for embedding and tests.
#[derive(Default)]
pub struct MemoryStatsSink {
    persisted: Mutex<Vec<RunStats>>,
}

impl MemoryStatsSink {
    pub fn persisted(&self) -> Vec<RunStats> {
        self.persisted
            .lock()
            .expect("stats sink mutex poisoned")
            .clone()
    }
}

impl StatsSink for MemoryStatsSink {
    fn persist(&self, stats: &RunStats) -> Result<()> {
        self.persisted
            .lock()
            .expect("stats sink mutex poisoned")
            .push(stats.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RunStats {
        RunStats {
            total_tasks: 4,
            dispatched: 5,
            requeued: 1,
            implicit_completions: 4,
            unexecuted: 0,
            workers_finished: 2,
            workers_dead: 1,
            elapsed_ms: 2000.0,
            throughput_tasks_per_s: 2.0,
            cpu_user_s: None,
            cpu_sys_s: Some(0.5),
        }
    }

    #[test]
    fn throughput_handles_zero_elapsed() {
        assert_eq!(RunStats::throughput(10, Duration::ZERO), 0.0);
        assert_eq!(RunStats::throughput(10, Duration::from_secs(2)), 5.0);
    }

    #[test]
    fn text_sink_writes_key_value_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stats.txt");
        FileStatsSink::new(&path, StatsFormat::Text)
            .persist(&sample())
            .expect("persist");
        let text = fs::read_to_string(&path).expect("read stats");
        assert!(text.contains("requeued: 1\n"));
        assert!(text.contains("elapsed_s: 2.00\n"));
        assert!(text.contains("cpu_user_s: NA\n"));
        assert!(text.contains("cpu_sys_s: 0.5000\n"));
    }

    #[test]
    fn json_sink_writes_null_for_missing_cpu() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stats.json");
        FileStatsSink::new(&path, StatsFormat::Json)
            .persist(&sample())
            .expect("persist");
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(value["workers_dead"], 1);
        assert_eq!(value["cpu_user_s"], serde_json::Value::Null);
    }

    #[test]
    fn unwritable_path_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = FileStatsSink::new(dir.path().join("no/such/dir/stats.txt"), StatsFormat::Text);
        assert!(sink.persist(&sample()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn cpu_delta_is_non_negative() {
        let start = CpuSample::now();
        let end = CpuSample::now();
        let (user, sys) = CpuSample::delta(start, end);
        assert!(user.expect("user time") >= 0.0);
        assert!(sys.expect("sys time") >= 0.0);
    }
}
