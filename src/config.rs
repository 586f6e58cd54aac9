//! Command-line arguments and validated runtime configuration.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::error::{ConfigError, DispatchError};
use crate::liveness::SweepPolicy;
use crate::stats::StatsFormat;
use crate::types::{TaskManifest, TaskRef, WorkerId};
use crate::worker::{FaultMode, FaultPlan};

/// Default heartbeat period.
pub const HEARTBEAT_INTERVAL_MS: u64 = 1000;
/// Consecutive missed heartbeats before a worker is presumed dead.
pub const MAX_MISSED: u32 = 3;
/// Upper bound on one control-loop wait.
pub const POLL_INTERVAL_MS: u64 = 10;

/// Fault-tolerant task dispatch across a pool of workers
#[derive(Parser, Debug, Clone)]
#[command(
    name = "fleet_dispatch",
    version,
    about = "Fault-tolerant master/worker task dispatch",
    after_help = "EXAMPLES:\n    \
        fleet_dispatch demo\n    \
        fleet_dispatch run --tasks 200 -w 8 --work-ms 20 --stats stats.txt\n    \
        fleet_dispatch run --manifest inputs.txt --exec ./filter --output-dir out\n    \
        fleet_dispatch run --tasks 50 -w 4 --fault 1:3:crash --fault 2:5:hang=4000"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Debug-level logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Small run where one worker crashes mid-task (default)
    Demo,
    /// Dispatch a task list across a worker pool
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Dispatch N synthetic tasks
    #[arg(long, value_name = "N", conflicts_with = "manifest")]
    pub tasks: Option<usize>,

    /// File with one input reference per line (blank lines and '#' comments skipped)
    #[arg(long, value_name = "FILE")]
    pub manifest: Option<PathBuf>,

    /// Number of worker agents
    #[arg(short = 'w', long, default_value_t = 4, value_name = "NUM")]
    pub workers: usize,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value_t = HEARTBEAT_INTERVAL_MS, value_name = "MS")]
    pub heartbeat_ms: u64,

    /// Missed heartbeats before a worker is presumed dead
    #[arg(long, default_value_t = MAX_MISSED, value_name = "NUM")]
    pub max_missed: u32,

    /// Upper bound on one coordinator wait in milliseconds
    #[arg(long, default_value_t = POLL_INTERVAL_MS, value_name = "MS")]
    pub poll_ms: u64,

    /// Also sweep idle workers for missed heartbeats
    #[arg(long)]
    pub sweep_idle: bool,

    /// Simulated work per task in milliseconds (ignored with --exec)
    #[arg(long, default_value_t = 50, value_name = "MS")]
    pub work_ms: u64,

    /// Program run once per task as `<PROGRAM> [ARGS..] <task> <input>`
    #[arg(long, value_name = "PROGRAM")]
    pub exec: Option<String>,

    /// Extra leading argument for --exec (repeatable)
    #[arg(long = "exec-arg", value_name = "ARG", action = clap::ArgAction::Append, allow_hyphen_values = true, requires = "exec")]
    pub exec_args: Vec<String>,

    /// Directory for executor output
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Write final statistics to FILE
    #[arg(long, value_name = "FILE")]
    pub stats: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = StatsFormat::Text)]
    pub stats_format: StatsFormat,

    /// Inject a fault: WORKER:AFTER:crash or WORKER:AFTER:hang=MS (repeatable)
    #[arg(long = "fault", value_name = "SPEC", action = clap::ArgAction::Append)]
    pub faults: Vec<String>,
}

/// Liveness and polling knobs shared by the coordinator and workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timing {
    pub heartbeat_interval: Duration,
    pub max_missed: u32,
    pub poll_interval: Duration,
    pub sweep_idle: bool,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            max_missed: MAX_MISSED,
            poll_interval: Duration::from_millis(POLL_INTERVAL_MS),
            sweep_idle: false,
        }
    }
}

impl Timing {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroHeartbeat);
        }
        if self.max_missed == 0 {
            return Err(ConfigError::ZeroMaxMissed);
        }
        if self.poll_interval >= self.heartbeat_interval {
            return Err(ConfigError::PollTooSlow {
                poll_ms: self.poll_interval.as_millis() as u64,
                heartbeat_ms: self.heartbeat_interval.as_millis() as u64,
            });
        }
        Ok(())
    }

    pub fn sweep_policy(&self) -> SweepPolicy {
        SweepPolicy {
            heartbeat_interval: self.heartbeat_interval,
            max_missed: self.max_missed,
            include_idle: self.sweep_idle,
        }
    }

    /// Worst-case delay between a worker's last heartbeat and its presumed death.
    pub fn detection_bound(&self) -> Duration {
        self.heartbeat_interval * self.max_missed + self.poll_interval
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskSource {
    Synthetic(usize),
    Manifest(PathBuf),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutorChoice {
    Simulated { work: Duration },
    Command { program: String, args: Vec<String> },
}

/// Validated configuration for a `run`.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub workers: usize,
    pub timing: Timing,
    pub tasks: TaskSource,
    pub executor: ExecutorChoice,
    pub output_dir: Option<PathBuf>,
    pub stats_path: Option<PathBuf>,
    pub stats_format: StatsFormat,
    pub faults: BTreeMap<WorkerId, FaultPlan>,
}

impl DispatchConfig {
    pub fn from_args(args: RunArgs) -> Result<Self, ConfigError> {
        if args.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        let timing = Timing {
            heartbeat_interval: Duration::from_millis(args.heartbeat_ms),
            max_missed: args.max_missed,
            poll_interval: Duration::from_millis(args.poll_ms),
            sweep_idle: args.sweep_idle,
        };
        timing.validate()?;

        let tasks = match (args.tasks, args.manifest) {
            (Some(count), _) => TaskSource::Synthetic(count),
            (None, Some(path)) => TaskSource::Manifest(path),
            (None, None) => return Err(ConfigError::NoTaskSource),
        };

        let executor = match args.exec {
            Some(program) => ExecutorChoice::Command {
                program,
                args: args.exec_args,
            },
            None => ExecutorChoice::Simulated {
                work: Duration::from_millis(args.work_ms),
            },
        };

        let mut faults = BTreeMap::new();
        for spec in &args.faults {
            let (worker, plan) = parse_fault(spec)?;
            if worker >= args.workers as WorkerId {
                return Err(ConfigError::FaultOutOfRange {
                    worker,
                    workers: args.workers,
                });
            }
            faults.insert(worker, plan);
        }

        Ok(Self {
            workers: args.workers,
            timing,
            tasks,
            executor,
            output_dir: args.output_dir,
            stats_path: args.stats,
            stats_format: args.stats_format,
            faults,
        })
    }

    /// Obtain the initial task list; failure here is fatal.
    pub fn load_manifest(&self) -> Result<TaskManifest, DispatchError> {
        match &self.tasks {
            TaskSource::Synthetic(count) => Ok(TaskManifest::synthetic(*count)),
            TaskSource::Manifest(path) => read_manifest(path),
        }
    }
}

/// Parse `WORKER:AFTER:crash` or `WORKER:AFTER:hang=MS`.
pub fn parse_fault(spec: &str) -> Result<(WorkerId, FaultPlan), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidFault {
        spec: spec.to_string(),
        reason: reason.to_string(),
    };
    let mut parts = spec.splitn(3, ':');
    let (Some(worker), Some(after), Some(mode)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(invalid("expected WORKER:AFTER:MODE"));
    };
    let worker = worker
        .trim()
        .parse::<WorkerId>()
        .map_err(|_| invalid("worker must be a non-negative integer"))?;
    let after_tasks = after
        .trim()
        .parse::<usize>()
        .map_err(|_| invalid("AFTER must be a non-negative integer"))?;
    let mode = match mode.trim() {
        "crash" => FaultMode::Crash,
        other => match other.strip_prefix("hang=") {
            Some(ms) => FaultMode::Hang(Duration::from_millis(
                ms.parse::<u64>()
                    .map_err(|_| invalid("hang duration must be milliseconds"))?,
            )),
            None => return Err(invalid("mode must be 'crash' or 'hang=MS'")),
        },
    };
    Ok((worker, FaultPlan { after_tasks, mode }))
}

/// Read one input reference per line, skipping blank lines and `#` comments.
pub fn read_manifest(path: &Path) -> Result<TaskManifest, DispatchError> {
    let text = fs::read_to_string(path).map_err(|source| DispatchError::Manifest {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(TaskManifest::new(
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(TaskRef::new),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(extra: &[&str]) -> RunArgs {
        let argv = ["fleet_dispatch", "run"].into_iter().chain(extra.iter().copied());
        match Cli::try_parse_from(argv).expect("parse").command {
            Some(Command::Run(args)) => args,
            other => panic!("expected run command, got {other:?}"),
        }
    }

    #[test]
    fn defaults_match_protocol_constants() {
        let config = DispatchConfig::from_args(run_args(&["--tasks", "5"])).expect("config");
        assert_eq!(config.timing, Timing::default());
        assert_eq!(config.timing.max_missed, 3);
        assert_eq!(config.workers, 4);
        assert_eq!(config.tasks, TaskSource::Synthetic(5));
        assert_eq!(
            config.executor,
            ExecutorChoice::Simulated {
                work: Duration::from_millis(50)
            }
        );
    }

    #[test]
    fn no_subcommand_means_demo() {
        let cli = Cli::try_parse_from(["fleet_dispatch"]).expect("parse");
        assert!(cli.command.is_none());
    }

    #[test]
    fn rejects_zero_workers_and_bad_timing() {
        let err = DispatchConfig::from_args(run_args(&["--tasks", "1", "-w", "0"])).unwrap_err();
        assert_eq!(err, ConfigError::NoWorkers);
        let err = DispatchConfig::from_args(run_args(&["--tasks", "1", "--max-missed", "0"])).unwrap_err();
        assert_eq!(err, ConfigError::ZeroMaxMissed);
        let err = DispatchConfig::from_args(run_args(&["--tasks", "1", "--heartbeat-ms", "10", "--poll-ms", "10"]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::PollTooSlow { .. }));
    }

    #[test]
    fn requires_a_task_source() {
        let err = DispatchConfig::from_args(run_args(&[])).unwrap_err();
        assert_eq!(err, ConfigError::NoTaskSource);
    }

    #[test]
    fn tasks_and_manifest_conflict() {
        let result = Cli::try_parse_from(["fleet_dispatch", "run", "--tasks", "2", "--manifest", "x"]);
        assert!(result.is_err());
    }

    #[test]
    fn parses_fault_specs() {
        assert_eq!(
            parse_fault("2:0:crash"),
            Ok((2, FaultPlan { after_tasks: 0, mode: FaultMode::Crash }))
        );
        assert_eq!(
            parse_fault("1:4:hang=250"),
            Ok((
                1,
                FaultPlan {
                    after_tasks: 4,
                    mode: FaultMode::Hang(Duration::from_millis(250))
                }
            ))
        );
        assert!(parse_fault("1:crash").is_err());
        assert!(parse_fault("x:1:crash").is_err());
        assert!(parse_fault("1:1:explode").is_err());
        assert!(parse_fault("1:1:hang=soon").is_err());
    }

    #[test]
    fn fault_must_target_existing_worker() {
        let err = DispatchConfig::from_args(run_args(&["--tasks", "1", "-w", "2", "--fault", "2:0:crash"]))
            .unwrap_err();
        assert_eq!(err, ConfigError::FaultOutOfRange { worker: 2, workers: 2 });
    }

    #[test]
    fn exec_selects_command_executor() {
        let config = DispatchConfig::from_args(run_args(&[
            "--tasks", "1", "--exec", "convert", "--exec-arg", "--blur", "--exec-arg", "55",
        ]))
        .expect("config");
        assert_eq!(
            config.executor,
            ExecutorChoice::Command {
                program: "convert".to_string(),
                args: vec!["--blur".to_string(), "55".to_string()],
            }
        );
    }

    #[test]
    fn manifest_skips_blanks_and_comments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("inputs.txt");
        fs::write(&path, "# inputs\n000001.bmp\n\n  000002.bmp  \n#000003.bmp\n").expect("write");
        let manifest = read_manifest(&path).expect("manifest");
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.get(1).map(TaskRef::as_str), Some("000002.bmp"));
    }

    #[test]
    fn unreadable_manifest_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = read_manifest(&dir.path().join("missing.txt"));
        assert!(matches!(result, Err(DispatchError::Manifest { .. })));
    }

    #[test]
    fn detection_bound_scales_with_max_missed() {
        let timing = Timing {
            heartbeat_interval: Duration::from_millis(100),
            max_missed: 3,
            poll_interval: Duration::from_millis(5),
            sweep_idle: false,
        };
        assert_eq!(timing.detection_bound(), Duration::from_millis(305));
    }
}
