//! Launches a coordinator and its worker pool over the in-process transport.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::error;

use crate::config::{DispatchConfig, ExecutorChoice, Timing};
use crate::coordinator::{Coordinator, DispatchOutcome};
use crate::error::{DispatchError, Result};
use crate::executor::{CommandExecutor, ExecutionContext, SimulatedExecutor, TaskExecutor};
use crate::stats::StatsSink;
use crate::transport::{WorkerLink, channel};
use crate::types::{TaskId, TaskManifest, WorkerId};
use crate::worker::{FaultMode, FaultPlan, WorkerAgent, WorkerReport};

// Demo knobs: short intervals for quick CLI feedback, work long enough that
// the crashed worker is detected while the survivors are still busy.
const DEMO_WORKERS: usize = 3;
const DEMO_TASKS: usize = 12;
const DEMO_WORK_MS: u64 = 100;
const DEMO_HEARTBEAT_MS: u64 = 40;
const DEMO_POLL_MS: u64 = 5;
const DEMO_CRASHING_WORKER: WorkerId = 1;

/// Shape of one run: pool size, timing and injected faults.
#[derive(Clone, Debug)]
pub struct ClusterPlan {
    pub workers: usize,
    pub timing: Timing,
    pub output_dir: Option<PathBuf>,
    pub faults: BTreeMap<WorkerId, FaultPlan>,
}

impl ClusterPlan {
    pub fn new(workers: usize, timing: Timing) -> Self {
        Self {
            workers,
            timing,
            output_dir: None,
            faults: BTreeMap::new(),
        }
    }

    pub fn with_fault(mut self, worker: WorkerId, fault: FaultPlan) -> Self {
        self.faults.insert(worker, fault);
        self
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            workers: config.workers,
            timing: config.timing,
            output_dir: config.output_dir.clone(),
            faults: config.faults.clone(),
        }
    }

    /// Three workers, one of which crashes holding its second task.
    pub fn demo() -> Self {
        let timing = Timing {
            heartbeat_interval: Duration::from_millis(DEMO_HEARTBEAT_MS),
            poll_interval: Duration::from_millis(DEMO_POLL_MS),
            ..Timing::default()
        };
        Self::new(DEMO_WORKERS, timing).with_fault(
            DEMO_CRASHING_WORKER,
            FaultPlan {
                after_tasks: 1,
                mode: FaultMode::Crash,
            },
        )
    }
}

pub fn demo_manifest() -> TaskManifest {
    TaskManifest::synthetic(DEMO_TASKS)
}

pub fn demo_executor() -> Arc<dyn TaskExecutor> {
    Arc::new(SimulatedExecutor::new(Duration::from_millis(DEMO_WORK_MS)))
}

pub fn build_executor(choice: &ExecutorChoice) -> Arc<dyn TaskExecutor> {
    match choice {
        ExecutorChoice::Simulated { work } => Arc::new(SimulatedExecutor::new(*work)),
        ExecutorChoice::Command { program, args } => {
            Arc::new(CommandExecutor::new(program.clone(), args.clone()))
        }
    }
}

/// Coordinator view plus every worker's own account of the run.
#[derive(Debug)]
pub struct ClusterOutcome {
    pub dispatch: DispatchOutcome,
    /// Reports from workers that returned; sorted by worker id.
    pub workers: Vec<WorkerReport>,
}

impl ClusterOutcome {
    /// Tasks some worker reports having executed successfully, with repeats.
    pub fn executed(&self) -> Vec<TaskId> {
        self.workers
            .iter()
            .flat_map(|report| report.executed.iter().copied())
            .collect()
    }

    pub fn report(&self, worker: WorkerId) -> Option<&WorkerReport> {
        self.workers.iter().find(|report| report.worker == worker)
    }
}

/// Run one coordinator on the calling thread and `plan.workers` agents on
/// their own threads, then join them all.
pub fn run_cluster(
    manifest: TaskManifest,
    plan: &ClusterPlan,
    executor: Arc<dyn TaskExecutor>,
    sink: &dyn StatsSink,
) -> Result<ClusterOutcome> {
    let ids: Vec<WorkerId> = (0..plan.workers as WorkerId).collect();
    let (coordinator_link, worker_links) = channel::fabric(ids.iter().copied());

    let mut handles = Vec::with_capacity(worker_links.len());
    for link in worker_links {
        let id = link.worker_id();
        let mut context = ExecutionContext::new(id);
        if let Some(dir) = plan.output_dir.as_ref() {
            context = context.with_output_dir(dir);
        }
        let agent = WorkerAgent::new(link, Arc::clone(&executor), context, plan.timing.heartbeat_interval)
            .with_fault(plan.faults.get(&id).copied());
        let name = format!("worker-{id}");
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || agent.run())
            .map_err(|source| DispatchError::Spawn { name, source })?;
        handles.push((id, handle));
    }

    let dispatch = Coordinator::new(coordinator_link, manifest, ids, &plan.timing).run(sink)?;

    let mut workers = Vec::with_capacity(handles.len());
    let mut panicked = None;
    for (id, handle) in handles {
        match handle.join() {
            Ok(Ok(report)) => workers.push(report),
            Ok(Err(err)) => error!(worker = id, error = %err, "worker failed"),
            Err(_) => {
                error!(worker = id, "worker thread panicked");
                panicked.get_or_insert(id);
            }
        }
    }
    if let Some(id) = panicked {
        return Err(DispatchError::WorkerPanicked(id));
    }
    Ok(ClusterOutcome { dispatch, workers })
}
