//! Worker agent: a task loop plus an independent heartbeat emitter.
//!
//! The heartbeat runs on its own thread so a long task never silences it. The
//! two activities share nothing but a stop channel. There is no completion
//! acknowledgement: the next task request is what tells the coordinator that
//! the previous task is done.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use tracing::{debug, info, info_span, warn};

use crate::error::{DispatchError, ExecutorError, Result, TransportError};
use crate::executor::{ExecutionContext, TaskExecutor};
use crate::transport::{HeartbeatLink, Reply, WorkerLink};
use crate::types::{TaskId, TaskManifest, WorkerId};

/// How an injected fault behaves once it fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultMode {
    /// Stop heartbeating and vanish without reaching the barrier.
    Crash,
    /// Stop heartbeating, stall, then carry on as a zombie.
    Hang(Duration),
}

/// Fault fired on the assignment that follows `after_tasks` completed ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultPlan {
    pub after_tasks: usize,
    pub mode: FaultMode,
}

/// Why the task loop ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    /// Received NoMoreTasks.
    Dismissed,
    /// A send or receive failed; the coordinator is presumed gone.
    CoordinatorLost(TransportError),
    /// An injected crash fired.
    Crashed,
}

#[derive(Clone, Debug)]
pub struct WorkerReport {
    pub worker: WorkerId,
    /// Every assignment received, in order.
    pub assigned: Vec<TaskId>,
    pub executed: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub heartbeats_sent: u64,
    pub exit: WorkerExit,
}

impl WorkerReport {
    fn new(worker: WorkerId) -> Self {
        Self {
            worker,
            assigned: Vec::new(),
            executed: Vec::new(),
            failed: Vec::new(),
            heartbeats_sent: 0,
            exit: WorkerExit::Dismissed,
        }
    }
}

/// Sends heartbeats on a fixed interval until stopped.
struct HeartbeatEmitter {
    worker: WorkerId,
    stop: Sender<()>,
    handle: thread::JoinHandle<u64>,
}

impl HeartbeatEmitter {
    fn spawn<H: HeartbeatLink>(link: H, worker: WorkerId, interval: Duration) -> Result<Self> {
        let (stop, stopped) = bounded::<()>(1);
        let name = format!("heartbeat-{worker}");
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut sent = 0u64;
                loop {
                    if let Err(err) = link.send_heartbeat(worker) {
                        debug!(worker, error = %err, "heartbeat send failed; emitter exiting");
                        break;
                    }
                    sent += 1;
                    // A stop message or a dropped stop handle both end the loop.
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                sent
            })
            .map_err(|source| DispatchError::Spawn { name, source })?;
        Ok(Self {
            worker,
            stop,
            handle,
        })
    }

    /// Signal the emitter and wait for it; returns heartbeats sent.
    fn stop(self) -> u64 {
        let _ = self.stop.try_send(());
        drop(self.stop);
        match self.handle.join() {
            Ok(sent) => sent,
            Err(_) => {
                warn!(worker = self.worker, "heartbeat thread panicked");
                0
            }
        }
    }
}

pub struct WorkerAgent<L: WorkerLink> {
    link: L,
    executor: Arc<dyn TaskExecutor>,
    context: ExecutionContext,
    heartbeat_interval: Duration,
    fault: Option<FaultPlan>,
}

impl<L: WorkerLink> WorkerAgent<L> {
    pub fn new(
        link: L,
        executor: Arc<dyn TaskExecutor>,
        context: ExecutionContext,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            link,
            executor,
            context,
            heartbeat_interval,
            fault: None,
        }
    }

    pub fn with_fault(mut self, fault: Option<FaultPlan>) -> Self {
        self.fault = fault;
        self
    }

    /// Receive the manifest, then pull and execute tasks until dismissed.
    ///
    /// Fails only on fatal local errors: the manifest never arrived or the
    /// heartbeat thread could not be started.
    pub fn run(mut self) -> Result<WorkerReport> {
        let worker = self.link.worker_id();
        let _span = info_span!("worker", id = worker).entered();
        let manifest = self.link.recv_manifest()?;
        debug!(tasks = manifest.len(), "manifest received");

        let mut emitter = Some(HeartbeatEmitter::spawn(
            self.link.heartbeat_link(),
            worker,
            self.heartbeat_interval,
        )?);
        let mut report = WorkerReport::new(worker);

        let exit = loop {
            if let Err(err) = self.link.request_task() {
                break WorkerExit::CoordinatorLost(err);
            }
            let task = match self.link.recv_reply() {
                Ok(Reply::Assignment(task)) => task,
                Ok(Reply::NoMoreTasks) => break WorkerExit::Dismissed,
                Err(err) => break WorkerExit::CoordinatorLost(err),
            };
            debug!(task, "assignment received");
            report.assigned.push(task);

            let completed = report.executed.len() + report.failed.len();
            if let Some(fault) = self.fault.take_if(|f| f.after_tasks == completed) {
                if let Some(emitter) = emitter.take() {
                    report.heartbeats_sent += emitter.stop();
                }
                match fault.mode {
                    FaultMode::Crash => {
                        warn!(task, "injected crash; abandoning task and link");
                        report.exit = WorkerExit::Crashed;
                        return Ok(report);
                    }
                    FaultMode::Hang(stall) => {
                        warn!(task, stall_ms = stall.as_millis() as u64, "injected hang; heartbeats stopped");
                        thread::sleep(stall);
                        info!(task, "resuming after hang");
                    }
                }
            }

            self.execute(task, &manifest, &mut report);
        };

        if let Some(emitter) = emitter.take() {
            report.heartbeats_sent += emitter.stop();
        }
        match &exit {
            WorkerExit::Dismissed => info!(executed = report.executed.len(), "dismissed"),
            other => warn!(exit = ?other, "task loop ended without dismissal"),
        }
        report.exit = exit;
        self.link.barrier();
        Ok(report)
    }

    fn execute(&self, task: TaskId, manifest: &TaskManifest, report: &mut WorkerReport) {
        let result = manifest
            .get(task)
            .ok_or(ExecutorError::UnknownTask(task))
            .and_then(|input| self.executor.execute(&self.context, task, input));
        match result {
            Ok(()) => {
                info!(task, "finished task");
                report.executed.push(task);
            }
            Err(err) => {
                // No NACK exists; the coordinator treats the next request as completion.
                warn!(task, error = %err, "task executor failed; abandoning task");
                report.failed.push(task);
            }
        }
    }
}
