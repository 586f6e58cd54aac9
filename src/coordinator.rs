//! Coordinator control loop: task dispatch, liveness reconciliation, requeue.
//!
//! A single thread owns the queue and the liveness table. Each cycle waits
//! (bounded) for any inbound traffic, folds in every pending heartbeat, sweeps
//! for stale workers, then answers at most one task request. The loop ends
//! once every worker is either dismissed or presumed dead.
//!
//! A request that finds the queue empty while another worker still holds a
//! task is parked rather than dismissed, so a task requeued from a worker
//! presumed dead still has someone to run it.

use std::time::{Duration, Instant};

use tracing::{debug, info, info_span, trace, warn};

use crate::config::Timing;
use crate::error::{Result, TransportError};
use crate::liveness::{HeartbeatOutcome, LivenessTable, SweepPolicy, WorkerRecord, WorkerStatus};
use crate::stats::{CpuSample, RunStats, StatsSink};
use crate::task_queue::TaskQueue;
use crate::transport::{CoordinatorLink, Reply};
use crate::types::{TaskId, TaskManifest, WorkerId};

/// One delivered assignment, in dispatch order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dispatch {
    pub worker: WorkerId,
    pub task: TaskId,
}

/// Everything the coordinator knows at termination.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub stats: RunStats,
    pub dispatches: Vec<Dispatch>,
    /// Tasks never executed because no worker was left to take them.
    pub pending: Vec<TaskId>,
    pub workers: Vec<WorkerRecord>,
}

impl DispatchOutcome {
    pub fn dead_workers(&self) -> Vec<WorkerId> {
        self.workers
            .iter()
            .filter(|r| r.status == WorkerStatus::Dead)
            .map(|r| r.id)
            .collect()
    }
}

#[derive(Debug, Default)]
struct Counters {
    implicit_completions: u64,
    drained_requests: u64,
    parked_requests: u64,
}

pub struct Coordinator<L: CoordinatorLink> {
    link: L,
    manifest: TaskManifest,
    queue: TaskQueue,
    table: LivenessTable,
    policy: SweepPolicy,
    poll_interval: Duration,
    detection_bound: Duration,
    dispatches: Vec<Dispatch>,
    counters: Counters,
}

impl<L: CoordinatorLink> Coordinator<L> {
    /// Queue every task in manifest order and register every worker as alive.
    pub fn new(
        link: L,
        manifest: TaskManifest,
        workers: impl IntoIterator<Item = WorkerId>,
        timing: &Timing,
    ) -> Self {
        let queue = TaskQueue::from_ids(manifest.task_ids());
        Self {
            link,
            manifest,
            queue,
            table: LivenessTable::new(workers, Instant::now()),
            policy: timing.sweep_policy(),
            poll_interval: timing.poll_interval,
            detection_bound: timing.detection_bound(),
            dispatches: Vec::new(),
            counters: Counters::default(),
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn table(&self) -> &LivenessTable {
        &self.table
    }

    /// Broadcast the manifest, dispatch until no worker is active, persist
    /// statistics, then meet the surviving workers at the barrier.
    pub fn run(mut self, sink: &dyn StatsSink) -> Result<DispatchOutcome> {
        let _span = info_span!("coordinator").entered();
        let cpu_start = CpuSample::now();
        let start = Instant::now();
        info!(
            tasks = self.manifest.len(),
            workers = self.table.active(),
            detection_bound_ms = self.detection_bound.as_millis() as u64,
            "dispatch starting"
        );

        for (worker, err) in self.link.broadcast_manifest(&self.manifest) {
            warn!(worker, error = %err, "manifest broadcast failed; presuming worker dead");
            self.declare_dead(worker);
        }

        while self.table.active() > 0 {
            self.link.wait_ready(self.poll_interval);
            let now = Instant::now();
            while let Some(worker) = self.link.try_recv_heartbeat() {
                self.handle_heartbeat(worker, now);
            }
            self.sweep(now);
            if let Some(worker) = self.link.try_recv_request() {
                self.handle_request(worker);
            }
            self.serve_parked();
        }

        // Wake any zombie still blocked on a reply before the rendezvous.
        self.link.close();
        let elapsed = start.elapsed();
        let (cpu_user_s, cpu_sys_s) = CpuSample::delta(cpu_start, CpuSample::now());
        let stats = RunStats {
            total_tasks: self.manifest.len(),
            dispatched: self.dispatches.len() as u64,
            requeued: self.queue.requeued(),
            implicit_completions: self.counters.implicit_completions,
            unexecuted: self.queue.len(),
            workers_finished: self.table.count(WorkerStatus::Finished),
            workers_dead: self.table.count(WorkerStatus::Dead),
            elapsed_ms: elapsed.as_secs_f64() * 1000.0,
            throughput_tasks_per_s: RunStats::throughput(self.counters.implicit_completions, elapsed),
            cpu_user_s,
            cpu_sys_s,
        };
        if stats.unexecuted > 0 {
            warn!(unexecuted = stats.unexecuted, "run ended with tasks never executed");
        }
        info!(
            dispatched = stats.dispatched,
            requeued = stats.requeued,
            dead = stats.workers_dead,
            drained = self.counters.drained_requests,
            parked = self.counters.parked_requests,
            elapsed_ms = stats.elapsed_ms as u64,
            "dispatch finished"
        );
        let persisted = sink.persist(&stats);

        let outcome = DispatchOutcome {
            stats,
            dispatches: self.dispatches,
            pending: self.queue.pending(),
            workers: self.table.records().cloned().collect(),
        };
        self.link.barrier(&outcome.dead_workers());
        persisted?;
        Ok(outcome)
    }

    /// Fold one heartbeat into the liveness table.
    pub fn handle_heartbeat(&mut self, worker: WorkerId, now: Instant) {
        match self.table.heartbeat(worker, now) {
            HeartbeatOutcome::Reset => trace!(worker, "heartbeat"),
            HeartbeatOutcome::Ignored(status) => {
                debug!(worker, ?status, "heartbeat from retired worker ignored")
            }
            HeartbeatOutcome::Unknown => warn!(worker, "heartbeat from unknown worker"),
        }
    }

    /// Count missed heartbeats and requeue the tasks of workers presumed dead.
    pub fn sweep(&mut self, now: Instant) {
        let report = self.table.sweep(now, &self.policy);
        for miss in report.missed {
            debug!(worker = miss.worker, missed = miss.missed, "heartbeat missed");
        }
        for death in report.deaths {
            warn!(
                worker = death.worker,
                task = ?death.held,
                max_missed = self.policy.max_missed,
                "worker presumed dead after missed heartbeats"
            );
            if let Some(task) = death.held {
                self.requeue(death.worker, task);
            }
        }
    }

    /// Answer one task request.
    ///
    /// The request doubles as the completion signal for whatever the sender
    /// held. Requests from dismissed or dead workers are drained unanswered.
    /// With the queue empty the sender is dismissed only when no other alive
    /// worker still holds a task; otherwise its request is parked.
    pub fn handle_request(&mut self, worker: WorkerId) {
        match self.table.record(worker).map(|r| r.status) {
            Some(WorkerStatus::Active) => {}
            Some(status) => {
                debug!(worker, ?status, "draining request from retired worker");
                self.counters.drained_requests += 1;
                return;
            }
            None => {
                warn!(worker, "request from unknown worker ignored");
                return;
            }
        }

        self.table.note_request(worker);
        if let Some(done) = self.table.take_assignment(worker) {
            debug!(worker, task = done, "previous task implicitly complete");
            self.counters.implicit_completions += 1;
        }

        match self.queue.pop() {
            Some(task) => self.assign(worker, task),
            None if self.table.holders() > 0 => {
                debug!(worker, in_flight = self.table.holders(), "queue empty; request parked");
                self.table.park(worker);
                self.counters.parked_requests += 1;
            }
            None => self.dismiss(worker),
        }
    }

    /// Answer parked requests: with requeued tasks while the queue has any,
    /// with NoMoreTasks once nothing is left in flight.
    pub fn serve_parked(&mut self) {
        for worker in self.table.parked() {
            match self.queue.pop() {
                Some(task) => self.assign(worker, task),
                None if self.table.holders() > 0 => break,
                None => self.dismiss(worker),
            }
        }
    }

    fn assign(&mut self, worker: WorkerId, task: TaskId) {
        self.table.assign(worker, task);
        match self.link.send_reply(worker, Reply::Assignment(task)) {
            Ok(()) => {
                info!(worker, task, remaining = self.queue.len(), "task assigned");
                self.dispatches.push(Dispatch { worker, task });
            }
            Err(err) => self.on_send_failure(worker, err),
        }
    }

    fn dismiss(&mut self, worker: WorkerId) {
        match self.link.send_reply(worker, Reply::NoMoreTasks) {
            Ok(()) => {
                info!(worker, active = self.table.active() - 1, "worker dismissed");
                self.table.mark_finished(worker);
            }
            Err(err) => self.on_send_failure(worker, err),
        }
    }

    fn on_send_failure(&mut self, worker: WorkerId, err: TransportError) {
        warn!(worker, error = %err, "reply failed; presuming worker dead");
        self.declare_dead(worker);
    }

    fn declare_dead(&mut self, worker: WorkerId) {
        if let Some(task) = self.table.mark_dead(worker) {
            self.requeue(worker, task);
        }
    }

    fn requeue(&mut self, worker: WorkerId, task: TaskId) {
        self.queue.requeue(task);
        warn!(worker, task, queued = self.queue.len(), "task requeued");
    }
}
