//! Worker liveness table: heartbeat bookkeeping and presumed-death detection.
//!
//! Owned by the coordinator's control loop and never shared, so no locking.
//! Death is only ever presumed; once a worker leaves `Active` it never returns.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::types::{TaskId, WorkerId};

/// Lifecycle of a worker as seen by the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Presumed alive and still eligible for work.
    Active,
    /// Dismissed with NoMoreTasks; never assigned again.
    Finished,
    /// Presumed dead; never assigned again.
    Dead,
}

/// Coordinator-side state for one worker.
#[derive(Clone, Debug)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub assigned: Option<TaskId>,
    pub last_heartbeat: Instant,
    pub missed: u32,
    /// Set by the first heartbeat or request.
    pub heard_from: bool,
    /// Request held back until in-flight tasks settle.
    pub awaiting_reply: bool,
}

impl WorkerRecord {
    fn new(id: WorkerId, now: Instant) -> Self {
        Self {
            id,
            status: WorkerStatus::Active,
            assigned: None,
            last_heartbeat: now,
            missed: 0,
            heard_from: false,
            awaiting_reply: false,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.status == WorkerStatus::Active
    }

    /// Whether the sweep tracks this worker's heartbeats.
    fn is_watched(&self, policy: &SweepPolicy) -> bool {
        self.is_alive()
            && (self.assigned.is_some()
                || self.awaiting_reply
                || !self.heard_from
                || policy.include_idle)
    }
}

/// Knobs governing the staleness sweep.
#[derive(Clone, Copy, Debug)]
pub struct SweepPolicy {
    pub heartbeat_interval: Duration,
    pub max_missed: u32,
    /// Also sweep idle workers that have already reported in.
    pub include_idle: bool,
}

/// Result of feeding a heartbeat into the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Reset,
    /// Sender already left `Active`; no rejoin.
    Ignored(WorkerStatus),
    Unknown,
}

/// A worker the sweep just declared dead, with the task it was holding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresumedDeath {
    pub worker: WorkerId,
    pub held: Option<TaskId>,
}

/// A worker whose heartbeat slipped past its next deadline without dying yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MissedBeat {
    pub worker: WorkerId,
    pub missed: u32,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub missed: Vec<MissedBeat>,
    pub deaths: Vec<PresumedDeath>,
}

/// Liveness and assignment state for every worker.
#[derive(Debug)]
pub struct LivenessTable {
    records: BTreeMap<WorkerId, WorkerRecord>,
    active: usize,
}

impl LivenessTable {
    /// Register every worker as alive, idle, and freshly heard from.
    pub fn new(workers: impl IntoIterator<Item = WorkerId>, now: Instant) -> Self {
        let records: BTreeMap<_, _> = workers
            .into_iter()
            .map(|id| (id, WorkerRecord::new(id, now)))
            .collect();
        let active = records.len();
        Self { records, active }
    }

    /// Workers still presumed alive and not dismissed.
    pub fn active(&self) -> usize {
        self.active
    }

    pub fn record(&self, worker: WorkerId) -> Option<&WorkerRecord> {
        self.records.get(&worker)
    }

    pub fn records(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.records.values()
    }

    pub fn count(&self, status: WorkerStatus) -> usize {
        self.records.values().filter(|r| r.status == status).count()
    }

    /// Alive workers holding an assignment.
    pub fn holders(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.is_alive() && r.assigned.is_some())
            .count()
    }

    /// Alive workers whose request is held back, in id order.
    pub fn parked(&self) -> Vec<WorkerId> {
        self.records
            .values()
            .filter(|r| r.is_alive() && r.awaiting_reply)
            .map(|r| r.id)
            .collect()
    }

    /// Alive worker currently holding `task`, if any.
    pub fn holder_of(&self, task: TaskId) -> Option<WorkerId> {
        self.records
            .values()
            .find(|r| r.is_alive() && r.assigned == Some(task))
            .map(|r| r.id)
    }

    /// Reset the sender's staleness counters.
    pub fn heartbeat(&mut self, worker: WorkerId, now: Instant) -> HeartbeatOutcome {
        match self.records.get_mut(&worker) {
            Some(record) if record.is_alive() => {
                record.last_heartbeat = now;
                record.missed = 0;
                record.heard_from = true;
                HeartbeatOutcome::Reset
            }
            Some(record) => HeartbeatOutcome::Ignored(record.status),
            None => HeartbeatOutcome::Unknown,
        }
    }

    /// Advance missed counters for stale workers and presume dead those at the limit.
    ///
    /// Covers workers holding a task, workers with a parked request and workers
    /// never heard from since registration. A worker's missed count goes up by
    /// at most one per sweep; its n-th miss is registered once
    /// `n * heartbeat_interval` has passed since the last beat.
    pub fn sweep(&mut self, now: Instant, policy: &SweepPolicy) -> SweepReport {
        let mut report = SweepReport::default();
        for record in self.records.values_mut() {
            if !record.is_watched(policy) {
                continue;
            }
            let silent_for = now.saturating_duration_since(record.last_heartbeat);
            if silent_for <= policy.heartbeat_interval * (record.missed + 1) {
                continue;
            }
            record.missed += 1;
            if record.missed >= policy.max_missed {
                record.status = WorkerStatus::Dead;
                record.awaiting_reply = false;
                report.deaths.push(PresumedDeath {
                    worker: record.id,
                    held: record.assigned.take(),
                });
            } else {
                report.missed.push(MissedBeat {
                    worker: record.id,
                    missed: record.missed,
                });
            }
        }
        self.active -= report.deaths.len();
        report
    }

    /// Note that a request arrived from `worker`.
    pub fn note_request(&mut self, worker: WorkerId) {
        if let Some(record) = self.records.get_mut(&worker) {
            record.heard_from = true;
        }
    }

    /// Hold the worker's request unanswered.
    pub fn park(&mut self, worker: WorkerId) {
        if let Some(record) = self.records.get_mut(&worker) {
            debug_assert!(record.assigned.is_none(), "parking worker {worker} that holds a task");
            record.awaiting_reply = true;
        }
    }

    /// Record a new assignment. The worker must be alive and idle.
    pub fn assign(&mut self, worker: WorkerId, task: TaskId) {
        if let Some(record) = self.records.get_mut(&worker) {
            debug_assert!(record.is_alive(), "assigning to worker {worker} that is not alive");
            debug_assert!(record.assigned.is_none(), "worker {worker} already holds a task");
            record.assigned = Some(task);
            record.awaiting_reply = false;
        }
    }

    /// Clear and return the worker's current assignment.
    pub fn take_assignment(&mut self, worker: WorkerId) -> Option<TaskId> {
        self.records
            .get_mut(&worker)
            .and_then(|record| record.assigned.take())
    }

    /// Presume a worker dead; returns the task it held so the caller can requeue it.
    ///
    /// No-op for workers already out of `Active`.
    pub fn mark_dead(&mut self, worker: WorkerId) -> Option<TaskId> {
        let record = self.records.get_mut(&worker)?;
        if !record.is_alive() {
            return None;
        }
        record.status = WorkerStatus::Dead;
        record.awaiting_reply = false;
        self.active -= 1;
        record.assigned.take()
    }

    /// Dismiss a worker after NoMoreTasks was delivered.
    pub fn mark_finished(&mut self, worker: WorkerId) {
        if let Some(record) = self.records.get_mut(&worker) {
            if record.is_alive() {
                record.status = WorkerStatus::Finished;
                record.assigned = None;
                record.awaiting_reply = false;
                self.active -= 1;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_last_heartbeat_for_test(&mut self, worker: WorkerId, instant: Instant) {
        if let Some(record) = self.records.get_mut(&worker) {
            record.last_heartbeat = instant;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(100);

    fn policy() -> SweepPolicy {
        SweepPolicy {
            heartbeat_interval: INTERVAL,
            max_missed: 3,
            include_idle: false,
        }
    }

    #[test]
    fn new_table_registers_all_workers_alive() {
        let now = Instant::now();
        let table = LivenessTable::new(0..3, now);
        assert_eq!(table.active(), 3);
        for record in table.records() {
            assert!(record.is_alive());
            assert_eq!(record.missed, 0);
            assert_eq!(record.assigned, None);
            assert_eq!(record.last_heartbeat, now);
        }
    }

    #[test]
    fn misses_accumulate_one_per_interval() {
        let start = Instant::now();
        let mut table = LivenessTable::new([1], start);
        table.assign(1, 10);

        let report = table.sweep(start + INTERVAL / 2, &policy());
        assert!(report.missed.is_empty());

        let report = table.sweep(start + INTERVAL + Duration::from_millis(1), &policy());
        assert_eq!(report.missed, vec![MissedBeat { worker: 1, missed: 1 }]);

        // Still inside the second window; no new miss.
        let report = table.sweep(start + INTERVAL * 2, &policy());
        assert!(report.missed.is_empty());

        let report = table.sweep(start + INTERVAL * 2 + Duration::from_millis(1), &policy());
        assert_eq!(report.missed, vec![MissedBeat { worker: 1, missed: 2 }]);
        assert!(report.deaths.is_empty());
    }

    #[test]
    fn third_miss_presumes_death_and_releases_task() {
        let start = Instant::now();
        let mut table = LivenessTable::new([1, 2], start);
        table.assign(1, 4);
        table.assign(2, 5);
        table.heartbeat(2, start + INTERVAL * 3);

        let mut deaths = Vec::new();
        for step in 1..=3 {
            let now = start + INTERVAL * step + Duration::from_millis(1);
            deaths.extend(table.sweep(now, &policy()).deaths);
        }
        assert_eq!(deaths, vec![PresumedDeath { worker: 1, held: Some(4) }]);
        assert_eq!(table.active(), 1);
        let record = table.record(1).expect("record");
        assert_eq!(record.status, WorkerStatus::Dead);
        assert_eq!(record.assigned, None);

        // Already dead; later sweeps report nothing more for it.
        let later = table.sweep(start + INTERVAL * 10, &policy());
        assert!(later.deaths.iter().all(|death| death.worker != 1));
    }

    #[test]
    fn heartbeat_resets_missed_count() {
        let start = Instant::now();
        let mut table = LivenessTable::new([3], start);
        table.assign(3, 0);
        table.sweep(start + INTERVAL * 2, &policy());
        assert_eq!(table.record(3).map(|r| r.missed), Some(1));

        let beat = start + INTERVAL * 2;
        assert_eq!(table.heartbeat(3, beat), HeartbeatOutcome::Reset);
        let record = table.record(3).expect("record");
        assert_eq!(record.missed, 0);
        assert_eq!(record.last_heartbeat, beat);
    }

    #[test]
    fn idle_workers_are_not_swept_by_default() {
        let start = Instant::now();
        let mut table = LivenessTable::new([0], start);
        table.heartbeat(0, start);
        let report = table.sweep(start + INTERVAL * 50, &policy());
        assert!(report.deaths.is_empty());
        assert!(report.missed.is_empty());
        assert_eq!(table.active(), 1);
    }

    #[test]
    fn idle_sweep_catches_silent_idle_worker() {
        let start = Instant::now();
        let mut table = LivenessTable::new([0], start);
        table.note_request(0);
        let policy = SweepPolicy {
            include_idle: true,
            ..policy()
        };
        let mut deaths = Vec::new();
        for step in 1..=3 {
            deaths.extend(table.sweep(start + INTERVAL * step + Duration::from_millis(1), &policy).deaths);
        }
        assert_eq!(deaths, vec![PresumedDeath { worker: 0, held: None }]);
        assert_eq!(table.active(), 0);
    }

    #[test]
    fn worker_never_heard_from_is_swept() {
        let start = Instant::now();
        let mut table = LivenessTable::new([0, 1], start);
        table.heartbeat(1, start);
        let mut deaths = Vec::new();
        for step in 1..=3 {
            deaths.extend(table.sweep(start + INTERVAL * step + Duration::from_millis(1), &policy()).deaths);
        }
        assert_eq!(deaths, vec![PresumedDeath { worker: 0, held: None }]);
        assert_eq!(table.active(), 1);
    }

    #[test]
    fn parked_worker_is_swept_and_unparked_on_death() {
        let start = Instant::now();
        let mut table = LivenessTable::new([0, 1], start);
        table.heartbeat(0, start);
        table.heartbeat(1, start);
        table.assign(1, 6);
        table.park(0);
        assert_eq!(table.parked(), vec![0]);
        assert_eq!(table.holders(), 1);

        for step in 1..=3 {
            let now = start + INTERVAL * step + Duration::from_millis(1);
            table.heartbeat(1, now);
            table.sweep(now, &policy());
        }
        assert_eq!(table.record(0).map(|r| r.status), Some(WorkerStatus::Dead));
        assert!(table.parked().is_empty());
    }

    #[test]
    fn assignment_clears_parked_request() {
        let now = Instant::now();
        let mut table = LivenessTable::new([0], now);
        table.park(0);
        table.assign(0, 2);
        assert!(table.parked().is_empty());
        assert_eq!(table.holders(), 1);
    }

    #[test]
    fn dead_and_finished_workers_ignore_heartbeats() {
        let now = Instant::now();
        let mut table = LivenessTable::new([0, 1], now);
        table.mark_dead(0);
        table.mark_finished(1);
        assert_eq!(table.heartbeat(0, now), HeartbeatOutcome::Ignored(WorkerStatus::Dead));
        assert_eq!(table.heartbeat(1, now), HeartbeatOutcome::Ignored(WorkerStatus::Finished));
        assert_eq!(table.heartbeat(9, now), HeartbeatOutcome::Unknown);
        assert_eq!(table.active(), 0);
    }

    #[test]
    fn mark_dead_is_idempotent() {
        let now = Instant::now();
        let mut table = LivenessTable::new([0], now);
        table.assign(0, 8);
        assert_eq!(table.mark_dead(0), Some(8));
        // A second presumption of the same death must not release the task again.
        assert_eq!(table.mark_dead(0), None);
        assert_eq!(table.active(), 0);
    }

    #[test]
    fn holder_of_only_reports_alive_workers() {
        let now = Instant::now();
        let mut table = LivenessTable::new([0, 1], now);
        table.assign(0, 3);
        assert_eq!(table.holder_of(3), Some(0));
        table.mark_dead(0);
        assert_eq!(table.holder_of(3), None);
    }

    #[test]
    fn deterministic_death_without_sleep() {
        let mut table = LivenessTable::new([42], Instant::now());
        table.assign(42, 1);
        let past = Instant::now() - Duration::from_secs(5);
        table.set_last_heartbeat_for_test(42, past);
        let now = Instant::now();
        let mut deaths = Vec::new();
        for _ in 0..3 {
            deaths.extend(table.sweep(now, &policy()).deaths);
        }
        assert_eq!(deaths, vec![PresumedDeath { worker: 42, held: Some(1) }]);
    }
}
