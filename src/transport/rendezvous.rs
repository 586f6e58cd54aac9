//! Final barrier between the coordinator and its workers.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

use crate::types::WorkerId;

struct RendezvousState {
    arrived: HashSet<WorkerId>,
    excused: HashSet<WorkerId>,
    coordinator_arrived: bool,
    open: bool,
}

/// Barrier that opens once the coordinator and every worker have either
/// arrived or been excused.
///
/// The coordinator excuses the workers it presumes dead, so a crashed worker
/// cannot hold the others forever. Arrivals after the barrier opened return
/// immediately.
pub struct Rendezvous {
    parties: HashSet<WorkerId>,
    state: Mutex<RendezvousState>,
    released: Condvar,
}

impl Rendezvous {
    pub fn new(workers: impl IntoIterator<Item = WorkerId>) -> Self {
        Self {
            parties: workers.into_iter().collect(),
            state: Mutex::new(RendezvousState {
                arrived: HashSet::new(),
                excused: HashSet::new(),
                coordinator_arrived: false,
                open: false,
            }),
            released: Condvar::new(),
        }
    }

    /// Worker arrival; blocks until the barrier opens.
    pub fn arrive(&self, worker: WorkerId) {
        let mut guard = self.state.lock().expect("rendezvous mutex poisoned");
        guard.arrived.insert(worker);
        self.wait_open(guard);
    }

    /// Coordinator arrival; excuses `dead` and blocks until the barrier opens.
    pub fn arrive_coordinator(&self, dead: &[WorkerId]) {
        let mut guard = self.state.lock().expect("rendezvous mutex poisoned");
        guard.excused.extend(dead.iter().copied());
        guard.coordinator_arrived = true;
        self.wait_open(guard);
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().expect("rendezvous mutex poisoned").open
    }

    fn wait_open(&self, mut guard: std::sync::MutexGuard<'_, RendezvousState>) {
        if !guard.open && self.complete(&guard) {
            guard.open = true;
            self.released.notify_all();
        }
        while !guard.open {
            guard = self
                .released
                .wait(guard)
                .expect("rendezvous condvar wait failed");
        }
    }

    fn complete(&self, state: &RendezvousState) -> bool {
        state.coordinator_arrived
            && self
                .parties
                .iter()
                .all(|w| state.arrived.contains(w) || state.excused.contains(w))
    }
}
