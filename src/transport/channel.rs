//! In-process transport over crossbeam channels.
//!
//! Each worker gets its own manifest and reply channel; heartbeats and task
//! requests from all workers fan in to two shared channels on the coordinator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Select, Sender, bounded, unbounded};

use super::{CoordinatorLink, HeartbeatLink, Reply, Rendezvous, WorkerLink};
use crate::error::TransportError;
use crate::types::{TaskManifest, WorkerId};

/// Build a connected coordinator endpoint and one endpoint per worker.
pub fn fabric(
    workers: impl IntoIterator<Item = WorkerId>,
) -> (ChannelCoordinator, Vec<ChannelWorker>) {
    let ids: Vec<WorkerId> = workers.into_iter().collect();
    let (heartbeat_tx, heartbeat_rx) = unbounded();
    let (request_tx, request_rx) = unbounded();
    let rendezvous = Arc::new(Rendezvous::new(ids.iter().copied()));

    let mut replies = HashMap::with_capacity(ids.len());
    let mut manifests = HashMap::with_capacity(ids.len());
    let mut endpoints = Vec::with_capacity(ids.len());
    for id in ids {
        let (reply_tx, reply_rx) = unbounded();
        let (manifest_tx, manifest_rx) = bounded(1);
        replies.insert(id, reply_tx);
        manifests.insert(id, manifest_tx);
        endpoints.push(ChannelWorker {
            id,
            heartbeats: heartbeat_tx.clone(),
            requests: request_tx.clone(),
            replies: reply_rx,
            manifest: manifest_rx,
            rendezvous: Arc::clone(&rendezvous),
        });
    }

    let coordinator = ChannelCoordinator {
        heartbeats: heartbeat_rx,
        requests: request_rx,
        replies,
        manifests,
        _inbound_keepalive: (heartbeat_tx, request_tx),
        rendezvous,
    };
    (coordinator, endpoints)
}

pub struct ChannelCoordinator {
    heartbeats: Receiver<WorkerId>,
    requests: Receiver<WorkerId>,
    replies: HashMap<WorkerId, Sender<Reply>>,
    manifests: HashMap<WorkerId, Sender<TaskManifest>>,
    // Inbound channels never disconnect while the coordinator lives, so the
    // select in `wait_ready` cannot spin on a closed channel once workers exit.
    _inbound_keepalive: (Sender<WorkerId>, Sender<WorkerId>),
    rendezvous: Arc<Rendezvous>,
}

impl CoordinatorLink for ChannelCoordinator {
    fn broadcast_manifest(&self, manifest: &TaskManifest) -> Vec<(WorkerId, TransportError)> {
        self.manifests
            .iter()
            .filter_map(|(&worker, sender)| {
                sender
                    .send(manifest.clone())
                    .err()
                    .map(|_| (worker, TransportError::worker_gone(worker)))
            })
            .collect()
    }

    fn wait_ready(&self, timeout: Duration) {
        let mut select = Select::new();
        select.recv(&self.heartbeats);
        select.recv(&self.requests);
        // Timeout and readiness both just end the wait; the caller probes next.
        let _ = select.ready_timeout(timeout);
    }

    fn try_recv_heartbeat(&self) -> Option<WorkerId> {
        self.heartbeats.try_recv().ok()
    }

    fn try_recv_request(&self) -> Option<WorkerId> {
        self.requests.try_recv().ok()
    }

    fn send_reply(&self, to: WorkerId, reply: Reply) -> Result<(), TransportError> {
        let sender = self
            .replies
            .get(&to)
            .ok_or(TransportError::UnknownWorker(to))?;
        sender
            .send(reply)
            .map_err(|_| TransportError::worker_gone(to))
    }

    fn close(&mut self) {
        self.replies.clear();
        self.manifests.clear();
    }

    fn barrier(&self, excused: &[WorkerId]) {
        self.rendezvous.arrive_coordinator(excused);
    }
}

pub struct ChannelWorker {
    id: WorkerId,
    heartbeats: Sender<WorkerId>,
    requests: Sender<WorkerId>,
    replies: Receiver<Reply>,
    manifest: Receiver<TaskManifest>,
    rendezvous: Arc<Rendezvous>,
}

#[derive(Clone)]
pub struct ChannelHeartbeat {
    sender: Sender<WorkerId>,
}

impl HeartbeatLink for ChannelHeartbeat {
    fn send_heartbeat(&self, from: WorkerId) -> Result<(), TransportError> {
        self.sender
            .send(from)
            .map_err(|_| TransportError::coordinator_gone())
    }
}

impl WorkerLink for ChannelWorker {
    type Heartbeat = ChannelHeartbeat;

    fn worker_id(&self) -> WorkerId {
        self.id
    }

    fn heartbeat_link(&self) -> ChannelHeartbeat {
        ChannelHeartbeat {
            sender: self.heartbeats.clone(),
        }
    }

    fn recv_manifest(&self) -> Result<TaskManifest, TransportError> {
        self.manifest
            .recv()
            .map_err(|_| TransportError::ManifestMissing)
    }

    fn request_task(&self) -> Result<(), TransportError> {
        self.requests
            .send(self.id)
            .map_err(|_| TransportError::coordinator_gone())
    }

    fn recv_reply(&self) -> Result<Reply, TransportError> {
        self.replies
            .recv()
            .map_err(|_| TransportError::coordinator_gone())
    }

    fn barrier(&self) {
        self.rendezvous.arrive(self.id);
    }
}
