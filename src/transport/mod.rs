//! Messaging contract between the coordinator and its workers.
//!
//! Three logically distinct message kinds flow over a transport: task requests
//! and heartbeats (worker to coordinator) and replies (coordinator to worker).
//! Delivery between a fixed pair of endpoints is reliable and ordered; nothing
//! orders one worker's heartbeats against its requests. Any send or receive
//! failure is reported as a [`TransportError`] and read by the caller as the
//! death of the other side.

use std::time::Duration;

use crate::error::TransportError;
use crate::types::{TaskId, TaskManifest, WorkerId};

pub mod channel;
mod rendezvous;

pub use rendezvous::Rendezvous;

/// Coordinator's answer to a task request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    Assignment(TaskId),
    NoMoreTasks,
}

/// Coordinator side of the transport.
///
/// Probes never block. `wait_ready` is the only blocking call in the control
/// loop and is bounded by its timeout.
pub trait CoordinatorLink {
    /// One-to-all startup broadcast. Returns the workers it could not reach.
    fn broadcast_manifest(&self, manifest: &TaskManifest) -> Vec<(WorkerId, TransportError)>;

    /// Block until a heartbeat or a task request may be available, or `timeout` passes.
    fn wait_ready(&self, timeout: Duration);

    /// Take one pending heartbeat from any sender.
    fn try_recv_heartbeat(&self) -> Option<WorkerId>;

    /// Take one pending task request from any sender.
    fn try_recv_request(&self) -> Option<WorkerId>;

    fn send_reply(&self, to: WorkerId, reply: Reply) -> Result<(), TransportError>;

    /// Drop every outbound path so workers still blocked on a reply wake up.
    fn close(&mut self);

    /// Final rendezvous. Workers in `excused` are presumed dead and not waited for.
    fn barrier(&self, excused: &[WorkerId]);
}

/// Heartbeat path of a worker, usable from its own thread.
pub trait HeartbeatLink: Send + 'static {
    fn send_heartbeat(&self, from: WorkerId) -> Result<(), TransportError>;
}

/// Worker side of the transport.
pub trait WorkerLink: Send {
    type Heartbeat: HeartbeatLink;

    fn worker_id(&self) -> WorkerId;

    /// Independent handle for the heartbeat emitter.
    fn heartbeat_link(&self) -> Self::Heartbeat;

    /// Block until the startup broadcast arrives.
    fn recv_manifest(&self) -> Result<TaskManifest, TransportError>;

    fn request_task(&self) -> Result<(), TransportError>;

    /// Block until the coordinator answers the last request.
    fn recv_reply(&self) -> Result<Reply, TransportError>;

    /// Final rendezvous with the coordinator and the other workers.
    fn barrier(&self);
}
