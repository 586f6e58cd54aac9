//! Error types for fleet_dispatch
//!
//! Transport errors double as liveness signals: any failed send or receive is
//! treated as the death of the remote endpoint. Executor errors stay local to
//! the worker that hit them. Everything in `DispatchError` is fatal to the
//! local process.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{TaskId, WorkerId};

/// Failure of a send or receive on the transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The remote endpoint has gone away
    #[error("endpoint {endpoint} disconnected")]
    Disconnected { endpoint: String },

    /// Addressed a worker the transport does not know about
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),

    /// The startup broadcast never arrived
    #[error("task manifest was not received")]
    ManifestMissing,
}

impl TransportError {
    pub fn coordinator_gone() -> Self {
        Self::Disconnected {
            endpoint: "coordinator".to_string(),
        }
    }

    pub fn worker_gone(worker: WorkerId) -> Self {
        Self::Disconnected {
            endpoint: format!("worker-{worker}"),
        }
    }
}

/// Failure of the task executor for a single task.
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// Task id is outside the manifest
    #[error("task {0} is not in the manifest")]
    UnknownTask(TaskId),

    /// Reading input or writing output failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// External program could not be started
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// External program ran but reported failure
    #[error("'{program}' exited with {status}")]
    CommandFailed { program: String, status: String },

    /// Any other executor-specific failure
    #[error("{0}")]
    Failed(String),
}

/// Invalid configuration values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("worker count must be > 0")]
    NoWorkers,

    #[error("heartbeat interval must be > 0")]
    ZeroHeartbeat,

    #[error("max missed heartbeats must be > 0")]
    ZeroMaxMissed,

    #[error("poll interval ({poll_ms}ms) must be shorter than the heartbeat interval ({heartbeat_ms}ms)")]
    PollTooSlow { poll_ms: u64, heartbeat_ms: u64 },

    #[error("either --tasks or --manifest is required")]
    NoTaskSource,

    #[error("invalid fault '{spec}': {reason}")]
    InvalidFault { spec: String, reason: String },

    #[error("fault targets worker {worker} but only {workers} worker(s) are configured")]
    FaultOutOfRange { worker: WorkerId, workers: usize },
}

/// Fatal local errors; these abort the process.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Initial task list could not be obtained
    #[error("cannot read task manifest '{}': {source}", path.display())]
    Manifest {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Statistics could not be persisted
    #[error("cannot write statistics: {0}")]
    Stats(#[from] std::io::Error),

    #[error("failed to encode statistics: {0}")]
    StatsEncoding(#[from] serde_json::Error),

    #[error("failed to spawn thread '{name}': {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },

    #[error("worker {0} panicked")]
    WorkerPanicked(WorkerId),
}

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;
