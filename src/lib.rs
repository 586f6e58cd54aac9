//! fleet_dispatch - fault-tolerant master/worker task dispatch
//!
//! A coordinator hands out task ids on request, tracks worker liveness through
//! heartbeats sent on an independent channel, presumes silent workers dead and
//! requeues whatever they held. Execution is at-least-once: a worker wrongly
//! presumed dead may still finish a task that is also re-run elsewhere.

pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod liveness;
pub mod logging;
pub mod stats;
pub mod task_queue;
pub mod transport;
pub mod types;
pub mod worker;

pub use error::{DispatchError, Result};
