//! funcbridge-host — the supervising half of the execution bridge.
//!
//! Owns the worker's lifecycle end to end: bind the control socket, spawn
//! the worker process, follow its lifecycle state machine from control
//! messages, gate request dispatch on readiness, and surface fatal
//! failures so the caller can exit non-zero instead of silently dropping
//! traffic.
//!
//! # Architecture
//!
//! ```text
//! Supervisor
//!   ├── ControlSocket        accept + pump control frames → WorkerEvent
//!   ├── WorkerProcess        spawn / wait / kill (tokio::process)
//!   ├── StateHandle          Spawned → Connected → Ready → Serving
//!   │                          → Exited(code) | Faulted(reason)
//!   └── Dispatcher           readiness gate + per-request channel pairs
//! ```

pub mod config;
pub mod control;
pub mod dispatch;
pub mod lifecycle;
pub mod process;
pub mod supervisor;

pub use config::Config;
pub use control::ControlSocket;
pub use dispatch::Dispatcher;
pub use lifecycle::{StateHandle, WorkerEvent, WorkerState};
pub use process::WorkerProcess;
pub use supervisor::Supervisor;

use thiserror::Error;

use funcbridge_proto::ProtocolError;

/// Supervisor-side failures.
#[derive(Debug, Error)]
pub enum HostError {
    /// Missing or invalid configuration; nothing was started.
    #[error("startup failed: {0}")]
    Startup(String),
    /// The control channel itself misbehaved. Always fatal to the worker.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The worker is dead or untrustworthy.
    #[error("worker faulted: {0}")]
    Faulted(String),
    /// A request was dispatched while the worker was not serving.
    #[error("worker not ready: {0}")]
    NotReady(String),
    /// The worker never became ready within the configured window.
    #[error("timed out waiting for worker readiness")]
    ReadyTimeout,
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}
