//! Worker supervision.
//!
//! One supervisor owns one worker for its whole lifetime: it binds the
//! control socket, spawns the process, folds control events into the
//! lifecycle state machine, and kills the process the moment the state
//! machine declares it untrustworthy. There is no in-place restart; a
//! dead worker stays dead and the caller decides what to do next.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::control::ControlSocket;
use crate::lifecycle::{StateHandle, WorkerEvent, WorkerState};
use crate::process::{Paths, WorkerProcess};
use crate::HostError;

pub struct Supervisor {
    state: StateHandle,
}

impl Supervisor {
    /// Bind the control socket, spawn the worker, and start supervising.
    pub async fn start(config: &Config) -> Result<Self, HostError> {
        let socket = ControlSocket::bind(&config.control_socket)?;
        let state = StateHandle::new();
        let (event_tx, event_rx) = mpsc::channel(16);
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(socket.serve(event_tx.clone()));

        let mut process = WorkerProcess::new(Paths::from(config));
        process.spawn()?;
        tokio::spawn(watch_process(process, event_tx, kill_rx));
        tokio::spawn(apply_events(state.clone(), event_rx, kill_tx));

        Ok(Self { state })
    }

    pub fn state(&self) -> StateHandle {
        self.state.clone()
    }

    /// Wait until the worker reports ready, returning its announced port.
    ///
    /// A worker that dies first, or never reports within `timeout`, is a
    /// startup failure.
    pub async fn await_ready(&self, timeout: Duration) -> Result<Option<u16>, HostError> {
        let mut updates = self.state.subscribe();
        let settled = tokio::time::timeout(
            timeout,
            updates.wait_for(|state| state.can_dispatch() || state.is_terminal()),
        )
        .await
        .map_err(|_| HostError::ReadyTimeout)?;

        match settled {
            Ok(state) => match &*state {
                WorkerState::Ready { port } | WorkerState::Serving { port } => Ok(*port),
                WorkerState::Faulted(reason) => Err(HostError::Faulted(reason.clone())),
                WorkerState::Exited(code) => Err(HostError::Faulted(format!(
                    "worker exited with code {code} before reporting ready"
                ))),
                _ => unreachable!("wait_for settled on a non-settled state"),
            },
            Err(_) => Err(HostError::Faulted("supervisor stopped".into())),
        }
    }

    /// Wait until the worker reaches a terminal state and return it.
    pub async fn wait_terminal(&self) -> WorkerState {
        let mut updates = self.state.subscribe();
        match updates.wait_for(|state| state.is_terminal()).await {
            Ok(state) => state.clone(),
            // The supervisor itself went away without observing an exit.
            Err(_) => WorkerState::Faulted("supervisor stopped".into()),
        }
    }
}

/// Wait on the child, forwarding its exit code as an event. A kill
/// trigger fires when the state machine faults: the worker cannot be
/// trusted to exit on its own at that point.
async fn watch_process(
    mut process: WorkerProcess,
    events: mpsc::Sender<WorkerEvent>,
    kill: oneshot::Receiver<String>,
) {
    tokio::select! {
        status = process.wait() => match status {
            Ok(status) => {
                let code = status.code().unwrap_or(-1);
                info!(code, "worker process exited");
                let _ = events.send(WorkerEvent::ProcessExited(code)).await;
            }
            Err(err) => {
                error!(error = %err, "failed waiting on worker process");
                let _ = events
                    .send(WorkerEvent::ProtocolViolation(format!(
                        "wait on worker failed: {err}"
                    )))
                    .await;
            }
        },
        reason = kill => {
            if let Ok(reason) = reason {
                warn!(reason = %reason, "killing faulted worker");
            }
            if let Err(err) = process.kill().await {
                error!(error = %err, "failed to kill worker process");
            }
        }
    }
}

/// Fold control events into the state machine; pull the kill trigger on
/// the first transition into `Faulted`.
async fn apply_events(
    state: StateHandle,
    mut events: mpsc::Receiver<WorkerEvent>,
    kill: oneshot::Sender<String>,
) {
    let mut kill = Some(kill);
    while let Some(event) = events.recv().await {
        if let WorkerState::Faulted(reason) = state.apply(event)
            && let Some(trigger) = kill.take()
        {
            let _ = trigger.send(reason);
        }
    }
}
