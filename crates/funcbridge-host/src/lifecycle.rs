//! Worker lifecycle state machine.
//!
//! `Spawned → Connected → Ready → Serving → {Exited | Faulted}`.
//!
//! The terminal states absorb everything: once a worker is dead no event
//! revives it. Any unexpected message ordering is a protocol violation and
//! lands in `Faulted` — there is no in-place recovery, the clean remedy is
//! a supervisor-level restart, for which this module exposes the
//! unambiguous "this worker is dead" signal.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use funcbridge_proto::ControlMessage;

/// Where one worker is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    /// Process launched; control connection not yet seen.
    Spawned,
    /// `started` observed: alive, not yet ready to serve.
    Connected,
    /// `ready` observed; traffic may be routed.
    Ready { port: Option<u16> },
    /// At least one request has been dispatched.
    Serving { port: Option<u16> },
    /// The process ended with an exit code. Terminal.
    Exited(i32),
    /// The worker is no longer trustworthy. Terminal.
    Faulted(String),
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Faulted(_))
    }

    /// Whether a request may be dispatched to the worker right now.
    pub fn can_dispatch(&self) -> bool {
        matches!(self, Self::Ready { .. } | Self::Serving { .. })
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawned => write!(f, "spawned"),
            Self::Connected => write!(f, "connected"),
            Self::Ready { .. } => write!(f, "ready"),
            Self::Serving { .. } => write!(f, "serving"),
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Faulted(reason) => write!(f, "faulted: {reason}"),
        }
    }
}

/// Everything that can move the state machine.
#[derive(Debug)]
pub enum WorkerEvent {
    /// A control message arrived (already sequence-checked).
    Message(ControlMessage),
    /// A malformed frame or ordering violation on the control channel.
    ProtocolViolation(String),
    /// The control connection closed without a graceful shutdown.
    ConnectionClosed,
    /// The worker process terminated with this exit code.
    ProcessExited(i32),
    /// The first request was handed to the worker.
    DispatchStarted,
}

/// Apply one event to the current state, producing the next.
fn transition(current: &WorkerState, event: &WorkerEvent) -> WorkerState {
    if current.is_terminal() {
        // A process exit may still refine an earlier fault with a code,
        // but a fault reason is never overwritten.
        return current.clone();
    }
    match event {
        WorkerEvent::Message(ControlMessage::Started) => match current {
            WorkerState::Spawned => WorkerState::Connected,
            other => fault(format!("`started` received in state {other:?}")),
        },
        WorkerEvent::Message(ControlMessage::Ready { port }) => match current {
            WorkerState::Connected => WorkerState::Ready { port: *port },
            other => fault(format!("`ready` received in state {other:?}")),
        },
        WorkerEvent::Message(ControlMessage::Error { error }) => fault(error.clone()),
        WorkerEvent::ProtocolViolation(reason) => fault(reason.clone()),
        WorkerEvent::ConnectionClosed => fault("control connection closed".to_string()),
        WorkerEvent::ProcessExited(code) => WorkerState::Exited(*code),
        WorkerEvent::DispatchStarted => match current {
            WorkerState::Ready { port } | WorkerState::Serving { port } => {
                WorkerState::Serving { port: *port }
            }
            other => other.clone(),
        },
    }
}

fn fault(reason: String) -> WorkerState {
    WorkerState::Faulted(reason)
}

/// Shared, observable handle to one worker's state.
///
/// Clones share the same underlying state; observers subscribe for
/// transition notifications.
#[derive(Debug, Clone)]
pub struct StateHandle {
    tx: Arc<watch::Sender<WorkerState>>,
}

impl StateHandle {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::channel(WorkerState::Spawned).0),
        }
    }

    /// Apply an event, returning the resulting state.
    pub fn apply(&self, event: WorkerEvent) -> WorkerState {
        let mut next = WorkerState::Spawned;
        self.tx.send_modify(|state| {
            next = transition(state, &event);
            if *state != next {
                tracing::debug!(from = ?state, to = ?next, ?event, "worker state transition");
            }
            *state = next.clone();
        });
        next
    }

    pub fn snapshot(&self) -> WorkerState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.tx.subscribe()
    }
}

impl Default for StateHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> WorkerEvent {
        WorkerEvent::Message(ControlMessage::Started)
    }

    fn ready(port: Option<u16>) -> WorkerEvent {
        WorkerEvent::Message(ControlMessage::Ready { port })
    }

    #[test]
    fn happy_path_reaches_serving() {
        let state = StateHandle::new();
        assert_eq!(state.apply(started()), WorkerState::Connected);
        assert_eq!(
            state.apply(ready(Some(4000))),
            WorkerState::Ready { port: Some(4000) }
        );
        assert!(state.snapshot().can_dispatch());
        assert_eq!(
            state.apply(WorkerEvent::DispatchStarted),
            WorkerState::Serving { port: Some(4000) }
        );
        assert!(state.snapshot().can_dispatch());
    }

    #[test]
    fn error_message_faults_the_worker() {
        let state = StateHandle::new();
        state.apply(started());
        let next = state.apply(WorkerEvent::Message(ControlMessage::Error {
            error: "uncaughtException: boom".into(),
        }));
        assert_eq!(next, WorkerState::Faulted("uncaughtException: boom".into()));
        assert!(next.is_terminal());
        assert!(!next.can_dispatch());
    }

    #[test]
    fn ready_before_started_is_a_violation() {
        let state = StateHandle::new();
        let next = state.apply(ready(None));
        assert!(matches!(next, WorkerState::Faulted(_)));
    }

    #[test]
    fn connection_close_without_shutdown_is_a_fault() {
        let state = StateHandle::new();
        state.apply(started());
        state.apply(ready(None));
        let next = state.apply(WorkerEvent::ConnectionClosed);
        assert_eq!(next, WorkerState::Faulted("control connection closed".into()));
    }

    #[test]
    fn terminal_states_absorb_everything() {
        let state = StateHandle::new();
        state.apply(started());
        state.apply(WorkerEvent::Message(ControlMessage::Error {
            error: "first fault".into(),
        }));
        // Neither a later exit nor a later message rewrites the fault.
        assert_eq!(
            state.apply(WorkerEvent::ProcessExited(1)),
            WorkerState::Faulted("first fault".into())
        );
        assert_eq!(
            state.apply(ready(None)),
            WorkerState::Faulted("first fault".into())
        );
    }

    #[test]
    fn clean_exit_is_not_a_fault() {
        let state = StateHandle::new();
        state.apply(started());
        state.apply(ready(None));
        assert_eq!(
            state.apply(WorkerEvent::ProcessExited(0)),
            WorkerState::Exited(0)
        );
        // The close that follows a recorded exit is absorbed.
        assert_eq!(
            state.apply(WorkerEvent::ConnectionClosed),
            WorkerState::Exited(0)
        );
    }

    #[test]
    fn no_dispatch_before_ready() {
        let state = StateHandle::new();
        assert!(!state.snapshot().can_dispatch());
        state.apply(started());
        assert!(!state.snapshot().can_dispatch());
    }

    #[tokio::test]
    async fn observers_see_transitions() {
        let state = StateHandle::new();
        let mut rx = state.subscribe();
        state.apply(started());
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), WorkerState::Connected);
    }
}
