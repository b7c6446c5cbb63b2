//! Connection state machine.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Transport being opened.
    Connecting,
    /// Protocol version and capability handshake.
    Negotiating,
    /// Idle, accepting downloads and run/stop commands.
    Ready,
    /// Exactly one transfer active.
    Downloading,
    /// User program executing on the hub.
    Running,
    /// Draining buffered output before the transport closes.
    Disconnecting,
    /// Protocol or transport failure. Only teardown leaves this state.
    Faulted { reason: String },
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Negotiating => write!(f, "NEGOTIATING"),
            ConnectionState::Ready => write!(f, "READY"),
            ConnectionState::Downloading => write!(f, "DOWNLOADING"),
            ConnectionState::Running => write!(f, "RUNNING"),
            ConnectionState::Disconnecting => write!(f, "DISCONNECTING"),
            ConnectionState::Faulted { reason } => write!(f, "FAULTED ({})", reason),
        }
    }
}

impl ConnectionState {
    /// Whether the machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Faulted { .. }, Disconnected) => true,
            (Faulted { .. }, _) => false,
            (Disconnected, Connecting) => true,
            (Disconnected, _) => false,
            (Disconnecting, Disconnected) => true,
            (Disconnecting, _) => false,
            (_, Faulted { .. }) | (_, Disconnecting) => true,
            (Connecting, Negotiating) | (Connecting, Disconnected) => true,
            (Negotiating, Ready) => true,
            (Ready, Downloading) | (Ready, Running) => true,
            (Downloading, Ready) | (Running, Ready) => true,
            _ => false,
        }
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self, ConnectionState::Faulted { .. })
    }

    /// States in which the transport is open.
    pub fn is_connected(&self) -> bool {
        !matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Connecting
        )
    }
}

/// Observable, validated state cell shared by a connection and its dispatcher.
#[derive(Clone)]
pub struct StateHandle {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl Default for StateHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StateHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> ConnectionState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Transition to `next`. On rejection the current state is returned.
    pub fn goto(&self, next: ConnectionState) -> Result<(), ConnectionState> {
        let mut rejected = None;
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(&next) {
                tracing::info!(from = %current, to = %next, "State transition");
                *current = next.clone();
                true
            } else {
                rejected = Some(current.clone());
                false
            }
        });
        match rejected {
            Some(current) => Err(current),
            None => Ok(()),
        }
    }

    /// Move to `Faulted`. Returns false when already faulted or disconnected.
    pub fn fault(&self, reason: impl Into<String>) -> bool {
        self.goto(ConnectionState::Faulted {
            reason: reason.into(),
        })
        .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    fn faulted() -> ConnectionState {
        Faulted {
            reason: "boom".into(),
        }
    }

    #[test]
    fn test_no_shortcut_to_running() {
        assert!(!Disconnected.can_transition_to(&Running));
        assert!(!Connecting.can_transition_to(&Running));
        assert!(!Negotiating.can_transition_to(&Running));
        assert!(Ready.can_transition_to(&Running));
    }

    #[test]
    fn test_faulted_only_leaves_to_disconnected() {
        for next in [
            Connecting,
            Negotiating,
            Ready,
            Downloading,
            Running,
            Disconnecting,
            faulted(),
        ] {
            assert!(!faulted().can_transition_to(&next), "{next}");
        }
        assert!(faulted().can_transition_to(&Disconnected));
    }

    #[test]
    fn test_fault_reachable_from_active_states() {
        for from in [Connecting, Negotiating, Ready, Downloading, Running] {
            assert!(from.can_transition_to(&faulted()), "{from}");
        }
        assert!(!Disconnected.can_transition_to(&faulted()));
    }

    #[test]
    fn test_handle_rejects_and_reports_current() {
        let state = StateHandle::new();
        let mut rx = state.subscribe();
        assert_eq!(state.goto(Running), Err(Disconnected));
        state.goto(Connecting).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Connecting);
        assert!(state.fault("link lost"));
        assert!(!state.fault("again"));
        assert!(state.get().is_faulted());
    }
}
