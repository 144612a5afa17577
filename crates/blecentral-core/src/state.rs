//! Session State Machine
//!
//! Pure transition table for one session's connection lifecycle. The runtime
//! feeds it [`SessionEvent`]s from its single execution context; the machine
//! validates each transition, maintains the generation counter and keeps a
//! bounded audit trail. It performs no I/O.
//!
//! ```text
//! Disconnected -> Connecting -> ServiceDiscovery -> Ready -> Disconnecting -> Disconnected
//!                     |               |
//!                     +---> Error <---+ ---> Disconnected (after cleanup)
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::errors::BleError;

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No native connection
    #[default]
    Disconnected,
    /// Waiting for the backend to confirm the native connection
    Connecting,
    /// Connected; the discovery pass is running
    ServiceDiscovery,
    /// GATT tree populated; commands accepted
    Ready,
    /// Tearing down the native connection
    Disconnecting,
    /// Connect or discovery failed; cleanup pending
    Error,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::ServiceDiscovery => "ServiceDiscovery",
            ConnectionState::Ready => "Ready",
            ConnectionState::Disconnecting => "Disconnecting",
            ConnectionState::Error => "Error",
        }
    }

    /// Whether a native connection exists or is being established
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::ServiceDiscovery | ConnectionState::Ready
        )
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    /// Error returned to a GATT command submitted in this state, if any
    pub fn command_rejection(&self) -> Option<BleError> {
        match self {
            ConnectionState::Ready => None,
            ConnectionState::Connecting | ConnectionState::ServiceDiscovery => {
                Some(BleError::NotReady { state: *self })
            }
            ConnectionState::Disconnected
            | ConnectionState::Disconnecting
            | ConnectionState::Error => Some(BleError::disconnected(format!("session is {}", self))),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

/// Inputs that drive the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Application called `connect()`
    ConnectRequested,
    /// Backend confirmed the native connection
    LinkEstablished,
    /// Backend refused or the connect deadline expired
    ConnectFailed { reason: String },
    /// GATT tree fully built
    DiscoveryComplete,
    /// Discovery pass failed or timed out
    DiscoveryFailed { reason: String },
    /// Application called `disconnect()`
    DisconnectRequested,
    /// Unsolicited disconnection reported by the backend
    LinkLost { reason: String },
    /// Native teardown finished (or was abandoned)
    TeardownComplete,
    /// Resources of a failed attempt released
    CleanupComplete,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::ConnectRequested => "ConnectRequested",
            SessionEvent::LinkEstablished => "LinkEstablished",
            SessionEvent::ConnectFailed { .. } => "ConnectFailed",
            SessionEvent::DiscoveryComplete => "DiscoveryComplete",
            SessionEvent::DiscoveryFailed { .. } => "DiscoveryFailed",
            SessionEvent::DisconnectRequested => "DisconnectRequested",
            SessionEvent::LinkLost { .. } => "LinkLost",
            SessionEvent::TeardownComplete => "TeardownComplete",
            SessionEvent::CleanupComplete => "CleanupComplete",
        }
    }
}

// ----------------------------------------------------------------------------
// Transition Results
// ----------------------------------------------------------------------------

/// Outcome of an accepted event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    /// Generation after the transition
    pub generation: u64,
    /// Whether this transition started a new generation
    pub generation_changed: bool,
}

/// Audit trail entry for state transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: SystemTime,
    pub from_state: ConnectionState,
    pub to_state: ConnectionState,
    pub event: String,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateTransitionError {
    /// Event not valid in the current state
    #[error("Invalid transition from {from_state} on {event}: {reason}")]
    InvalidTransition {
        from_state: ConnectionState,
        event: String,
        reason: String,
    },
}

// ----------------------------------------------------------------------------
// State Machine
// ----------------------------------------------------------------------------

/// Connection lifecycle plus generation counter.
///
/// The generation advances when a connect attempt starts and again whenever
/// the link is torn down, so every continuation created under one connection
/// can be recognised as stale afterwards.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    state: ConnectionState,
    generation: u64,
    audit: VecDeque<AuditEntry>,
    audit_capacity: usize,
}

impl SessionMachine {
    pub fn new(audit_capacity: usize) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            generation: 0,
            audit: VecDeque::with_capacity(audit_capacity.min(256)),
            audit_capacity,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn audit_trail(&self) -> impl Iterator<Item = &AuditEntry> {
        self.audit.iter()
    }

    /// Apply an event, returning the transition taken
    pub fn apply(&mut self, event: SessionEvent) -> Result<Transition, StateTransitionError> {
        use ConnectionState::*;

        let from = self.state;
        let to = match (&event, from) {
            (SessionEvent::ConnectRequested, Disconnected) => Connecting,
            (SessionEvent::LinkEstablished, Connecting) => ServiceDiscovery,
            (SessionEvent::ConnectFailed { .. }, Connecting) => Error,
            (SessionEvent::DiscoveryComplete, ServiceDiscovery) => Ready,
            (SessionEvent::DiscoveryFailed { .. }, ServiceDiscovery) => Error,
            (SessionEvent::DisconnectRequested, Connecting | ServiceDiscovery | Ready) => {
                Disconnecting
            }
            (SessionEvent::LinkLost { .. }, Connecting | ServiceDiscovery | Ready) => {
                Disconnecting
            }
            (SessionEvent::TeardownComplete, Disconnecting) => Disconnected,
            (SessionEvent::CleanupComplete, Error) => Disconnected,
            (event, from) => {
                return Err(StateTransitionError::InvalidTransition {
                    from_state: from,
                    event: event.name().to_string(),
                    reason: format!("{} is not accepted in {}", event.name(), from),
                })
            }
        };

        let generation_changed = matches!(to, Connecting | Disconnecting | Error);
        if generation_changed {
            self.generation += 1;
        }
        self.state = to;
        self.record(from, to, &event);

        Ok(Transition {
            from,
            to,
            generation: self.generation,
            generation_changed,
        })
    }

    fn record(&mut self, from: ConnectionState, to: ConnectionState, event: &SessionEvent) {
        if self.audit_capacity == 0 {
            return;
        }
        if self.audit.len() == self.audit_capacity {
            self.audit.pop_front();
        }
        self.audit.push_back(AuditEntry {
            timestamp: SystemTime::now(),
            from_state: from,
            to_state: to,
            event: event.name().to_string(),
            generation: self.generation,
        });
    }
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let machine = SessionMachine::default();
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert_eq!(machine.generation(), 0);
        assert_eq!(machine.audit_trail().count(), 0);
    }

    #[test]
    fn test_happy_path_and_teardown() {
        let mut machine = SessionMachine::default();

        let t = machine.apply(SessionEvent::ConnectRequested).unwrap();
        assert_eq!(t.to, ConnectionState::Connecting);
        assert_eq!(t.generation, 1);

        machine.apply(SessionEvent::LinkEstablished).unwrap();
        let t = machine.apply(SessionEvent::DiscoveryComplete).unwrap();
        assert_eq!(t.to, ConnectionState::Ready);
        assert!(!t.generation_changed);

        let t = machine
            .apply(SessionEvent::LinkLost {
                reason: "supervision timeout".into(),
            })
            .unwrap();
        assert_eq!(t.to, ConnectionState::Disconnecting);
        assert_eq!(t.generation, 2);

        machine.apply(SessionEvent::TeardownComplete).unwrap();
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert_eq!(machine.audit_trail().count(), 5);
    }

    #[test]
    fn test_connect_rejected_unless_disconnected() {
        let mut machine = SessionMachine::default();
        machine.apply(SessionEvent::ConnectRequested).unwrap();

        let err = machine.apply(SessionEvent::ConnectRequested).unwrap_err();
        match err {
            StateTransitionError::InvalidTransition { from_state, .. } => {
                assert_eq!(from_state, ConnectionState::Connecting);
            }
        }
        assert_eq!(machine.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_failure_passes_through_error() {
        let mut machine = SessionMachine::default();
        machine.apply(SessionEvent::ConnectRequested).unwrap();
        machine.apply(SessionEvent::LinkEstablished).unwrap();
        let t = machine
            .apply(SessionEvent::DiscoveryFailed {
                reason: "gatt error".into(),
            })
            .unwrap();
        assert_eq!(t.to, ConnectionState::Error);

        assert!(machine.apply(SessionEvent::ConnectRequested).is_err());
        machine.apply(SessionEvent::CleanupComplete).unwrap();
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_audit_trail_is_bounded() {
        let mut machine = SessionMachine::new(3);
        for _ in 0..3 {
            machine.apply(SessionEvent::ConnectRequested).unwrap();
            machine.apply(SessionEvent::DisconnectRequested).unwrap();
            machine.apply(SessionEvent::TeardownComplete).unwrap();
        }
        let events: Vec<_> = machine.audit_trail().map(|e| e.event.as_str()).collect();
        assert_eq!(
            events,
            vec!["ConnectRequested", "DisconnectRequested", "TeardownComplete"]
        );
    }

    #[test]
    fn test_command_rejection_by_state() {
        assert!(ConnectionState::Ready.command_rejection().is_none());
        assert!(matches!(
            ConnectionState::Connecting.command_rejection(),
            Some(BleError::NotReady { .. })
        ));
        assert!(ConnectionState::Disconnected
            .command_rejection()
            .is_some_and(|e| e.is_disconnected()));
    }
}
