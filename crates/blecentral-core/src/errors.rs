//! Error types for the blecentral client
//!
//! Every failure a caller can observe is a [`BleError`]. Backends translate
//! their native errors into this taxonomy at the adapter boundary so that the
//! session layer never has to know which stack produced them.

use std::time::Duration;

use crate::state::{ConnectionState, StateTransitionError};

// ----------------------------------------------------------------------------
// Operation Kinds
// ----------------------------------------------------------------------------

/// GATT operation that was rejected by the peripheral or the native stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattOperation {
    Read,
    Write,
    Subscribe,
    Unsubscribe,
    ReadDescriptor,
    WriteDescriptor,
    Discover,
}

impl std::fmt::Display for GattOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GattOperation::Read => "read",
            GattOperation::Write => "write",
            GattOperation::Subscribe => "subscribe",
            GattOperation::Unsubscribe => "unsubscribe",
            GattOperation::ReadDescriptor => "read descriptor",
            GattOperation::WriteDescriptor => "write descriptor",
            GattOperation::Discover => "discover",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors surfaced by scanning, sessions and backends
#[derive(Debug, Clone, thiserror::Error)]
pub enum BleError {
    /// Native connection refused or peripheral unreachable
    #[error("Failed to connect to {peripheral}: {reason}")]
    Connect { peripheral: String, reason: String },

    /// Service enumeration failed
    #[error("Service discovery failed: {reason}")]
    Discovery { reason: String },

    /// Read/write/subscribe rejected by the peripheral or native stack
    #[error("GATT {operation} on {target} failed: {reason}")]
    Operation {
        operation: GattOperation,
        target: String,
        reason: String,
    },

    /// No response within the configured deadline
    #[error("{operation} timed out after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// Operation invalidated by a concurrent or prior disconnection
    #[error("Disconnected: {reason}")]
    Disconnected { reason: String },

    /// Selector does not resolve in the current GATT tree
    #[error("Characteristic not found: {selector}")]
    CharacteristicNotFound { selector: String },

    /// Descriptor reference does not resolve in the current GATT tree
    #[error("Descriptor not found: {selector}")]
    DescriptorNotFound { selector: String },

    /// More than one characteristic matched and the policy forbids guessing
    #[error("Characteristic {uuid} is ambiguous ({count} matches)")]
    AmbiguousCharacteristic { uuid: String, count: usize },

    /// Re-entrant connect attempt
    #[error("Connect rejected: session is {state}")]
    AlreadyConnecting { state: ConnectionState },

    /// Connection is being established; GATT commands are not accepted yet
    #[error("Session not ready: currently {state}")]
    NotReady { state: ConnectionState },

    /// Scanning could not be started or stopped
    #[error("Scan error: {reason}")]
    Scan { reason: String },

    /// No usable adapter on this host
    #[error("Bluetooth adapter not available: {reason}")]
    AdapterUnavailable { reason: String },

    /// The backend violated the adapter contract
    #[error("Adapter contract violation: {detail}")]
    AdapterContract { detail: String },

    /// Malformed UUID string
    #[error("Invalid UUID '{input}'")]
    InvalidUuid { input: String },

    /// The session task is gone
    #[error("Channel error: {message}")]
    Channel { message: String },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("State transition error: {0}")]
    StateTransition(#[from] StateTransitionError),
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl BleError {
    pub fn connect<P: Into<String>, R: Into<String>>(peripheral: P, reason: R) -> Self {
        BleError::Connect {
            peripheral: peripheral.into(),
            reason: reason.into(),
        }
    }

    pub fn discovery<R: Into<String>>(reason: R) -> Self {
        BleError::Discovery {
            reason: reason.into(),
        }
    }

    pub fn operation<T: Into<String>, R: Into<String>>(
        operation: GattOperation,
        target: T,
        reason: R,
    ) -> Self {
        BleError::Operation {
            operation,
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout<O: Into<String>>(operation: O, duration: Duration) -> Self {
        BleError::Timeout {
            operation: operation.into(),
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn disconnected<R: Into<String>>(reason: R) -> Self {
        BleError::Disconnected {
            reason: reason.into(),
        }
    }

    pub fn characteristic_not_found<S: Into<String>>(selector: S) -> Self {
        BleError::CharacteristicNotFound {
            selector: selector.into(),
        }
    }

    pub fn descriptor_not_found<S: Into<String>>(selector: S) -> Self {
        BleError::DescriptorNotFound {
            selector: selector.into(),
        }
    }

    pub fn scan<R: Into<String>>(reason: R) -> Self {
        BleError::Scan {
            reason: reason.into(),
        }
    }

    pub fn adapter_unavailable<R: Into<String>>(reason: R) -> Self {
        BleError::AdapterUnavailable {
            reason: reason.into(),
        }
    }

    pub fn contract<D: Into<String>>(detail: D) -> Self {
        BleError::AdapterContract {
            detail: detail.into(),
        }
    }

    pub fn channel_error<M: Into<String>>(message: M) -> Self {
        BleError::Channel {
            message: message.into(),
        }
    }

    pub fn config_error<R: Into<String>>(reason: R) -> Self {
        BleError::Configuration {
            reason: reason.into(),
        }
    }

    /// Whether the session can be used again after this error.
    ///
    /// Contract violations and a dead session task are fatal; everything else
    /// leaves the session in a state from which `connect()` or the next command
    /// can proceed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            BleError::AdapterContract { .. }
                | BleError::Channel { .. }
                | BleError::StateTransition(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BleError::Timeout { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, BleError::Disconnected { .. })
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type BleResult<T> = std::result::Result<T, BleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(BleError::disconnected("link lost").is_recoverable());
        assert!(BleError::timeout("read", Duration::from_millis(10)).is_recoverable());
        assert!(!BleError::contract("ack for unknown command").is_recoverable());
        assert!(!BleError::channel_error("session task exited").is_recoverable());
    }

    #[test]
    fn test_error_messages() {
        let err = BleError::operation(GattOperation::Write, "2a37", "insufficient authentication");
        assert_eq!(
            err.to_string(),
            "GATT write on 2a37 failed: insufficient authentication"
        );

        let err = BleError::timeout("read", Duration::from_millis(250));
        assert_eq!(err.to_string(), "read timed out after 250ms");
    }
}
