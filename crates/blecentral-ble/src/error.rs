//! Native error mapping
//!
//! Both stacks report failures as opaque error values. They are folded into
//! [`BleError`] by the phase in which they occurred so callers see the same
//! taxonomy regardless of backend.

use std::fmt::Display;

use blecentral_core::{AttributeHandle, BleError, BleResult, GattOperation, PeripheralId};

// ----------------------------------------------------------------------------
// Result Extension
// ----------------------------------------------------------------------------

pub(crate) trait NativeResultExt<T> {
    fn or_adapter(self, context: &str) -> BleResult<T>;
    fn or_scan(self) -> BleResult<T>;
    fn or_connect(self, peripheral: &PeripheralId) -> BleResult<T>;
    fn or_discovery(self) -> BleResult<T>;
    fn or_operation(self, operation: GattOperation, handle: AttributeHandle) -> BleResult<T>;
}

impl<T, E: Display> NativeResultExt<T> for Result<T, E> {
    fn or_adapter(self, context: &str) -> BleResult<T> {
        self.map_err(|e| BleError::adapter_unavailable(format!("{}: {}", context, e)))
    }

    fn or_scan(self) -> BleResult<T> {
        self.map_err(|e| BleError::scan(e.to_string()))
    }

    fn or_connect(self, peripheral: &PeripheralId) -> BleResult<T> {
        self.map_err(|e| BleError::connect(peripheral.as_str(), e.to_string()))
    }

    fn or_discovery(self) -> BleResult<T> {
        self.map_err(|e| BleError::discovery(e.to_string()))
    }

    fn or_operation(self, operation: GattOperation, handle: AttributeHandle) -> BleResult<T> {
        self.map_err(|e| BleError::operation(operation, handle.to_string(), e.to_string()))
    }
}

/// Error for a handle the backend never reported on this connection
pub(crate) fn unknown_handle(operation: GattOperation, handle: AttributeHandle) -> BleError {
    BleError::operation(
        operation,
        handle.to_string(),
        "handle not reported by service discovery on this connection",
    )
}

/// Error for a connection token the backend no longer tracks
pub(crate) fn unknown_connection<C: Display>(connection: C) -> BleError {
    BleError::disconnected(format!("no native connection {}", connection))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_errors_carry_target_and_reason() {
        let result: Result<(), &str> = Err("ATT error 0x05");
        let err = result
            .or_operation(GattOperation::Read, AttributeHandle(0x2a))
            .unwrap_err();
        assert!(matches!(
            err,
            BleError::Operation {
                operation: GattOperation::Read,
                ..
            }
        ));
        let message = err.to_string();
        assert!(message.contains("0x002a"));
        assert!(message.contains("ATT error 0x05"));
    }

    #[test]
    fn test_phase_mapping() {
        let id = PeripheralId::new("AA:BB:CC:DD:EE:FF");
        let failed: Result<(), String> = Err("page timeout".into());
        assert!(matches!(
            failed.clone().or_connect(&id),
            Err(BleError::Connect { .. })
        ));
        assert!(matches!(failed.clone().or_scan(), Err(BleError::Scan { .. })));
        assert!(matches!(
            failed.clone().or_discovery(),
            Err(BleError::Discovery { .. })
        ));
        assert!(matches!(
            failed.or_adapter("no adapter"),
            Err(BleError::AdapterUnavailable { .. })
        ));
        assert!(unknown_connection("AA#3").is_disconnected());
    }
}
