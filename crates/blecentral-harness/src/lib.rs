//! blecentral harness
//!
//! A deterministic stand-in for the native BLE stacks. [`SimulatedAdapter`]
//! implements the same [`NativeAdapter`](blecentral_core::NativeAdapter)
//! contract as the BlueZ and btleplug backends, so sessions and scanners can
//! be exercised end to end in ordinary `#[tokio::test]`s.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use blecentral_harness::{heart_rate_monitor, SimulatedAdapter};
//!
//! let hrm = heart_rate_monitor("AA:BB:CC:DD:EE:01");
//! let adapter = Arc::new(SimulatedAdapter::ideal());
//! adapter.script_peripheral(Duration::from_millis(10), &hrm);
//! adapter.add_peripheral(hrm);
//! ```

pub mod adapter;
pub mod peripheral;

pub use adapter::{AdapterCall, SimulatedAdapter, SimulatedAdapterConfig};
pub use peripheral::{
    echo_peripheral, heart_rate_monitor, notify_only, read_notify, read_only, read_write,
    SimulatedPeripheral, CCCD_UUID, ECHO_CHARACTERISTIC_UUID, ECHO_SERVICE_UUID,
};
