//! Native backends for the blecentral BLE client
//!
//! Each backend implements [`NativeAdapter`](blecentral_core::NativeAdapter)
//! for one platform stack:
//!
//! - [`BluezAdapter`] - BlueZ over D-Bus via `bluer` (Linux only)
//! - [`BtleplugAdapter`] - CoreBluetooth, WinRT or BlueZ via `btleplug`
//!
//! [`open_adapter`] picks one from a [`ClientConfig`](blecentral_core::ClientConfig);
//! [`open_central`] also wraps it in a [`Central`](blecentral_runtime::Central).
//!
//! ## Usage
//!
//! ```rust,no_run
//! use blecentral_ble::open_central;
//! use blecentral_runtime::{uuid_from_u16, ClientConfig, ScanFilter};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let central = open_central(ClientConfig::load()?).await?;
//!
//! let mut sightings = central.scan(ScanFilter::services(&["180d"])?).await?;
//! if let Some(peripheral) = sightings.next().await {
//!     central.stop_scan().await?;
//!     let session = central.session(peripheral)?;
//!     session.connect().await?;
//!     let location = session.read(uuid_from_u16(0x2a38)).await?;
//!     println!("sensor location: {:?}", location);
//!     session.close().await?;
//! }
//! # Ok(())
//! # }
//! ```

#[cfg(target_os = "linux")]
mod bluez;
mod error;
mod platform;
mod portable;

#[cfg(target_os = "linux")]
pub use bluez::BluezAdapter;
pub use platform::{open_adapter, open_central};
pub use portable::BtleplugAdapter;
