//! Backend selection

use std::sync::Arc;

use blecentral_core::{BackendPreference, BleResult, ClientConfig, NativeAdapter};
use blecentral_runtime::Central;
use tracing::debug;

use crate::portable::BtleplugAdapter;

/// Open the native stack named by `config.backend` on `config.adapter`
pub async fn open_adapter(config: &ClientConfig) -> BleResult<Arc<dyn NativeAdapter>> {
    config.validate()?;
    let name = config.adapter.as_deref();
    debug!(backend = ?config.backend, adapter = ?name, "Opening BLE backend");

    match config.backend {
        BackendPreference::BlueZ => open_bluez(name).await,
        BackendPreference::Btleplug => Ok(Arc::new(BtleplugAdapter::open(name).await?)),
        BackendPreference::Auto if cfg!(target_os = "linux") => open_bluez(name).await,
        BackendPreference::Auto => Ok(Arc::new(BtleplugAdapter::open(name).await?)),
    }
}

/// Open the configured backend and wrap it in a [`Central`]
pub async fn open_central(config: ClientConfig) -> BleResult<Central> {
    let adapter = open_adapter(&config).await?;
    Central::new(adapter, config)
}

#[cfg(target_os = "linux")]
async fn open_bluez(name: Option<&str>) -> BleResult<Arc<dyn NativeAdapter>> {
    Ok(Arc::new(crate::bluez::BluezAdapter::open(name).await?))
}

#[cfg(not(target_os = "linux"))]
async fn open_bluez(_name: Option<&str>) -> BleResult<Arc<dyn NativeAdapter>> {
    Err(blecentral_core::BleError::adapter_unavailable(
        "the BlueZ backend is only available on Linux",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use blecentral_core::BleError;

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_opening() {
        let config = ClientConfig {
            adapter: Some(String::new()),
            ..Default::default()
        };
        let err = open_adapter(&config).await.err().unwrap();
        assert!(matches!(err, BleError::Configuration { .. }));
    }

    #[cfg(not(target_os = "linux"))]
    #[tokio::test]
    async fn test_bluez_requires_linux() {
        let config = ClientConfig {
            backend: BackendPreference::BlueZ,
            ..Default::default()
        };
        let err = open_adapter(&config).await.err().unwrap();
        assert!(matches!(err, BleError::AdapterUnavailable { .. }));
    }
}
