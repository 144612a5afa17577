//! Central Facade
//!
//! Bundles one backend adapter with client configuration and hands out the
//! scanner and per-peripheral sessions.

use std::sync::Arc;

use blecentral_core::{
    BackendKind, BleResult, ClientConfig, NativeAdapter, PeripheralHandle, ScanFilter,
    SessionConfig,
};
use tracing::info;

use crate::scanner::{ScanStream, Scanner};
use crate::session::Session;

/// Entry point for a BLE central
#[derive(Clone)]
pub struct Central {
    adapter: Arc<dyn NativeAdapter>,
    config: ClientConfig,
    scanner: Scanner,
}

impl Central {
    pub fn new(adapter: Arc<dyn NativeAdapter>, config: ClientConfig) -> BleResult<Self> {
        config.validate()?;
        info!(backend = %adapter.kind(), "BLE central ready");
        Ok(Self {
            scanner: Scanner::new(Arc::clone(&adapter)),
            adapter,
            config,
        })
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.adapter.kind()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    pub async fn scan(&self, filter: ScanFilter) -> BleResult<ScanStream> {
        self.scanner.start_scan(filter).await
    }

    /// Scan with the configured default filter
    pub async fn scan_with_defaults(&self) -> BleResult<ScanStream> {
        self.scanner.start_scan(self.config.scan.clone()).await
    }

    pub async fn stop_scan(&self) -> BleResult<()> {
        self.scanner.stop_scan().await
    }

    /// Session for `peripheral` using the configured session defaults
    pub fn session(&self, peripheral: PeripheralHandle) -> BleResult<Session> {
        self.session_with_config(peripheral, self.config.session.clone())
    }

    pub fn session_with_config(
        &self,
        peripheral: PeripheralHandle,
        config: SessionConfig,
    ) -> BleResult<Session> {
        Session::new(Arc::clone(&self.adapter), peripheral, config)
    }
}
