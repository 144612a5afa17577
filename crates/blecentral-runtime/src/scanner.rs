//! Scanner
//!
//! Turns the backend's raw advertisement channel into a filtered,
//! de-duplicated stream of [`PeripheralHandle`]s and keeps a snapshot of
//! every peripheral seen during the current scan.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use blecentral_core::{
    BleResult, NativeAdapter, PeripheralHandle, PeripheralId, ScanEvent, ScanEventReceiver,
    ScanFilter,
};
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Scan length used by [`Scanner::discover`] when the filter has none
pub const DEFAULT_DISCOVERY_WINDOW: Duration = Duration::from_secs(5);

// ----------------------------------------------------------------------------
// Shared State
// ----------------------------------------------------------------------------

#[derive(Default)]
struct DeviceTable {
    devices: HashMap<PeripheralId, PeripheralHandle>,
    /// First-sighting order
    order: Vec<PeripheralId>,
}

impl DeviceTable {
    /// Merge a sighting, returning the merged handle and whether it is new
    fn record(&mut self, sighting: PeripheralHandle) -> (PeripheralHandle, bool) {
        match self.devices.get_mut(&sighting.id) {
            Some(existing) => {
                existing.advertisement.merge(sighting.advertisement);
                if sighting.name.is_some() {
                    existing.name = sighting.name;
                }
                existing.last_seen = sighting.last_seen;
                (existing.clone(), false)
            }
            None => {
                self.order.push(sighting.id.clone());
                self.devices.insert(sighting.id.clone(), sighting.clone());
                (sighting, true)
            }
        }
    }

    fn remove(&mut self, id: &PeripheralId) -> bool {
        self.order.retain(|known| known != id);
        self.devices.remove(id).is_some()
    }

    fn snapshot(&self) -> Vec<PeripheralHandle> {
        self.order
            .iter()
            .filter_map(|id| self.devices.get(id).cloned())
            .collect()
    }

    fn clear(&mut self) {
        self.devices.clear();
        self.order.clear();
    }
}

struct ActiveScan {
    id: u64,
    pump: JoinHandle<()>,
}

#[derive(Default)]
struct ScannerState {
    table: DeviceTable,
    active: Option<ActiveScan>,
    next_scan_id: u64,
}

// ----------------------------------------------------------------------------
// Scanner
// ----------------------------------------------------------------------------

/// Discovers peripherals through a [`NativeAdapter`]
#[derive(Clone)]
pub struct Scanner {
    adapter: Arc<dyn NativeAdapter>,
    state: Arc<RwLock<ScannerState>>,
}

impl Scanner {
    pub fn new(adapter: Arc<dyn NativeAdapter>) -> Self {
        Self {
            adapter,
            state: Arc::new(RwLock::new(ScannerState::default())),
        }
    }

    /// Start a scan.
    ///
    /// Any scan already running is stopped first and the device snapshot is
    /// cleared. The stream ends on [`Scanner::stop_scan`] or when the
    /// filter's timeout elapses.
    pub async fn start_scan(&self, filter: ScanFilter) -> BleResult<ScanStream> {
        self.stop_scan().await?;

        let events = self.adapter.start_scan(&filter).await?;

        let mut state = self.state.write().await;
        state.table.clear();
        state.next_scan_id += 1;
        let scan_id = state.next_scan_id;

        let (sender, receiver) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_scan(
            scan_id,
            events,
            filter.clone(),
            sender,
            Arc::clone(&self.state),
            Arc::clone(&self.adapter),
        ));
        state.active = Some(ActiveScan { id: scan_id, pump });

        info!(
            scan = scan_id,
            services = filter.service_uuids.len(),
            timeout = ?filter.timeout,
            duplicates = filter.duplicates,
            "Scan started"
        );
        Ok(ScanStream { receiver })
    }

    /// Stop the running scan. A no-op when not scanning.
    pub async fn stop_scan(&self) -> BleResult<()> {
        let active = self.state.write().await.active.take();
        let Some(active) = active else {
            trace!("stop_scan while idle");
            return Ok(());
        };
        active.pump.abort();
        self.adapter.stop_scan().await?;
        info!(scan = active.id, "Scan stopped");
        Ok(())
    }

    pub async fn is_scanning(&self) -> bool {
        self.state.read().await.active.is_some()
    }

    /// Peripherals seen by the current (or last) scan, in first-seen order
    pub async fn discovered_devices(&self) -> Vec<PeripheralHandle> {
        self.state.read().await.table.snapshot()
    }

    /// Scan for a bounded window and return everything seen.
    ///
    /// Uses the filter's timeout, or five seconds when it has none.
    pub async fn discover(&self, filter: ScanFilter) -> BleResult<Vec<PeripheralHandle>> {
        let filter = match filter.timeout {
            Some(_) => filter,
            None => filter.with_timeout(DEFAULT_DISCOVERY_WINDOW),
        };
        let mut stream = self.start_scan(filter).await?;
        while stream.next().await.is_some() {}
        Ok(self.discovered_devices().await)
    }

    /// Scan until a peripheral with this address or platform id shows up
    pub async fn find_device_by_address(
        &self,
        address: &str,
        timeout: Duration,
    ) -> BleResult<Option<PeripheralHandle>> {
        self.find_device_by_filter(
            ScanFilter::new().with_timeout(timeout),
            |handle: &PeripheralHandle| handle.id.matches_address(address),
        )
        .await
    }

    /// Scan until `predicate` accepts a sighting; stops the scan either way
    pub async fn find_device_by_filter<F>(
        &self,
        filter: ScanFilter,
        predicate: F,
    ) -> BleResult<Option<PeripheralHandle>>
    where
        F: Fn(&PeripheralHandle) -> bool,
    {
        let filter = match filter.timeout {
            Some(_) => filter,
            None => filter.with_timeout(DEFAULT_DISCOVERY_WINDOW),
        };
        let mut stream = self.start_scan(filter).await?;
        let mut found = None;
        while let Some(handle) = stream.next().await {
            if predicate(&handle) {
                debug!(peripheral = %handle.id, "Found matching peripheral");
                found = Some(handle);
                break;
            }
        }
        self.stop_scan().await?;
        Ok(found)
    }
}

async fn pump_scan(
    scan_id: u64,
    mut events: ScanEventReceiver,
    filter: ScanFilter,
    sender: mpsc::UnboundedSender<PeripheralHandle>,
    state: Arc<RwLock<ScannerState>>,
    adapter: Arc<dyn NativeAdapter>,
) {
    let deadline = filter.timeout.map(|t| tokio::time::Instant::now() + t);
    let mut reported: HashSet<PeripheralId> = HashSet::new();

    loop {
        let event = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(event) => event,
                Err(_) => {
                    debug!(scan = scan_id, "Scan window elapsed");
                    break;
                }
            },
            None => events.recv().await,
        };

        let Some(event) = event else {
            debug!(scan = scan_id, "Backend ended the scan");
            break;
        };

        match event {
            ScanEvent::Advertisement(sighting) => {
                if !filter.matches(&sighting) {
                    trace!(peripheral = %sighting.id, "Sighting rejected by filter");
                    continue;
                }
                let (merged, is_new) = state.write().await.table.record(sighting);
                if is_new {
                    debug!(peripheral = %merged.id, name = merged.display_name(), "Discovered peripheral");
                }
                if !filter.duplicates && !reported.insert(merged.id.clone()) {
                    continue;
                }
                if sender.send(merged).is_err() {
                    trace!(scan = scan_id, "Scan stream dropped");
                }
            }
            ScanEvent::DeviceRemoved(id) => {
                if state.write().await.table.remove(&id) {
                    debug!(peripheral = %id, "Peripheral removed");
                }
                reported.remove(&id);
            }
        }
    }

    // Only the scan that is still current releases the radio
    let still_current = {
        let mut state = state.write().await;
        match &state.active {
            Some(active) if active.id == scan_id => {
                state.active = None;
                true
            }
            _ => false,
        }
    };
    if still_current {
        if let Err(e) = adapter.stop_scan().await {
            warn!(scan = scan_id, "Failed to stop scan: {}", e);
        }
        info!(scan = scan_id, "Scan finished");
    }
}

// ----------------------------------------------------------------------------
// Scan Stream
// ----------------------------------------------------------------------------

/// Sightings produced by one scan
pub struct ScanStream {
    receiver: mpsc::UnboundedReceiver<PeripheralHandle>,
}

impl Stream for ScanStream {
    type Item = PeripheralHandle;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blecentral_core::AdvertisementData;

    fn sighting(id: &str, rssi: i16) -> PeripheralHandle {
        PeripheralHandle::new(
            PeripheralId::new(id),
            AdvertisementData {
                rssi: Some(rssi),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_device_table_keeps_first_seen_order() {
        let mut table = DeviceTable::default();
        assert!(table.record(sighting("B", -40)).1);
        assert!(table.record(sighting("A", -50)).1);
        let (merged, is_new) = table.record(sighting("B", -70));
        assert!(!is_new);
        assert_eq!(merged.rssi(), Some(-70));

        let ids: Vec<_> = table.snapshot().into_iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![PeripheralId::new("B"), PeripheralId::new("A")]);

        assert!(table.remove(&PeripheralId::new("B")));
        assert!(!table.remove(&PeripheralId::new("B")));
        assert_eq!(table.snapshot().len(), 1);
    }
}
