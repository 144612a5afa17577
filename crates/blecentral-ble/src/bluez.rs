//! BlueZ backend
//!
//! Drives `bluetoothd` over D-Bus through `bluer`. BlueZ exposes real ATT
//! handles in its object paths (`service000a/char000b`), so those ids are
//! passed through as [`AttributeHandle`]s unchanged.
//!
//! Active scans use device discovery with a `SetDiscoveryFilter`. Passive
//! scans register an advertisement monitor with `or_patterns` instead, since
//! discovery always sends scan requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use blecentral_core::{
    AdvertisementData, AttributeHandle, BackendEvent, BackendEventSender, BackendKind, BleError,
    BleResult, CharacteristicDefinition, CharacteristicProperties, ConnectionHandle,
    DescriptorDefinition, GattOperation, NativeAdapter, NativeConnection, PeripheralHandle,
    PeripheralId, ScanEvent, ScanEventReceiver, ScanEventSender, ScanFilter, ScanningMode,
    ServiceDefinition, WriteMode,
};
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest, Descriptor};
use bluer::gatt::{CharacteristicFlags, WriteOp};
use bluer::monitor::{Monitor, MonitorEvent, Pattern, RssiSamplingPeriod, Type as MonitorType};
use bluer::{
    AdapterEvent, Address, DeviceEvent, DeviceProperty, DiscoveryFilter, DiscoveryTransport,
};
use futures::{pin_mut, Stream, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{unknown_connection, unknown_handle, NativeResultExt};

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

struct Link {
    device: bluer::Device,
    events: BackendEventSender,
    characteristics: HashMap<AttributeHandle, Characteristic>,
    descriptors: HashMap<AttributeHandle, Descriptor>,
    /// Dropping a notify stream makes BlueZ issue StopNotify
    notifiers: HashMap<AttributeHandle, JoinHandle<()>>,
    watcher: JoinHandle<()>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.watcher.abort();
        for (_, notifier) in self.notifiers.drain() {
            notifier.abort();
        }
    }
}

// ----------------------------------------------------------------------------
// Adapter
// ----------------------------------------------------------------------------

/// [`NativeAdapter`] backed by BlueZ
pub struct BluezAdapter {
    _session: bluer::Session,
    adapter: bluer::Adapter,
    scan: Mutex<Option<JoinHandle<()>>>,
    links: RwLock<HashMap<u64, Link>>,
    next_token: AtomicU64,
}

impl BluezAdapter {
    /// Open `name` (e.g. `hci0`), or the default adapter, and power it on
    pub async fn open(name: Option<&str>) -> BleResult<Self> {
        let session = bluer::Session::new()
            .await
            .or_adapter("failed to connect to bluetoothd")?;
        let adapter = match name {
            Some(name) => session.adapter(name).or_adapter("failed to open adapter")?,
            None => session
                .default_adapter()
                .await
                .or_adapter("no default adapter")?,
        };
        adapter
            .set_powered(true)
            .await
            .or_adapter("failed to power on adapter")?;

        info!(adapter = adapter.name(), "BlueZ adapter ready");
        Ok(Self {
            _session: session,
            adapter,
            scan: Mutex::new(None),
            links: RwLock::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        })
    }

    async fn device(&self, connection: &ConnectionHandle) -> BleResult<bluer::Device> {
        self.links
            .read()
            .await
            .get(&connection.token)
            .map(|link| link.device.clone())
            .ok_or_else(|| unknown_connection(connection))
    }

    async fn characteristic(
        &self,
        connection: &ConnectionHandle,
        operation: GattOperation,
        handle: AttributeHandle,
    ) -> BleResult<Characteristic> {
        let links = self.links.read().await;
        let link = links
            .get(&connection.token)
            .ok_or_else(|| unknown_connection(connection))?;
        link.characteristics
            .get(&handle)
            .cloned()
            .ok_or_else(|| unknown_handle(operation, handle))
    }

    async fn discover(&self, filter: &ScanFilter, tx: ScanEventSender) -> BleResult<JoinHandle<()>> {
        let native_filter = DiscoveryFilter {
            uuids: filter.service_uuids.iter().copied().collect(),
            rssi: filter.min_rssi,
            transport: DiscoveryTransport::Le,
            duplicate_data: filter.duplicates,
            ..Default::default()
        };
        self.adapter
            .set_discovery_filter(native_filter)
            .await
            .or_scan()?;
        let discovered = self.adapter.discover_devices_with_changes().await.or_scan()?;

        let adapter = self.adapter.clone();
        let task = tokio::spawn(async move {
            pin_mut!(discovered);
            while let Some(event) = discovered.next().await {
                let scan_event = match event {
                    AdapterEvent::DeviceAdded(address) => match sighting(&adapter, address).await {
                        Ok(handle) => ScanEvent::Advertisement(handle),
                        Err(e) => {
                            debug!(%address, error = %e, "Skipping unreadable device");
                            continue;
                        }
                    },
                    AdapterEvent::DeviceRemoved(address) => {
                        ScanEvent::DeviceRemoved(PeripheralId::new(address.to_string()))
                    }
                    _ => continue,
                };
                if tx.send(scan_event).is_err() {
                    break;
                }
            }
            debug!("BlueZ discovery stream ended");
        });

        debug!(services = filter.service_uuids.len(), "BlueZ discovery started");
        Ok(task)
    }

    async fn monitor(&self, filter: &ScanFilter, tx: ScanEventSender) -> BleResult<JoinHandle<()>> {
        let monitor = passive_monitor(filter)?;
        let manager = self.adapter.monitor().await.or_scan()?;
        let mut monitored = manager.register(monitor).await.or_scan()?;

        let adapter = self.adapter.clone();
        let task = tokio::spawn(async move {
            // Dropping the manager unregisters the monitor
            let _manager = manager;
            while let Some(event) = monitored.next().await {
                let scan_event = match event {
                    MonitorEvent::DeviceFound(found) => match sighting(&adapter, found.device).await {
                        Ok(handle) => ScanEvent::Advertisement(handle),
                        Err(e) => {
                            debug!(address = %found.device, error = %e, "Skipping unreadable device");
                            continue;
                        }
                    },
                    MonitorEvent::DeviceLost(lost) => {
                        ScanEvent::DeviceRemoved(PeripheralId::new(lost.device.to_string()))
                    }
                    _ => continue,
                };
                if tx.send(scan_event).is_err() {
                    break;
                }
            }
            debug!("BlueZ advertisement monitor ended");
        });

        debug!(patterns = filter.or_patterns.len(), "BlueZ passive scan started");
        Ok(task)
    }

    async fn descriptor(
        &self,
        connection: &ConnectionHandle,
        operation: GattOperation,
        handle: AttributeHandle,
    ) -> BleResult<Descriptor> {
        let links = self.links.read().await;
        let link = links
            .get(&connection.token)
            .ok_or_else(|| unknown_connection(connection))?;
        link.descriptors
            .get(&handle)
            .cloned()
            .ok_or_else(|| unknown_handle(operation, handle))
    }
}

#[async_trait]
impl NativeAdapter for BluezAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::BlueZ
    }

    async fn start_scan(&self, filter: &ScanFilter) -> BleResult<ScanEventReceiver> {
        self.stop_scan().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let task = match filter.scanning_mode {
            ScanningMode::Active => self.discover(filter, tx).await?,
            ScanningMode::Passive => self.monitor(filter, tx).await?,
        };
        *self.scan.lock().await = Some(task);
        Ok(rx)
    }

    async fn stop_scan(&self) -> BleResult<()> {
        if let Some(task) = self.scan.lock().await.take() {
            // Dropping the discovery stream ends the session's discovery
            task.abort();
            debug!("BlueZ discovery stopped");
        }
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralId) -> BleResult<NativeConnection> {
        let address: Address = peripheral
            .as_str()
            .parse()
            .map_err(|_| BleError::connect(peripheral.as_str(), "not a Bluetooth device address"))?;
        let device = self.adapter.device(address).or_connect(peripheral)?;

        // Subscribe before connecting so a drop during setup is not missed
        let changes = device.events().await.or_connect(peripheral)?;
        if !device.is_connected().await.or_connect(peripheral)? {
            device.connect().await.or_connect(peripheral)?;
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = tokio::spawn(watch_link(changes, tx.clone()));
        self.links.write().await.insert(
            token,
            Link {
                device,
                events: tx,
                characteristics: HashMap::new(),
                descriptors: HashMap::new(),
                notifiers: HashMap::new(),
                watcher,
            },
        );

        info!(peripheral = %peripheral, token, "BlueZ link established");
        Ok(NativeConnection {
            handle: ConnectionHandle {
                peripheral: peripheral.clone(),
                token,
            },
            events: rx,
            mtu: None,
        })
    }

    async fn disconnect(&self, connection: &ConnectionHandle) -> BleResult<()> {
        let Some(link) = self.links.write().await.remove(&connection.token) else {
            return Ok(());
        };
        if link.device.is_connected().await.unwrap_or(false) {
            link.device
                .disconnect()
                .await
                .or_connect(&connection.peripheral)?;
        }
        debug!(connection = %connection, "BlueZ link closed");
        Ok(())
    }

    async fn discover_services(
        &self,
        connection: &ConnectionHandle,
    ) -> BleResult<Vec<ServiceDefinition>> {
        let device = self.device(connection).await?;
        wait_services_resolved(&device).await?;

        let mut definitions = Vec::new();
        let mut characteristics = HashMap::new();
        let mut descriptors = HashMap::new();
        let mut mtu = None;

        for service in device.services().await.or_discovery()? {
            let mut characteristic_definitions = Vec::new();
            for characteristic in service.characteristics().await.or_discovery()? {
                let mut descriptor_definitions = Vec::new();
                for descriptor in characteristic.descriptors().await.or_discovery()? {
                    let handle = AttributeHandle(descriptor.id());
                    descriptor_definitions.push(DescriptorDefinition {
                        uuid: descriptor.uuid().await.or_discovery()?,
                        handle,
                    });
                    descriptors.insert(handle, descriptor);
                }

                if mtu.is_none() {
                    mtu = characteristic.mtu().await.ok();
                }
                let handle = AttributeHandle(characteristic.id());
                characteristic_definitions.push(CharacteristicDefinition {
                    uuid: characteristic.uuid().await.or_discovery()?,
                    handle,
                    properties: properties(&characteristic.flags().await.or_discovery()?),
                    descriptors: descriptor_definitions,
                });
                characteristics.insert(handle, characteristic);
            }
            characteristic_definitions.sort_by_key(|c| c.handle);

            definitions.push(ServiceDefinition {
                uuid: service.uuid().await.or_discovery()?,
                handle: AttributeHandle(service.id()),
                primary: service.primary().await.or_discovery()?,
                characteristics: characteristic_definitions,
            });
        }
        definitions.sort_by_key(|s| s.handle);

        let mut links = self.links.write().await;
        let link = links
            .get_mut(&connection.token)
            .ok_or_else(|| unknown_connection(connection))?;
        link.characteristics = characteristics;
        link.descriptors = descriptors;
        if let Some(mtu) = mtu.and_then(|m| u16::try_from(m).ok()) {
            let _ = link.events.send(BackendEvent::MtuChanged { mtu });
        }

        debug!(
            connection = %connection,
            services = definitions.len(),
            "BlueZ discovery complete"
        );
        Ok(definitions)
    }

    async fn read(
        &self,
        connection: &ConnectionHandle,
        characteristic: AttributeHandle,
    ) -> BleResult<Vec<u8>> {
        self.characteristic(connection, GattOperation::Read, characteristic)
            .await?
            .read()
            .await
            .or_operation(GattOperation::Read, characteristic)
    }

    async fn write(
        &self,
        connection: &ConnectionHandle,
        characteristic: AttributeHandle,
        value: &[u8],
        mode: WriteMode,
    ) -> BleResult<()> {
        let request = CharacteristicWriteRequest {
            op_type: match mode {
                WriteMode::WithResponse => WriteOp::Request,
                WriteMode::WithoutResponse => WriteOp::Command,
            },
            ..Default::default()
        };
        self.characteristic(connection, GattOperation::Write, characteristic)
            .await?
            .write_ext(value, &request)
            .await
            .or_operation(GattOperation::Write, characteristic)
    }

    async fn set_notify(
        &self,
        connection: &ConnectionHandle,
        characteristic: AttributeHandle,
        enabled: bool,
    ) -> BleResult<()> {
        if !enabled {
            let mut links = self.links.write().await;
            if let Some(notifier) = links
                .get_mut(&connection.token)
                .and_then(|link| link.notifiers.remove(&characteristic))
            {
                notifier.abort();
            }
            return Ok(());
        }

        let operation = GattOperation::Subscribe;
        let (target, events) = {
            let links = self.links.read().await;
            let link = links
                .get(&connection.token)
                .ok_or_else(|| unknown_connection(connection))?;
            if link.notifiers.contains_key(&characteristic) {
                return Ok(());
            }
            let target = link
                .characteristics
                .get(&characteristic)
                .cloned()
                .ok_or_else(|| unknown_handle(operation, characteristic))?;
            (target, link.events.clone())
        };

        // Resolves once BlueZ acknowledged StartNotify
        let values = target
            .notify()
            .await
            .or_operation(operation, characteristic)?;
        let notifier = tokio::spawn(async move {
            pin_mut!(values);
            while let Some(value) = values.next().await {
                let event = BackendEvent::ValueChanged {
                    handle: characteristic,
                    value,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
        });

        let mut links = self.links.write().await;
        match links.get_mut(&connection.token) {
            Some(link) => {
                link.notifiers.insert(characteristic, notifier);
                Ok(())
            }
            None => {
                notifier.abort();
                Err(unknown_connection(connection))
            }
        }
    }

    async fn read_descriptor(
        &self,
        connection: &ConnectionHandle,
        descriptor: AttributeHandle,
    ) -> BleResult<Vec<u8>> {
        self.descriptor(connection, GattOperation::ReadDescriptor, descriptor)
            .await?
            .read()
            .await
            .or_operation(GattOperation::ReadDescriptor, descriptor)
    }

    async fn write_descriptor(
        &self,
        connection: &ConnectionHandle,
        descriptor: AttributeHandle,
        value: &[u8],
    ) -> BleResult<()> {
        self.descriptor(connection, GattOperation::WriteDescriptor, descriptor)
            .await?
            .write(value)
            .await
            .or_operation(GattOperation::WriteDescriptor, descriptor)
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

async fn sighting(adapter: &bluer::Adapter, address: Address) -> bluer::Result<PeripheralHandle> {
    let device = adapter.device(address)?;

    let mut service_uuids: Vec<_> = device.uuids().await?.unwrap_or_default().into_iter().collect();
    service_uuids.sort();
    let advertisement = AdvertisementData {
        local_name: device.name().await?,
        service_uuids,
        manufacturer_data: device
            .manufacturer_data()
            .await?
            .unwrap_or_default()
            .into_iter()
            .collect(),
        service_data: device
            .service_data()
            .await?
            .unwrap_or_default()
            .into_iter()
            .collect(),
        tx_power: device.tx_power().await?,
        rssi: device.rssi().await?,
        ..Default::default()
    };

    let mut handle = PeripheralHandle::new(PeripheralId::new(address.to_string()), advertisement);
    if handle.name.is_none() {
        // BlueZ falls back to the address when no alias is set
        if let Ok(alias) = device.alias().await {
            if alias != address.to_string() {
                handle = handle.with_name(alias);
            }
        }
    }
    Ok(handle)
}

/// Forward link loss to the session
async fn watch_link(changes: impl Stream<Item = DeviceEvent>, events: BackendEventSender) {
    pin_mut!(changes);
    while let Some(change) = changes.next().await {
        match change {
            DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) => {
                let _ = events.send(BackendEvent::Disconnected {
                    reason: "link lost".to_string(),
                });
                break;
            }
            _ => continue,
        }
    }
}

async fn wait_services_resolved(device: &bluer::Device) -> BleResult<()> {
    let changes = device.events().await.or_discovery()?;
    if device.is_services_resolved().await.or_discovery()? {
        return Ok(());
    }
    pin_mut!(changes);
    while let Some(change) = changes.next().await {
        match change {
            DeviceEvent::PropertyChanged(DeviceProperty::ServicesResolved(true)) => return Ok(()),
            DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) => {
                return Err(BleError::disconnected("link lost during service discovery"));
            }
            _ => continue,
        }
    }
    Err(BleError::discovery("device event stream closed"))
}

/// Advertisement monitor for a passive scan
fn passive_monitor(filter: &ScanFilter) -> BleResult<Monitor> {
    let patterns = filter
        .passive_patterns()?
        .iter()
        .map(|p| Pattern {
            data_type: p.data_type,
            start_position: p.start_position,
            content: p.content.clone(),
        })
        .collect();
    let sampling = if filter.duplicates {
        RssiSamplingPeriod::All
    } else {
        RssiSamplingPeriod::First
    };
    Ok(Monitor {
        monitor_type: MonitorType::OrPatterns,
        rssi_sampling_period: Some(sampling),
        patterns: Some(patterns),
        ..Default::default()
    })
}

fn properties(flags: &CharacteristicFlags) -> CharacteristicProperties {
    CharacteristicProperties {
        read: flags.read,
        write: flags.write,
        write_without_response: flags.write_without_response,
        notify: flags.notify,
        indicate: flags.indicate,
    }
}
