//! btleplug backend
//!
//! Covers CoreBluetooth, WinRT and BlueZ through btleplug. btleplug only
//! exposes attributes by UUID, so handles are synthesised in discovery order:
//! each service, then its characteristics, each followed by its descriptors.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use blecentral_core::{
    AdvertisementData, AttributeHandle, BackendEvent, BackendEventSender, BackendKind, BleError,
    BleResult, CharacteristicDefinition, CharacteristicProperties, ConnectionHandle,
    DescriptorDefinition, GattOperation, NativeAdapter, NativeConnection, PeripheralHandle,
    PeripheralId, ScanEvent, ScanEventReceiver, ScanFilter, ScanningMode, ServiceDefinition,
    WriteMode,
};
use btleplug::api::{
    Central as _, CentralEvent, CharPropFlags, Characteristic, Descriptor, Manager as _,
    Peripheral as _, ScanFilter as NativeScanFilter, Service, ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId as NativeId};
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::error::{unknown_connection, unknown_handle, NativeResultExt};

// ----------------------------------------------------------------------------
// Attribute Layout
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Attribute {
    Characteristic(Characteristic),
    Descriptor(Descriptor),
}

/// Discovery output plus the handle → attribute table used to route commands
#[derive(Debug, Default)]
struct Layout {
    services: Vec<ServiceDefinition>,
    attributes: HashMap<AttributeHandle, Attribute>,
}

fn layout(services: &BTreeSet<Service>) -> Layout {
    let mut layout = Layout::default();
    let mut next = 0u16;
    let mut allocate = || {
        next = next.saturating_add(1);
        AttributeHandle(next)
    };

    for service in services {
        let service_handle = allocate();
        let mut characteristics = Vec::with_capacity(service.characteristics.len());
        for characteristic in &service.characteristics {
            let handle = allocate();
            let descriptors = characteristic
                .descriptors
                .iter()
                .map(|descriptor| {
                    let handle = allocate();
                    layout
                        .attributes
                        .insert(handle, Attribute::Descriptor(descriptor.clone()));
                    DescriptorDefinition {
                        uuid: descriptor.uuid,
                        handle,
                    }
                })
                .collect();
            layout
                .attributes
                .insert(handle, Attribute::Characteristic(characteristic.clone()));
            characteristics.push(CharacteristicDefinition {
                uuid: characteristic.uuid,
                handle,
                properties: properties(characteristic.properties),
                descriptors,
            });
        }
        layout.services.push(ServiceDefinition {
            uuid: service.uuid,
            handle: service_handle,
            primary: service.primary,
            characteristics,
        });
    }
    layout
}

fn properties(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// Characteristic UUID → handle for every characteristic with notifications on
type Routes = Arc<RwLock<HashMap<Uuid, AttributeHandle>>>;

struct Link {
    peripheral: Peripheral,
    attributes: HashMap<AttributeHandle, Attribute>,
    routes: Routes,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Link {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ----------------------------------------------------------------------------
// Adapter
// ----------------------------------------------------------------------------

/// [`NativeAdapter`] backed by btleplug
pub struct BtleplugAdapter {
    _manager: Manager,
    adapter: Adapter,
    /// Native ids of peripherals seen while scanning
    known: Arc<RwLock<HashMap<PeripheralId, NativeId>>>,
    scan: Mutex<Option<JoinHandle<()>>>,
    links: RwLock<HashMap<u64, Link>>,
    next_token: AtomicU64,
}

impl BtleplugAdapter {
    /// Open the first adapter, or the first whose description contains `name`
    pub async fn open(name: Option<&str>) -> BleResult<Self> {
        let manager = Manager::new()
            .await
            .or_adapter("failed to initialise btleplug")?;
        let adapters = manager
            .adapters()
            .await
            .or_adapter("failed to enumerate adapters")?;

        let mut selected = None;
        for adapter in adapters {
            let info = adapter.adapter_info().await.unwrap_or_default();
            if name.map_or(true, |name| info.contains(name)) {
                info!(adapter = %info, "btleplug adapter ready");
                selected = Some(adapter);
                break;
            }
        }
        let adapter = selected.ok_or_else(|| match name {
            Some(name) => BleError::adapter_unavailable(format!("adapter '{}' not found", name)),
            None => BleError::adapter_unavailable("no Bluetooth adapter found"),
        })?;

        Ok(Self {
            _manager: manager,
            adapter,
            known: Arc::new(RwLock::new(HashMap::new())),
            scan: Mutex::new(None),
            links: RwLock::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        })
    }

    /// Native peripheral for `id`, falling back to the stack's device list
    async fn peripheral(&self, id: &PeripheralId) -> BleResult<Peripheral> {
        if let Some(native) = self.known.read().await.get(id).cloned() {
            return self.adapter.peripheral(&native).await.or_connect(id);
        }
        for peripheral in self.adapter.peripherals().await.or_connect(id)? {
            if peripheral_key(&peripheral).matches_address(id.as_str()) {
                return Ok(peripheral);
            }
        }
        Err(BleError::connect(
            id.as_str(),
            "peripheral unknown to the stack; scan for it first",
        ))
    }

    async fn attribute(
        &self,
        connection: &ConnectionHandle,
        operation: GattOperation,
        handle: AttributeHandle,
    ) -> BleResult<(Peripheral, Attribute)> {
        let links = self.links.read().await;
        let link = links
            .get(&connection.token)
            .ok_or_else(|| unknown_connection(connection))?;
        let attribute = link
            .attributes
            .get(&handle)
            .cloned()
            .ok_or_else(|| unknown_handle(operation, handle))?;
        Ok((link.peripheral.clone(), attribute))
    }

    async fn characteristic(
        &self,
        connection: &ConnectionHandle,
        operation: GattOperation,
        handle: AttributeHandle,
    ) -> BleResult<(Peripheral, Characteristic)> {
        match self.attribute(connection, operation, handle).await? {
            (peripheral, Attribute::Characteristic(c)) => Ok((peripheral, c)),
            _ => Err(unknown_handle(operation, handle)),
        }
    }

    async fn descriptor(
        &self,
        connection: &ConnectionHandle,
        operation: GattOperation,
        handle: AttributeHandle,
    ) -> BleResult<(Peripheral, Descriptor)> {
        match self.attribute(connection, operation, handle).await? {
            (peripheral, Attribute::Descriptor(d)) => Ok((peripheral, d)),
            _ => Err(unknown_handle(operation, handle)),
        }
    }
}

#[async_trait]
impl NativeAdapter for BtleplugAdapter {
    fn kind(&self) -> BackendKind {
        if cfg!(any(target_os = "macos", target_os = "ios")) {
            BackendKind::CoreBluetooth
        } else if cfg!(target_os = "windows") {
            BackendKind::WinRt
        } else {
            BackendKind::BlueZ
        }
    }

    async fn start_scan(&self, filter: &ScanFilter) -> BleResult<ScanEventReceiver> {
        self.stop_scan().await?;

        let native_filter = native_filter(filter)?;
        // Subscribe before starting so early sightings are not lost
        let mut central_events = self.adapter.events().await.or_scan()?;
        self.adapter.start_scan(native_filter).await.or_scan()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = self.adapter.clone();
        let known = Arc::clone(&self.known);
        let task = tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. }
                    | CentralEvent::ServiceDataAdvertisement { id, .. }
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Some(handle) = sighting(&peripheral).await else {
                    continue;
                };
                known.write().await.insert(handle.id.clone(), id);
                if tx.send(ScanEvent::Advertisement(handle)).is_err() {
                    break;
                }
            }
            debug!("btleplug event stream ended");
        });
        *self.scan.lock().await = Some(task);

        debug!(services = filter.service_uuids.len(), "btleplug scan started");
        Ok(rx)
    }

    async fn stop_scan(&self) -> BleResult<()> {
        let Some(task) = self.scan.lock().await.take() else {
            return Ok(());
        };
        task.abort();
        self.adapter.stop_scan().await.or_scan()?;
        debug!("btleplug scan stopped");
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> BleResult<NativeConnection> {
        let peripheral = self.peripheral(id).await?;
        let central_events = self.adapter.events().await.or_connect(id)?;
        if !peripheral.is_connected().await.or_connect(id)? {
            peripheral.connect().await.or_connect(id)?;
        }
        let values = peripheral.notifications().await.or_connect(id)?;

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let routes = Routes::default();
        let tasks = vec![
            tokio::spawn(watch_link(central_events, peripheral.id(), tx.clone())),
            tokio::spawn(route_notifications(values, Arc::clone(&routes), tx)),
        ];
        self.links.write().await.insert(
            token,
            Link {
                peripheral,
                attributes: HashMap::new(),
                routes,
                tasks,
            },
        );

        info!(peripheral = %id, token, "btleplug link established");
        Ok(NativeConnection {
            handle: ConnectionHandle {
                peripheral: id.clone(),
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
        if link.peripheral.is_connected().await.unwrap_or(false) {
            link.peripheral
                .disconnect()
                .await
                .or_connect(&connection.peripheral)?;
        }
        debug!(connection = %connection, "btleplug link closed");
        Ok(())
    }

    async fn discover_services(
        &self,
        connection: &ConnectionHandle,
    ) -> BleResult<Vec<ServiceDefinition>> {
        let peripheral = self
            .links
            .read()
            .await
            .get(&connection.token)
            .map(|link| link.peripheral.clone())
            .ok_or_else(|| unknown_connection(connection))?;
        peripheral.discover_services().await.or_discovery()?;
        let Layout {
            services,
            attributes,
        } = layout(&peripheral.services());

        let mut links = self.links.write().await;
        let link = links
            .get_mut(&connection.token)
            .ok_or_else(|| unknown_connection(connection))?;
        link.attributes = attributes;
        link.routes.write().await.clear();

        debug!(
            connection = %connection,
            services = services.len(),
            "btleplug discovery complete"
        );
        Ok(services)
    }

    async fn read(
        &self,
        connection: &ConnectionHandle,
        characteristic: AttributeHandle,
    ) -> BleResult<Vec<u8>> {
        let operation = GattOperation::Read;
        let (peripheral, target) = self
            .characteristic(connection, operation, characteristic)
            .await?;
        peripheral
            .read(&target)
            .await
            .or_operation(operation, characteristic)
    }

    async fn write(
        &self,
        connection: &ConnectionHandle,
        characteristic: AttributeHandle,
        value: &[u8],
        mode: WriteMode,
    ) -> BleResult<()> {
        let operation = GattOperation::Write;
        let (peripheral, target) = self
            .characteristic(connection, operation, characteristic)
            .await?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        peripheral
            .write(&target, value, write_type)
            .await
            .or_operation(operation, characteristic)
    }

    async fn set_notify(
        &self,
        connection: &ConnectionHandle,
        characteristic: AttributeHandle,
        enabled: bool,
    ) -> BleResult<()> {
        let operation = if enabled {
            GattOperation::Subscribe
        } else {
            GattOperation::Unsubscribe
        };
        let (peripheral, target) = self
            .characteristic(connection, operation, characteristic)
            .await?;
        let routes = self
            .links
            .read()
            .await
            .get(&connection.token)
            .map(|link| Arc::clone(&link.routes))
            .ok_or_else(|| unknown_connection(connection))?;

        if enabled {
            peripheral
                .subscribe(&target)
                .await
                .or_operation(operation, characteristic)?;
            routes.write().await.insert(target.uuid, characteristic);
        } else {
            routes.write().await.remove(&target.uuid);
            peripheral
                .unsubscribe(&target)
                .await
                .or_operation(operation, characteristic)?;
        }
        Ok(())
    }

    async fn read_descriptor(
        &self,
        connection: &ConnectionHandle,
        descriptor: AttributeHandle,
    ) -> BleResult<Vec<u8>> {
        let operation = GattOperation::ReadDescriptor;
        let (peripheral, target) = self.descriptor(connection, operation, descriptor).await?;
        peripheral
            .read_descriptor(&target)
            .await
            .or_operation(operation, descriptor)
    }

    async fn write_descriptor(
        &self,
        connection: &ConnectionHandle,
        descriptor: AttributeHandle,
        value: &[u8],
    ) -> BleResult<()> {
        let operation = GattOperation::WriteDescriptor;
        let (peripheral, target) = self.descriptor(connection, operation, descriptor).await?;
        peripheral
            .write_descriptor(&target, value)
            .await
            .or_operation(operation, descriptor)
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

/// CoreBluetooth hides addresses behind per-host UUIDs
/// btleplug has no passive mode, so asking for one is a configuration error
fn native_filter(filter: &ScanFilter) -> BleResult<NativeScanFilter> {
    if filter.scanning_mode == ScanningMode::Passive {
        return Err(BleError::config_error(
            "passive scanning is not supported by the btleplug backend",
        ));
    }
    Ok(NativeScanFilter {
        services: filter.service_uuids.clone(),
    })
}

fn peripheral_key(peripheral: &Peripheral) -> PeripheralId {
    if cfg!(any(target_os = "macos", target_os = "ios")) {
        PeripheralId::new(peripheral.id().to_string())
    } else {
        PeripheralId::new(peripheral.address().to_string())
    }
}

async fn sighting(peripheral: &Peripheral) -> Option<PeripheralHandle> {
    let properties = peripheral.properties().await.ok()??;
    let advertisement = AdvertisementData {
        local_name: properties.local_name,
        service_uuids: properties.services,
        manufacturer_data: properties.manufacturer_data.into_iter().collect(),
        service_data: properties.service_data.into_iter().collect(),
        tx_power: properties.tx_power_level,
        rssi: properties.rssi,
        ..Default::default()
    };
    Some(PeripheralHandle::new(peripheral_key(peripheral), advertisement))
}

async fn watch_link<S>(mut central_events: S, target: NativeId, events: BackendEventSender)
where
    S: Stream<Item = CentralEvent> + Unpin,
{
    while let Some(event) = central_events.next().await {
        if let CentralEvent::DeviceDisconnected(id) = event {
            if id == target {
                let _ = events.send(BackendEvent::Disconnected {
                    reason: "peripheral disconnected".to_string(),
                });
                break;
            }
        }
    }
}

async fn route_notifications<S>(mut values: S, routes: Routes, events: BackendEventSender)
where
    S: Stream<Item = ValueNotification> + Unpin,
{
    while let Some(notification) = values.next().await {
        let Some(handle) = routes.read().await.get(&notification.uuid).copied() else {
            trace!(uuid = %notification.uuid, "Dropping notification for unrouted characteristic");
            continue;
        };
        trace!(handle = %handle, value = %hex::encode(&notification.value), "Notification");
        let event = BackendEvent::ValueChanged {
            handle,
            value: notification.value,
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blecentral_core::uuid_from_u16;

    fn heart_rate_service() -> BTreeSet<Service> {
        let service_uuid = uuid_from_u16(0x180d);
        let measurement_uuid = uuid_from_u16(0x2a37);
        let cccd = Descriptor {
            uuid: uuid_from_u16(0x2902),
            service_uuid,
            characteristic_uuid: measurement_uuid,
        };
        let measurement = Characteristic {
            uuid: measurement_uuid,
            service_uuid,
            properties: CharPropFlags::NOTIFY,
            descriptors: BTreeSet::from([cccd]),
        };
        let location = Characteristic {
            uuid: uuid_from_u16(0x2a38),
            service_uuid,
            properties: CharPropFlags::READ,
            descriptors: BTreeSet::new(),
        };
        BTreeSet::from([Service {
            uuid: service_uuid,
            primary: true,
            characteristics: BTreeSet::from([measurement, location]),
        }])
    }

    #[test]
    fn test_handles_follow_discovery_order() {
        let layout = layout(&heart_rate_service());
        assert_eq!(layout.services.len(), 1);

        let service = &layout.services[0];
        assert_eq!(service.handle, AttributeHandle(1));
        assert!(service.primary);

        let handles: Vec<_> = service
            .characteristics
            .iter()
            .flat_map(|c| {
                std::iter::once(c.handle).chain(c.descriptors.iter().map(|d| d.handle))
            })
            .collect();
        assert_eq!(
            handles,
            vec![AttributeHandle(2), AttributeHandle(3), AttributeHandle(4)]
        );
        assert_eq!(layout.attributes.len(), 3);
        assert!(matches!(
            layout.attributes.get(&AttributeHandle(3)),
            Some(Attribute::Descriptor(_))
        ));
    }

    #[test]
    fn test_property_flags() {
        let props = properties(CharPropFlags::NOTIFY | CharPropFlags::WRITE_WITHOUT_RESPONSE);
        assert!(props.notify);
        assert!(props.supports_write(WriteMode::WithoutResponse));
        assert!(!props.supports_write(WriteMode::WithResponse));
        assert!(!props.read);
    }

    #[test]
    fn test_passive_scans_are_rejected() {
        let active = native_filter(&ScanFilter::services(&["180d"]).unwrap()).unwrap();
        assert_eq!(active.services, vec![uuid_from_u16(0x180d)]);

        let passive = ScanFilter::passive([blecentral_core::OrPattern::new(0, 0xff, &[0x4c])]);
        assert!(matches!(
            native_filter(&passive),
            Err(BleError::Configuration { .. })
        ));
    }
}
