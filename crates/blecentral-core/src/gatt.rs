//! GATT attribute cache
//!
//! A [`GattTree`] is built once per discovery pass and is immutable afterwards;
//! it is shared with callers behind an `Arc`. The only mutable part of the
//! cache is the last-known value of each attribute, kept beside the tree in
//! [`AttributeCache`].
//!
//! Lookups go two ways: by UUID (possibly ambiguous, resolved through
//! [`DuplicateUuidPolicy`]) and by backend handle (unambiguous, used for all
//! dispatch once a selector has been resolved).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use uuid::Uuid;

use crate::config::DuplicateUuidPolicy;
use crate::errors::{BleError, BleResult};
use crate::types::display_uuid;

// ----------------------------------------------------------------------------
// Handles and Properties
// ----------------------------------------------------------------------------

/// Opaque backend attribute handle.
///
/// Stacks that expose ATT handles pass them through; stacks that only expose
/// UUIDs synthesise handles in discovery order. Handles are only meaningful
/// within the generation that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributeHandle(pub u16);

impl fmt::Display for AttributeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Write procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WriteMode {
    /// Write request; resolves on the peripheral's acknowledgement
    #[default]
    WithResponse,
    /// Write command; resolves once the stack accepted it
    WithoutResponse,
}

/// Characteristic capability set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    pub fn can_subscribe(&self) -> bool {
        self.notify || self.indicate
    }

    pub fn supports_write(&self, mode: WriteMode) -> bool {
        match mode {
            WriteMode::WithResponse => self.write,
            WriteMode::WithoutResponse => self.write_without_response,
        }
    }
}

impl fmt::Display for CharacteristicProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: SmallVec<[&str; 5]> = SmallVec::new();
        if self.read {
            names.push("read");
        }
        if self.write {
            names.push("write");
        }
        if self.write_without_response {
            names.push("write-without-response");
        }
        if self.notify {
            names.push("notify");
        }
        if self.indicate {
            names.push("indicate");
        }
        write!(f, "{{{}}}", names.join(", "))
    }
}

// ----------------------------------------------------------------------------
// Discovery Definitions (backend output)
// ----------------------------------------------------------------------------

/// Service as reported by a backend's discovery pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub uuid: Uuid,
    pub handle: AttributeHandle,
    pub primary: bool,
    pub characteristics: Vec<CharacteristicDefinition>,
}

/// Characteristic as reported by a backend's discovery pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDefinition {
    pub uuid: Uuid,
    pub handle: AttributeHandle,
    pub properties: CharacteristicProperties,
    pub descriptors: Vec<DescriptorDefinition>,
}

/// Descriptor as reported by a backend's discovery pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorDefinition {
    pub uuid: Uuid,
    pub handle: AttributeHandle,
}

// ----------------------------------------------------------------------------
// References and Selectors
// ----------------------------------------------------------------------------

/// Resolved characteristic reference, valid only for its generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    pub generation: u64,
    pub handle: AttributeHandle,
    pub uuid: Uuid,
    pub service_uuid: Uuid,
}

impl fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{} (gen {})",
            display_uuid(&self.service_uuid),
            display_uuid(&self.uuid),
            self.handle,
            self.generation
        )
    }
}

/// Resolved descriptor reference, valid only for its generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorRef {
    pub generation: u64,
    pub handle: AttributeHandle,
    pub uuid: Uuid,
    pub characteristic_handle: AttributeHandle,
}

impl fmt::Display for DescriptorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} on {} (gen {})",
            display_uuid(&self.uuid),
            self.handle,
            self.characteristic_handle,
            self.generation
        )
    }
}

/// How a caller names a characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CharacteristicSelector {
    /// Bare UUID, resolved through the duplicate policy
    Uuid(Uuid),
    /// Disambiguation path: n-th instance of `characteristic` under `service`
    Qualified {
        service: Uuid,
        characteristic: Uuid,
        index: usize,
    },
    /// Reference obtained from a previous tree
    Ref(CharacteristicRef),
}

impl CharacteristicSelector {
    pub fn qualified(service: Uuid, characteristic: Uuid, index: usize) -> Self {
        CharacteristicSelector::Qualified {
            service,
            characteristic,
            index,
        }
    }
}

impl From<Uuid> for CharacteristicSelector {
    fn from(uuid: Uuid) -> Self {
        CharacteristicSelector::Uuid(uuid)
    }
}

impl From<CharacteristicRef> for CharacteristicSelector {
    fn from(reference: CharacteristicRef) -> Self {
        CharacteristicSelector::Ref(reference)
    }
}

impl From<&CharacteristicRef> for CharacteristicSelector {
    fn from(reference: &CharacteristicRef) -> Self {
        CharacteristicSelector::Ref(*reference)
    }
}

impl From<&GattCharacteristic> for CharacteristicSelector {
    fn from(characteristic: &GattCharacteristic) -> Self {
        CharacteristicSelector::Ref(characteristic.reference())
    }
}

impl fmt::Display for CharacteristicSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CharacteristicSelector::Uuid(uuid) => write!(f, "{}", display_uuid(uuid)),
            CharacteristicSelector::Qualified {
                service,
                characteristic,
                index,
            } => write!(
                f,
                "{}/{}[{}]",
                display_uuid(service),
                display_uuid(characteristic),
                index
            ),
            CharacteristicSelector::Ref(reference) => write!(f, "{}", reference),
        }
    }
}

/// How a caller names a descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorSelector {
    /// Descriptor UUID under a characteristic
    Under {
        characteristic: CharacteristicSelector,
        descriptor: Uuid,
    },
    /// Reference obtained from a previous tree
    Ref(DescriptorRef),
}

impl From<DescriptorRef> for DescriptorSelector {
    fn from(reference: DescriptorRef) -> Self {
        DescriptorSelector::Ref(reference)
    }
}

impl fmt::Display for DescriptorSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorSelector::Under {
                characteristic,
                descriptor,
            } => write!(f, "{}/{}", characteristic, display_uuid(descriptor)),
            DescriptorSelector::Ref(reference) => write!(f, "{}", reference),
        }
    }
}

// ----------------------------------------------------------------------------
// Tree
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattDescriptor {
    pub uuid: Uuid,
    pub handle: AttributeHandle,
    pub characteristic_handle: AttributeHandle,
    generation: u64,
}

impl GattDescriptor {
    pub fn reference(&self) -> DescriptorRef {
        DescriptorRef {
            generation: self.generation,
            handle: self.handle,
            uuid: self.uuid,
            characteristic_handle: self.characteristic_handle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub handle: AttributeHandle,
    pub service_uuid: Uuid,
    pub service_handle: AttributeHandle,
    pub properties: CharacteristicProperties,
    pub descriptors: Vec<GattDescriptor>,
    generation: u64,
}

impl GattCharacteristic {
    pub fn reference(&self) -> CharacteristicRef {
        CharacteristicRef {
            generation: self.generation,
            handle: self.handle,
            uuid: self.uuid,
            service_uuid: self.service_uuid,
        }
    }

    pub fn descriptor(&self, uuid: Uuid) -> Option<&GattDescriptor> {
        self.descriptors.iter().find(|d| d.uuid == uuid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub handle: AttributeHandle,
    pub primary: bool,
    pub characteristics: Vec<GattCharacteristic>,
}

/// Immutable result of one discovery pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattTree {
    generation: u64,
    services: Vec<GattService>,
    characteristic_index: HashMap<AttributeHandle, (usize, usize)>,
    descriptor_index: HashMap<AttributeHandle, (usize, usize, usize)>,
}

impl GattTree {
    /// Build the tree for `generation`, preserving the backend's discovery order.
    ///
    /// Fails with a discovery error if the backend reported the same handle
    /// twice; partial trees are never produced.
    pub fn build(generation: u64, definitions: Vec<ServiceDefinition>) -> BleResult<Self> {
        let mut services = Vec::with_capacity(definitions.len());
        let mut characteristic_index = HashMap::new();
        let mut descriptor_index = HashMap::new();

        for (s_idx, service) in definitions.into_iter().enumerate() {
            let mut characteristics = Vec::with_capacity(service.characteristics.len());

            for (c_idx, characteristic) in service.characteristics.into_iter().enumerate() {
                if characteristic_index
                    .insert(characteristic.handle, (s_idx, c_idx))
                    .is_some()
                    || descriptor_index.contains_key(&characteristic.handle)
                {
                    return Err(BleError::discovery(format!(
                        "duplicate attribute handle {}",
                        characteristic.handle
                    )));
                }

                let mut descriptors = Vec::with_capacity(characteristic.descriptors.len());
                for (d_idx, descriptor) in characteristic.descriptors.into_iter().enumerate() {
                    if characteristic_index.contains_key(&descriptor.handle)
                        || descriptor_index
                            .insert(descriptor.handle, (s_idx, c_idx, d_idx))
                            .is_some()
                    {
                        return Err(BleError::discovery(format!(
                            "duplicate attribute handle {}",
                            descriptor.handle
                        )));
                    }
                    descriptors.push(GattDescriptor {
                        uuid: descriptor.uuid,
                        handle: descriptor.handle,
                        characteristic_handle: characteristic.handle,
                        generation,
                    });
                }

                characteristics.push(GattCharacteristic {
                    uuid: characteristic.uuid,
                    handle: characteristic.handle,
                    service_uuid: service.uuid,
                    service_handle: service.handle,
                    properties: characteristic.properties,
                    descriptors,
                    generation,
                });
            }

            services.push(GattService {
                uuid: service.uuid,
                handle: service.handle,
                primary: service.primary,
                characteristics,
            });
        }

        Ok(Self {
            generation,
            services,
            characteristic_index,
            descriptor_index,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn services(&self) -> &[GattService] {
        &self.services
    }

    pub fn service(&self, uuid: Uuid) -> Option<&GattService> {
        self.services.iter().find(|s| s.uuid == uuid)
    }

    /// All characteristics in discovery order
    pub fn characteristics(&self) -> impl Iterator<Item = &GattCharacteristic> {
        self.services.iter().flat_map(|s| s.characteristics.iter())
    }

    pub fn characteristic_count(&self) -> usize {
        self.characteristic_index.len()
    }

    /// Unambiguous lookup by backend handle
    pub fn by_handle(&self, handle: AttributeHandle) -> Option<&GattCharacteristic> {
        self.characteristic_index
            .get(&handle)
            .map(|&(s, c)| &self.services[s].characteristics[c])
    }

    pub fn descriptor_by_handle(&self, handle: AttributeHandle) -> Option<&GattDescriptor> {
        self.descriptor_index
            .get(&handle)
            .map(|&(s, c, d)| &self.services[s].characteristics[c].descriptors[d])
    }

    /// Resolve a selector to a characteristic of this tree
    pub fn resolve(
        &self,
        selector: &CharacteristicSelector,
        policy: DuplicateUuidPolicy,
    ) -> BleResult<&GattCharacteristic> {
        let not_found = || BleError::characteristic_not_found(selector.to_string());

        match selector {
            CharacteristicSelector::Uuid(uuid) => {
                let matches: SmallVec<[&GattCharacteristic; 2]> =
                    self.characteristics().filter(|c| c.uuid == *uuid).collect();
                match (matches.len(), policy) {
                    (0, _) => Err(not_found()),
                    (1, _) | (_, DuplicateUuidPolicy::FirstMatch) => Ok(matches[0]),
                    (n, DuplicateUuidPolicy::LastMatch) => Ok(matches[n - 1]),
                    (n, DuplicateUuidPolicy::Reject) => Err(BleError::AmbiguousCharacteristic {
                        uuid: display_uuid(uuid),
                        count: n,
                    }),
                }
            }
            CharacteristicSelector::Qualified {
                service,
                characteristic,
                index,
            } => self
                .services
                .iter()
                .filter(|s| s.uuid == *service)
                .flat_map(|s| s.characteristics.iter())
                .filter(|c| c.uuid == *characteristic)
                .nth(*index)
                .ok_or_else(not_found),
            CharacteristicSelector::Ref(reference) => {
                if reference.generation != self.generation {
                    return Err(not_found());
                }
                self.by_handle(reference.handle)
                    .filter(|c| c.uuid == reference.uuid)
                    .ok_or_else(not_found)
            }
        }
    }

    /// Resolve a descriptor selector to a descriptor of this tree
    pub fn resolve_descriptor(
        &self,
        selector: &DescriptorSelector,
        policy: DuplicateUuidPolicy,
    ) -> BleResult<&GattDescriptor> {
        match selector {
            DescriptorSelector::Under {
                characteristic,
                descriptor,
            } => {
                let parent = self.resolve(characteristic, policy)?;
                parent
                    .descriptor(*descriptor)
                    .ok_or_else(|| BleError::descriptor_not_found(selector.to_string()))
            }
            DescriptorSelector::Ref(reference) => {
                if reference.generation != self.generation {
                    return Err(BleError::descriptor_not_found(selector.to_string()));
                }
                self.descriptor_by_handle(reference.handle)
                    .filter(|d| d.uuid == reference.uuid)
                    .ok_or_else(|| BleError::descriptor_not_found(selector.to_string()))
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Attribute Cache
// ----------------------------------------------------------------------------

/// Tree plus last-known values, owned by one session generation
#[derive(Debug, Clone)]
pub struct AttributeCache {
    tree: Arc<GattTree>,
    values: HashMap<AttributeHandle, Vec<u8>>,
}

impl AttributeCache {
    pub fn new(tree: GattTree) -> Self {
        Self {
            tree: Arc::new(tree),
            values: HashMap::new(),
        }
    }

    pub fn tree(&self) -> &Arc<GattTree> {
        &self.tree
    }

    pub fn generation(&self) -> u64 {
        self.tree.generation
    }

    /// Record a value from a read response or notification.
    ///
    /// Returns false (and records nothing) when the handle is not part of
    /// this tree.
    pub fn record_value(&mut self, handle: AttributeHandle, value: &[u8]) -> bool {
        if self.tree.by_handle(handle).is_none() && self.tree.descriptor_by_handle(handle).is_none()
        {
            return false;
        }
        self.values.insert(handle, value.to_vec());
        true
    }

    pub fn value(&self, handle: AttributeHandle) -> Option<&[u8]> {
        self.values.get(&handle).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::uuid_from_u16;

    fn props(read: bool, notify: bool) -> CharacteristicProperties {
        CharacteristicProperties {
            read,
            notify,
            ..Default::default()
        }
    }

    /// Two services, each exposing a 0x2a19 characteristic
    fn sample_definitions() -> Vec<ServiceDefinition> {
        vec![
            ServiceDefinition {
                uuid: uuid_from_u16(0x180f),
                handle: AttributeHandle(0x0001),
                primary: true,
                characteristics: vec![CharacteristicDefinition {
                    uuid: uuid_from_u16(0x2a19),
                    handle: AttributeHandle(0x0003),
                    properties: props(true, true),
                    descriptors: vec![DescriptorDefinition {
                        uuid: uuid_from_u16(0x2902),
                        handle: AttributeHandle(0x0004),
                    }],
                }],
            },
            ServiceDefinition {
                uuid: uuid_from_u16(0x180d),
                handle: AttributeHandle(0x0010),
                primary: true,
                characteristics: vec![
                    CharacteristicDefinition {
                        uuid: uuid_from_u16(0x2a37),
                        handle: AttributeHandle(0x0012),
                        properties: props(false, true),
                        descriptors: vec![],
                    },
                    CharacteristicDefinition {
                        uuid: uuid_from_u16(0x2a19),
                        handle: AttributeHandle(0x0014),
                        properties: props(true, false),
                        descriptors: vec![],
                    },
                ],
            },
        ]
    }

    #[test]
    fn test_lookup_by_uuid_and_handle() {
        let tree = GattTree::build(1, sample_definitions()).unwrap();
        assert_eq!(tree.characteristic_count(), 3);

        let hr = tree
            .resolve(&uuid_from_u16(0x2a37).into(), DuplicateUuidPolicy::FirstMatch)
            .unwrap();
        assert_eq!(hr.handle, AttributeHandle(0x0012));
        assert_eq!(tree.by_handle(AttributeHandle(0x0012)).unwrap().uuid, hr.uuid);
        assert!(tree.by_handle(AttributeHandle(0x0099)).is_none());
    }

    #[test]
    fn test_duplicate_uuid_policies() {
        let tree = GattTree::build(1, sample_definitions()).unwrap();
        let battery: CharacteristicSelector = uuid_from_u16(0x2a19).into();

        let first = tree.resolve(&battery, DuplicateUuidPolicy::FirstMatch).unwrap();
        assert_eq!(first.handle, AttributeHandle(0x0003));

        let last = tree.resolve(&battery, DuplicateUuidPolicy::LastMatch).unwrap();
        assert_eq!(last.handle, AttributeHandle(0x0014));

        let err = tree.resolve(&battery, DuplicateUuidPolicy::Reject).unwrap_err();
        assert!(matches!(err, BleError::AmbiguousCharacteristic { count: 2, .. }));

        let qualified =
            CharacteristicSelector::qualified(uuid_from_u16(0x180d), uuid_from_u16(0x2a19), 0);
        let resolved = tree.resolve(&qualified, DuplicateUuidPolicy::Reject).unwrap();
        assert_eq!(resolved.handle, AttributeHandle(0x0014));
    }

    #[test]
    fn test_stale_reference_is_not_found() {
        let old = GattTree::build(1, sample_definitions()).unwrap();
        let reference = old.by_handle(AttributeHandle(0x0012)).unwrap().reference();

        let fresh = GattTree::build(2, sample_definitions()).unwrap();
        let err = fresh
            .resolve(&reference.into(), DuplicateUuidPolicy::FirstMatch)
            .unwrap_err();
        assert!(matches!(err, BleError::CharacteristicNotFound { .. }));
    }

    #[test]
    fn test_duplicate_handles_rejected() {
        let mut defs = sample_definitions();
        defs[1].characteristics[0].handle = AttributeHandle(0x0004);
        let err = GattTree::build(1, defs).unwrap_err();
        assert!(matches!(err, BleError::Discovery { .. }));
    }

    #[test]
    fn test_descriptor_resolution() {
        let tree = GattTree::build(3, sample_definitions()).unwrap();
        let selector = DescriptorSelector::Under {
            characteristic: CharacteristicSelector::qualified(
                uuid_from_u16(0x180f),
                uuid_from_u16(0x2a19),
                0,
            ),
            descriptor: uuid_from_u16(0x2902),
        };
        let cccd = tree
            .resolve_descriptor(&selector, DuplicateUuidPolicy::FirstMatch)
            .unwrap();
        assert_eq!(cccd.handle, AttributeHandle(0x0004));
        assert_eq!(cccd.characteristic_handle, AttributeHandle(0x0003));
    }

    #[test]
    fn test_value_cache_ignores_foreign_handles() {
        let mut cache = AttributeCache::new(GattTree::build(1, sample_definitions()).unwrap());
        assert!(cache.record_value(AttributeHandle(0x0012), &[0x01]));
        assert!(!cache.record_value(AttributeHandle(0x0099), &[0x02]));
        assert_eq!(cache.value(AttributeHandle(0x0012)), Some(&[0x01][..]));
        assert_eq!(cache.value(AttributeHandle(0x0099)), None);
    }
}
