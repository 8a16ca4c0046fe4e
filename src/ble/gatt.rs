//! GATT attribute model and the per-connection discovery cache.
//!
//! Every discovered service, characteristic and descriptor is given a
//! [`Handle`] by the central. Handles are never reused, so a handle from a
//! replaced subtree or an earlier connection cannot alias a live attribute.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::ble::uuids::BleUuid;
use crate::error::{Error, Result};
use crate::transport::{CharacteristicInfo, DescriptorInfo, ServiceInfo};

/// Identifier of a discovered GATT attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Handle(u32);

impl Handle {
    /// The raw handle value.
    pub fn value(&self) -> u32 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic handle source shared by all peripherals of a session.
#[derive(Debug, Default)]
pub(crate) struct HandleAllocator {
    next: u32,
}

impl HandleAllocator {
    pub fn next(&mut self) -> Handle {
        self.next += 1;
        Handle(self.next)
    }
}

/// Characteristic property bits as defined by the GATT specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    /// Permits broadcasts of the value.
    pub const BROADCAST: Self = Self(0x01);
    /// Permits reads.
    pub const READ: Self = Self(0x02);
    /// Permits writes without response.
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);
    /// Permits writes with response.
    pub const WRITE: Self = Self(0x08);
    /// Permits notifications.
    pub const NOTIFY: Self = Self(0x10);
    /// Permits indications.
    pub const INDICATE: Self = Self(0x20);
    /// Permits signed writes.
    pub const AUTHENTICATED_SIGNED_WRITES: Self = Self(0x40);
    /// Additional properties live in the extended properties descriptor.
    pub const EXTENDED_PROPERTIES: Self = Self(0x80);

    const NAMES: [(Self, &'static str); 8] = [
        (Self::BROADCAST, "broadcast"),
        (Self::READ, "read"),
        (Self::WRITE_WITHOUT_RESPONSE, "writeWithoutResponse"),
        (Self::WRITE, "write"),
        (Self::NOTIFY, "notify"),
        (Self::INDICATE, "indicate"),
        (Self::AUTHENTICATED_SIGNED_WRITES, "authenticatedSignedWrites"),
        (Self::EXTENDED_PROPERTIES, "extendedProperties"),
    ];

    /// Build from the raw property byte.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// The raw property byte.
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Check whether every bit of `other` is set.
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Property names in declaration order.
    pub fn names(&self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl std::ops::BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// How notifications should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NotifyMode {
    /// Unacknowledged notifications.
    Notify,
    /// Acknowledged indications.
    Indicate,
}

impl NotifyMode {
    /// Pick a mode the characteristic supports, preferring indications when asked for.
    pub fn choose(
        properties: CharacteristicProperties,
        notify: bool,
        indicate: bool,
    ) -> Option<Self> {
        if indicate && properties.contains(CharacteristicProperties::INDICATE) {
            Some(Self::Indicate)
        } else if notify && properties.contains(CharacteristicProperties::NOTIFY) {
            Some(Self::Notify)
        } else {
            None
        }
    }
}

/// Native location of an attribute, as understood by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributePath {
    /// Owning service UUID.
    pub service: BleUuid,
    /// Characteristic UUID, for characteristics and descriptors.
    pub characteristic: Option<BleUuid>,
    /// Descriptor UUID, for descriptors.
    pub descriptor: Option<BleUuid>,
}

impl AttributePath {
    /// Path of a service.
    pub fn service(service: BleUuid) -> Self {
        Self {
            service,
            characteristic: None,
            descriptor: None,
        }
    }

    /// Path of a characteristic.
    pub fn characteristic(service: BleUuid, characteristic: BleUuid) -> Self {
        Self {
            service,
            characteristic: Some(characteristic),
            descriptor: None,
        }
    }

    /// Path of a descriptor.
    pub fn descriptor(service: BleUuid, characteristic: BleUuid, descriptor: BleUuid) -> Self {
        Self {
            service,
            characteristic: Some(characteristic),
            descriptor: Some(descriptor),
        }
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.service)?;
        if let Some(characteristic) = self.characteristic {
            write!(f, "/{}", characteristic)?;
        }
        if let Some(descriptor) = self.descriptor {
            write!(f, "/{}", descriptor)?;
        }
        Ok(())
    }
}

/// A discovered service.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Service {
    /// Handle assigned by the central.
    pub handle: Handle,
    /// Service UUID.
    pub uuid: BleUuid,
    /// Whether this is a primary service.
    pub primary: bool,
}

impl Service {
    /// Native path of this service.
    pub fn path(&self) -> AttributePath {
        AttributePath::service(self.uuid)
    }
}

/// A discovered characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Characteristic {
    /// Handle assigned by the central.
    pub handle: Handle,
    /// Characteristic UUID.
    pub uuid: BleUuid,
    /// Handle of the owning service.
    pub service: Handle,
    /// UUID of the owning service.
    pub service_uuid: BleUuid,
    /// Property flags.
    pub properties: CharacteristicProperties,
}

impl Characteristic {
    /// Native path of this characteristic.
    pub fn path(&self) -> AttributePath {
        AttributePath::characteristic(self.service_uuid, self.uuid)
    }
}

/// A discovered descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Descriptor {
    /// Handle assigned by the central.
    pub handle: Handle,
    /// Descriptor UUID.
    pub uuid: BleUuid,
    /// Handle of the owning characteristic.
    pub characteristic: Handle,
    /// UUID of the owning service.
    pub service_uuid: BleUuid,
    /// UUID of the owning characteristic.
    pub characteristic_uuid: BleUuid,
}

impl Descriptor {
    /// Native path of this descriptor.
    pub fn path(&self) -> AttributePath {
        AttributePath::descriptor(self.service_uuid, self.characteristic_uuid, self.uuid)
    }
}

/// A characteristic with its discovered descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicNode {
    /// The characteristic.
    pub characteristic: Characteristic,
    /// Descriptors in native enumeration order.
    pub descriptors: Vec<Descriptor>,
}

/// A service with its discovered children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceNode {
    /// The service.
    pub service: Service,
    /// Included services, if discovered.
    pub included: Vec<Service>,
    /// Characteristics in native enumeration order.
    pub characteristics: Vec<CharacteristicNode>,
}

/// The cached attribute tree of one connected peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GattTree {
    services: Vec<ServiceNode>,
}

/// An I/O target resolved from a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Attribute {
    Characteristic(Characteristic),
    Descriptor(Descriptor),
}

impl GattTree {
    /// Services in native enumeration order.
    pub fn services(&self) -> &[ServiceNode] {
        &self.services
    }

    /// Look up a service by handle.
    pub fn service(&self, handle: Handle) -> Option<&Service> {
        self.services
            .iter()
            .map(|node| &node.service)
            .find(|service| service.handle == handle)
    }

    /// Look up a characteristic by handle.
    pub fn characteristic(&self, handle: Handle) -> Option<&Characteristic> {
        self.characteristic_nodes()
            .map(|node| &node.characteristic)
            .find(|c| c.handle == handle)
    }

    /// Look up a descriptor by handle.
    pub fn descriptor(&self, handle: Handle) -> Option<&Descriptor> {
        self.characteristic_nodes()
            .flat_map(|node| node.descriptors.iter())
            .find(|d| d.handle == handle)
    }

    /// Characteristics a native notification may refer to.
    ///
    /// A service can expose several characteristics with the same UUID, so
    /// this yields every match in tree order.
    pub fn characteristics_by_uuid(
        &self,
        service: Option<BleUuid>,
        characteristic: BleUuid,
    ) -> impl Iterator<Item = &Characteristic> + '_ {
        self.characteristic_nodes()
            .map(|node| &node.characteristic)
            .filter(move |c| {
                c.uuid == characteristic && service.map_or(true, |s| s == c.service_uuid)
            })
    }

    /// Total number of attributes in the tree.
    pub fn len(&self) -> usize {
        self.services
            .iter()
            .map(|s| {
                1 + s.included.len()
                    + s.characteristics
                        .iter()
                        .map(|c| 1 + c.descriptors.len())
                        .sum::<usize>()
            })
            .sum()
    }

    /// Check if nothing has been discovered.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    fn characteristic_nodes(&self) -> impl Iterator<Item = &CharacteristicNode> {
        self.services.iter().flat_map(|s| s.characteristics.iter())
    }

    fn service_node_mut(&mut self, handle: Handle) -> Result<&mut ServiceNode> {
        self.services
            .iter_mut()
            .find(|node| node.service.handle == handle)
            .ok_or_else(|| unknown_handle(handle, "service"))
    }

    fn characteristic_node_mut(&mut self, handle: Handle) -> Result<&mut CharacteristicNode> {
        self.services
            .iter_mut()
            .flat_map(|s| s.characteristics.iter_mut())
            .find(|node| node.characteristic.handle == handle)
            .ok_or_else(|| unknown_handle(handle, "characteristic"))
    }
}

fn unknown_handle(handle: Handle, kind: &str) -> Error {
    Error::invalid_state(format!("{} is not a known {} handle", handle, kind))
}

fn passes(filter: &[BleUuid], uuid: &BleUuid) -> bool {
    filter.is_empty() || filter.contains(uuid)
}

/// GATT state of a connected peripheral: the discovery cache plus standing subscriptions.
#[derive(Debug, Default)]
pub(crate) struct GattSession {
    tree: GattTree,
    subscriptions: HashMap<Handle, NotifyMode>,
}

impl GattSession {
    pub fn tree(&self) -> &GattTree {
        &self.tree
    }

    /// Replace the whole service list.
    ///
    /// `filter` is applied here as well, which is a no-op for transports
    /// that already filtered natively.
    pub fn install_services(
        &mut self,
        infos: Vec<ServiceInfo>,
        filter: &[BleUuid],
        handles: &mut HandleAllocator,
    ) -> Vec<Service> {
        let services: Vec<Service> = infos
            .into_iter()
            .filter(|info| passes(filter, &info.uuid))
            .map(|info| Service {
                handle: handles.next(),
                uuid: info.uuid,
                primary: info.primary,
            })
            .collect();

        self.tree.services = services
            .iter()
            .cloned()
            .map(|service| ServiceNode {
                service,
                included: Vec::new(),
                characteristics: Vec::new(),
            })
            .collect();
        self.prune_subscriptions();

        debug!("Service tree replaced with {} services", services.len());
        services
    }

    /// Replace the included services of one service.
    pub fn install_included(
        &mut self,
        service: Handle,
        infos: Vec<ServiceInfo>,
        filter: &[BleUuid],
        handles: &mut HandleAllocator,
    ) -> Result<Vec<Service>> {
        let node = self.tree.service_node_mut(service)?;
        node.included = infos
            .into_iter()
            .filter(|info| passes(filter, &info.uuid))
            .map(|info| Service {
                handle: handles.next(),
                uuid: info.uuid,
                primary: info.primary,
            })
            .collect();
        Ok(node.included.clone())
    }

    /// Replace the characteristics of one service.
    pub fn install_characteristics(
        &mut self,
        service: Handle,
        infos: Vec<CharacteristicInfo>,
        filter: &[BleUuid],
        handles: &mut HandleAllocator,
    ) -> Result<Vec<Characteristic>> {
        let node = self.tree.service_node_mut(service)?;
        let service_uuid = node.service.uuid;
        node.characteristics = infos
            .into_iter()
            .filter(|info| passes(filter, &info.uuid))
            .map(|info| CharacteristicNode {
                characteristic: Characteristic {
                    handle: handles.next(),
                    uuid: info.uuid,
                    service,
                    service_uuid,
                    properties: info.properties,
                },
                descriptors: Vec::new(),
            })
            .collect();
        let characteristics = node
            .characteristics
            .iter()
            .map(|c| c.characteristic.clone())
            .collect();
        self.prune_subscriptions();
        Ok(characteristics)
    }

    /// Replace the descriptors of one characteristic.
    pub fn install_descriptors(
        &mut self,
        characteristic: Handle,
        infos: Vec<DescriptorInfo>,
        handles: &mut HandleAllocator,
    ) -> Result<Vec<Descriptor>> {
        let node = self.tree.characteristic_node_mut(characteristic)?;
        let service_uuid = node.characteristic.service_uuid;
        let characteristic_uuid = node.characteristic.uuid;
        node.descriptors = infos
            .into_iter()
            .map(|info| Descriptor {
                handle: handles.next(),
                uuid: info.uuid,
                characteristic,
                service_uuid,
                characteristic_uuid,
            })
            .collect();
        Ok(node.descriptors.clone())
    }

    /// Resolve a handle to something that can be read or written.
    pub fn attribute(&self, handle: Handle) -> Result<Attribute> {
        if let Some(c) = self.tree.characteristic(handle) {
            return Ok(Attribute::Characteristic(c.clone()));
        }
        if let Some(d) = self.tree.descriptor(handle) {
            return Ok(Attribute::Descriptor(d.clone()));
        }
        Err(unknown_handle(handle, "characteristic or descriptor"))
    }

    /// Resolve a characteristic handle.
    pub fn characteristic(&self, handle: Handle) -> Result<Characteristic> {
        self.tree
            .characteristic(handle)
            .cloned()
            .ok_or_else(|| unknown_handle(handle, "characteristic"))
    }

    /// Resolve a service handle.
    pub fn service(&self, handle: Handle) -> Result<Service> {
        self.tree
            .service(handle)
            .cloned()
            .ok_or_else(|| unknown_handle(handle, "service"))
    }

    pub fn subscription(&self, handle: Handle) -> Option<NotifyMode> {
        self.subscriptions.get(&handle).copied()
    }

    pub fn set_subscription(&mut self, handle: Handle, mode: Option<NotifyMode>) {
        match mode {
            Some(mode) => {
                self.subscriptions.insert(handle, mode);
            }
            None => {
                self.subscriptions.remove(&handle);
            }
        }
    }

    /// The subscribed characteristic a native notification belongs to.
    pub fn subscribed_characteristic(
        &self,
        service: Option<BleUuid>,
        characteristic: BleUuid,
    ) -> Option<Handle> {
        self.tree
            .characteristics_by_uuid(service, characteristic)
            .map(|c| c.handle)
            .find(|handle| self.subscriptions.contains_key(handle))
    }

    fn prune_subscriptions(&mut self) {
        let tree = &self.tree;
        self.subscriptions.retain(|handle, _| {
            let live = tree.characteristic(*handle).is_some();
            if !live {
                debug!("Dropping subscription on replaced characteristic {}", handle);
            }
            live
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{BATTERY_LEVEL, BATTERY_SERVICE, CLIENT_CHARACTERISTIC_CONFIGURATION};
    use pretty_assertions::assert_eq;

    fn battery_session(handles: &mut HandleAllocator) -> (GattSession, Service, Characteristic) {
        let mut session = GattSession::default();
        let services = session.install_services(
            vec![ServiceInfo {
                uuid: BATTERY_SERVICE,
                primary: true,
            }],
            &[],
            handles,
        );
        let service = services[0].clone();
        let characteristics = session
            .install_characteristics(
                service.handle,
                vec![CharacteristicInfo {
                    uuid: BATTERY_LEVEL,
                    properties: CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
                }],
                &[],
                handles,
            )
            .unwrap();
        (session, service, characteristics[0].clone())
    }

    #[test]
    fn test_property_names() {
        let props = CharacteristicProperties::READ
            | CharacteristicProperties::WRITE_WITHOUT_RESPONSE
            | CharacteristicProperties::INDICATE;
        assert_eq!(props.names(), vec!["read", "writeWithoutResponse", "indicate"]);
        assert_eq!(CharacteristicProperties::from_bits(0xff).names().len(), 8);
    }

    #[test]
    fn test_notify_mode_choice() {
        let both = CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE;
        assert_eq!(NotifyMode::choose(both, true, true), Some(NotifyMode::Indicate));
        assert_eq!(NotifyMode::choose(both, true, false), Some(NotifyMode::Notify));
        assert_eq!(
            NotifyMode::choose(CharacteristicProperties::NOTIFY, false, true),
            None
        );
        assert_eq!(
            NotifyMode::choose(CharacteristicProperties::READ, true, true),
            None
        );
    }

    #[test]
    fn test_install_and_resolve() {
        let mut handles = HandleAllocator::default();
        let (mut session, service, characteristic) = battery_session(&mut handles);

        assert_eq!(characteristic.service, service.handle);
        assert_eq!(
            characteristic.path(),
            AttributePath::characteristic(BATTERY_SERVICE, BATTERY_LEVEL)
        );

        let descriptors = session
            .install_descriptors(
                characteristic.handle,
                vec![DescriptorInfo {
                    uuid: CLIENT_CHARACTERISTIC_CONFIGURATION,
                }],
                &mut handles,
            )
            .unwrap();

        assert_eq!(session.tree().len(), 3);
        assert!(matches!(
            session.attribute(descriptors[0].handle),
            Ok(Attribute::Descriptor(_))
        ));
        assert!(matches!(
            session.attribute(characteristic.handle),
            Ok(Attribute::Characteristic(_))
        ));
        assert!(session.attribute(service.handle).is_err());
    }

    #[test]
    fn test_rediscovery_replaces_and_invalidates_handles() {
        let mut handles = HandleAllocator::default();
        let (mut session, _, characteristic) = battery_session(&mut handles);
        session.set_subscription(characteristic.handle, Some(NotifyMode::Notify));

        let services = session.install_services(
            vec![ServiceInfo {
                uuid: BATTERY_SERVICE,
                primary: true,
            }],
            &[],
            &mut handles,
        );

        assert_eq!(services.len(), 1);
        assert_eq!(session.tree().len(), 1);
        assert!(matches!(
            session.attribute(characteristic.handle),
            Err(Error::InvalidState { .. })
        ));
        assert_eq!(session.subscription(characteristic.handle), None);
    }

    #[test]
    fn test_service_filter_post_applied() {
        let mut handles = HandleAllocator::default();
        let mut session = GattSession::default();
        let services = session.install_services(
            vec![
                ServiceInfo {
                    uuid: BleUuid::from_u16(0x1800),
                    primary: true,
                },
                ServiceInfo {
                    uuid: BATTERY_SERVICE,
                    primary: true,
                },
            ],
            &[BATTERY_SERVICE],
            &mut handles,
        );
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].uuid, BATTERY_SERVICE);
    }

    #[test]
    fn test_subscribed_characteristic_lookup() {
        let mut handles = HandleAllocator::default();
        let (mut session, _, characteristic) = battery_session(&mut handles);

        assert_eq!(session.subscribed_characteristic(None, BATTERY_LEVEL), None);
        session.set_subscription(characteristic.handle, Some(NotifyMode::Notify));
        assert_eq!(
            session.subscribed_characteristic(Some(BATTERY_SERVICE), BATTERY_LEVEL),
            Some(characteristic.handle)
        );
        session.set_subscription(characteristic.handle, None);
        assert_eq!(session.subscribed_characteristic(None, BATTERY_LEVEL), None);
    }

    #[test]
    fn test_subscribed_lookup_skips_unsubscribed_twin() {
        let mut handles = HandleAllocator::default();
        let mut session = GattSession::default();
        let service = session.install_services(
            vec![ServiceInfo {
                uuid: BATTERY_SERVICE,
                primary: true,
            }],
            &[],
            &mut handles,
        )[0]
        .clone();
        let level = CharacteristicInfo {
            uuid: BATTERY_LEVEL,
            properties: CharacteristicProperties::NOTIFY,
        };
        let twins = session
            .install_characteristics(service.handle, vec![level.clone(), level], &[], &mut handles)
            .unwrap();
        assert_eq!(twins.len(), 2);

        session.set_subscription(twins[1].handle, Some(NotifyMode::Notify));
        assert_eq!(
            session.subscribed_characteristic(None, BATTERY_LEVEL),
            Some(twins[1].handle)
        );
        assert_eq!(
            session.subscribed_characteristic(Some(BATTERY_SERVICE), BATTERY_LEVEL),
            Some(twins[1].handle)
        );
    }
}
