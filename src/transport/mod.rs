//! Platform Bluetooth stack abstraction.
//!
//! The session drives the radio exclusively through [`BleTransport`]. The
//! production implementation wraps btleplug; tests use a scripted fake.
//! Transports deliver unsolicited events (adapter state, advertisements,
//! link loss, notifications) on the channel returned by
//! [`BleTransport::events`].

mod platform;
#[cfg(test)]
pub(crate) mod fake;

pub use self::platform::BtleplugTransport;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::ble::address::DeviceAddress;
use crate::ble::advertising::AdvertisementReport;
use crate::ble::gatt::{AttributePath, CharacteristicProperties, NotifyMode};
use crate::ble::radio::{RadioState, ScanFilter};
use crate::ble::uuids::BleUuid;
use crate::error::Result;

/// Optional features of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// The stack can filter discovery results by UUID itself.
    pub native_discovery_filter: bool,
    /// The stack can enumerate included services.
    pub included_services: bool,
}

/// A service as enumerated by the native stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Service UUID.
    pub uuid: BleUuid,
    /// Whether this is a primary service.
    pub primary: bool,
}

/// A characteristic as enumerated by the native stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    /// Characteristic UUID.
    pub uuid: BleUuid,
    /// Property flags.
    pub properties: CharacteristicProperties,
}

/// A descriptor as enumerated by the native stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorInfo {
    /// Descriptor UUID.
    pub uuid: BleUuid,
}

/// Unsolicited events from the native stack.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeEvent {
    /// The adapter changed power state.
    AdapterState(RadioState),
    /// An advertisement or scan response was received.
    Advertisement(AdvertisementReport),
    /// The link to a peripheral dropped without a local request.
    LinkLost(DeviceAddress),
    /// A notification or indication arrived.
    Notification {
        /// Source peripheral.
        address: DeviceAddress,
        /// Owning service, when the stack reports it.
        service: Option<BleUuid>,
        /// Characteristic UUID.
        characteristic: BleUuid,
        /// Value payload.
        value: Bytes,
    },
}

/// The native Bluetooth stack as seen by a central session.
///
/// Methods are invoked from the session's worker tasks; implementations
/// must be safe to call concurrently for different peripherals.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Optional features of this stack.
    fn capabilities(&self) -> Capabilities;

    /// Take the native event stream.
    ///
    /// Called once when a session starts. The stream ending means the stack
    /// is gone for good.
    async fn events(&self) -> Result<mpsc::UnboundedReceiver<NativeEvent>>;

    /// Current adapter state.
    async fn adapter_state(&self) -> Result<RadioState>;

    /// Start (or restart with new parameters) scanning.
    async fn start_scan(&self, filter: &ScanFilter) -> Result<()>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<()>;

    /// Open a link.
    async fn connect(&self, address: &DeviceAddress) -> Result<()>;

    /// Close a link.
    async fn disconnect(&self, address: &DeviceAddress) -> Result<()>;

    /// Read the signal strength of a peripheral, if the stack can.
    async fn read_rssi(&self, address: &DeviceAddress) -> Result<Option<i16>>;

    /// Enumerate services, optionally restricted to `filter`.
    async fn discover_services(
        &self,
        address: &DeviceAddress,
        filter: &[BleUuid],
    ) -> Result<Vec<ServiceInfo>>;

    /// Enumerate services included by `service`.
    async fn discover_included_services(
        &self,
        address: &DeviceAddress,
        service: &AttributePath,
        filter: &[BleUuid],
    ) -> Result<Vec<ServiceInfo>>;

    /// Enumerate characteristics of `service`.
    async fn discover_characteristics(
        &self,
        address: &DeviceAddress,
        service: &AttributePath,
        filter: &[BleUuid],
    ) -> Result<Vec<CharacteristicInfo>>;

    /// Enumerate descriptors of `characteristic`.
    async fn discover_descriptors(
        &self,
        address: &DeviceAddress,
        characteristic: &AttributePath,
    ) -> Result<Vec<DescriptorInfo>>;

    /// Read a characteristic or descriptor value.
    async fn read(&self, address: &DeviceAddress, attribute: &AttributePath) -> Result<Bytes>;

    /// Write a characteristic or descriptor value.
    async fn write(
        &self,
        address: &DeviceAddress,
        attribute: &AttributePath,
        value: &[u8],
        with_response: bool,
    ) -> Result<()>;

    /// Enable notifications in `mode`, or disable them with `None`.
    async fn set_notify(
        &self,
        address: &DeviceAddress,
        characteristic: &AttributePath,
        mode: Option<NotifyMode>,
    ) -> Result<()>;
}
