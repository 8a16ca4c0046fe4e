//! btleplug-backed transport.
//!
//! Uses the first adapter reported by the platform manager. Advertisement,
//! connection and adapter events from btleplug are converted into
//! [`NativeEvent`]s; each connected peripheral gets a notification pump that
//! forwards value notifications on the same channel.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, CentralState, Characteristic, Descriptor, Manager as _,
    Peripheral as _, PeripheralProperties, ScanFilter as NativeScanFilter, Service, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId as NativeId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::{
    BleTransport, Capabilities, CharacteristicInfo, DescriptorInfo, NativeEvent, ServiceInfo,
};
use crate::ble::address::DeviceAddress;
use crate::ble::advertising::AdvertisementReport;
use crate::ble::gatt::{AttributePath, CharacteristicProperties, NotifyMode};
use crate::ble::radio::{RadioState, ScanFilter};
use crate::ble::uuids::BleUuid;
use crate::error::{Error, Result};

/// Transport over the host's native stack via btleplug.
pub struct BtleplugTransport {
    inner: Arc<Inner>,
}

struct Inner {
    adapter: Adapter,
    /// Peripherals seen so far, by the address reported to the session.
    peripherals: RwLock<HashMap<DeviceAddress, Peripheral>>,
    /// Native ids back to addresses, for disconnect events.
    addresses: RwLock<HashMap<NativeId, DeviceAddress>>,
    event_tx: Mutex<Option<mpsc::UnboundedSender<NativeEvent>>>,
    /// Notification pumps of connected peripherals.
    pumps: Mutex<HashMap<DeviceAddress, JoinHandle<()>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RadioUnavailable`] if there is no usable adapter.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await.map_err(|e| {
            warn!("Bluetooth manager unavailable: {}", e);
            Error::RadioUnavailable
        })?;

        let adapter = manager
            .adapters()
            .await
            .map_err(map_error)?
            .into_iter()
            .next()
            .ok_or(Error::RadioUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Use a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            inner: Arc::new(Inner {
                adapter,
                peripherals: RwLock::new(HashMap::new()),
                addresses: RwLock::new(HashMap::new()),
                event_tx: Mutex::new(None),
                pumps: Mutex::new(HashMap::new()),
                event_task: Mutex::new(None),
            }),
        }
    }

    /// The underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.inner.adapter
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        if let Some(task) = self.inner.event_task.lock().take() {
            task.abort();
        }
        for (_, pump) in self.inner.pumps.lock().drain() {
            pump.abort();
        }
    }
}

impl Inner {
    fn send(&self, event: NativeEvent) {
        if let Some(tx) = self.event_tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    async fn handle_event(&self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                self.process_peripheral(&id).await;
            }
            CentralEvent::ManufacturerDataAdvertisement { id, .. }
            | CentralEvent::ServiceDataAdvertisement { id, .. }
            | CentralEvent::ServicesAdvertisement { id, .. } => {
                self.process_peripheral(&id).await;
            }
            CentralEvent::DeviceConnected(id) => {
                debug!("Device connected: {:?}", id);
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);
                let address = self.addresses.read().get(&id).cloned();
                if let Some(address) = address {
                    self.stop_pump(&address);
                    self.send(NativeEvent::LinkLost(address));
                }
            }
            CentralEvent::StateUpdate(state) => {
                self.send(NativeEvent::AdapterState(radio_state(state)));
            }
        }
    }

    async fn process_peripheral(&self, id: &NativeId) {
        let peripheral = match self.adapter.peripheral(id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        let address = address_of(&peripheral, &properties);
        self.remember(&address, peripheral);
        self.send(NativeEvent::Advertisement(report_from(address, properties)));
    }

    fn remember(&self, address: &DeviceAddress, peripheral: Peripheral) {
        self.addresses
            .write()
            .insert(peripheral.id(), address.clone());
        self.peripherals.write().insert(address.clone(), peripheral);
    }

    /// Look up a peripheral, falling back to the adapter's own cache.
    async fn peripheral(&self, address: &DeviceAddress) -> Result<Peripheral> {
        if let Some(p) = self.peripherals.read().get(address).cloned() {
            return Ok(p);
        }

        for peripheral in self.adapter.peripherals().await.map_err(map_error)? {
            let properties = peripheral.properties().await.ok().flatten();
            let candidate = match properties {
                Some(ref props) => address_of(&peripheral, props),
                None => DeviceAddress::Platform(peripheral.id().to_string()),
            };
            if candidate.peripheral_id() == address.peripheral_id() {
                self.remember(address, peripheral.clone());
                return Ok(peripheral);
            }
        }

        Err(Error::PeripheralNotFound {
            identifier: address.peripheral_id().to_string(),
        })
    }

    fn start_pump(&self, address: &DeviceAddress, peripheral: Peripheral) {
        let tx = match self.event_tx.lock().clone() {
            Some(tx) => tx,
            None => return,
        };
        let source = address.clone();

        let handle = tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to get notifications for {}: {}", source, e);
                    return;
                }
            };

            while let Some(notification) = notifications.next().await {
                let event = NativeEvent::Notification {
                    address: source.clone(),
                    service: service_of(&peripheral, notification.uuid),
                    characteristic: BleUuid::from(notification.uuid),
                    value: Bytes::from(notification.value),
                };
                if tx.send(event).is_err() {
                    break;
                }
            }

            debug!("Notification pump for {} ended", source);
        });

        if let Some(previous) = self.pumps.lock().insert(address.clone(), handle) {
            previous.abort();
        }
    }

    fn stop_pump(&self, address: &DeviceAddress) {
        if let Some(pump) = self.pumps.lock().remove(address) {
            pump.abort();
        }
    }

    async fn services(&self, peripheral: &Peripheral) -> Result<Vec<Service>> {
        let mut services = peripheral.services();
        if services.is_empty() {
            peripheral.discover_services().await.map_err(map_error)?;
            services = peripheral.services();
        }
        Ok(services.into_iter().collect())
    }

    async fn service(&self, peripheral: &Peripheral, path: &AttributePath) -> Result<Service> {
        self.services(peripheral)
            .await?
            .into_iter()
            .find(|s| BleUuid::from(s.uuid) == path.service)
            .ok_or_else(|| missing(path))
    }

    async fn characteristic(
        &self,
        peripheral: &Peripheral,
        path: &AttributePath,
    ) -> Result<Characteristic> {
        let uuid = path.characteristic.ok_or_else(|| missing(path))?;
        self.service(peripheral, path)
            .await?
            .characteristics
            .into_iter()
            .find(|c| BleUuid::from(c.uuid) == uuid)
            .ok_or_else(|| missing(path))
    }

    async fn descriptor(&self, peripheral: &Peripheral, path: &AttributePath) -> Result<Descriptor> {
        let uuid = path.descriptor.ok_or_else(|| missing(path))?;
        self.characteristic(peripheral, path)
            .await?
            .descriptors
            .into_iter()
            .find(|d| BleUuid::from(d.uuid) == uuid)
            .ok_or_else(|| missing(path))
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_discovery_filter: false,
            included_services: false,
        }
    }

    async fn events(&self) -> Result<mpsc::UnboundedReceiver<NativeEvent>> {
        let mut events = self.inner.adapter.events().await.map_err(map_error)?;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.event_tx.lock() = Some(tx);

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                inner.handle_event(event).await;
            }
            debug!("Adapter event stream ended");
            inner.event_tx.lock().take();
        });

        if let Some(previous) = self.inner.event_task.lock().replace(handle) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn adapter_state(&self) -> Result<RadioState> {
        let state = self.inner.adapter.adapter_state().await.map_err(map_error)?;
        Ok(radio_state(state))
    }

    async fn start_scan(&self, filter: &ScanFilter) -> Result<()> {
        info!("Starting BLE scan");
        let native = NativeScanFilter {
            services: filter.services.iter().map(|u| u.as_uuid()).collect(),
        };
        self.inner
            .adapter
            .start_scan(native)
            .await
            .map_err(map_error)
    }

    async fn stop_scan(&self) -> Result<()> {
        info!("Stopping BLE scan");
        self.inner.adapter.stop_scan().await.map_err(map_error)
    }

    async fn connect(&self, address: &DeviceAddress) -> Result<()> {
        let peripheral = self
            .inner
            .peripheral(address)
            .await
            .map_err(unknown_device)?;

        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral.connect().await.map_err(|e| Error::ConnectFailed {
                reason: e.to_string(),
            })?;
        }

        info!("Connected to {}", address);
        self.inner.start_pump(address, peripheral);
        Ok(())
    }

    async fn disconnect(&self, address: &DeviceAddress) -> Result<()> {
        self.inner.stop_pump(address);
        let peripheral = self.inner.peripheral(address).await?;
        peripheral.disconnect().await.map_err(map_error)?;
        info!("Disconnected from {}", address);
        Ok(())
    }

    async fn read_rssi(&self, address: &DeviceAddress) -> Result<Option<i16>> {
        let peripheral = self.inner.peripheral(address).await?;
        Ok(peripheral
            .properties()
            .await
            .map_err(map_error)?
            .and_then(|p| p.rssi))
    }

    async fn discover_services(
        &self,
        address: &DeviceAddress,
        _filter: &[BleUuid],
    ) -> Result<Vec<ServiceInfo>> {
        let peripheral = self.inner.peripheral(address).await?;
        peripheral.discover_services().await.map_err(map_error)?;
        Ok(peripheral
            .services()
            .into_iter()
            .map(|s| ServiceInfo {
                uuid: BleUuid::from(s.uuid),
                primary: s.primary,
            })
            .collect())
    }

    async fn discover_included_services(
        &self,
        _address: &DeviceAddress,
        _service: &AttributePath,
        _filter: &[BleUuid],
    ) -> Result<Vec<ServiceInfo>> {
        Err(Error::NotSupported {
            operation: "included service discovery".to_string(),
        })
    }

    async fn discover_characteristics(
        &self,
        address: &DeviceAddress,
        service: &AttributePath,
        _filter: &[BleUuid],
    ) -> Result<Vec<CharacteristicInfo>> {
        let peripheral = self.inner.peripheral(address).await?;
        Ok(self
            .inner
            .service(&peripheral, service)
            .await?
            .characteristics
            .into_iter()
            .map(|c| CharacteristicInfo {
                uuid: BleUuid::from(c.uuid),
                properties: CharacteristicProperties::from_bits(c.properties.bits()),
            })
            .collect())
    }

    async fn discover_descriptors(
        &self,
        address: &DeviceAddress,
        characteristic: &AttributePath,
    ) -> Result<Vec<DescriptorInfo>> {
        let peripheral = self.inner.peripheral(address).await?;
        Ok(self
            .inner
            .characteristic(&peripheral, characteristic)
            .await?
            .descriptors
            .into_iter()
            .map(|d| DescriptorInfo {
                uuid: BleUuid::from(d.uuid),
            })
            .collect())
    }

    async fn read(&self, address: &DeviceAddress, attribute: &AttributePath) -> Result<Bytes> {
        let peripheral = self.inner.peripheral(address).await?;
        let value = if attribute.descriptor.is_some() {
            let descriptor = self.inner.descriptor(&peripheral, attribute).await?;
            peripheral.read_descriptor(&descriptor).await
        } else {
            let characteristic = self.inner.characteristic(&peripheral, attribute).await?;
            peripheral.read(&characteristic).await
        };
        value.map(Bytes::from).map_err(map_error)
    }

    async fn write(
        &self,
        address: &DeviceAddress,
        attribute: &AttributePath,
        value: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let peripheral = self.inner.peripheral(address).await?;
        if attribute.descriptor.is_some() {
            let descriptor = self.inner.descriptor(&peripheral, attribute).await?;
            return peripheral
                .write_descriptor(&descriptor, value)
                .await
                .map_err(map_error);
        }

        let characteristic = self.inner.characteristic(&peripheral, attribute).await?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        peripheral
            .write(&characteristic, value, write_type)
            .await
            .map_err(map_error)
    }

    async fn set_notify(
        &self,
        address: &DeviceAddress,
        characteristic: &AttributePath,
        mode: Option<NotifyMode>,
    ) -> Result<()> {
        let peripheral = self.inner.peripheral(address).await?;
        let target = self.inner.characteristic(&peripheral, characteristic).await?;
        // btleplug picks notify or indicate from the characteristic properties.
        match mode {
            Some(_) => peripheral.subscribe(&target).await,
            None => peripheral.unsubscribe(&target).await,
        }
        .map_err(map_error)
    }
}

fn radio_state(state: CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::PoweredOn,
        CentralState::PoweredOff => RadioState::PoweredOff,
        CentralState::Unknown => RadioState::Unknown,
    }
}

fn address_of(peripheral: &Peripheral, properties: &PeripheralProperties) -> DeviceAddress {
    if properties.address == BDAddr::default() {
        DeviceAddress::Platform(peripheral.id().to_string())
    } else {
        DeviceAddress::Mac(properties.address.into_inner())
    }
}

fn report_from(address: DeviceAddress, properties: PeripheralProperties) -> AdvertisementReport {
    let mut report = AdvertisementReport::new(address);
    report.rssi = properties.rssi;
    report.local_name = properties.local_name;
    report.tx_power_level = properties.tx_power_level;
    report.service_uuids = properties.services.into_iter().map(BleUuid::from).collect();
    report.service_data = properties
        .service_data
        .into_iter()
        .map(|(uuid, data)| (BleUuid::from(uuid), Bytes::from(data)))
        .collect();
    report.manufacturer_data = properties
        .manufacturer_data
        .into_iter()
        .map(|(company, data)| (company, Bytes::from(data)))
        .collect();
    report
}

fn service_of(peripheral: &Peripheral, characteristic: uuid::Uuid) -> Option<BleUuid> {
    peripheral
        .services()
        .into_iter()
        .find(|s| s.characteristics.iter().any(|c| c.uuid == characteristic))
        .map(|s| BleUuid::from(s.uuid))
}

fn missing(path: &AttributePath) -> Error {
    Error::invalid_state(format!("attribute {} not present on peripheral", path))
}

/// A connect to an id the adapter has never seen fails before any native attempt.
fn unknown_device(e: Error) -> Error {
    match e {
        Error::PeripheralNotFound { identifier } => Error::ConnectFailed {
            reason: format!("device not found: {}", identifier),
        },
        other => other,
    }
}

fn map_error(e: btleplug::Error) -> Error {
    match e {
        btleplug::Error::NotConnected => Error::NotConnected,
        btleplug::Error::TimedOut(_) => Error::Timeout,
        btleplug::Error::PermissionDenied => Error::RadioUnavailable,
        btleplug::Error::NotSupported(operation) => Error::NotSupported { operation },
        other => Error::native(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_unknown_device_reported_as_connect_failure() {
        let err = unknown_device(Error::PeripheralNotFound {
            identifier: "aabbccddeeff".to_string(),
        });
        assert_eq!(
            err,
            Error::ConnectFailed {
                reason: "device not found: aabbccddeeff".to_string()
            }
        );
        assert_eq!(unknown_device(Error::Timeout), Error::Timeout);
    }

    #[test]
    fn test_map_error() {
        assert_eq!(map_error(btleplug::Error::NotConnected), Error::NotConnected);
        assert_eq!(
            map_error(btleplug::Error::PermissionDenied),
            Error::RadioUnavailable
        );
        assert!(matches!(
            map_error(btleplug::Error::Other("boom".into())),
            Error::NativeFailure { .. }
        ));
    }
}
