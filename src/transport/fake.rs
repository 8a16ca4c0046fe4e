//! Scriptable in-memory transport for session tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};

use super::{
    BleTransport, Capabilities, CharacteristicInfo, DescriptorInfo, NativeEvent, ServiceInfo,
};
use crate::ble::address::DeviceAddress;
use crate::ble::gatt::{AttributePath, CharacteristicProperties, NotifyMode};
use crate::ble::radio::{RadioState, ScanFilter};
use crate::ble::uuids::{
    BleUuid, BATTERY_LEVEL, BATTERY_SERVICE, CLIENT_CHARACTERISTIC_CONFIGURATION,
};
use crate::error::{Error, Result};

/// How [`FakeTransport::connect`] behaves.
#[derive(Debug, Clone)]
pub(crate) enum ConnectBehavior {
    Succeed,
    Fail(Error),
    /// Never completes.
    Hang,
    /// Completes once [`FakeTransport::open_gate`] is called.
    Gated,
}

#[derive(Debug)]
struct FakeState {
    adapter_state: RadioState,
    capabilities: Capabilities,
    connect: ConnectBehavior,
    services: Vec<(BleUuid, Vec<CharacteristicInfo>)>,
    values: HashMap<AttributePath, Bytes>,
    rssi: Option<i16>,
    hang_io: bool,
    hang_disconnect: bool,
    calls: Vec<&'static str>,
    notify_modes: Vec<Option<NotifyMode>>,
}

pub(crate) struct FakeTransport {
    state: Mutex<FakeState>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<NativeEvent>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<NativeEvent>>>,
    gate: Semaphore,
}

impl FakeTransport {
    pub fn with_state(adapter_state: RadioState) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(FakeState {
                adapter_state,
                capabilities: Capabilities::default(),
                connect: ConnectBehavior::Succeed,
                services: Vec::new(),
                values: HashMap::new(),
                rssi: None,
                hang_io: false,
                hang_disconnect: false,
                calls: Vec::new(),
                notify_modes: Vec::new(),
            }),
            events_tx: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
            gate: Semaphore::new(0),
        }
    }

    pub fn powered_on() -> Self {
        Self::with_state(RadioState::PoweredOn)
    }

    pub fn set_connect(&self, behavior: ConnectBehavior) {
        self.state.lock().connect = behavior;
    }

    pub fn set_hang_io(&self, hang: bool) {
        self.state.lock().hang_io = hang;
    }

    pub fn set_hang_disconnect(&self, hang: bool) {
        self.state.lock().hang_disconnect = hang;
    }

    pub fn set_rssi(&self, rssi: Option<i16>) {
        self.state.lock().rssi = rssi;
    }

    pub fn set_value(&self, attribute: &AttributePath, value: &[u8]) {
        self.state
            .lock()
            .values
            .insert(attribute.clone(), Bytes::copy_from_slice(value));
    }

    pub fn add_service(&self, uuid: BleUuid, characteristics: Vec<CharacteristicInfo>) {
        self.state.lock().services.push((uuid, characteristics));
    }

    /// Battery service with a single battery level characteristic.
    pub fn add_battery_service(&self, properties: CharacteristicProperties) {
        self.add_service(
            BATTERY_SERVICE,
            vec![CharacteristicInfo {
                uuid: BATTERY_LEVEL,
                properties,
            }],
        );
    }

    pub fn open_gate(&self) {
        self.gate.add_permits(64);
    }

    pub fn emit(&self, event: NativeEvent) {
        if let Some(tx) = self.events_tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn notify(&self, raw: u64, characteristic: BleUuid, value: &[u8]) {
        self.emit(NativeEvent::Notification {
            address: DeviceAddress::from_u64(raw),
            service: None,
            characteristic,
            value: Bytes::copy_from_slice(value),
        });
    }

    /// End the native event stream.
    pub fn close_events(&self) {
        self.events_tx.lock().take();
    }

    pub fn calls_named(&self, name: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == name).count()
    }

    pub fn notify_modes(&self) -> Vec<Option<NotifyMode>> {
        self.state.lock().notify_modes.clone()
    }

    pub async fn wait_for_call(&self, name: &str) {
        self.wait_for_calls(name, 1).await
    }

    pub async fn wait_for_calls(&self, name: &str, count: usize) {
        while self.calls_named(name) < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn record(&self, name: &'static str) -> bool {
        let mut state = self.state.lock();
        state.calls.push(name);
        state.hang_io
    }

    /// Record an I/O call and park forever if I/O is hanging.
    async fn io(&self, name: &'static str) {
        if self.record(name) {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl BleTransport for FakeTransport {
    fn capabilities(&self) -> Capabilities {
        self.state.lock().capabilities
    }

    async fn events(&self) -> Result<mpsc::UnboundedReceiver<NativeEvent>> {
        self.events_rx
            .lock()
            .take()
            .ok_or_else(|| Error::invalid_state("event stream already taken"))
    }

    async fn adapter_state(&self) -> Result<RadioState> {
        Ok(self.state.lock().adapter_state)
    }

    async fn start_scan(&self, _filter: &ScanFilter) -> Result<()> {
        self.record("start_scan");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record("stop_scan");
        Ok(())
    }

    async fn connect(&self, _address: &DeviceAddress) -> Result<()> {
        let behavior = {
            let mut state = self.state.lock();
            state.calls.push("connect");
            state.connect.clone()
        };
        match behavior {
            ConnectBehavior::Succeed => Ok(()),
            ConnectBehavior::Fail(e) => Err(e),
            ConnectBehavior::Hang => std::future::pending().await,
            ConnectBehavior::Gated => {
                let _ = self.gate.acquire().await;
                self.record("connect_released");
                Ok(())
            }
        }
    }

    async fn disconnect(&self, _address: &DeviceAddress) -> Result<()> {
        self.record("disconnect");
        let hang = self.state.lock().hang_disconnect;
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn read_rssi(&self, _address: &DeviceAddress) -> Result<Option<i16>> {
        self.record("read_rssi");
        Ok(self.state.lock().rssi)
    }

    async fn discover_services(
        &self,
        _address: &DeviceAddress,
        _filter: &[BleUuid],
    ) -> Result<Vec<ServiceInfo>> {
        self.io("discover_services").await;
        Ok(self
            .state
            .lock()
            .services
            .iter()
            .map(|(uuid, _)| ServiceInfo {
                uuid: *uuid,
                primary: true,
            })
            .collect())
    }

    async fn discover_included_services(
        &self,
        _address: &DeviceAddress,
        _service: &AttributePath,
        _filter: &[BleUuid],
    ) -> Result<Vec<ServiceInfo>> {
        self.io("discover_included_services").await;
        Ok(Vec::new())
    }

    async fn discover_characteristics(
        &self,
        _address: &DeviceAddress,
        service: &AttributePath,
        _filter: &[BleUuid],
    ) -> Result<Vec<CharacteristicInfo>> {
        self.io("discover_characteristics").await;
        Ok(self
            .state
            .lock()
            .services
            .iter()
            .find(|(uuid, _)| *uuid == service.service)
            .map(|(_, characteristics)| characteristics.clone())
            .unwrap_or_default())
    }

    async fn discover_descriptors(
        &self,
        _address: &DeviceAddress,
        _characteristic: &AttributePath,
    ) -> Result<Vec<DescriptorInfo>> {
        self.io("discover_descriptors").await;
        Ok(vec![DescriptorInfo {
            uuid: CLIENT_CHARACTERISTIC_CONFIGURATION,
        }])
    }

    async fn read(&self, _address: &DeviceAddress, attribute: &AttributePath) -> Result<Bytes> {
        self.io("read").await;
        Ok(self
            .state
            .lock()
            .values
            .get(attribute)
            .cloned()
            .unwrap_or_default())
    }

    async fn write(
        &self,
        _address: &DeviceAddress,
        attribute: &AttributePath,
        value: &[u8],
        _with_response: bool,
    ) -> Result<()> {
        self.io("write").await;
        self.set_value(attribute, value);
        Ok(())
    }

    async fn set_notify(
        &self,
        _address: &DeviceAddress,
        _characteristic: &AttributePath,
        mode: Option<NotifyMode>,
    ) -> Result<()> {
        self.io("set_notify").await;
        self.state.lock().notify_modes.push(mode);
        Ok(())
    }
}
