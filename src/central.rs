//! The consumer-facing central.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::ble::address::PeripheralId;
use crate::ble::gatt::{Characteristic, Descriptor, GattTree, Handle, Service};
use crate::ble::radio::{RadioState, ScanFilter};
use crate::ble::registry::PeripheralInfo;
use crate::ble::uuids::BleUuid;
use crate::config::CentralConfig;
use crate::error::{Error, Result};
use crate::events::{CallbackHandle, CentralEvent, EventBridge, EventKind};
use crate::session::{Command, OpOutput, Reply, Request, Session};
use crate::transport::{BleTransport, BtleplugTransport};

/// A BLE central bound to one radio.
///
/// Create it with [`Central::new`] (or [`Central::with_btleplug`]), register
/// listeners, then call [`Central::start`]. Listeners registered before
/// `start` observe the initial `stateChange`.
///
/// All methods may be called concurrently; they are applied one at a time
/// by the session task in the order they arrive.
pub struct Central {
    transport: Arc<dyn BleTransport>,
    config: CentralConfig,
    events: Arc<EventBridge>,
    commands: RwLock<Option<mpsc::UnboundedSender<Command>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Central {
    /// Create a central over `transport`. Nothing runs until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if `config` is invalid.
    pub fn new(transport: Arc<dyn BleTransport>, config: CentralConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            events: Arc::new(EventBridge::new(config.event_capacity)),
            transport,
            config,
            commands: RwLock::new(None),
            task: Mutex::new(None),
        })
    }

    /// Create a central over the host's first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RadioUnavailable`] if Bluetooth is not available.
    pub async fn with_btleplug(config: CentralConfig) -> Result<Self> {
        let transport = BtleplugTransport::new().await?;
        Self::new(Arc::new(transport), config)
    }

    /// Start the session.
    ///
    /// Emits `stateChange` with the adapter's current state.
    pub async fn start(&self) -> Result<()> {
        if self.commands.read().is_some() {
            return Err(Error::invalid_state("central already started"));
        }

        let native = self.transport.events().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Session::run(
            self.transport.clone(),
            self.config.clone(),
            self.events.clone(),
            rx,
            native,
        ));

        *self.commands.write() = Some(tx);
        *self.task.lock() = Some(handle);
        info!("Central started");
        Ok(())
    }

    /// Stop scanning, disconnect every peripheral and end the session.
    ///
    /// Outstanding operations fail with [`Error::Disconnected`]. Calling
    /// this more than once is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        let sender = match self.commands.write().take() {
            Some(sender) => sender,
            None => return Ok(()),
        };

        let (tx, rx) = oneshot::channel();
        if sender.send(Command::Shutdown { reply: tx }).is_ok() {
            let _ = rx.await;
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("Central shut down");
        Ok(())
    }

    /// Whether [`start`](Self::start) was called and the central is not shut down.
    pub fn is_running(&self) -> bool {
        self.commands
            .read()
            .as_ref()
            .map_or(false, |tx| !tx.is_closed())
    }

    /// The configuration in use.
    pub fn config(&self) -> &CentralConfig {
        &self.config
    }

    // === Events ===

    /// Receive every event on an async channel.
    ///
    /// Receivers that fall more than `event_capacity` events behind observe
    /// a `Lagged` error.
    pub fn events(&self) -> broadcast::Receiver<CentralEvent> {
        self.events.subscribe()
    }

    /// Register a callback for one kind of event.
    ///
    /// Callbacks run on the session task, in emission order. A panicking
    /// callback is logged and does not affect other callbacks.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> CallbackHandle
    where
        F: Fn(&CentralEvent) + Send + Sync + 'static,
    {
        self.events.on(Some(kind), callback)
    }

    /// Register a callback for every event.
    pub fn on_any<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&CentralEvent) + Send + Sync + 'static,
    {
        self.events.on(None, callback)
    }

    // === Radio ===

    /// Current radio state.
    pub async fn power_state(&self) -> Result<RadioState> {
        self.request(|reply| Command::PowerState { reply }).await
    }

    /// Start scanning, or change the filter of a running scan.
    ///
    /// With an empty `services` list every peripheral is reported. Unless
    /// `allow_duplicates` is set, each peripheral is reported once per call.
    pub async fn start_scanning(&self, services: &[BleUuid], allow_duplicates: bool) -> Result<()> {
        let filter = ScanFilter::new(services.to_vec(), allow_duplicates);
        self.request(|reply| Command::StartScan { filter, reply })
            .await
    }

    /// Stop scanning. A no-op when not scanning.
    pub async fn stop_scanning(&self) -> Result<()> {
        self.request(|reply| Command::StopScan { reply }).await
    }

    // === Connections ===

    /// Connect to a peripheral.
    ///
    /// Unknown ids are registered on the fly. The outcome is also reported
    /// by a `connect` event.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] while connecting or connected,
    /// [`Error::Timeout`] or [`Error::ConnectFailed`] when the attempt fails.
    pub async fn connect(&self, id: &PeripheralId) -> Result<()> {
        let id = id.clone();
        self.request(|reply| Command::Connect { id, reply }).await
    }

    /// Disconnect from a peripheral.
    ///
    /// Resolves once the peripheral is disconnected, even if the native
    /// stack reported an error.
    pub async fn disconnect(&self, id: &PeripheralId) -> Result<()> {
        let id = id.clone();
        self.request(|reply| Command::Disconnect { id, reply })
            .await
    }

    /// Refresh the signal strength of a peripheral.
    ///
    /// Falls back to the last advertised value when the stack cannot
    /// report a live one.
    pub async fn update_rssi(&self, id: &PeripheralId) -> Result<Option<i16>> {
        let id = id.clone();
        self.request(|reply| Command::UpdateRssi { id, reply })
            .await
    }

    // === Discovery ===

    /// Discover services, replacing any previously discovered tree.
    pub async fn discover_services(&self, id: &PeripheralId, uuids: &[BleUuid]) -> Result<Vec<Service>> {
        self.gatt(
            id,
            Request::DiscoverServices {
                filter: uuids.to_vec(),
            },
        )
        .await?
        .into_services()
    }

    /// Discover the services included by `service`.
    pub async fn discover_included_services(
        &self,
        id: &PeripheralId,
        service: Handle,
        uuids: &[BleUuid],
    ) -> Result<Vec<Service>> {
        self.gatt(
            id,
            Request::DiscoverIncludedServices {
                service,
                filter: uuids.to_vec(),
            },
        )
        .await?
        .into_services()
    }

    /// Discover the characteristics of `service`.
    pub async fn discover_characteristics(
        &self,
        id: &PeripheralId,
        service: Handle,
        uuids: &[BleUuid],
    ) -> Result<Vec<Characteristic>> {
        self.gatt(
            id,
            Request::DiscoverCharacteristics {
                service,
                filter: uuids.to_vec(),
            },
        )
        .await?
        .into_characteristics()
    }

    /// Discover the descriptors of `characteristic`.
    pub async fn discover_descriptors(
        &self,
        id: &PeripheralId,
        characteristic: Handle,
    ) -> Result<Vec<Descriptor>> {
        self.gatt(id, Request::DiscoverDescriptors { characteristic })
            .await?
            .into_descriptors()
    }

    // === I/O ===

    /// Read a characteristic. Also emitted as a `data` event.
    pub async fn read(&self, id: &PeripheralId, characteristic: Handle) -> Result<Bytes> {
        self.gatt(id, Request::Read { handle: characteristic })
            .await?
            .into_value()
    }

    /// Write a characteristic.
    ///
    /// With `with_response` the call resolves on the peripheral's
    /// acknowledgment; without, once the stack accepted the write.
    pub async fn write(
        &self,
        id: &PeripheralId,
        characteristic: Handle,
        value: impl Into<Bytes>,
        with_response: bool,
    ) -> Result<()> {
        self.gatt(
            id,
            Request::Write {
                handle: characteristic,
                value: value.into(),
                with_response,
            },
        )
        .await?
        .into_done()
    }

    /// Subscribe to value changes, preferring indications when supported.
    pub async fn subscribe(&self, id: &PeripheralId, characteristic: Handle) -> Result<()> {
        self.subscribe_with(id, characteristic, true, true).await
    }

    /// Subscribe with an explicit choice of notifications and/or indications.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParameter`] if both flags are false,
    /// [`Error::NotSupported`] if the characteristic supports neither
    /// requested mode.
    pub async fn subscribe_with(
        &self,
        id: &PeripheralId,
        characteristic: Handle,
        notify: bool,
        indicate: bool,
    ) -> Result<()> {
        self.gatt(
            id,
            Request::Subscribe {
                handle: characteristic,
                notify,
                indicate,
            },
        )
        .await?
        .into_done()
    }

    /// Stop value change notifications.
    pub async fn unsubscribe(&self, id: &PeripheralId, characteristic: Handle) -> Result<()> {
        self.gatt(
            id,
            Request::Unsubscribe {
                handle: characteristic,
            },
        )
        .await?
        .into_done()
    }

    /// Read a descriptor. Also emitted as a `valueRead` event.
    pub async fn read_descriptor(&self, id: &PeripheralId, descriptor: Handle) -> Result<Bytes> {
        self.gatt(id, Request::Read { handle: descriptor })
            .await?
            .into_value()
    }

    /// Write a descriptor.
    pub async fn write_descriptor(
        &self,
        id: &PeripheralId,
        descriptor: Handle,
        value: impl Into<Bytes>,
    ) -> Result<()> {
        self.gatt(
            id,
            Request::Write {
                handle: descriptor,
                value: value.into(),
                with_response: true,
            },
        )
        .await?
        .into_done()
    }

    // === Registry ===

    /// Snapshot of one peripheral.
    pub async fn peripheral(&self, id: &PeripheralId) -> Result<PeripheralInfo> {
        let id = id.clone();
        self.request(|reply| Command::Peripheral { id, reply })
            .await
    }

    /// Snapshots of every known peripheral, ordered by id.
    pub async fn peripherals(&self) -> Result<Vec<PeripheralInfo>> {
        self.request(|reply| Command::Peripherals { reply }).await
    }

    /// Forget a disconnected peripheral.
    pub async fn remove_peripheral(&self, id: &PeripheralId) -> Result<()> {
        let id = id.clone();
        self.request(|reply| Command::RemovePeripheral { id, reply })
            .await
    }

    /// The discovered attribute tree of a connected peripheral.
    pub async fn gatt_tree(&self, id: &PeripheralId) -> Result<GattTree> {
        let id = id.clone();
        self.request(|reply| Command::GattTree { id, reply }).await
    }

    async fn gatt(&self, id: &PeripheralId, request: Request) -> Result<OpOutput> {
        let id = id.clone();
        self.request(|reply| Command::Gatt { id, request, reply })
            .await
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let sender = self
            .commands
            .read()
            .clone()
            .ok_or_else(|| Error::invalid_state("central is not running"))?;

        let (tx, rx) = oneshot::channel();
        sender.send(make(tx)).map_err(|_| Error::session_closed())?;
        rx.await.map_err(|_| {
            debug!("Session dropped a reply");
            Error::session_closed()
        })?
    }
}
