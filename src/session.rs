//! The session actor.
//!
//! A [`Session`] owns every piece of mutable state of a central: the radio,
//! the scanner policy, the peripheral registry with its connection machines
//! and GATT caches, and the operation queues. It runs as a single tokio task
//! and is the only writer of that state. Three channels feed it:
//!
//! - completions of native calls it spawned,
//! - unsolicited native events from the transport,
//! - commands from [`Central`](crate::Central).
//!
//! They are polled in that order, so a completion or native event that is
//! already queued is always applied before the next command.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::ble::address::{DeviceAddress, PeripheralId};
use crate::ble::advertising::AdvertisementReport;
use crate::ble::connection::{ConnectionState, DisconnectReason, DisconnectStep};
use crate::ble::dispatcher::{Dispatcher, OpKey, OpKind, Target};
use crate::ble::gatt::{
    Attribute, AttributePath, Characteristic, Descriptor, GattSession, GattTree, Handle,
    HandleAllocator, NotifyMode, Service,
};
use crate::ble::radio::{Radio, RadioState, ScanFilter, ScanStart};
use crate::ble::registry::{PeripheralInfo, PeripheralRegistry};
use crate::ble::scanner::AdvertisementScanner;
use crate::ble::uuids::BleUuid;
use crate::config::CentralConfig;
use crate::error::{Error, Result};
use crate::events::{CentralEvent, EventBridge};
use crate::transport::{
    BleTransport, Capabilities, CharacteristicInfo, DescriptorInfo, NativeEvent, ServiceInfo,
};

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests sent by [`Central`](crate::Central).
#[derive(Debug)]
pub(crate) enum Command {
    PowerState {
        reply: Reply<RadioState>,
    },
    StartScan {
        filter: ScanFilter,
        reply: Reply<()>,
    },
    StopScan {
        reply: Reply<()>,
    },
    Connect {
        id: PeripheralId,
        reply: Reply<()>,
    },
    Disconnect {
        id: PeripheralId,
        reply: Reply<()>,
    },
    UpdateRssi {
        id: PeripheralId,
        reply: Reply<Option<i16>>,
    },
    Gatt {
        id: PeripheralId,
        request: Request,
        reply: Reply<OpOutput>,
    },
    Peripheral {
        id: PeripheralId,
        reply: Reply<PeripheralInfo>,
    },
    Peripherals {
        reply: Reply<Vec<PeripheralInfo>>,
    },
    RemovePeripheral {
        id: PeripheralId,
        reply: Reply<()>,
    },
    GattTree {
        id: PeripheralId,
        reply: Reply<GattTree>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// A queued GATT operation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Request {
    DiscoverServices {
        filter: Vec<BleUuid>,
    },
    DiscoverIncludedServices {
        service: Handle,
        filter: Vec<BleUuid>,
    },
    DiscoverCharacteristics {
        service: Handle,
        filter: Vec<BleUuid>,
    },
    DiscoverDescriptors {
        characteristic: Handle,
    },
    /// Characteristic or descriptor read.
    Read {
        handle: Handle,
    },
    /// Characteristic or descriptor write.
    Write {
        handle: Handle,
        value: Bytes,
        with_response: bool,
    },
    Subscribe {
        handle: Handle,
        notify: bool,
        indicate: bool,
    },
    Unsubscribe {
        handle: Handle,
    },
}

impl Request {
    fn key(&self, id: &PeripheralId) -> OpKey {
        let (target, kind) = match self {
            Self::DiscoverServices { .. } => (Target::Peripheral, OpKind::DiscoverServices),
            Self::DiscoverIncludedServices { service, .. } => {
                (Target::Attribute(*service), OpKind::DiscoverIncludedServices)
            }
            Self::DiscoverCharacteristics { service, .. } => {
                (Target::Attribute(*service), OpKind::DiscoverCharacteristics)
            }
            Self::DiscoverDescriptors { characteristic } => {
                (Target::Attribute(*characteristic), OpKind::DiscoverDescriptors)
            }
            Self::Read { handle } => (Target::Attribute(*handle), OpKind::Read),
            Self::Write { handle, .. } => (Target::Attribute(*handle), OpKind::Write),
            Self::Subscribe { handle, .. } | Self::Unsubscribe { handle } => {
                (Target::Attribute(*handle), OpKind::Notify)
            }
        };
        OpKey::new(id.clone(), target, kind)
    }
}

/// Successful result of a GATT operation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum OpOutput {
    Services(Vec<Service>),
    Characteristics(Vec<Characteristic>),
    Descriptors(Vec<Descriptor>),
    Value(Bytes),
    Done,
}

impl OpOutput {
    pub fn into_services(self) -> Result<Vec<Service>> {
        match self {
            Self::Services(services) => Ok(services),
            other => Err(mismatch(&other)),
        }
    }

    pub fn into_characteristics(self) -> Result<Vec<Characteristic>> {
        match self {
            Self::Characteristics(characteristics) => Ok(characteristics),
            other => Err(mismatch(&other)),
        }
    }

    pub fn into_descriptors(self) -> Result<Vec<Descriptor>> {
        match self {
            Self::Descriptors(descriptors) => Ok(descriptors),
            other => Err(mismatch(&other)),
        }
    }

    pub fn into_value(self) -> Result<Bytes> {
        match self {
            Self::Value(value) => Ok(value),
            other => Err(mismatch(&other)),
        }
    }

    pub fn into_done(self) -> Result<()> {
        match self {
            Self::Done => Ok(()),
            other => Err(mismatch(&other)),
        }
    }
}

fn mismatch(output: &OpOutput) -> Error {
    Error::Internal(format!("unexpected operation output {:?}", output))
}

/// Raw result of a native call, before it is folded into session state.
#[derive(Debug)]
enum NativeResult {
    Services(Vec<ServiceInfo>),
    Characteristics(Vec<CharacteristicInfo>),
    Descriptors(Vec<DescriptorInfo>),
    Value(Bytes),
    Done,
}

/// A native call with everything it needs, so it can run off the session task.
#[derive(Debug)]
enum NativeCall {
    DiscoverServices {
        filter: Vec<BleUuid>,
    },
    DiscoverIncluded {
        service: AttributePath,
        filter: Vec<BleUuid>,
    },
    DiscoverCharacteristics {
        service: AttributePath,
        filter: Vec<BleUuid>,
    },
    DiscoverDescriptors {
        characteristic: AttributePath,
    },
    Read {
        attribute: AttributePath,
    },
    Write {
        attribute: AttributePath,
        value: Bytes,
        with_response: bool,
    },
    SetNotify {
        characteristic: AttributePath,
        mode: Option<NotifyMode>,
    },
}

impl NativeCall {
    async fn run(self, transport: &dyn BleTransport, address: &DeviceAddress) -> Result<NativeResult> {
        Ok(match self {
            Self::DiscoverServices { filter } => {
                NativeResult::Services(transport.discover_services(address, &filter).await?)
            }
            Self::DiscoverIncluded { service, filter } => NativeResult::Services(
                transport
                    .discover_included_services(address, &service, &filter)
                    .await?,
            ),
            Self::DiscoverCharacteristics { service, filter } => NativeResult::Characteristics(
                transport
                    .discover_characteristics(address, &service, &filter)
                    .await?,
            ),
            Self::DiscoverDescriptors { characteristic } => NativeResult::Descriptors(
                transport
                    .discover_descriptors(address, &characteristic)
                    .await?,
            ),
            Self::Read { attribute } => NativeResult::Value(transport.read(address, &attribute).await?),
            Self::Write {
                attribute,
                value,
                with_response,
            } => {
                transport
                    .write(address, &attribute, &value, with_response)
                    .await?;
                NativeResult::Done
            }
            Self::SetNotify {
                characteristic,
                mode,
            } => {
                transport.set_notify(address, &characteristic, mode).await?;
                NativeResult::Done
            }
        })
    }
}

enum Prepared {
    /// Nothing to ask the native stack; the request resolves now.
    Immediate,
    Native(DeviceAddress, NativeCall),
}

/// Native completions marshalled back onto the session task.
enum Completion {
    Connect {
        id: PeripheralId,
        generation: u64,
        result: Result<()>,
    },
    /// Teardown of a timed-out connect attempt finished.
    ConnectTimedOut {
        id: PeripheralId,
        generation: u64,
    },
    Disconnect {
        id: PeripheralId,
        generation: u64,
        result: Result<()>,
    },
    Rssi {
        id: PeripheralId,
        result: Result<Option<i16>>,
        reply: Reply<Option<i16>>,
    },
    Op {
        key: OpKey,
        token: u64,
        result: Result<NativeResult>,
    },
}

async fn bounded<T>(limit: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    timeout(limit, call).await.unwrap_or(Err(Error::Timeout))
}

fn respond<T>(reply: Reply<T>, result: Result<T>) {
    let _ = reply.send(result);
}

/// State owned by the session task.
pub(crate) struct Session {
    transport: Arc<dyn BleTransport>,
    capabilities: Capabilities,
    config: CentralConfig,
    events: Arc<EventBridge>,
    radio: Radio,
    scanner: AdvertisementScanner,
    registry: PeripheralRegistry,
    handles: HandleAllocator,
    dispatcher: Dispatcher<Request, OpOutput>,
    completion_tx: mpsc::UnboundedSender<Completion>,
}

impl Session {
    /// Run the session until shutdown or until every command sender is dropped.
    pub async fn run(
        transport: Arc<dyn BleTransport>,
        config: CentralConfig,
        events: Arc<EventBridge>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut native: mpsc::UnboundedReceiver<NativeEvent>,
    ) {
        let (completion_tx, mut completions) = mpsc::unbounded_channel();
        let mut session = Session {
            capabilities: transport.capabilities(),
            transport,
            config,
            events,
            radio: Radio::default(),
            scanner: AdvertisementScanner::default(),
            registry: PeripheralRegistry::default(),
            handles: HandleAllocator::default(),
            dispatcher: Dispatcher::default(),
            completion_tx,
        };

        session.initial_state().await;

        let mut native_open = true;
        loop {
            tokio::select! {
                biased;

                Some(completion) = completions.recv() => session.on_completion(completion),
                event = native.recv(), if native_open => match event {
                    Some(event) => session.on_native(event),
                    None => {
                        native_open = false;
                        session.on_transport_lost();
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        session.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => session.on_command(command).await,
                    None => {
                        session.shutdown().await;
                        break;
                    }
                },
            }
        }

        debug!("Central session ended");
    }

    async fn initial_state(&mut self) {
        let transport = self.transport.clone();
        match bounded(self.config.radio_timeout, transport.adapter_state()).await {
            Ok(state) => {
                self.radio.update_state(state);
            }
            Err(e) => warn!("Failed to query adapter state: {}", e),
        }
        info!("Radio state: {}", self.radio.state());
        self.events.emit(CentralEvent::StateChange(self.radio.state()));
    }

    // === Commands ===

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::PowerState { reply } => respond(reply, Ok(self.radio.state())),
            Command::StartScan { filter, reply } => {
                let result = self.start_scan(filter).await;
                respond(reply, result);
            }
            Command::StopScan { reply } => {
                let result = self.stop_scan().await;
                respond(reply, result);
            }
            Command::Connect { id, reply } => self.connect(id, reply),
            Command::Disconnect { id, reply } => self.disconnect(id, reply),
            Command::UpdateRssi { id, reply } => self.update_rssi(id, reply),
            Command::Gatt { id, request, reply } => self.submit(id, request, reply),
            Command::Peripheral { id, reply } => {
                respond(reply, self.registry.get(&id).map(|r| r.info()))
            }
            Command::Peripherals { reply } => respond(reply, Ok(self.registry.snapshot())),
            Command::RemovePeripheral { id, reply } => {
                let result = self.registry.remove(&id).map(|record| {
                    debug!("Removed peripheral {}", record.id);
                });
                respond(reply, result);
            }
            Command::GattTree { id, reply } => {
                let result = self
                    .registry
                    .get(&id)
                    .and_then(|r| r.gatt())
                    .map(|gatt| gatt.tree().clone());
                respond(reply, result);
            }
            // Handled by the run loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn start_scan(&mut self, filter: ScanFilter) -> Result<()> {
        let plan = self.radio.plan_start(&filter)?;
        if plan == ScanStart::Unchanged {
            debug!("Scan already running with the same filter");
            self.scanner.reset();
            return Ok(());
        }

        let transport = self.transport.clone();
        bounded(self.config.radio_timeout, transport.start_scan(&filter)).await?;

        info!(
            "Scanning started (services: {:?}, duplicates: {})",
            filter.services, filter.allow_duplicates
        );
        self.radio.scan_started(filter.clone());
        self.scanner.reset();
        self.events.emit(CentralEvent::ScanStart { filter });
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<()> {
        if !self.radio.is_scanning() {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        let transport = self.transport.clone();
        bounded(self.config.radio_timeout, transport.stop_scan()).await?;

        info!("Scanning stopped");
        self.radio.scan_stopped();
        self.events.emit(CentralEvent::ScanStop);
        Ok(())
    }

    fn connect(&mut self, id: PeripheralId, reply: Reply<()>) {
        if let Err(e) = self.radio.ensure_available() {
            return respond(reply, Err(e));
        }
        if !self.registry.contains(&id) {
            self.registry.resolve(&id.to_address());
        }
        let record = match self.registry.get_mut(&id) {
            Ok(record) => record,
            Err(e) => return respond(reply, Err(e)),
        };

        let generation = match record.connection.begin_connect(reply) {
            Ok(generation) => generation,
            Err((reply, e)) => return respond(reply, Err(e)),
        };

        info!("Connecting to {}", record.address);
        let address = record.address.clone();
        let transport = self.transport.clone();
        let limit = self.config.connect_timeout;
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = bounded(limit, transport.connect(&address)).await;
            let _ = tx.send(Completion::Connect {
                id,
                generation,
                result,
            });
        });
    }

    fn disconnect(&mut self, id: PeripheralId, reply: Reply<()>) {
        let record = match self.registry.get_mut(&id) {
            Ok(record) => record,
            Err(e) => return respond(reply, Err(e)),
        };

        match record.connection.begin_disconnect(reply) {
            Err((reply, e)) => respond(reply, Err(e)),
            Ok(DisconnectStep::AlreadyDisconnected(reply)) => respond(reply, Ok(())),
            Ok(DisconnectStep::Joined) => debug!("Joining disconnect of {}", id),
            Ok(DisconnectStep::Started(generation)) => {
                info!("Disconnecting from {}", record.address);
                let address = record.address.clone();
                let transport = self.transport.clone();
                let limit = self.config.disconnect_timeout;
                let tx = self.completion_tx.clone();
                tokio::spawn(async move {
                    let result = bounded(limit, transport.disconnect(&address)).await;
                    let _ = tx.send(Completion::Disconnect {
                        id,
                        generation,
                        result,
                    });
                });
            }
        }
    }

    fn update_rssi(&mut self, id: PeripheralId, reply: Reply<Option<i16>>) {
        if let Err(e) = self.radio.ensure_available() {
            return respond(reply, Err(e));
        }
        let address = match self.registry.get(&id) {
            Ok(record) => record.address.clone(),
            Err(e) => return respond(reply, Err(e)),
        };

        let transport = self.transport.clone();
        let limit = self.config.io_timeout;
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = bounded(limit, transport.read_rssi(&address)).await;
            let _ = tx.send(Completion::Rssi { id, result, reply });
        });
    }

    fn submit(&mut self, id: PeripheralId, request: Request, reply: Reply<OpOutput>) {
        if let Err(e) = self.registry.get(&id).and_then(|r| r.gatt().map(|_| ())) {
            return respond(reply, Err(e));
        }
        let key = request.key(&id);
        self.dispatcher.enqueue(key.clone(), request, reply);
        self.pump(key);
    }

    // === Operation queues ===

    /// Start queued operations of `key` until one is handed to the native stack.
    fn pump(&mut self, key: OpKey) {
        while let Some((token, request)) = self.dispatcher.ready(&key) {
            let outcome = match self.prepare(&key.peripheral, &request) {
                Ok(Prepared::Immediate) => self.apply(&key.peripheral, &request, NativeResult::Done),
                Ok(Prepared::Native(address, call)) => {
                    let transport = self.transport.clone();
                    let limit = self.limit_for(key.kind);
                    let tx = self.completion_tx.clone();
                    let task_key = key.clone();
                    trace!("Issuing operation {} on {}", token, key);
                    let task = tokio::spawn(async move {
                        let result = bounded(limit, call.run(transport.as_ref(), &address)).await;
                        let _ = tx.send(Completion::Op {
                            key: task_key,
                            token,
                            result,
                        });
                    });
                    self.dispatcher
                        .mark_in_flight(&key, token, task.abort_handle());
                    return;
                }
                Err(e) => Err(e),
            };

            if let Some(op) = self.dispatcher.complete(&key, token) {
                op.resolve(outcome);
            }
        }
    }

    fn limit_for(&self, kind: OpKind) -> Duration {
        match kind {
            OpKind::DiscoverServices
            | OpKind::DiscoverIncludedServices
            | OpKind::DiscoverCharacteristics
            | OpKind::DiscoverDescriptors => self.config.discovery_timeout,
            OpKind::Read | OpKind::Write | OpKind::Notify => self.config.io_timeout,
        }
    }

    /// Validate a request against current state and build its native call.
    fn prepare(&self, id: &PeripheralId, request: &Request) -> Result<Prepared> {
        let record = self.registry.get(id)?;
        let gatt = record.gatt()?;
        let native_filter = |filter: &Vec<BleUuid>| {
            if self.capabilities.native_discovery_filter {
                filter.clone()
            } else {
                Vec::new()
            }
        };

        let call = match request {
            Request::DiscoverServices { filter } => NativeCall::DiscoverServices {
                filter: native_filter(filter),
            },
            Request::DiscoverIncludedServices { service, filter } => {
                if !self.capabilities.included_services {
                    return Err(Error::NotSupported {
                        operation: "included service discovery".to_string(),
                    });
                }
                NativeCall::DiscoverIncluded {
                    service: gatt.service(*service)?.path(),
                    filter: native_filter(filter),
                }
            }
            Request::DiscoverCharacteristics { service, filter } => {
                NativeCall::DiscoverCharacteristics {
                    service: gatt.service(*service)?.path(),
                    filter: native_filter(filter),
                }
            }
            Request::DiscoverDescriptors { characteristic } => NativeCall::DiscoverDescriptors {
                characteristic: gatt.characteristic(*characteristic)?.path(),
            },
            Request::Read { handle } => NativeCall::Read {
                attribute: attribute_path(&gatt.attribute(*handle)?),
            },
            Request::Write {
                handle,
                value,
                with_response,
            } => {
                let attribute = gatt.attribute(*handle)?;
                NativeCall::Write {
                    // Descriptor writes are always acknowledged.
                    with_response: *with_response || matches!(attribute, Attribute::Descriptor(_)),
                    attribute: attribute_path(&attribute),
                    value: value.clone(),
                }
            }
            Request::Subscribe {
                handle,
                notify,
                indicate,
            } => {
                let characteristic = gatt.characteristic(*handle)?;
                let mode = subscription_mode(&characteristic, *notify, *indicate)?;
                if gatt.subscription(*handle) == Some(mode) {
                    return Ok(Prepared::Immediate);
                }
                NativeCall::SetNotify {
                    characteristic: characteristic.path(),
                    mode: Some(mode),
                }
            }
            Request::Unsubscribe { handle } => {
                let characteristic = gatt.characteristic(*handle)?;
                if gatt.subscription(*handle).is_none() {
                    return Ok(Prepared::Immediate);
                }
                NativeCall::SetNotify {
                    characteristic: characteristic.path(),
                    mode: None,
                }
            }
        };

        Ok(Prepared::Native(record.address.clone(), call))
    }

    /// Fold a successful native result into state, emit its event and build the output.
    fn apply(&mut self, id: &PeripheralId, request: &Request, result: NativeResult) -> Result<OpOutput> {
        let gatt = self.registry.get_mut(id)?.gatt_mut()?;
        let handles = &mut self.handles;
        let id = id.clone();

        let (event, output) = match (request, result) {
            (Request::DiscoverServices { filter }, NativeResult::Services(infos)) => {
                let services = gatt.install_services(infos, filter, handles);
                (
                    CentralEvent::ServicesDiscover {
                        id,
                        services: services.clone(),
                    },
                    OpOutput::Services(services),
                )
            }
            (Request::DiscoverIncludedServices { service, filter }, NativeResult::Services(infos)) => {
                let included = gatt.install_included(*service, infos, filter, handles)?;
                (
                    CentralEvent::IncludedServicesDiscover {
                        id,
                        service: *service,
                        included: included.clone(),
                    },
                    OpOutput::Services(included),
                )
            }
            (
                Request::DiscoverCharacteristics { service, filter },
                NativeResult::Characteristics(infos),
            ) => {
                let characteristics = gatt.install_characteristics(*service, infos, filter, handles)?;
                (
                    CentralEvent::CharacteristicsDiscover {
                        id,
                        service: *service,
                        characteristics: characteristics.clone(),
                    },
                    OpOutput::Characteristics(characteristics),
                )
            }
            (Request::DiscoverDescriptors { characteristic }, NativeResult::Descriptors(infos)) => {
                let descriptors = gatt.install_descriptors(*characteristic, infos, handles)?;
                (
                    CentralEvent::DescriptorsDiscover {
                        id,
                        characteristic: *characteristic,
                        descriptors: descriptors.clone(),
                    },
                    OpOutput::Descriptors(descriptors),
                )
            }
            (Request::Read { handle }, NativeResult::Value(value)) => {
                let event = match gatt.attribute(*handle)? {
                    Attribute::Characteristic(c) => CentralEvent::Data {
                        id,
                        characteristic: c.handle,
                        uuid: c.uuid,
                        value: value.clone(),
                        is_notification: false,
                    },
                    Attribute::Descriptor(d) => CentralEvent::ValueRead {
                        id,
                        descriptor: d.handle,
                        value: value.clone(),
                    },
                };
                (event, OpOutput::Value(value))
            }
            (Request::Write { handle, .. }, NativeResult::Done) => {
                let event = match gatt.attribute(*handle)? {
                    Attribute::Characteristic(c) => CentralEvent::Write {
                        id,
                        characteristic: c.handle,
                    },
                    Attribute::Descriptor(d) => CentralEvent::ValueWrite {
                        id,
                        descriptor: d.handle,
                    },
                };
                (event, OpOutput::Done)
            }
            (
                Request::Subscribe {
                    handle,
                    notify,
                    indicate,
                },
                NativeResult::Done,
            ) => {
                let characteristic = gatt.characteristic(*handle)?;
                let mode = subscription_mode(&characteristic, *notify, *indicate)?;
                gatt.set_subscription(*handle, Some(mode));
                debug!("Subscribed to {} on {} ({:?})", characteristic.uuid, id, mode);
                (
                    CentralEvent::Notify {
                        id,
                        characteristic: *handle,
                        enabled: true,
                    },
                    OpOutput::Done,
                )
            }
            (Request::Unsubscribe { handle }, NativeResult::Done) => {
                gatt.characteristic(*handle)?;
                gatt.set_subscription(*handle, None);
                (
                    CentralEvent::Notify {
                        id,
                        characteristic: *handle,
                        enabled: false,
                    },
                    OpOutput::Done,
                )
            }
            (request, result) => {
                return Err(Error::Internal(format!(
                    "native result {:?} does not match request {:?}",
                    result, request
                )))
            }
        };

        self.events.emit(event);
        Ok(output)
    }

    // === Completions ===

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Connect {
                id,
                generation,
                result,
            } => self.on_connect_complete(id, generation, result),
            Completion::ConnectTimedOut { id, generation } => {
                self.finish_connect(id, generation, Err(Error::Timeout))
            }
            Completion::Disconnect {
                id,
                generation,
                result,
            } => {
                let current = self.registry.get(&id).map(|r| r.connection.generation());
                if current != Ok(generation) {
                    debug!("Ignoring stale disconnect completion for {}", id);
                    return;
                }
                if let Err(e) = result {
                    warn!("Native disconnect of {} failed: {}", id, e);
                }
                self.finish_disconnect(&id);
            }
            Completion::Rssi { id, result, reply } => {
                let record = match self.registry.get_mut(&id) {
                    Ok(record) => record,
                    Err(e) => return respond(reply, Err(e)),
                };
                match result {
                    Ok(Some(rssi)) => record.rssi = Some(rssi),
                    Ok(None) => trace!("No live RSSI for {}, using last advertised", id),
                    Err(e) => debug!("RSSI read for {} failed: {}", id, e),
                }
                let rssi = record.rssi;
                self.events.emit(CentralEvent::RssiUpdate { id, rssi });
                respond(reply, Ok(rssi));
            }
            Completion::Op { key, token, result } => {
                let op = match self.dispatcher.complete(&key, token) {
                    Some(op) => op,
                    None => return,
                };
                let outcome = result.and_then(|r| self.apply(&key.peripheral, &op.request, r));
                if let Err(ref e) = outcome {
                    debug!("Operation {} on {} failed: {}", token, key, e);
                }
                op.resolve(outcome);
                self.pump(key);
            }
        }
    }

    fn on_connect_complete(&mut self, id: PeripheralId, generation: u64, result: Result<()>) {
        let record = match self.registry.get(&id) {
            Ok(record) => record,
            Err(_) => return,
        };

        if !record.connection.is_attempt(generation) {
            let link_may_be_up = matches!(result, Ok(()) | Err(Error::Timeout));
            // A newer attempt owns the link once the generation has moved.
            if link_may_be_up
                && record.state() == ConnectionState::Disconnected
                && record.connection.generation() == generation
            {
                debug!("Tearing down link of abandoned connect to {}", record.address);
                let address = record.address.clone();
                let transport = self.transport.clone();
                let limit = self.config.disconnect_timeout;
                tokio::spawn(async move {
                    let _ = bounded(limit, transport.disconnect(&address)).await;
                });
            } else {
                debug!("Ignoring stale connect completion for {}", id);
            }
            return;
        }

        if result == Err(Error::Timeout) {
            // Stay connecting until the half-open link is torn down, so a
            // retry cannot overlap the cleanup.
            debug!("Connect to {} timed out, cancelling native attempt", record.address);
            let address = record.address.clone();
            let transport = self.transport.clone();
            let limit = self.config.disconnect_timeout;
            let tx = self.completion_tx.clone();
            tokio::spawn(async move {
                let _ = bounded(limit, transport.disconnect(&address)).await;
                let _ = tx.send(Completion::ConnectTimedOut { id, generation });
            });
            return;
        }

        self.finish_connect(id, generation, result);
    }

    /// `Connecting -> Connected | Disconnected` for the current attempt.
    fn finish_connect(&mut self, id: PeripheralId, generation: u64, result: Result<()>) {
        let record = match self.registry.get_mut(&id) {
            Ok(record) => record,
            Err(_) => return,
        };
        let reply = match record.connection.finish_connect(generation, result.is_ok()) {
            Some(reply) => reply,
            None => return,
        };

        let result = result.map_err(connect_error);
        match result {
            Ok(()) => {
                info!("Connected to {}", record.address);
                record.gatt = Some(GattSession::default());
            }
            Err(ref e) => warn!("Connection to {} failed: {}", record.address, e),
        }

        self.events.emit(CentralEvent::Connect {
            id,
            error: result.clone().err(),
        });
        if let Some(reply) = reply {
            respond(reply, result);
        }
    }

    /// `Disconnecting -> Disconnected`: drop GATT state, fail pending
    /// operations, release waiting disconnect calls and emit `disconnect`.
    fn finish_disconnect(&mut self, id: &PeripheralId) {
        let record = match self.registry.get_mut(id) {
            Ok(record) => record,
            Err(_) => return,
        };
        let (replies, reason) = match record.connection.finish_disconnect() {
            Some(done) => done,
            None => return,
        };

        info!("Disconnected from {} ({:?})", record.address, reason);
        record.gatt = None;
        self.dispatcher.fail_peripheral(id, &Error::Disconnected);
        for reply in replies {
            respond(reply, Ok(()));
        }
        self.events.emit(CentralEvent::Disconnect {
            id: id.clone(),
            reason,
        });
    }

    // === Native events ===

    fn on_native(&mut self, event: NativeEvent) {
        match event {
            NativeEvent::AdapterState(state) => self.on_adapter_state(state),
            NativeEvent::Advertisement(report) => self.on_advertisement(report),
            NativeEvent::LinkLost(address) => self.on_link_lost(&address),
            NativeEvent::Notification {
                address,
                service,
                characteristic,
                value,
            } => self.on_notification(&address, service, characteristic, value),
        }
    }

    fn on_adapter_state(&mut self, state: RadioState) {
        if !self.radio.update_state(state) {
            return;
        }
        info!("Radio state changed: {}", state);
        self.events.emit(CentralEvent::StateChange(state));

        if !state.is_powered_on() {
            let was_scanning = self.radio.scan_stopped();
            self.radio_down(was_scanning, Error::RadioUnavailable);
        }
    }

    fn on_transport_lost(&mut self) {
        error!("Native event stream ended; radio is no longer available");
        let was_scanning = self.radio.is_scanning();
        if self.radio.mark_lost() {
            self.events.emit(CentralEvent::StateChange(self.radio.state()));
        }
        self.radio_down(was_scanning, Error::RadioUnavailable);
    }

    /// Tear down everything that depends on the radio.
    fn radio_down(&mut self, was_scanning: bool, error: Error) {
        if was_scanning {
            self.events.emit(CentralEvent::ScanStop);
        }

        for id in self.registry.ids_in(&[ConnectionState::Connecting]) {
            self.abort_connect(&id, error.clone());
        }
        for id in self
            .registry
            .ids_in(&[ConnectionState::Connected, ConnectionState::Disconnecting])
        {
            if let Ok(record) = self.registry.get_mut(&id) {
                record.connection.link_lost(DisconnectReason::LinkLost);
            }
            self.finish_disconnect(&id);
        }
    }

    fn abort_connect(&mut self, id: &PeripheralId, error: Error) {
        let reply = match self.registry.get_mut(id) {
            Ok(record) => record.connection.abort_connect(),
            Err(_) => return,
        };
        if let Some(reply) = reply {
            warn!("Abandoning connect to {}: {}", id, error);
            self.events.emit(CentralEvent::Connect {
                id: id.clone(),
                error: Some(error.clone()),
            });
            respond(reply, Err(error));
        }
    }

    fn on_advertisement(&mut self, report: AdvertisementReport) {
        let record = self.registry.resolve(&report.address);
        record.observe(&report);
        trace!("Advertisement from {} (rssi {:?})", record.address, report.rssi);

        if !self.radio.is_scanning() {
            return;
        }
        if self
            .scanner
            .should_report(&record.id, &record.advertisement, self.radio.filter())
        {
            self.events.emit(CentralEvent::Discover {
                id: record.id.clone(),
                address: record.address.clone(),
                advertisement: record.advertisement.clone(),
                rssi: report.rssi,
                connectable: record.connectable,
            });
        }
    }

    fn on_link_lost(&mut self, address: &DeviceAddress) {
        let id = address.peripheral_id();
        let record = match self.registry.get_mut(&id) {
            Ok(record) => record,
            Err(_) => return,
        };

        match record.state() {
            ConnectionState::Connected => {
                warn!("Link to {} lost", address);
                record.connection.link_lost(DisconnectReason::LinkLost);
                self.finish_disconnect(&id);
            }
            state => debug!("Ignoring link loss of {} while {}", address, state),
        }
    }

    fn on_notification(
        &mut self,
        address: &DeviceAddress,
        service: Option<BleUuid>,
        characteristic: BleUuid,
        value: Bytes,
    ) {
        let id = address.peripheral_id();
        let handle = self
            .registry
            .get(&id)
            .and_then(|r| r.gatt())
            .ok()
            .and_then(|gatt| gatt.subscribed_characteristic(service, characteristic));

        match handle {
            Some(handle) => self.events.emit(CentralEvent::Data {
                id,
                characteristic: handle,
                uuid: characteristic,
                value,
                is_notification: true,
            }),
            None => trace!(
                "Dropping notification for unsubscribed {} on {}",
                characteristic,
                address
            ),
        }
    }

    // === Teardown ===

    async fn shutdown(&mut self) {
        info!("Shutting down central session");

        if self.radio.is_scanning() {
            let transport = self.transport.clone();
            if let Err(e) = bounded(self.config.radio_timeout, transport.stop_scan()).await {
                warn!("Failed to stop scanning during shutdown: {}", e);
            }
            self.radio.scan_stopped();
            self.events.emit(CentralEvent::ScanStop);
        }

        for id in self.registry.ids_in(&[ConnectionState::Connecting]) {
            self.abort_connect(&id, Error::Disconnected);
        }

        for id in self
            .registry
            .ids_in(&[ConnectionState::Connected, ConnectionState::Disconnecting])
        {
            let address = match self.registry.get_mut(&id) {
                Ok(record) => {
                    record.connection.link_lost(DisconnectReason::Shutdown);
                    record.address.clone()
                }
                Err(_) => continue,
            };
            let transport = self.transport.clone();
            if let Err(e) = bounded(self.config.disconnect_timeout, transport.disconnect(&address)).await {
                warn!("Failed to disconnect {} during shutdown: {}", address, e);
            }
            self.finish_disconnect(&id);
        }

        for id in self.dispatcher.peripherals() {
            self.dispatcher.fail_peripheral(&id, &Error::Disconnected);
        }
    }
}

/// Connect failures surface as `ConnectFailed` unless they are timeouts or
/// radio loss.
fn connect_error(e: Error) -> Error {
    match e {
        Error::Timeout | Error::RadioUnavailable | Error::ConnectFailed { .. } => e,
        Error::NativeFailure { message, .. } => Error::ConnectFailed { reason: message },
        other => Error::ConnectFailed {
            reason: other.to_string(),
        },
    }
}

fn attribute_path(attribute: &Attribute) -> AttributePath {
    match attribute {
        Attribute::Characteristic(c) => c.path(),
        Attribute::Descriptor(d) => d.path(),
    }
}

fn subscription_mode(
    characteristic: &Characteristic,
    notify: bool,
    indicate: bool,
) -> Result<NotifyMode> {
    if !notify && !indicate {
        return Err(Error::InvalidParameter {
            name: "notify/indicate".to_string(),
            value: "both false".to_string(),
        });
    }
    NotifyMode::choose(characteristic.properties, notify, indicate).ok_or_else(|| {
        Error::NotSupported {
            operation: format!(
                "characteristic {} does not support the requested notification mode",
                characteristic.uuid
            ),
        }
    })
}
