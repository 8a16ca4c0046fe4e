//! Upward event channel.
//!
//! Every component of a session publishes through one [`EventBridge`], so
//! consumers observe a single totally ordered stream. Events reach
//! registered callbacks synchronously, in emission order, and are also
//! published on a `broadcast` channel for async consumers.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::ble::address::{DeviceAddress, PeripheralId};
use crate::ble::advertising::Advertisement;
use crate::ble::connection::DisconnectReason;
use crate::ble::gatt::{Characteristic, Descriptor, Handle, Service};
use crate::ble::radio::{RadioState, ScanFilter};
use crate::ble::uuids::BleUuid;
use crate::error::Error;

/// An event emitted by a [`Central`](crate::Central).
#[derive(Debug, Clone, PartialEq)]
pub enum CentralEvent {
    /// The radio changed state.
    StateChange(RadioState),
    /// Scanning started, or restarted with a new filter.
    ScanStart {
        /// The active filter.
        filter: ScanFilter,
    },
    /// Scanning stopped.
    ScanStop,
    /// A peripheral was seen while scanning.
    Discover {
        /// Peripheral id.
        id: PeripheralId,
        /// Platform address.
        address: DeviceAddress,
        /// Cumulative advertisement data.
        advertisement: Advertisement,
        /// Signal strength of the triggering report.
        rssi: Option<i16>,
        /// Whether the peripheral accepts connections.
        connectable: bool,
    },
    /// A connect attempt finished.
    Connect {
        /// Peripheral id.
        id: PeripheralId,
        /// Set when the attempt failed.
        error: Option<Error>,
    },
    /// A peripheral reached the disconnected state.
    Disconnect {
        /// Peripheral id.
        id: PeripheralId,
        /// Why the link ended.
        reason: DisconnectReason,
    },
    /// A fresh RSSI value is available.
    RssiUpdate {
        /// Peripheral id.
        id: PeripheralId,
        /// Signal strength in dBm.
        rssi: Option<i16>,
    },
    /// Service discovery completed.
    ServicesDiscover {
        /// Peripheral id.
        id: PeripheralId,
        /// The new service list.
        services: Vec<Service>,
    },
    /// Included service discovery completed.
    IncludedServicesDiscover {
        /// Peripheral id.
        id: PeripheralId,
        /// Including service.
        service: Handle,
        /// Included services.
        included: Vec<Service>,
    },
    /// Characteristic discovery completed.
    CharacteristicsDiscover {
        /// Peripheral id.
        id: PeripheralId,
        /// Owning service.
        service: Handle,
        /// The new characteristic list.
        characteristics: Vec<Characteristic>,
    },
    /// Descriptor discovery completed.
    DescriptorsDiscover {
        /// Peripheral id.
        id: PeripheralId,
        /// Owning characteristic.
        characteristic: Handle,
        /// The new descriptor list.
        descriptors: Vec<Descriptor>,
    },
    /// A characteristic value arrived, from a read or a notification.
    Data {
        /// Peripheral id.
        id: PeripheralId,
        /// Characteristic handle.
        characteristic: Handle,
        /// Characteristic UUID.
        uuid: BleUuid,
        /// Value payload.
        value: Bytes,
        /// `true` for notifications and indications, `false` for read responses.
        is_notification: bool,
    },
    /// A characteristic write completed.
    Write {
        /// Peripheral id.
        id: PeripheralId,
        /// Characteristic handle.
        characteristic: Handle,
    },
    /// Notifications were enabled or disabled.
    Notify {
        /// Peripheral id.
        id: PeripheralId,
        /// Characteristic handle.
        characteristic: Handle,
        /// New subscription state.
        enabled: bool,
    },
    /// A descriptor read completed.
    ValueRead {
        /// Peripheral id.
        id: PeripheralId,
        /// Descriptor handle.
        descriptor: Handle,
        /// Value payload.
        value: Bytes,
    },
    /// A descriptor write completed.
    ValueWrite {
        /// Peripheral id.
        id: PeripheralId,
        /// Descriptor handle.
        descriptor: Handle,
    },
}

/// Discriminant of [`CentralEvent`], used to register listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum EventKind {
    StateChange,
    ScanStart,
    ScanStop,
    Discover,
    Connect,
    Disconnect,
    RssiUpdate,
    ServicesDiscover,
    IncludedServicesDiscover,
    CharacteristicsDiscover,
    DescriptorsDiscover,
    Data,
    Write,
    Notify,
    ValueRead,
    ValueWrite,
}

impl EventKind {
    /// The event name in the native binding's spelling.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StateChange => "stateChange",
            Self::ScanStart => "scanStart",
            Self::ScanStop => "scanStop",
            Self::Discover => "discover",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::RssiUpdate => "rssiUpdate",
            Self::ServicesDiscover => "servicesDiscover",
            Self::IncludedServicesDiscover => "includedServicesDiscover",
            Self::CharacteristicsDiscover => "characteristicsDiscover",
            Self::DescriptorsDiscover => "descriptorsDiscover",
            Self::Data => "data",
            Self::Write => "write",
            Self::Notify => "notify",
            Self::ValueRead => "valueRead",
            Self::ValueWrite => "valueWrite",
        }
    }
}

impl CentralEvent {
    /// The kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StateChange(_) => EventKind::StateChange,
            Self::ScanStart { .. } => EventKind::ScanStart,
            Self::ScanStop => EventKind::ScanStop,
            Self::Discover { .. } => EventKind::Discover,
            Self::Connect { .. } => EventKind::Connect,
            Self::Disconnect { .. } => EventKind::Disconnect,
            Self::RssiUpdate { .. } => EventKind::RssiUpdate,
            Self::ServicesDiscover { .. } => EventKind::ServicesDiscover,
            Self::IncludedServicesDiscover { .. } => EventKind::IncludedServicesDiscover,
            Self::CharacteristicsDiscover { .. } => EventKind::CharacteristicsDiscover,
            Self::DescriptorsDiscover { .. } => EventKind::DescriptorsDiscover,
            Self::Data { .. } => EventKind::Data,
            Self::Write { .. } => EventKind::Write,
            Self::Notify { .. } => EventKind::Notify,
            Self::ValueRead { .. } => EventKind::ValueRead,
            Self::ValueWrite { .. } => EventKind::ValueWrite,
        }
    }

    /// The peripheral this event concerns, if any.
    pub fn peripheral(&self) -> Option<&PeripheralId> {
        match self {
            Self::StateChange(_) | Self::ScanStart { .. } | Self::ScanStop => None,
            Self::Discover { id, .. }
            | Self::Connect { id, .. }
            | Self::Disconnect { id, .. }
            | Self::RssiUpdate { id, .. }
            | Self::ServicesDiscover { id, .. }
            | Self::IncludedServicesDiscover { id, .. }
            | Self::CharacteristicsDiscover { id, .. }
            | Self::DescriptorsDiscover { id, .. }
            | Self::Data { id, .. }
            | Self::Write { id, .. }
            | Self::Notify { id, .. }
            | Self::ValueRead { id, .. }
            | Self::ValueWrite { id, .. } => Some(id),
        }
    }
}

/// Handle for a registered callback.
///
/// The callback is unregistered when this handle is dropped.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Keep the callback registered for the lifetime of the central.
    pub fn detach(mut self) {
        self.unregister_fn.take();
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle").field("id", &self.id).finish()
    }
}

type Listener = Arc<dyn Fn(&CentralEvent) + Send + Sync>;

/// `None` registers for every kind.
type ListenerMap = HashMap<Option<EventKind>, Vec<(u64, Listener)>>;

/// Fan-out point for session events.
pub(crate) struct EventBridge {
    listeners: Arc<RwLock<ListenerMap>>,
    next_id: AtomicU64,
    tx: broadcast::Sender<CentralEvent>,
}

impl EventBridge {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            listeners: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CentralEvent> {
        self.tx.subscribe()
    }

    /// Register a listener for one kind, or for all kinds with `None`.
    pub fn on<F>(&self, kind: Option<EventKind>, callback: F) -> CallbackHandle
    where
        F: Fn(&CentralEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));

        let listeners = Arc::downgrade(&self.listeners);
        CallbackHandle::new(id, move || {
            if let Some(listeners) = listeners.upgrade() {
                if let Some(list) = listeners.write().get_mut(&kind) {
                    list.retain(|(listener_id, _)| *listener_id != id);
                }
            }
        })
    }

    /// Deliver an event to every listener, then to broadcast receivers.
    pub fn emit(&self, event: CentralEvent) {
        let kind = event.kind();
        trace!("Emitting {} event", kind.name());

        // Snapshot so listeners may register or unregister while running.
        let targets: Vec<(u64, Listener)> = {
            let listeners = self.listeners.read();
            let mut targets = Vec::new();
            for key in [Some(kind), None] {
                if let Some(list) = listeners.get(&key) {
                    targets.extend(list.iter().cloned());
                }
            }
            targets.sort_by_key(|(id, _)| *id);
            targets
        };

        for (id, listener) in targets {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!("Listener {} panicked handling {} event", id, kind.name());
            }
        }

        let _ = self.tx.send(event);
    }

    #[cfg(test)]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    fn connect(id: &str) -> CentralEvent {
        CentralEvent::Connect {
            id: PeripheralId::new(id),
            error: None,
        }
    }

    #[test]
    fn test_kind_and_names() {
        assert_eq!(CentralEvent::ScanStop.kind(), EventKind::ScanStop);
        assert_eq!(connect("aabbccddeeff").kind().name(), "connect");
        assert_eq!(
            connect("aabbccddeeff").peripheral(),
            Some(&PeripheralId::new("aabbccddeeff"))
        );
        assert_eq!(CentralEvent::StateChange(RadioState::PoweredOn).peripheral(), None);
    }

    #[test]
    fn test_listeners_receive_in_order() {
        let bridge = EventBridge::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        let _first = bridge.on(Some(EventKind::Connect), move |e| {
            log.lock().push(format!("first {:?}", e.peripheral()))
        });
        let log = seen.clone();
        let _any = bridge.on(None, move |e| log.lock().push(format!("any {}", e.kind().name())));

        bridge.emit(connect("aabbccddeeff"));
        bridge.emit(CentralEvent::ScanStop);

        assert_eq!(
            *seen.lock(),
            vec![
                "first Some(PeripheralId(\"aabbccddeeff\"))".to_string(),
                "any connect".to_string(),
                "any scanStop".to_string(),
            ]
        );
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let bridge = EventBridge::new(16);
        let count = Arc::new(AtomicU64::new(0));

        let _bad = bridge.on(Some(EventKind::ScanStop), |_| panic!("listener failure"));
        let counter = count.clone();
        let _good = bridge.on(Some(EventKind::ScanStop), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bridge.emit(CentralEvent::ScanStop);
        bridge.emit(CentralEvent::ScanStop);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dropping_handle_unregisters() {
        let bridge = EventBridge::new(16);
        let count = Arc::new(AtomicU64::new(0));

        let counter = count.clone();
        let handle = bridge.on(Some(EventKind::ScanStop), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bridge.emit(CentralEvent::ScanStop);
        drop(handle);
        bridge.emit(CentralEvent::ScanStop);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.listener_count(), 0);

        bridge
            .on(Some(EventKind::ScanStop), |_| {})
            .detach();
        assert_eq!(bridge.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_receives_events() {
        let bridge = EventBridge::new(16);
        let mut rx = bridge.subscribe();
        bridge.emit(CentralEvent::StateChange(RadioState::PoweredOn));
        assert_eq!(
            rx.recv().await.unwrap(),
            CentralEvent::StateChange(RadioState::PoweredOn)
        );
    }
}
