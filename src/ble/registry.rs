//! Peripheral registry.
//!
//! One record per remote device ever seen (or connected to by id) during
//! the lifetime of a central. Records are created lazily and only removed
//! on request, and only while disconnected.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::ble::address::{DeviceAddress, PeripheralId};
use crate::ble::advertising::{Advertisement, AdvertisementReport};
use crate::ble::connection::{ConnectionMachine, ConnectionState};
use crate::ble::gatt::GattSession;
use crate::error::{Error, Result};

/// State of one known peripheral.
#[derive(Debug)]
pub(crate) struct PeripheralRecord {
    pub id: PeripheralId,
    pub address: DeviceAddress,
    pub advertisement: Advertisement,
    pub rssi: Option<i16>,
    pub connectable: bool,
    pub connection: ConnectionMachine,
    /// Present exactly while connected.
    pub gatt: Option<GattSession>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl PeripheralRecord {
    fn new(address: DeviceAddress) -> Self {
        let now = Utc::now();
        Self {
            id: address.peripheral_id(),
            address,
            advertisement: Advertisement::default(),
            rssi: None,
            connectable: true,
            connection: ConnectionMachine::default(),
            gatt: None,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Fold an advertisement into the record.
    pub fn observe(&mut self, report: &AdvertisementReport) {
        self.advertisement.merge(report);
        if report.rssi.is_some() {
            self.rssi = report.rssi;
        }
        if let Some(connectable) = report.connectable {
            self.connectable = connectable;
        }
        self.last_seen = Utc::now();
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// The GATT session, failing unless connected.
    pub fn gatt(&self) -> Result<&GattSession> {
        match (self.state(), self.gatt.as_ref()) {
            (ConnectionState::Connected, Some(gatt)) => Ok(gatt),
            _ => Err(Error::NotConnected),
        }
    }

    pub fn gatt_mut(&mut self) -> Result<&mut GattSession> {
        match (self.connection.state(), self.gatt.as_mut()) {
            (ConnectionState::Connected, Some(gatt)) => Ok(gatt),
            _ => Err(Error::NotConnected),
        }
    }

    pub fn info(&self) -> PeripheralInfo {
        PeripheralInfo {
            id: self.id.clone(),
            address: self.address.clone(),
            advertisement: self.advertisement.clone(),
            rssi: self.rssi,
            connectable: self.connectable,
            state: self.state(),
            first_seen: self.first_seen,
            last_seen: self.last_seen,
        }
    }
}

/// Snapshot of a peripheral, as returned to consumers.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralInfo {
    /// Consumer-visible identifier.
    pub id: PeripheralId,
    /// Platform address.
    pub address: DeviceAddress,
    /// Cumulative advertisement data.
    pub advertisement: Advertisement,
    /// Last known signal strength in dBm.
    pub rssi: Option<i16>,
    /// Whether the peripheral accepts connections.
    pub connectable: bool,
    /// Current connection state.
    pub state: ConnectionState,
    /// When the peripheral was first seen.
    pub first_seen: DateTime<Utc>,
    /// When the peripheral was last heard from.
    pub last_seen: DateTime<Utc>,
}

/// All peripherals known to a session, by id.
#[derive(Debug, Default)]
pub(crate) struct PeripheralRegistry {
    records: HashMap<PeripheralId, PeripheralRecord>,
}

impl PeripheralRegistry {
    /// Get or create the record for an address.
    pub fn resolve(&mut self, address: &DeviceAddress) -> &mut PeripheralRecord {
        let id = address.peripheral_id();
        self.records.entry(id).or_insert_with(|| {
            debug!("Registering peripheral {}", address);
            PeripheralRecord::new(address.clone())
        })
    }

    pub fn get(&self, id: &PeripheralId) -> Result<&PeripheralRecord> {
        self.records.get(id).ok_or_else(|| not_found(id))
    }

    pub fn get_mut(&mut self, id: &PeripheralId) -> Result<&mut PeripheralRecord> {
        self.records.get_mut(id).ok_or_else(|| not_found(id))
    }

    pub fn contains(&self, id: &PeripheralId) -> bool {
        self.records.contains_key(id)
    }

    /// Forget a peripheral. Only disconnected peripherals can be removed.
    pub fn remove(&mut self, id: &PeripheralId) -> Result<PeripheralRecord> {
        let state = self.get(id)?.state();
        if state != ConnectionState::Disconnected {
            return Err(Error::invalid_state(format!(
                "cannot remove peripheral {} while {}",
                id, state
            )));
        }
        self.records.remove(id).ok_or_else(|| not_found(id))
    }

    /// Ids of peripherals in any of the given states.
    pub fn ids_in(&self, states: &[ConnectionState]) -> Vec<PeripheralId> {
        let mut ids: Vec<PeripheralId> = self
            .records
            .values()
            .filter(|r| states.contains(&r.state()))
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Snapshots of every record, ordered by id.
    pub fn snapshot(&self) -> Vec<PeripheralInfo> {
        let mut infos: Vec<PeripheralInfo> = self.records.values().map(|r| r.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.len()
    }
}

fn not_found(id: &PeripheralId) -> Error {
    Error::PeripheralNotFound {
        identifier: id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::BATTERY_SERVICE;
    use tokio::sync::oneshot;

    fn address() -> DeviceAddress {
        DeviceAddress::from_u64(0xAABB_CCDD_EEFF)
    }

    #[test]
    fn test_resolve_creates_once() {
        let mut registry = PeripheralRegistry::default();
        registry.resolve(&address()).rssi = Some(-40);
        let record = registry.resolve(&address());
        assert_eq!(record.rssi, Some(-40));
        assert_eq!(record.id.as_str(), "aabbccddeeff");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_observe_merges_advertisement() {
        let mut registry = PeripheralRegistry::default();
        let mut report = AdvertisementReport::new(address());
        report.rssi = Some(-70);
        report.local_name = Some("Tag".to_string());
        report.connectable = Some(false);
        registry.resolve(&address()).observe(&report);

        let mut response = AdvertisementReport::new(address());
        response.service_uuids = vec![BATTERY_SERVICE];
        registry.resolve(&address()).observe(&response);

        let info = registry.get(&address().peripheral_id()).unwrap().info();
        assert_eq!(info.rssi, Some(-70));
        assert_eq!(info.advertisement.local_name.as_deref(), Some("Tag"));
        assert_eq!(info.advertisement.service_uuids, vec![BATTERY_SERVICE]);
        assert!(!info.connectable);
    }

    #[test]
    fn test_unknown_peripheral() {
        let registry = PeripheralRegistry::default();
        assert!(matches!(
            registry.get(&PeripheralId::new("001122334455")),
            Err(Error::PeripheralNotFound { .. })
        ));
    }

    #[test]
    fn test_remove_requires_disconnected() {
        let mut registry = PeripheralRegistry::default();
        let id = address().peripheral_id();
        let (tx, _rx) = oneshot::channel();
        registry
            .resolve(&address())
            .connection
            .begin_connect(tx)
            .unwrap();

        assert!(matches!(
            registry.remove(&id),
            Err(Error::InvalidState { .. })
        ));
        registry.get_mut(&id).unwrap().connection.abort_connect();
        assert!(registry.remove(&id).is_ok());
        assert!(!registry.contains(&id));
    }

    #[test]
    fn test_gatt_requires_connection() {
        let mut registry = PeripheralRegistry::default();
        let record = registry.resolve(&address());
        record.gatt = Some(GattSession::default());
        assert_eq!(record.gatt().err(), Some(Error::NotConnected));
    }
}
