// Allow holding locks across await points - we use parking_lot which is designed for this
#![allow(clippy::await_holding_lock)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ble-central
//!
//! An asynchronous, event-driven Bluetooth Low Energy central.
//!
//! A [`Central`] owns one radio. It scans for advertising peripherals,
//! connects to them, discovers their GATT attributes and reads, writes and
//! subscribes to characteristics and descriptors. Every state change is
//! reported both as the result of the call that caused it and as a
//! [`CentralEvent`].
//!
//! ## Features
//!
//! - **Scanning**: Service UUID filters and duplicate suppression
//! - **Connections**: One state machine per peripheral, with timeouts
//! - **GATT Discovery**: Services, included services, characteristics, descriptors
//! - **I/O**: Reads, writes with and without response, notifications and indications
//! - **Ordering**: Operations on the same attribute complete in issue order
//! - **Events**: Callbacks per event kind plus an async broadcast stream
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_central::{Central, CentralConfig, CentralEvent, EventKind, Result, BATTERY_SERVICE};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let central = Central::with_btleplug(CentralConfig::default()).await?;
//!     let _discover = central.on(EventKind::Discover, |event| {
//!         if let CentralEvent::Discover { id, rssi, .. } = event {
//!             println!("Found {} ({:?} dBm)", id, rssi);
//!         }
//!     });
//!
//!     central.start().await?;
//!     central.start_scanning(&[BATTERY_SERVICE], false).await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!     central.stop_scanning().await?;
//!
//!     for peripheral in central.peripherals().await? {
//!         println!("{} {:?}", peripheral.id, peripheral.advertisement.local_name);
//!     }
//!
//!     central.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps. Peripherals are identified by an
//! opaque per-host identifier instead of their device address.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod central;
pub mod config;
pub mod error;
pub mod events;
pub mod transport;

mod session;

// Re-exports for convenience
pub use central::Central;
pub use config::CentralConfig;
pub use error::{Error, Result};
pub use events::{CallbackHandle, CentralEvent, EventKind};
pub use transport::{BleTransport, BtleplugTransport, Capabilities, NativeEvent};

// Re-export commonly used types from submodules
pub use ble::address::{DeviceAddress, PeripheralId};
pub use ble::advertising::{Advertisement, AdvertisementReport};
pub use ble::connection::{ConnectionState, DisconnectReason};
pub use ble::gatt::{
    Characteristic, CharacteristicProperties, Descriptor, GattTree, Handle, NotifyMode, Service,
};
pub use ble::radio::{RadioState, ScanFilter};
pub use ble::registry::PeripheralInfo;
pub use ble::uuids::{BleUuid, BATTERY_LEVEL, BATTERY_SERVICE};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<Central>();
        let _ = std::any::TypeId::of::<CentralEvent>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<GattTree>();
        let _ = std::any::TypeId::of::<PeripheralInfo>();
        let _ = std::any::TypeId::of::<BtleplugTransport>();
    }

    #[test]
    fn test_event_names() {
        assert_eq!(EventKind::StateChange.name(), "stateChange");
        assert_eq!(EventKind::ServicesDiscover.name(), "servicesDiscover");
        assert_eq!(EventKind::ValueWrite.name(), "valueWrite");
    }
}
