//! BLE domain model.
//!
//! Addresses, advertisements, radio and connection state, and the GATT
//! attribute tree. Everything here is plain data plus the state machines
//! the session drives; nothing in this module talks to a Bluetooth stack.

pub mod address;
pub mod advertising;
pub mod connection;
pub(crate) mod dispatcher;
pub mod gatt;
pub mod radio;
pub mod registry;
pub(crate) mod scanner;
pub mod uuids;

pub use address::{DeviceAddress, PeripheralId};
pub use advertising::{Advertisement, AdvertisementReport};
pub use connection::{ConnectionState, DisconnectReason};
pub use gatt::{
    AttributePath, Characteristic, CharacteristicProperties, Descriptor, GattTree, Handle,
    NotifyMode, Service,
};
pub use radio::{RadioState, ScanFilter};
pub use registry::PeripheralInfo;
pub use uuids::*;
