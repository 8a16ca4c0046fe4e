//! Bluetooth UUIDs.
//!
//! GATT attributes are identified either by a 16-bit (or 32-bit) alias of
//! the Bluetooth Base UUID or by a full 128-bit UUID. [`BleUuid`] stores the
//! full form and renders the short form whenever the value lies on the base.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::{Error, Result};

/// The Bluetooth Base UUID, `00000000-0000-1000-8000-00805f9b34fb`.
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x0000_0000_0000_1000_8000_00805f9b34fb);

const BASE_MASK: u128 = (1u128 << 96) - 1;

/// A GATT UUID in either short or long form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BleUuid(Uuid);

impl BleUuid {
    /// Build a UUID from a 16-bit alias.
    pub const fn from_u16(short: u16) -> Self {
        Self::from_u32(short as u32)
    }

    /// Build a UUID from a 32-bit alias.
    pub const fn from_u32(short: u32) -> Self {
        Self(Uuid::from_u128(
            BLUETOOTH_BASE_UUID.as_u128() | ((short as u128) << 96),
        ))
    }

    /// Wrap a full 128-bit UUID.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The full 128-bit UUID.
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// The 32-bit alias, when this UUID lies on the Bluetooth Base UUID.
    pub fn as_u32(&self) -> Option<u32> {
        let value = self.0.as_u128();
        if value & BASE_MASK == BLUETOOTH_BASE_UUID.as_u128() & BASE_MASK {
            Some((value >> 96) as u32)
        } else {
            None
        }
    }

    /// The 16-bit alias, when this UUID has one.
    pub fn as_u16(&self) -> Option<u16> {
        self.as_u32().and_then(|short| u16::try_from(short).ok())
    }

    /// Whether this UUID can be written in a short form.
    pub fn is_short(&self) -> bool {
        self.as_u32().is_some()
    }

    /// Parse a UUID string.
    ///
    /// Accepted forms are 4 or 8 hex digits (alias of the base UUID),
    /// 32 hex digits without dashes, and the canonical hyphenated form.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || Error::InvalidParameter {
            name: "uuid".to_string(),
            value: input.to_string(),
        };

        let trimmed = input.trim();
        if !trimmed.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
            return Err(invalid());
        }

        match trimmed.len() {
            4 => u16::from_str_radix(trimmed, 16)
                .map(Self::from_u16)
                .map_err(|_| invalid()),
            8 => u32::from_str_radix(trimmed, 16)
                .map(Self::from_u32)
                .map_err(|_| invalid()),
            32 | 36 => Uuid::parse_str(trimmed).map(Self).map_err(|_| invalid()),
            _ => Err(invalid()),
        }
    }

    /// Parse a list of UUID strings, failing on the first invalid entry.
    pub fn parse_all<S: AsRef<str>>(inputs: &[S]) -> Result<Vec<Self>> {
        inputs.iter().map(|s| Self::parse(s.as_ref())).collect()
    }
}

impl fmt::Display for BleUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_u32() {
            Some(short) if short <= u16::MAX as u32 => write!(f, "{:04x}", short),
            Some(short) => write!(f, "{:08x}", short),
            None => write!(f, "{}", self.0.hyphenated()),
        }
    }
}

impl FromStr for BleUuid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<Uuid> for BleUuid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<BleUuid> for Uuid {
    fn from(uuid: BleUuid) -> Self {
        uuid.0
    }
}

impl From<u16> for BleUuid {
    fn from(short: u16) -> Self {
        Self::from_u16(short)
    }
}

// Well-known assigned numbers

/// Generic Access service.
pub const GENERIC_ACCESS_SERVICE: BleUuid = BleUuid::from_u16(0x1800);
/// Generic Attribute service.
pub const GENERIC_ATTRIBUTE_SERVICE: BleUuid = BleUuid::from_u16(0x1801);
/// Device Information service.
pub const DEVICE_INFO_SERVICE: BleUuid = BleUuid::from_u16(0x180a);
/// Battery service.
pub const BATTERY_SERVICE: BleUuid = BleUuid::from_u16(0x180f);
/// Battery Level characteristic.
pub const BATTERY_LEVEL: BleUuid = BleUuid::from_u16(0x2a19);
/// Device Name characteristic.
pub const DEVICE_NAME: BleUuid = BleUuid::from_u16(0x2a00);
/// Manufacturer Name String characteristic.
pub const MANUFACTURER_NAME: BleUuid = BleUuid::from_u16(0x2a29);
/// Model Number String characteristic.
pub const MODEL_NUMBER: BleUuid = BleUuid::from_u16(0x2a24);
/// Firmware Revision String characteristic.
pub const FIRMWARE_REVISION: BleUuid = BleUuid::from_u16(0x2a26);
/// Client Characteristic Configuration descriptor.
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: BleUuid = BleUuid::from_u16(0x2902);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_form_roundtrip() {
        let uuid = BleUuid::parse("180f").unwrap();
        assert_eq!(uuid, BATTERY_SERVICE);
        assert_eq!(uuid.as_u16(), Some(0x180f));
        assert_eq!(uuid.to_string(), "180f");
        assert_eq!(
            uuid.as_uuid().to_string(),
            "0000180f-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_long_form_on_base_prints_short() {
        let uuid = BleUuid::parse("00002A19-0000-1000-8000-00805F9B34FB").unwrap();
        assert_eq!(uuid, BATTERY_LEVEL);
        assert_eq!(uuid.to_string(), "2a19");
    }

    #[test]
    fn test_dashless_form() {
        let uuid = BleUuid::parse("6e400001b5a3f393e0a9e50e24dcca9e").unwrap();
        assert!(!uuid.is_short());
        assert_eq!(uuid.to_string(), "6e400001-b5a3-f393-e0a9-e50e24dcca9e");
    }

    #[test]
    fn test_32_bit_alias() {
        let uuid = BleUuid::parse("0001180f").unwrap();
        assert_eq!(uuid.as_u32(), Some(0x0001_180f));
        assert_eq!(uuid.as_u16(), None);
        assert_eq!(uuid.to_string(), "0001180f");
    }

    #[test]
    fn test_invalid_inputs() {
        for input in ["", "18f", "zzzz", "180f-", "12345", "not-a-uuid-at-all"] {
            assert!(BleUuid::parse(input).is_err(), "accepted {:?}", input);
        }
    }

    #[test]
    fn test_parse_all() {
        let uuids = BleUuid::parse_all(&["180f", "2a19"]).unwrap();
        assert_eq!(uuids, vec![BATTERY_SERVICE, BATTERY_LEVEL]);
        assert!(BleUuid::parse_all(&["180f", "nope"]).is_err());
    }
}
