//! Device addresses and consumer-visible peripheral identifiers.

use std::fmt;

/// Platform address of a remote device.
///
/// Most stacks expose the 48-bit Bluetooth device address. Some (CoreBluetooth)
/// only hand out an opaque per-host identifier, which is carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceAddress {
    /// A 48-bit device address, most significant byte first.
    Mac([u8; 6]),
    /// An opaque platform identifier.
    Platform(String),
}

impl DeviceAddress {
    /// Build an address from the low 48 bits of an integer.
    pub fn from_u64(raw: u64) -> Self {
        let bytes = raw.to_be_bytes();
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&bytes[2..]);
        Self::Mac(mac)
    }

    /// The address as an integer, if it is a 48-bit address.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Mac(mac) => Some(mac.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)),
            Self::Platform(_) => None,
        }
    }

    /// Parse `aa:bb:cc:dd:ee:ff`, `aa-bb-...` or 12 bare hex digits.
    ///
    /// Anything else is kept as an opaque platform identifier.
    pub fn parse(input: &str) -> Self {
        let digits: String = input
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();

        let separators_ok = input.len() == 12 || input.len() == 17;
        if separators_ok && digits.len() == 12 && digits.chars().all(|c| c.is_ascii_hexdigit()) {
            if let Ok(raw) = u64::from_str_radix(&digits, 16) {
                return Self::from_u64(raw);
            }
        }

        Self::Platform(input.to_string())
    }

    /// The identifier under which this device is reported to consumers.
    pub fn peripheral_id(&self) -> PeripheralId {
        match self {
            Self::Mac(mac) => PeripheralId(mac.iter().map(|b| format!("{:02x}", b)).collect()),
            Self::Platform(id) => PeripheralId(
                id.chars()
                    .filter(|c| *c != ':' && *c != '-')
                    .flat_map(|c| c.to_lowercase())
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mac(mac) => {
                let parts: Vec<String> = mac.iter().map(|b| format!("{:02x}", b)).collect();
                write!(f, "{}", parts.join(":"))
            }
            Self::Platform(id) => write!(f, "{}", id),
        }
    }
}

impl Default for DeviceAddress {
    fn default() -> Self {
        Self::Mac([0; 6])
    }
}

/// Stable, consumer-visible identifier of a peripheral.
///
/// Derived 1:1 from the [`DeviceAddress`]: a 48-bit address becomes twelve
/// lowercase hex digits without separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Create an identifier from its string form.
    ///
    /// Separators are dropped and hex digits lowercased so that
    /// `"AA:BB:CC:DD:EE:FF"` and `"aabbccddeeff"` name the same peripheral.
    pub fn new(id: impl AsRef<str>) -> Self {
        DeviceAddress::parse(id.as_ref()).peripheral_id()
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The address a connect-by-id should target when the peripheral has not been seen.
    pub fn to_address(&self) -> DeviceAddress {
        DeviceAddress::parse(&self.0)
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeripheralId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_formatting() {
        let address = DeviceAddress::from_u64(0xAABB_CCDD_EEFF);
        assert_eq!(address.to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(address.peripheral_id().as_str(), "aabbccddeeff");
        assert_eq!(address.as_u64(), Some(0xAABB_CCDD_EEFF));
    }

    #[test]
    fn test_parse_variants() {
        let expected = DeviceAddress::Mac([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(DeviceAddress::parse("AA:BB:CC:DD:EE:FF"), expected);
        assert_eq!(DeviceAddress::parse("aa-bb-cc-dd-ee-ff"), expected);
        assert_eq!(DeviceAddress::parse("aabbccddeeff"), expected);
    }

    #[test]
    fn test_opaque_identifier() {
        let address = DeviceAddress::parse("4E1C2A3B-0000-4F7D-9C6E-112233445566");
        assert!(matches!(address, DeviceAddress::Platform(_)));
        assert_eq!(address.as_u64(), None);
        assert_eq!(
            address.peripheral_id().as_str(),
            "4e1c2a3b00004f7d9c6e112233445566"
        );
    }

    #[test]
    fn test_peripheral_id_normalisation() {
        assert_eq!(PeripheralId::new("AA:BB:CC:DD:EE:FF"), PeripheralId::new("aabbccddeeff"));
        assert_eq!(
            PeripheralId::new("aabbccddeeff").to_address(),
            DeviceAddress::from_u64(0xAABB_CCDD_EEFF)
        );
    }
}
