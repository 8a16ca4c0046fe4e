//! Advertisement reports and the cumulative advertisement view.
//!
//! A peripheral usually spreads its advertised data across several packets
//! (advertising PDU plus scan response). Each [`AdvertisementReport`] carries
//! whatever one packet contained; [`Advertisement::merge`] folds reports into
//! a per-peripheral view where newer fields overwrite and absent fields are
//! retained.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::ble::address::DeviceAddress;
use crate::ble::uuids::BleUuid;
use crate::error::{Error, Result};

/// AD type codes from the Bluetooth Assigned Numbers document.
mod ad_type {
    pub const FLAGS: u8 = 0x01;
    pub const INCOMPLETE_SERVICE_UUIDS_16: u8 = 0x02;
    pub const COMPLETE_SERVICE_UUIDS_16: u8 = 0x03;
    pub const INCOMPLETE_SERVICE_UUIDS_32: u8 = 0x04;
    pub const COMPLETE_SERVICE_UUIDS_32: u8 = 0x05;
    pub const INCOMPLETE_SERVICE_UUIDS_128: u8 = 0x06;
    pub const COMPLETE_SERVICE_UUIDS_128: u8 = 0x07;
    pub const SHORTENED_LOCAL_NAME: u8 = 0x08;
    pub const COMPLETE_LOCAL_NAME: u8 = 0x09;
    pub const TX_POWER_LEVEL: u8 = 0x0A;
    pub const SERVICE_DATA_16: u8 = 0x16;
    pub const SERVICE_DATA_32: u8 = 0x20;
    pub const SERVICE_DATA_128: u8 = 0x21;
    pub const MANUFACTURER_DATA: u8 = 0xFF;
}

/// One advertisement (or scan response) as delivered by the radio.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AdvertisementReport {
    /// Address of the advertiser.
    pub address: DeviceAddress,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Whether the advertising PDU type accepts connections, when known.
    pub connectable: Option<bool>,
    /// Local name, if this packet carried one.
    pub local_name: Option<String>,
    /// Advertised TX power level in dBm.
    pub tx_power_level: Option<i16>,
    /// AD flags byte.
    pub flags: Option<u8>,
    /// Service UUIDs listed in this packet.
    pub service_uuids: Vec<BleUuid>,
    /// Service data keyed by service UUID.
    pub service_data: BTreeMap<BleUuid, Bytes>,
    /// Manufacturer specific data keyed by company identifier.
    pub manufacturer_data: BTreeMap<u16, Bytes>,
    /// The undecoded payload, when the platform exposes it.
    pub raw: Option<Bytes>,
}

impl AdvertisementReport {
    /// Create an empty report for an address.
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    /// Decode a raw advertising payload (a sequence of AD structures).
    ///
    /// Unknown AD types are skipped. A zero length byte terminates the
    /// payload early, as the remainder is padding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if an AD structure runs past the
    /// end of the payload or a UUID list has a ragged length.
    pub fn from_raw(
        address: DeviceAddress,
        payload: &[u8],
        rssi: Option<i16>,
        connectable: Option<bool>,
    ) -> Result<Self> {
        let mut report = Self::new(address);
        report.rssi = rssi;
        report.connectable = connectable;
        report.raw = Some(Bytes::copy_from_slice(payload));

        let mut offset = 0;
        while offset < payload.len() {
            let length = payload[offset] as usize;
            if length == 0 {
                break;
            }

            let end = offset + 1 + length;
            if end > payload.len() {
                return Err(malformed(format!(
                    "AD structure at offset {} claims {} bytes, only {} left",
                    offset,
                    length,
                    payload.len() - offset - 1
                )));
            }

            let kind = payload[offset + 1];
            let data = &payload[offset + 2..end];
            report.apply_structure(kind, data)?;

            offset = end;
        }

        Ok(report)
    }

    fn apply_structure(&mut self, kind: u8, data: &[u8]) -> Result<()> {
        match kind {
            ad_type::FLAGS => {
                self.flags = data.first().copied();
            }
            ad_type::INCOMPLETE_SERVICE_UUIDS_16 | ad_type::COMPLETE_SERVICE_UUIDS_16 => {
                for uuid in decode_uuid_list(data, 2)? {
                    self.push_service(uuid);
                }
            }
            ad_type::INCOMPLETE_SERVICE_UUIDS_32 | ad_type::COMPLETE_SERVICE_UUIDS_32 => {
                for uuid in decode_uuid_list(data, 4)? {
                    self.push_service(uuid);
                }
            }
            ad_type::INCOMPLETE_SERVICE_UUIDS_128 | ad_type::COMPLETE_SERVICE_UUIDS_128 => {
                for uuid in decode_uuid_list(data, 16)? {
                    self.push_service(uuid);
                }
            }
            ad_type::SHORTENED_LOCAL_NAME => {
                // A complete name wins over a shortened one in the same packet.
                if self.local_name.is_none() {
                    self.local_name = Some(String::from_utf8_lossy(data).into_owned());
                }
            }
            ad_type::COMPLETE_LOCAL_NAME => {
                self.local_name = Some(String::from_utf8_lossy(data).into_owned());
            }
            ad_type::TX_POWER_LEVEL => {
                self.tx_power_level = data.first().map(|b| *b as i8 as i16);
            }
            ad_type::SERVICE_DATA_16 => self.push_service_data(data, 2)?,
            ad_type::SERVICE_DATA_32 => self.push_service_data(data, 4)?,
            ad_type::SERVICE_DATA_128 => self.push_service_data(data, 16)?,
            ad_type::MANUFACTURER_DATA => {
                if data.len() < 2 {
                    return Err(malformed("manufacturer data shorter than a company id"));
                }
                let company = u16::from_le_bytes([data[0], data[1]]);
                self.manufacturer_data
                    .insert(company, Bytes::copy_from_slice(&data[2..]));
            }
            _ => {}
        }

        Ok(())
    }

    fn push_service(&mut self, uuid: BleUuid) {
        if !self.service_uuids.contains(&uuid) {
            self.service_uuids.push(uuid);
        }
    }

    fn push_service_data(&mut self, data: &[u8], width: usize) -> Result<()> {
        if data.len() < width {
            return Err(malformed("service data shorter than its UUID"));
        }
        let uuid = decode_uuid(&data[..width]);
        self.service_data
            .insert(uuid, Bytes::copy_from_slice(&data[width..]));
        Ok(())
    }
}

fn malformed(context: impl Into<String>) -> Error {
    Error::InvalidParameter {
        name: "advertisement".to_string(),
        value: context.into(),
    }
}

/// Decode a little-endian UUID of 2, 4 or 16 bytes.
fn decode_uuid(bytes: &[u8]) -> BleUuid {
    match bytes.len() {
        2 => BleUuid::from_u16(u16::from_le_bytes([bytes[0], bytes[1]])),
        4 => BleUuid::from_u32(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        _ => {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(&bytes[..16]);
            BleUuid::from_uuid(uuid::Uuid::from_u128(u128::from_le_bytes(raw)))
        }
    }
}

fn decode_uuid_list(data: &[u8], width: usize) -> Result<Vec<BleUuid>> {
    if data.len() % width != 0 {
        return Err(malformed(format!(
            "{} byte UUID list is not a multiple of {}",
            data.len(),
            width
        )));
    }
    Ok(data.chunks_exact(width).map(decode_uuid).collect())
}

/// The cumulative advertisement view of one peripheral.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Advertisement {
    /// Most recent local name.
    pub local_name: Option<String>,
    /// Most recent TX power level in dBm.
    pub tx_power_level: Option<i16>,
    /// Most recent AD flags.
    pub flags: Option<u8>,
    /// Every service UUID ever advertised, in first-seen order.
    pub service_uuids: Vec<BleUuid>,
    /// Latest service data per service UUID.
    pub service_data: BTreeMap<BleUuid, Bytes>,
    /// Latest manufacturer data per company identifier.
    pub manufacturer_data: BTreeMap<u16, Bytes>,
    /// Most recent raw payload.
    pub raw: Option<Bytes>,
}

impl Advertisement {
    /// Fold a report into this view.
    ///
    /// Fields present in the report overwrite, fields absent are kept.
    /// Service UUIDs accumulate; keyed data is overwritten per key.
    pub fn merge(&mut self, report: &AdvertisementReport) {
        if let Some(ref name) = report.local_name {
            self.local_name = Some(name.clone());
        }
        if report.tx_power_level.is_some() {
            self.tx_power_level = report.tx_power_level;
        }
        if report.flags.is_some() {
            self.flags = report.flags;
        }
        for uuid in &report.service_uuids {
            if !self.service_uuids.contains(uuid) {
                self.service_uuids.push(*uuid);
            }
        }
        for (uuid, data) in &report.service_data {
            self.service_data.insert(*uuid, data.clone());
        }
        for (company, data) in &report.manufacturer_data {
            self.manufacturer_data.insert(*company, data.clone());
        }
        if report.raw.is_some() {
            self.raw = report.raw.clone();
        }
    }

    /// Whether any advertised service appears in `filter`.
    ///
    /// An empty filter matches everything.
    pub fn matches_services(&self, filter: &[BleUuid]) -> bool {
        filter.is_empty() || self.service_uuids.iter().any(|uuid| filter.contains(uuid))
    }
}
