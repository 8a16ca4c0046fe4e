//! Radio power state and scan bookkeeping.
//!
//! [`Radio`] is the state owned by the radio session manager: the adapter's
//! power state, whether a scan is active, and the filter of that scan. The
//! session applies native calls around these transitions; this type only
//! decides what each request means for the current state.

use std::fmt;

use crate::ble::uuids::BleUuid;
use crate::error::{Error, Result};

/// Power / availability state of the host adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RadioState {
    /// Not yet known.
    #[default]
    Unknown,
    /// The adapter is resetting.
    Resetting,
    /// The host has no usable BLE adapter.
    Unsupported,
    /// The process is not allowed to use Bluetooth.
    Unauthorized,
    /// The adapter is present but off.
    PoweredOff,
    /// The adapter is on and usable.
    PoweredOn,
}

impl RadioState {
    /// Check if the radio can scan and connect.
    pub fn is_powered_on(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }

    /// The event-level spelling of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Resetting => "resetting",
            Self::Unsupported => "unsupported",
            Self::Unauthorized => "unauthorized",
            Self::PoweredOff => "poweredOff",
            Self::PoweredOn => "poweredOn",
        }
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of an active scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanFilter {
    /// Only report peripherals advertising one of these services. Empty means all.
    pub services: Vec<BleUuid>,
    /// Report every advertisement instead of once per peripheral per scan.
    pub allow_duplicates: bool,
}

impl ScanFilter {
    /// Create a filter.
    pub fn new(services: Vec<BleUuid>, allow_duplicates: bool) -> Self {
        Self {
            services,
            allow_duplicates,
        }
    }
}

/// What a start-scan request amounts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanStart {
    /// No scan was active.
    Started,
    /// A scan was active with a different filter.
    FilterChanged,
    /// A scan was active with the same filter.
    Unchanged,
}

/// The single radio owned by a central session.
#[derive(Debug, Default)]
pub(crate) struct Radio {
    state: RadioState,
    scanning: bool,
    filter: ScanFilter,
    /// Set once the native event stream has ended for good.
    lost: bool,
}

impl Radio {
    pub fn state(&self) -> RadioState {
        self.state
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn filter(&self) -> &ScanFilter {
        &self.filter
    }

    /// Record a state reported by the adapter. Returns `true` if it changed.
    pub fn update_state(&mut self, state: RadioState) -> bool {
        if self.lost || self.state == state {
            return false;
        }
        self.state = state;
        true
    }

    /// The transport is gone; the radio stays unusable from now on.
    pub fn mark_lost(&mut self) -> bool {
        let changed = !self.lost;
        self.lost = true;
        self.state = RadioState::Unknown;
        self.scanning = false;
        changed
    }

    /// Fail with [`Error::RadioUnavailable`] unless the radio is usable.
    pub fn ensure_available(&self) -> Result<()> {
        if self.lost || !self.state.is_powered_on() {
            return Err(Error::RadioUnavailable);
        }
        Ok(())
    }

    /// Classify a start request without changing state.
    pub fn plan_start(&self, filter: &ScanFilter) -> Result<ScanStart> {
        self.ensure_available()?;
        Ok(if !self.scanning {
            ScanStart::Started
        } else if self.filter != *filter {
            ScanStart::FilterChanged
        } else {
            ScanStart::Unchanged
        })
    }

    /// Commit a successful start.
    pub fn scan_started(&mut self, filter: ScanFilter) {
        self.scanning = true;
        self.filter = filter;
    }

    /// Mark scanning as stopped. Returns `true` if a scan was active.
    pub fn scan_stopped(&mut self) -> bool {
        std::mem::replace(&mut self.scanning, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::BATTERY_SERVICE;

    fn powered() -> Radio {
        let mut radio = Radio::default();
        radio.update_state(RadioState::PoweredOn);
        radio
    }

    #[test]
    fn test_state_spelling() {
        assert_eq!(RadioState::PoweredOn.to_string(), "poweredOn");
        assert_eq!(RadioState::PoweredOff.to_string(), "poweredOff");
        assert_eq!(RadioState::default(), RadioState::Unknown);
    }

    #[test]
    fn test_start_requires_power() {
        let radio = Radio::default();
        assert_eq!(
            radio.plan_start(&ScanFilter::default()),
            Err(Error::RadioUnavailable)
        );
        assert!(!radio.is_scanning());
    }

    #[test]
    fn test_start_is_idempotent() {
        let mut radio = powered();
        let filter = ScanFilter::new(vec![BATTERY_SERVICE], false);

        assert_eq!(radio.plan_start(&filter), Ok(ScanStart::Started));
        radio.scan_started(filter.clone());
        assert_eq!(radio.plan_start(&filter), Ok(ScanStart::Unchanged));

        let wider = ScanFilter::new(vec![], true);
        assert_eq!(radio.plan_start(&wider), Ok(ScanStart::FilterChanged));
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let mut radio = powered();
        assert!(!radio.scan_stopped());
        radio.scan_started(ScanFilter::default());
        assert!(radio.scan_stopped());
        assert!(!radio.is_scanning());
    }

    #[test]
    fn test_update_state_reports_changes_only() {
        let mut radio = Radio::default();
        assert!(radio.update_state(RadioState::PoweredOff));
        assert!(!radio.update_state(RadioState::PoweredOff));
        assert!(radio.update_state(RadioState::PoweredOn));
    }

    #[test]
    fn test_lost_radio_stays_unavailable() {
        let mut radio = powered();
        radio.scan_started(ScanFilter::default());
        assert!(radio.mark_lost());
        assert!(!radio.is_scanning());
        assert_eq!(radio.state(), RadioState::Unknown);
        assert!(!radio.update_state(RadioState::PoweredOn));
        assert_eq!(radio.ensure_available(), Err(Error::RadioUnavailable));
    }
}
