//! Advertisement scanning policy.
//!
//! Decides, for each advertisement folded into the registry, whether a
//! `discover` event is due. The record itself is always updated; only the
//! emission is subject to the scan filter and duplicate policy.

use std::collections::HashSet;

use tracing::trace;

use crate::ble::address::PeripheralId;
use crate::ble::advertising::Advertisement;
use crate::ble::radio::ScanFilter;

/// Per-scan discovery bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct AdvertisementScanner {
    /// Peripherals already reported during the current scan.
    reported: HashSet<PeripheralId>,
}

impl AdvertisementScanner {
    /// Start a new scan session; every peripheral may be reported again.
    pub fn reset(&mut self) {
        self.reported.clear();
    }

    /// Decide whether `id`, with its merged advertisement, should be reported.
    ///
    /// Peripherals whose cumulative service set misses the filter are
    /// suppressed without being marked as reported, so a later scan response
    /// that adds the service still produces the first `discover`.
    pub fn should_report(
        &mut self,
        id: &PeripheralId,
        advertisement: &Advertisement,
        filter: &ScanFilter,
    ) -> bool {
        if !advertisement.matches_services(&filter.services) {
            trace!("Suppressing {}: no advertised service matches the filter", id);
            return false;
        }

        let first = self.reported.insert(id.clone());
        if !first && !filter.allow_duplicates {
            trace!("Suppressing duplicate advertisement from {}", id);
            return false;
        }

        true
    }

    /// Number of peripherals reported in this scan session.
    #[cfg(test)]
    pub fn reported_count(&self) -> usize {
        self.reported.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{BleUuid, BATTERY_SERVICE};

    fn battery_advertisement() -> Advertisement {
        Advertisement {
            service_uuids: vec![BATTERY_SERVICE],
            ..Default::default()
        }
    }

    #[test]
    fn test_filter_suppresses_non_matching() {
        let mut scanner = AdvertisementScanner::default();
        let filter = ScanFilter::new(vec![BATTERY_SERVICE], false);

        let other = Advertisement {
            service_uuids: vec![BleUuid::from_u16(0x1234)],
            ..Default::default()
        };
        assert!(!scanner.should_report(&PeripheralId::new("ccddeeff0011"), &other, &filter));
        assert!(scanner.should_report(
            &PeripheralId::new("aabbccddeeff"),
            &battery_advertisement(),
            &filter
        ));
        assert_eq!(scanner.reported_count(), 1);
    }

    #[test]
    fn test_duplicates_suppressed_until_reset() {
        let mut scanner = AdvertisementScanner::default();
        let filter = ScanFilter::default();
        let id = PeripheralId::new("aabbccddeeff");
        let adv = Advertisement::default();

        assert!(scanner.should_report(&id, &adv, &filter));
        assert!(!scanner.should_report(&id, &adv, &filter));

        scanner.reset();
        assert!(scanner.should_report(&id, &adv, &filter));
    }

    #[test]
    fn test_allow_duplicates_reports_every_time() {
        let mut scanner = AdvertisementScanner::default();
        let filter = ScanFilter::new(vec![], true);
        let id = PeripheralId::new("aabbccddeeff");
        let adv = Advertisement::default();

        for _ in 0..3 {
            assert!(scanner.should_report(&id, &adv, &filter));
        }
    }

    #[test]
    fn test_late_matching_service_still_reported_once() {
        let mut scanner = AdvertisementScanner::default();
        let filter = ScanFilter::new(vec![BATTERY_SERVICE], false);
        let id = PeripheralId::new("aabbccddeeff");

        assert!(!scanner.should_report(&id, &Advertisement::default(), &filter));
        assert!(scanner.should_report(&id, &battery_advertisement(), &filter));
        assert!(!scanner.should_report(&id, &battery_advertisement(), &filter));
    }
}
