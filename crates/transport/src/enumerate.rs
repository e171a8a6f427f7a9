//! Enumeration engine
//!
//! Reconciles the device table with what the platform currently reports.
//! Runs with the table lock held by the caller.

use crate::allow_list::AllowList;
use crate::backend::{LocationKey, PlatformDevice, UsbBackend};
use crate::descriptor::{BulkEndpoints, DescriptorError, parse_bulk_endpoints};
use crate::error::{Error, Result};
use crate::table::{DeviceIdentity, DeviceRecord, DeviceTable};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Table indices that changed during one scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub added: Vec<usize>,
    pub removed: Vec<usize>,
}

impl ScanReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Refresh `table` against the platform listing
///
/// Per-device failures exclude that device and the scan carries on; only a
/// failing platform listing aborts the pass.
pub(crate) fn scan(
    backend: &dyn UsbBackend,
    allow_list: &AllowList,
    table: &mut DeviceTable,
) -> Result<ScanReport> {
    let devices = backend.list_devices().map_err(|e| {
        warn!("Device enumeration failed: {}", e);
        Error::Enumeration(e)
    })?;

    let mut observed: HashSet<LocationKey> = HashSet::new();
    let mut report = ScanReport::default();

    for device in devices
        .iter()
        .filter(|device| allow_list.contains(device.vendor_id, device.product_id))
    {
        let existing = table.position_by_location(device.location);

        let (identity, endpoints) = match probe(backend, device) {
            Ok(probed) => probed,
            Err(e) => {
                if existing.is_some() {
                    // Still attached; keep the cached fields
                    debug!("Could not refresh device at {}: {}", device.location, e);
                    observed.insert(device.location);
                } else {
                    debug!(
                        "Skipping device {:04x}:{:04x} at {}: {}",
                        device.vendor_id, device.product_id, device.location, e
                    );
                }
                continue;
            }
        };

        observed.insert(device.location);

        match existing.and_then(|index| table.get_mut(index).map(|record| (index, record))) {
            Some((index, record)) => {
                if record.stale {
                    info!("Device {} at {} reappeared", index, device.location);
                }
                record.refresh(identity, endpoints);
            }
            None => {
                let record = DeviceRecord::new(identity, device.location, endpoints);
                match table.insert(record) {
                    Ok(index) => {
                        info!(
                            "Added device {}: {:04x}:{:04x} at {}",
                            index, device.vendor_id, device.product_id, device.location
                        );
                        report.added.push(index);
                    }
                    Err(e) => warn!("Ignoring device at {}: {}", device.location, e),
                }
            }
        }
    }

    let missing: Vec<usize> = table
        .iter()
        .filter(|(_, record)| !observed.contains(&record.location))
        .map(|(index, _)| index)
        .collect();

    for index in missing {
        let Some(record) = table.get_mut(index) else {
            continue;
        };

        if record.is_open() {
            // Open sessions are never closed from under the caller
            if !record.stale {
                warn!(
                    "Device {} at {} disappeared while open, keeping session",
                    index, record.location
                );
                record.stale = true;
            }
            continue;
        }

        if let Some(record) = table.remove(index) {
            info!("Removed device {} at {}", index, record.location);
            report.removed.push(index);
        }
    }

    debug!(
        "Scan complete: {} devices, {} added, {} removed",
        table.len(),
        report.added.len(),
        report.removed.len()
    );
    Ok(report)
}

/// Read identity and bulk endpoints for one candidate
fn probe(
    backend: &dyn UsbBackend,
    device: &PlatformDevice,
) -> Result<(DeviceIdentity, BulkEndpoints)> {
    let descriptor = backend.config_descriptor(device)?;
    let endpoints = find_bulk_interface(&descriptor)?;

    let strings = backend.device_strings(device).unwrap_or_else(|e| {
        debug!("No string descriptors for {}: {}", device.location, e);
        Default::default()
    });

    Ok((
        DeviceIdentity::new(device.vendor_id, device.product_id, strings),
        endpoints,
    ))
}

/// Try interface 0, 1, 2, ... until one yields a bulk endpoint pair
pub fn find_bulk_interface(
    descriptor: &[u8],
) -> std::result::Result<BulkEndpoints, DescriptorError> {
    let mut last_error = None;

    for index in 0..=u8::MAX {
        match parse_bulk_endpoints(descriptor, index) {
            Ok(endpoints) => return Ok(endpoints),
            Err(e @ DescriptorError::MalformedDescriptor { .. }) => return Err(e),
            Err(e @ DescriptorError::NoSuchInterface { .. }) => {
                return Err(last_error.unwrap_or(e));
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.unwrap_or(DescriptorError::NoSuchInterface { index: u8::MAX }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PlatformError;
    use crate::descriptor::CLASS_VENDOR_SPECIFIC;
    use crate::test_utils::{ConfigDescriptorBuilder, MockBackend, MockDevice};

    fn allow_default() -> AllowList {
        AllowList::from_filters(&["0x8765:0x1234"]).unwrap()
    }

    #[test]
    fn test_scan_adds_allowed_device() {
        let backend = MockBackend::with_devices(vec![
            MockDevice::bulk(0x8765, 0x1234, LocationKey(1)).with_strings(
                Some("Acme"),
                Some("Widget"),
                Some("SN0001"),
            ),
            MockDevice::bulk(0x1111, 0x2222, LocationKey(2)),
        ]);
        let mut table = DeviceTable::new(8);

        let report = scan(&backend, &allow_default(), &mut table).unwrap();
        assert_eq!(report.added, vec![0]);
        assert!(report.removed.is_empty());
        assert_eq!(table.len(), 1);

        let info = table.get(0).unwrap().info(0);
        assert_eq!(info.identity.product.as_deref(), Some("Widget"));
        assert_eq!(info.identity.serial_number.as_deref(), Some("SN0001"));
    }

    #[test]
    fn test_rescan_is_stable() {
        let backend = MockBackend::with_devices(vec![
            MockDevice::bulk(0x8765, 0x1234, LocationKey(1)),
            MockDevice::bulk(0x8765, 0x1234, LocationKey(2)),
        ]);
        let mut table = DeviceTable::new(8);
        scan(&backend, &allow_default(), &mut table).unwrap();
        let before: Vec<_> = table.iter().map(|(i, r)| r.info(i)).collect();

        let report = scan(&backend, &allow_default(), &mut table).unwrap();
        assert!(report.is_empty());
        let after: Vec<_> = table.iter().map(|(i, r)| r.info(i)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_scan_skips_non_bulk_device() {
        let hid = ConfigDescriptorBuilder::new()
            .interface(0x03)
            .interrupt_endpoint(0x81, 8)
            .build();
        let backend = MockBackend::with_devices(vec![
            MockDevice::bulk(0x8765, 0x1234, LocationKey(1)).with_descriptor(hid),
            MockDevice::bulk(0x8765, 0x1234, LocationKey(2))
                .with_descriptor_error(PlatformError::Access),
            MockDevice::bulk(0x8765, 0x1234, LocationKey(3)),
        ]);
        let mut table = DeviceTable::new(8);

        let report = scan(&backend, &allow_default(), &mut table).unwrap();
        assert_eq!(report.added, vec![0]);
        assert_eq!(table.get(0).unwrap().location, LocationKey(3));
    }

    #[test]
    fn test_scan_removes_missing_device() {
        let backend = MockBackend::with_devices(vec![
            MockDevice::bulk(0x8765, 0x1234, LocationKey(1)),
            MockDevice::bulk(0x8765, 0x1234, LocationKey(2)),
        ]);
        let mut table = DeviceTable::new(8);
        scan(&backend, &allow_default(), &mut table).unwrap();

        backend.detach(LocationKey(1));
        let report = scan(&backend, &allow_default(), &mut table).unwrap();
        assert_eq!(report.removed, vec![0]);
        assert!(report.added.is_empty());
        assert_eq!(table.position_by_location(LocationKey(2)), Some(1));
    }

    #[test]
    fn test_listing_failure_aborts_scan() {
        let backend = MockBackend::with_devices(vec![MockDevice::bulk(
            0x8765,
            0x1234,
            LocationKey(1),
        )]);
        let mut table = DeviceTable::new(8);
        scan(&backend, &allow_default(), &mut table).unwrap();

        backend.fail_listing(Some(PlatformError::Io));
        assert!(matches!(
            scan(&backend, &allow_default(), &mut table),
            Err(Error::Enumeration(PlatformError::Io))
        ));
        // Table untouched by the failed pass
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_disallowed_device_removed_after_allow_list_change() {
        let backend = MockBackend::with_devices(vec![MockDevice::bulk(
            0x8765,
            0x1234,
            LocationKey(1),
        )]);
        let mut table = DeviceTable::new(8);
        scan(&backend, &allow_default(), &mut table).unwrap();

        let report = scan(&backend, &AllowList::new(), &mut table).unwrap();
        assert_eq!(report.removed, vec![0]);
    }

    #[test]
    fn test_find_bulk_interface_walks_indices() {
        let descriptor = ConfigDescriptorBuilder::new()
            .interface(0x01)
            .interface(0x01)
            .interface(CLASS_VENDOR_SPECIFIC)
            .bulk_endpoint(0x84, 64)
            .bulk_endpoint(0x05, 64)
            .build();
        let endpoints = find_bulk_interface(&descriptor).unwrap();
        assert_eq!(endpoints.interface_number, 2);

        let audio_only = ConfigDescriptorBuilder::new().interface(0x01).build();
        assert!(matches!(
            find_bulk_interface(&audio_only),
            Err(DescriptorError::InterfaceNotBulk { .. })
        ));
    }
}
