//! End-to-end tests for the bulk USB transport against the mock backend
//!
//! Covers:
//! - Discovery, the device count and the occupied-slot mask
//! - Chunked writes and timed reads through session handles
//! - Unplugging an open device and closing afterwards
//! - The hot-plug monitor and device-change listeners

use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use transport::test_utils::{MockBackend, MockDevice};
use transport::{BulkUsb, DeviceEvent, Error, LocationKey, PlatformError, UsbSettings};

const VID: u16 = 0x8765;
const PID: u16 = 0x1234;

fn settings() -> UsbSettings {
    UsbSettings {
        allowed_devices: vec!["0x8765:0x1234".to_string()],
        poll_interval_ms: 20,
        ..Default::default()
    }
}

fn device(location: u64) -> MockDevice {
    MockDevice::bulk(VID, PID, LocationKey(location))
}

fn transport(devices: Vec<MockDevice>, settings: &UsbSettings) -> (Arc<MockBackend>, BulkUsb) {
    let backend = Arc::new(MockBackend::with_devices(devices));
    let bulk = BulkUsb::init(backend.clone(), settings).unwrap();
    (backend, bulk)
}

mod discovery {
    use super::*;

    #[test]
    fn test_single_allowed_device() {
        let (_backend, bulk) = transport(vec![device(1)], &settings());

        assert_eq!(bulk.available_device_count().unwrap(), (1, 0x1));

        let info = bulk.device_info(0).unwrap();
        assert_eq!(info.identity.vendor_id, VID);
        assert_eq!(info.endpoints.input.address, 0x81);
        assert_eq!(info.endpoints.output.address, 0x02);
        assert!(!info.is_open);
    }

    #[test]
    fn test_other_vendors_ignored() {
        let (_backend, bulk) = transport(
            vec![
                MockDevice::bulk(0x0403, 0x6001, LocationKey(1)),
                device(2),
                MockDevice::bulk(VID, 0x9999, LocationKey(3)),
                device(4),
            ],
            &settings(),
        );

        assert_eq!(bulk.available_device_count().unwrap(), (2, 0b11));
        let locations: Vec<_> = bulk.devices().iter().map(|info| info.location).collect();
        assert_eq!(locations, vec![LocationKey(2), LocationKey(4)]);
    }

    #[test]
    fn test_allow_list_added_at_runtime() {
        let (_backend, bulk) = transport(
            vec![MockDevice::bulk(0x0403, 0x6001, LocationKey(7))],
            &settings(),
        );
        assert_eq!(bulk.available_device_count().unwrap(), (0, 0));

        bulk.add_allowed_device(0x0403, 0x6001);
        assert_eq!(bulk.available_device_count().unwrap(), (1, 0x1));
    }

    #[test]
    fn test_freed_slot_reused() {
        let (backend, bulk) = transport(vec![device(1), device(2), device(3)], &settings());
        assert_eq!(bulk.available_device_count().unwrap(), (3, 0b111));

        backend.detach(LocationKey(2));
        assert_eq!(bulk.available_device_count().unwrap(), (2, 0b101));

        backend.attach(device(9));
        assert_eq!(bulk.available_device_count().unwrap(), (3, 0b111));
        assert_eq!(bulk.device_info(1).unwrap().location, LocationKey(9));
    }

    #[test]
    fn test_table_capacity_respected() {
        let settings = UsbSettings {
            max_devices: 2,
            ..settings()
        };
        let (_backend, bulk) = transport(vec![device(1), device(2), device(3)], &settings);

        assert_eq!(bulk.available_device_count().unwrap(), (2, 0b11));
    }

    #[test]
    fn test_listing_failure_reported() {
        let (backend, bulk) = transport(vec![device(1)], &settings());
        backend.fail_listing(Some(PlatformError::Io));

        assert!(matches!(
            bulk.available_device_count(),
            Err(Error::Enumeration(PlatformError::Io))
        ));
    }
}

mod transfers {
    use super::*;

    #[test]
    fn test_chunked_write() {
        let settings = UsbSettings {
            write_chunk_size: 64,
            ..settings()
        };
        let dev = device(1);
        let (_backend, bulk) = transport(vec![dev.clone()], &settings);
        bulk.rescan().unwrap();
        let handle = bulk.open(0).unwrap();

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(bulk.write(handle, &payload).unwrap(), 10_000);
        assert_eq!(dev.io().write_calls(), 157);
        assert_eq!(dev.io().written(), payload);
    }

    #[test]
    fn test_read_times_out_empty() {
        let (_backend, bulk) = transport(vec![device(1)], &settings());
        bulk.rescan().unwrap();
        let handle = bulk.open(0).unwrap();

        let mut buf = [0u8; 100];
        let read = bulk
            .read_timed(handle, &mut buf, Duration::from_millis(50))
            .unwrap();
        assert_eq!(read, 0);
    }

    #[test]
    fn test_surplus_served_to_next_read() {
        let dev = device(1);
        let (_backend, bulk) = transport(vec![dev.clone()], &settings());
        bulk.rescan().unwrap();
        let handle = bulk.open(0).unwrap();

        dev.io().push_inbound((0..=255).collect());
        let mut buf = [0u8; 100];
        bulk.read_timed(handle, &mut buf, Duration::from_millis(50))
            .unwrap();
        assert_eq!(bulk.queued_bytes(handle).unwrap(), 156);

        dev.io().disconnect();
        // Buffered bytes are still delivered before the device is touched
        let mut rest = [0u8; 156];
        assert_eq!(
            bulk.read_timed(handle, &mut rest, Duration::from_millis(50))
                .unwrap(),
            156
        );
        assert_eq!(rest[0], 100);
        assert_eq!(rest[155], 255);
    }

    #[test]
    fn test_mode_round_trip() {
        let (_backend, bulk) = transport(vec![device(1)], &settings());
        bulk.rescan().unwrap();
        let handle = bulk.open(0).unwrap();

        assert!(!bulk.transfer_mode(handle).unwrap().short_read);
        bulk.set_mode(handle, true, false).unwrap();
        let mode = bulk.transfer_mode(handle).unwrap();
        assert!(mode.short_read);
        assert!(!mode.short_write);
    }

    #[test]
    fn test_closed_handle_rejected() {
        let (_backend, bulk) = transport(vec![device(1)], &settings());
        bulk.rescan().unwrap();
        let handle = bulk.open(0).unwrap();

        bulk.close(handle);
        bulk.close(handle);
        assert!(matches!(bulk.write(handle, b"x"), Err(Error::InvalidHandle)));
        assert!(matches!(
            bulk.read(handle, &mut [0u8; 1]),
            Err(Error::InvalidHandle)
        ));
        assert!(matches!(
            bulk.set_mode(handle, true, true),
            Err(Error::InvalidHandle)
        ));
    }
}

mod unplug {
    use super::*;

    #[test]
    fn test_open_device_unplugged() {
        let dev = device(1);
        let (backend, bulk) = transport(vec![dev.clone()], &settings());
        bulk.rescan().unwrap();
        let handle = bulk.open(0).unwrap();

        backend.detach(LocationKey(1));
        let report = bulk.rescan().unwrap();
        assert!(report.removed.is_empty());

        let info = bulk.session_info(handle).unwrap();
        assert!(info.is_open);
        assert!(info.stale);

        let err = bulk.write(handle, &[0u8; 16]).unwrap_err();
        assert!(matches!(
            err,
            Error::Transfer {
                transferred: 0,
                source: PlatformError::NoDevice
            }
        ));

        bulk.close(handle);
        assert_eq!(dev.io().open_handles(), 0);

        let report = bulk.rescan().unwrap();
        assert_eq!(report.removed, vec![0]);
        assert_eq!(bulk.available_device_count().unwrap(), (0, 0));
    }

    #[test]
    fn test_stale_device_returns() {
        let dev = device(1);
        let (backend, bulk) = transport(vec![dev.clone()], &settings());
        bulk.rescan().unwrap();
        let handle = bulk.open(0).unwrap();

        bulk.remove_allowed_device(VID, PID);
        bulk.rescan().unwrap();
        assert!(bulk.device_info(0).unwrap().stale);

        bulk.add_allowed_device(VID, PID);
        let report = bulk.rescan().unwrap();
        assert!(report.is_empty());
        assert!(!bulk.session_info(handle).unwrap().stale);
        assert_eq!(backend.list_calls(), 3);
    }

    #[test]
    fn test_open_after_unplug_fails() {
        let (backend, bulk) = transport(vec![device(1)], &settings());
        bulk.rescan().unwrap();
        backend.detach(LocationKey(1));

        assert!(matches!(
            bulk.open(0),
            Err(Error::Platform(PlatformError::NoDevice))
        ));
    }
}

mod hotplug {
    use super::*;

    fn hotplug_settings() -> UsbSettings {
        UsbSettings {
            hotplug: true,
            ..settings()
        }
    }

    #[test]
    fn test_monitor_reports_arrival_and_removal() {
        let (tx, rx) = mpsc::channel();
        let backend = Arc::new(MockBackend::new());
        let bulk = BulkUsb::init_with_callback(backend.clone(), &hotplug_settings(), move |event| {
            let _ = tx.send(event);
        })
        .unwrap();
        assert!(bulk.is_monitoring());

        backend.attach(device(1));
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            DeviceEvent::Added(0)
        );

        backend.detach(LocationKey(1));
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            DeviceEvent::Removed(0)
        );

        bulk.exit();
        assert!(!bulk.is_monitoring());
    }

    #[test]
    fn test_listener_may_call_back_in() {
        let backend = Arc::new(MockBackend::new());
        let bulk = Arc::new(BulkUsb::init(backend.clone(), &hotplug_settings()).unwrap());
        let (tx, rx) = mpsc::channel();

        let weak: Weak<BulkUsb> = Arc::downgrade(&bulk);
        let _subscription = bulk.subscribe(move |event| {
            if let (DeviceEvent::Added(index), Some(bulk)) = (event, weak.upgrade()) {
                let _ = tx.send(bulk.device_info(index).map(|info| info.location));
            }
        });

        backend.attach(device(5));
        let location = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(location, LocationKey(5));
    }

    #[test]
    fn test_transfers_during_rescans() {
        let devices: Vec<_> = (1..=2).map(device).collect();
        let (backend, bulk) = transport(devices.clone(), &hotplug_settings());
        bulk.rescan().unwrap();
        let bulk = Arc::new(bulk);

        let workers: Vec<_> = (0..2)
            .map(|index| {
                let bulk = Arc::clone(&bulk);
                thread::spawn(move || {
                    let handle = bulk.open(index).unwrap();
                    let mut written = 0;
                    for round in 0..50u8 {
                        written += bulk.write(handle, &[round; 300]).unwrap();
                    }
                    written
                })
            })
            .collect();

        for location in 10..20 {
            backend.attach(device(location));
            thread::sleep(Duration::from_millis(5));
            backend.detach(LocationKey(location));
        }

        for worker in workers {
            assert_eq!(worker.join().unwrap(), 50 * 300);
        }
        for dev in &devices {
            assert_eq!(dev.io().written().len(), 50 * 300);
        }
    }

    #[tokio::test]
    async fn test_event_channel() {
        let backend = Arc::new(MockBackend::new());
        let bulk = BulkUsb::init(backend.clone(), &hotplug_settings()).unwrap();
        let (subscription, events) = bulk.event_channel();
        assert_eq!(bulk.listener_count(), 1);

        backend.attach(device(3));
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, DeviceEvent::Added(0));

        drop(subscription);
        assert_eq!(bulk.listener_count(), 0);
        assert!(events.recv().await.is_err());
    }

    #[test]
    fn test_exit_stops_monitor_and_is_idempotent() {
        let (backend, bulk) = transport(vec![device(1)], &hotplug_settings());
        bulk.exit();
        bulk.exit();

        backend.attach(device(2));
        assert!(matches!(bulk.rescan(), Err(Error::ShutDown)));
        assert!(matches!(bulk.open(0), Err(Error::ShutDown)));
    }
}
