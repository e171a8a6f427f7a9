//! libusb backend
//!
//! Implements the platform boundary on top of `rusb`. Hot-plug callbacks are
//! funnelled through an async channel and drained by
//! [`UsbBackend::wait_for_change`], which drives `libusb_handle_events` with
//! a bounded timeout so the caller can keep checking its stop flag.

use super::{BulkHandle, DeviceStrings, LocationKey, PlatformDevice, PlatformError, UsbBackend};
use async_channel::{Receiver, Sender};
use byteorder::{ByteOrder, LittleEndian};
use rusb::{
    Context, Device, DeviceHandle, Direction, Hotplug, HotplugBuilder, Recipient, Registration,
    RequestType, UsbContext,
};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout for descriptor and string reads during enumeration
const DESCRIPTOR_TIMEOUT: Duration = Duration::from_secs(1);

/// bRequest value of GET_DESCRIPTOR
const REQUEST_GET_DESCRIPTOR: u8 = 0x06;

/// Descriptor type of a configuration descriptor
const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;

/// Length of the fixed configuration descriptor header
const CONFIG_HEADER_LEN: usize = 9;

/// `rusb` backed implementation of [`UsbBackend`]
pub struct LibusbBackend {
    /// Hot-plug registration; must drop before `context`
    registration: Mutex<Option<Registration<Context>>>,
    /// Change notifications produced by the hot-plug callback
    changes: Receiver<()>,
    context: Context,
}

impl LibusbBackend {
    /// Create a libusb context and register for hot-plug notifications
    ///
    /// Platforms without hot-plug support still work: change waits then
    /// degrade to periodic rescans.
    pub fn new() -> Result<Self, PlatformError> {
        let context = Context::new()?;
        let (tx, rx) = async_channel::bounded(64);

        let registration = if rusb::has_hotplug() {
            let registration = HotplugBuilder::new()
                .enumerate(false)
                .register(&context, Box::new(HotplugCallback { changes: tx }))?;
            debug!("Hot-plug callbacks registered");
            Some(registration)
        } else {
            warn!("libusb lacks hot-plug support on this platform, falling back to polling");
            None
        };

        Ok(Self {
            registration: Mutex::new(registration),
            changes: rx,
            context,
        })
    }

    fn has_registration(&self) -> bool {
        self.registration
            .lock()
            .map(|registration| registration.is_some())
            .unwrap_or(false)
    }

    /// Locate the live rusb device for a location key
    fn find_device(&self, location: LocationKey) -> Result<Device<Context>, PlatformError> {
        let devices = self.context.devices()?;
        devices
            .iter()
            .find(|device| {
                LocationKey::from_bus_address(device.bus_number(), device.address()) == location
            })
            .ok_or(PlatformError::NoDevice)
    }
}

impl UsbBackend for LibusbBackend {
    fn list_devices(&self) -> Result<Vec<PlatformDevice>, PlatformError> {
        let devices = self.context.devices()?;
        let mut listed = Vec::with_capacity(devices.len());

        for device in devices.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    debug!(
                        "Skipping device at bus={} addr={}: {}",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                    continue;
                }
            };

            listed.push(PlatformDevice {
                vendor_id: descriptor.vendor_id(),
                product_id: descriptor.product_id(),
                location: LocationKey::from_bus_address(device.bus_number(), device.address()),
            });
        }

        Ok(listed)
    }

    fn config_descriptor(&self, device: &PlatformDevice) -> Result<Vec<u8>, PlatformError> {
        let handle = self.find_device(device.location)?.open()?;
        let request_type =
            rusb::request_type(Direction::In, RequestType::Standard, Recipient::Device);
        let value = (DESCRIPTOR_TYPE_CONFIGURATION as u16) << 8;

        // Header first to learn wTotalLength, then the whole set
        let mut header = [0u8; CONFIG_HEADER_LEN];
        let read = handle.read_control(
            request_type,
            REQUEST_GET_DESCRIPTOR,
            value,
            0,
            &mut header,
            DESCRIPTOR_TIMEOUT,
        )?;
        if read < 4 {
            return Err(PlatformError::Io);
        }

        let total_length = LittleEndian::read_u16(&header[2..4]) as usize;
        let mut buffer = vec![0u8; total_length.max(read)];
        let read = handle.read_control(
            request_type,
            REQUEST_GET_DESCRIPTOR,
            value,
            0,
            &mut buffer,
            DESCRIPTOR_TIMEOUT,
        )?;
        buffer.truncate(read);

        Ok(buffer)
    }

    fn device_strings(&self, device: &PlatformDevice) -> Result<DeviceStrings, PlatformError> {
        let usb_device = self.find_device(device.location)?;
        let descriptor = usb_device.device_descriptor()?;
        let handle = usb_device.open()?;

        let read = |index: Option<u8>| {
            index.and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
        };

        Ok(DeviceStrings {
            manufacturer: read(descriptor.manufacturer_string_index()),
            product: read(descriptor.product_string_index()),
            serial_number: read(descriptor.serial_number_string_index()),
        })
    }

    fn open(
        &self,
        location: LocationKey,
        interface: u8,
    ) -> Result<Box<dyn BulkHandle>, PlatformError> {
        let mut handle = self.find_device(location)?.open()?;

        match handle.set_auto_detach_kernel_driver(true) {
            Ok(()) | Err(rusb::Error::NotSupported) => {}
            Err(e) => warn!("Failed to enable kernel driver auto-detach: {}", e),
        }

        handle.claim_interface(interface)?;
        debug!("Claimed interface {} on device {}", interface, location);

        Ok(Box::new(LibusbHandle {
            handle,
            interface,
            location,
        }))
    }

    fn wait_for_change(&self, timeout: Duration) -> Result<bool, PlatformError> {
        if !self.has_registration() {
            std::thread::sleep(timeout);
            return Ok(true);
        }

        match self.context.handle_events(Some(timeout)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => return Err(e.into()),
        }

        let mut changed = false;
        while self.changes.try_recv().is_ok() {
            changed = true;
        }
        Ok(changed)
    }
}

/// Opened libusb device with one claimed interface
struct LibusbHandle {
    handle: DeviceHandle<Context>,
    interface: u8,
    location: LocationKey,
}

impl BulkHandle for LibusbHandle {
    fn read_bulk(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, PlatformError> {
        Ok(self.handle.read_bulk(endpoint, buf, timeout)?)
    }

    fn write_bulk(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, PlatformError> {
        Ok(self.handle.write_bulk(endpoint, data, timeout)?)
    }
}

impl Drop for LibusbHandle {
    fn drop(&mut self) {
        match self.handle.release_interface(self.interface) {
            Ok(()) => debug!(
                "Released interface {} on device {}",
                self.interface, self.location
            ),
            // Already gone; nothing left to release
            Err(rusb::Error::NoDevice) => {}
            Err(e) => warn!(
                "Failed to release interface {} on device {}: {}",
                self.interface, self.location, e
            ),
        }
    }
}

/// Forwards hot-plug callbacks into the change channel
struct HotplugCallback {
    changes: Sender<()>,
}

impl<T: UsbContext> Hotplug<T> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        // A full channel already holds a pending rescan
        let _ = self.changes.try_send(());
    }

    fn device_left(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.changes.try_send(());
    }
}
