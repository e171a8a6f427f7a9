//! Test utilities for the bulk USB transport
//!
//! Provides an in-memory [`UsbBackend`] and a configuration descriptor
//! builder, so enumeration and transfer logic can be exercised without
//! hardware.
//!
//! # Example
//!
//! ```
//! use transport::backend::LocationKey;
//! use transport::test_utils::{MockBackend, MockDevice};
//!
//! let device = MockDevice::bulk(0x8765, 0x1234, LocationKey(1));
//! let backend = MockBackend::with_devices(vec![device.clone()]);
//! backend.detach(device.location);
//! ```

use crate::backend::{
    BulkHandle, DeviceStrings, LocationKey, PlatformDevice, PlatformError, UsbBackend,
};
use crate::descriptor::{
    CLASS_VENDOR_SPECIFIC, DESCRIPTOR_TYPE_CONFIGURATION, DESCRIPTOR_TYPE_ENDPOINT,
    DESCRIPTOR_TYPE_INTERFACE,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

struct InterfaceLayout {
    number: u8,
    alternate: u8,
    class: u8,
    /// (bEndpointAddress, bmAttributes, wMaxPacketSize)
    endpoints: Vec<(u8, u8, u16)>,
}

/// Builds a configuration descriptor set byte by byte
///
/// Interfaces are numbered in the order they are added; endpoints attach to
/// the most recently added interface.
#[derive(Default)]
pub struct ConfigDescriptorBuilder {
    interfaces: Vec<InterfaceLayout>,
}

impl ConfigDescriptorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add interface (alternate setting 0) with the given class
    pub fn interface(mut self, class: u8) -> Self {
        let number = self
            .interfaces
            .iter()
            .filter(|iface| iface.alternate == 0)
            .count() as u8;
        self.interfaces.push(InterfaceLayout {
            number,
            alternate: 0,
            class,
            endpoints: Vec::new(),
        });
        self
    }

    /// Add another alternate setting of the last interface
    pub fn alternate(mut self, class: u8) -> Self {
        let (number, alternate) = self
            .interfaces
            .last()
            .map(|iface| (iface.number, iface.alternate + 1))
            .unwrap_or((0, 0));
        self.interfaces.push(InterfaceLayout {
            number,
            alternate,
            class,
            endpoints: Vec::new(),
        });
        self
    }

    pub fn bulk_endpoint(self, address: u8, max_packet_size: u16) -> Self {
        self.endpoint(address, 0x02, max_packet_size)
    }

    pub fn interrupt_endpoint(self, address: u8, max_packet_size: u16) -> Self {
        self.endpoint(address, 0x03, max_packet_size)
    }

    fn endpoint(mut self, address: u8, attributes: u8, max_packet_size: u16) -> Self {
        if self.interfaces.is_empty() {
            self = self.interface(CLASS_VENDOR_SPECIFIC);
        }
        if let Some(iface) = self.interfaces.last_mut() {
            iface.endpoints.push((address, attributes, max_packet_size));
        }
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let num_interfaces = self
            .interfaces
            .iter()
            .filter(|iface| iface.alternate == 0)
            .count() as u8;

        let mut buf = vec![
            9,
            DESCRIPTOR_TYPE_CONFIGURATION,
            0,
            0,
            num_interfaces,
            1,    // bConfigurationValue
            0,    // iConfiguration
            0x80, // bus powered
            50,   // 100 mA
        ];

        for iface in &self.interfaces {
            buf.extend_from_slice(&[
                9,
                DESCRIPTOR_TYPE_INTERFACE,
                iface.number,
                iface.alternate,
                iface.endpoints.len() as u8,
                iface.class,
                0,
                0,
                0,
            ]);
            for &(address, attributes, max_packet_size) in &iface.endpoints {
                let [lo, hi] = max_packet_size.to_le_bytes();
                let interval = if attributes == 0x03 { 1 } else { 0 };
                buf.extend_from_slice(&[
                    7,
                    DESCRIPTOR_TYPE_ENDPOINT,
                    address,
                    attributes,
                    lo,
                    hi,
                    interval,
                ]);
            }
        }

        let [lo, hi] = (buf.len() as u16).to_le_bytes();
        buf[2] = lo;
        buf[3] = hi;
        buf
    }
}

/// Scripted I/O behind a mock device's bulk endpoints
#[derive(Default)]
pub struct MockIo {
    inbound: Mutex<VecDeque<Vec<u8>>>,
    inbound_ready: Condvar,
    written: Mutex<Vec<u8>>,
    read_calls: AtomicUsize,
    write_calls: AtomicUsize,
    last_read_len: AtomicUsize,
    /// Largest write accepted per call, 0 for unlimited
    max_write: AtomicUsize,
    fail_write: Mutex<Option<(usize, PlatformError)>>,
    disconnected: AtomicBool,
    open_handles: AtomicUsize,
}

impl MockIo {
    /// Queue one packet for the IN endpoint
    ///
    /// A read with a smaller buffer receives the head of the packet; the
    /// rest is delivered by the next read.
    pub fn push_inbound(&self, packet: Vec<u8>) {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(packet);
        self.inbound_ready.notify_all();
    }

    /// Everything written to the OUT endpoint so far
    pub fn written(&self) -> Vec<u8> {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Buffer length of the most recent read request
    pub fn last_read_len(&self) -> usize {
        self.last_read_len.load(Ordering::SeqCst)
    }

    /// Accept at most `max` bytes per write call
    pub fn set_max_write(&self, max: usize) {
        self.max_write.store(max, Ordering::SeqCst);
    }

    /// Fail the write call with zero-based number `call` once
    pub fn fail_write_on_call(&self, call: usize, error: PlatformError) {
        *self
            .fail_write
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((call, error));
    }

    /// Make every subsequent transfer fail with `NoDevice`
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        self.inbound_ready.notify_all();
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Handles opened and not yet dropped
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, PlatformError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        self.last_read_len.store(buf.len(), Ordering::SeqCst);

        let deadline = Instant::now() + timeout;
        let mut inbound = self.inbound.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            if self.is_disconnected() {
                return Err(PlatformError::NoDevice);
            }

            if let Some(mut packet) = inbound.pop_front() {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                if n < packet.len() {
                    inbound.push_front(packet.split_off(n));
                }
                return Ok(n);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PlatformError::Timeout);
            }
            inbound = self
                .inbound_ready
                .wait_timeout(inbound, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn write(&self, data: &[u8]) -> Result<usize, PlatformError> {
        let call = self.write_calls.fetch_add(1, Ordering::SeqCst);

        if self.is_disconnected() {
            return Err(PlatformError::NoDevice);
        }

        {
            let mut fail = self.fail_write.lock().unwrap_or_else(PoisonError::into_inner);
            if fail.as_ref().is_some_and(|(at, _)| *at == call) {
                if let Some((_, error)) = fail.take() {
                    return Err(error);
                }
            }
        }

        let accepted = match self.max_write.load(Ordering::SeqCst) {
            0 => data.len(),
            max => data.len().min(max),
        };
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(&data[..accepted]);
        Ok(accepted)
    }
}

struct MockHandle {
    io: Arc<MockIo>,
}

impl BulkHandle for MockHandle {
    fn read_bulk(
        &self,
        _endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, PlatformError> {
        self.io.read(buf, timeout)
    }

    fn write_bulk(
        &self,
        _endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, PlatformError> {
        self.io.write(data)
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.io.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A device known to [`MockBackend`]
///
/// Clones share the same [`MockIo`].
#[derive(Clone)]
pub struct MockDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    pub location: LocationKey,
    pub descriptor: Vec<u8>,
    pub strings: DeviceStrings,
    pub descriptor_error: Option<PlatformError>,
    io: Arc<MockIo>,
}

impl MockDevice {
    /// Vendor-specific interface 0 with bulk endpoints 0x81 and 0x02
    pub fn bulk(vendor_id: u16, product_id: u16, location: LocationKey) -> Self {
        let descriptor = ConfigDescriptorBuilder::new()
            .interface(CLASS_VENDOR_SPECIFIC)
            .bulk_endpoint(0x81, 512)
            .bulk_endpoint(0x02, 512)
            .build();

        Self {
            vendor_id,
            product_id,
            location,
            descriptor,
            strings: DeviceStrings::default(),
            descriptor_error: None,
            io: Arc::new(MockIo::default()),
        }
    }

    pub fn with_descriptor(mut self, descriptor: Vec<u8>) -> Self {
        self.descriptor = descriptor;
        self
    }

    pub fn with_strings(
        mut self,
        manufacturer: Option<&str>,
        product: Option<&str>,
        serial_number: Option<&str>,
    ) -> Self {
        self.strings = DeviceStrings {
            manufacturer: manufacturer.map(str::to_string),
            product: product.map(str::to_string),
            serial_number: serial_number.map(str::to_string),
        };
        self
    }

    /// Make descriptor retrieval fail
    pub fn with_descriptor_error(mut self, error: PlatformError) -> Self {
        self.descriptor_error = Some(error);
        self
    }

    pub fn io(&self) -> Arc<MockIo> {
        Arc::clone(&self.io)
    }

    fn platform_device(&self) -> PlatformDevice {
        PlatformDevice {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            location: self.location,
        }
    }
}

#[derive(Default)]
struct MockState {
    devices: Vec<MockDevice>,
    listing_error: Option<PlatformError>,
    changed: bool,
    list_calls: usize,
}

/// In-memory [`UsbBackend`]
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
    change: Condvar,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: Vec<MockDevice>) -> Self {
        let backend = Self::new();
        backend.lock().devices = devices;
        backend
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find(&self, location: LocationKey) -> Option<MockDevice> {
        self.lock()
            .devices
            .iter()
            .find(|device| device.location == location)
            .cloned()
    }

    /// Plug in a device and raise a change notification
    pub fn attach(&self, device: MockDevice) {
        let mut state = self.lock();
        state.devices.push(device);
        state.changed = true;
        self.change.notify_all();
    }

    /// Unplug the device at `location`; its open handles start failing
    pub fn detach(&self, location: LocationKey) {
        let mut state = self.lock();
        state.devices.retain(|device| {
            if device.location == location {
                device.io.disconnect();
                false
            } else {
                true
            }
        });
        state.changed = true;
        self.change.notify_all();
    }

    /// Make `list_devices` fail with `error`, or succeed again with `None`
    pub fn fail_listing(&self, error: Option<PlatformError>) {
        self.lock().listing_error = error;
    }

    /// Raise a change notification without changing the device set
    pub fn signal_change(&self) {
        self.lock().changed = true;
        self.change.notify_all();
    }

    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }
}

impl UsbBackend for MockBackend {
    fn list_devices(&self) -> Result<Vec<PlatformDevice>, PlatformError> {
        let mut state = self.lock();
        state.list_calls += 1;

        if let Some(error) = &state.listing_error {
            return Err(error.clone());
        }
        Ok(state.devices.iter().map(MockDevice::platform_device).collect())
    }

    fn config_descriptor(&self, device: &PlatformDevice) -> Result<Vec<u8>, PlatformError> {
        let device = self.find(device.location).ok_or(PlatformError::NoDevice)?;
        match device.descriptor_error {
            Some(error) => Err(error),
            None => Ok(device.descriptor),
        }
    }

    fn device_strings(&self, device: &PlatformDevice) -> Result<DeviceStrings, PlatformError> {
        self.find(device.location)
            .map(|device| device.strings)
            .ok_or(PlatformError::NoDevice)
    }

    fn open(
        &self,
        location: LocationKey,
        _interface: u8,
    ) -> Result<Box<dyn BulkHandle>, PlatformError> {
        let device = self.find(location).ok_or(PlatformError::NoDevice)?;
        if device.io.is_disconnected() {
            return Err(PlatformError::NoDevice);
        }

        device.io.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockHandle { io: device.io }))
    }

    fn wait_for_change(&self, timeout: Duration) -> Result<bool, PlatformError> {
        let state = self.lock();
        let (mut state, _) = self
            .change
            .wait_timeout_while(state, timeout, |state| !state.changed)
            .unwrap_or_else(PoisonError::into_inner);

        Ok(std::mem::take(&mut state.changed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_total_length() {
        let buf = ConfigDescriptorBuilder::new()
            .interface(CLASS_VENDOR_SPECIFIC)
            .bulk_endpoint(0x81, 64)
            .bulk_endpoint(0x01, 64)
            .alternate(CLASS_VENDOR_SPECIFIC)
            .interface(0x03)
            .build();

        assert_eq!(buf.len(), 9 + 9 + 7 + 7 + 9 + 9);
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]) as usize, buf.len());
        // bNumInterfaces ignores alternate settings
        assert_eq!(buf[4], 2);
    }

    #[test]
    fn test_inbound_packet_split() {
        let io = MockIo::default();
        io.push_inbound(vec![1, 2, 3, 4, 5]);

        let mut buf = [0u8; 3];
        assert_eq!(io.read(&mut buf, Duration::from_millis(10)), Ok(3));
        assert_eq!(io.read(&mut buf, Duration::from_millis(10)), Ok(2));
        assert_eq!(&buf[..2], &[4, 5]);
        assert_eq!(
            io.read(&mut buf, Duration::from_millis(10)),
            Err(PlatformError::Timeout)
        );
    }

    #[test]
    fn test_wait_for_change_consumes_signal() {
        let backend = MockBackend::new();
        assert_eq!(backend.wait_for_change(Duration::from_millis(10)), Ok(false));

        backend.signal_change();
        assert_eq!(backend.wait_for_change(Duration::from_millis(10)), Ok(true));
        assert_eq!(backend.wait_for_change(Duration::from_millis(10)), Ok(false));
    }
}
