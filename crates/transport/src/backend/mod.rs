//! Platform USB boundary
//!
//! The transport layer never talks to the operating system directly. It
//! consumes a [`UsbBackend`] for enumeration, descriptor retrieval and
//! change notification, and a [`BulkHandle`] per opened device for the
//! actual bulk transfers.
//!
//! - [`libusb`]: the production backend built on `rusb`
//! - [`crate::test_utils::MockBackend`]: scripted in-memory backend for tests

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub mod libusb;

pub use libusb::LibusbBackend;

/// Platform-stable identifier for a physical device position
///
/// Two enumeration passes that see the same key are looking at the same
/// physical device, even if nothing has been opened yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct LocationKey(pub u64);

impl LocationKey {
    /// Build a key from a libusb-style bus number and device address
    pub fn from_bus_address(bus: u8, address: u8) -> Self {
        Self(((bus as u64) << 8) | address as u64)
    }
}

impl fmt::Display for LocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", (self.0 >> 8) & 0xff, self.0 & 0xff)
    }
}

/// One attached device as reported by the platform listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    pub location: LocationKey,
}

/// String properties of a device, empty when unavailable
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStrings {
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

/// Errors reported by the platform USB facility
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("operation timed out")]
    Timeout,

    #[error("endpoint stalled")]
    Pipe,

    #[error("device disconnected")]
    NoDevice,

    #[error("entity not found")]
    NotFound,

    #[error("resource busy")]
    Busy,

    #[error("buffer overflow")]
    Overflow,

    #[error("input/output error")]
    Io,

    #[error("invalid parameter")]
    InvalidParam,

    #[error("access denied")]
    Access,

    #[error("{message}")]
    Other { message: String },
}

impl From<rusb::Error> for PlatformError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Timeout => PlatformError::Timeout,
            rusb::Error::Pipe => PlatformError::Pipe,
            rusb::Error::NoDevice => PlatformError::NoDevice,
            rusb::Error::NotFound => PlatformError::NotFound,
            rusb::Error::Busy => PlatformError::Busy,
            rusb::Error::Overflow => PlatformError::Overflow,
            rusb::Error::Io => PlatformError::Io,
            rusb::Error::InvalidParam => PlatformError::InvalidParam,
            rusb::Error::Access => PlatformError::Access,
            _ => PlatformError::Other {
                message: err.to_string(),
            },
        }
    }
}

/// Enumeration, descriptor and notification surface of the platform
pub trait UsbBackend: Send + Sync {
    /// List every currently attached device
    fn list_devices(&self) -> Result<Vec<PlatformDevice>, PlatformError>;

    /// Fetch the raw active configuration descriptor (all of `wTotalLength`)
    fn config_descriptor(&self, device: &PlatformDevice) -> Result<Vec<u8>, PlatformError>;

    /// Fetch manufacturer, product and serial strings
    fn device_strings(&self, device: &PlatformDevice) -> Result<DeviceStrings, PlatformError>;

    /// Open the device at `location` and claim `interface`
    fn open(
        &self,
        location: LocationKey,
        interface: u8,
    ) -> Result<Box<dyn BulkHandle>, PlatformError>;

    /// Block up to `timeout` for a device-change notification
    ///
    /// Returns `true` when the attached set may have changed and a rescan is
    /// worthwhile.
    fn wait_for_change(&self, timeout: Duration) -> Result<bool, PlatformError>;
}

/// An opened device with a claimed interface
///
/// Dropping the handle releases the interface and closes the device.
pub trait BulkHandle: Send + Sync {
    /// Bulk IN transfer; returns the number of bytes placed in `buf`
    fn read_bulk(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, PlatformError>;

    /// Bulk OUT transfer; returns the number of bytes accepted
    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration)
    -> Result<usize, PlatformError>;
}
