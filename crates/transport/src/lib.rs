//! Host-side bulk USB transport
//!
//! Discovers allow-listed devices exposing a vendor-specific interface with
//! one bulk IN and one bulk OUT endpoint, keeps them in a small indexed
//! table, and offers timed, chunked bulk reads and writes on opened devices.
//!
//! ```no_run
//! use std::sync::Arc;
//! use transport::{BulkUsb, LibusbBackend, UsbSettings};
//!
//! # fn main() -> transport::Result<()> {
//! let settings = UsbSettings {
//!     allowed_devices: vec!["0x8765:0x1234".to_string()],
//!     ..Default::default()
//! };
//! let usb = BulkUsb::init(Arc::new(LibusbBackend::new()?), &settings)?;
//!
//! let (count, _mask) = usb.available_device_count()?;
//! if count > 0 {
//!     let handle = usb.open(0)?;
//!     usb.write(handle, b"ping")?;
//!     let mut reply = [0u8; 64];
//!     let n = usb.read(handle, &mut reply)?;
//!     println!("{:?}", &reply[..n]);
//!     usb.close(handle);
//! }
//! # Ok(())
//! # }
//! ```

pub mod allow_list;
pub mod backend;
pub mod descriptor;
pub mod enumerate;
pub mod error;
pub mod manager;
pub mod monitor;
pub mod session;
pub mod settings;
pub mod table;
pub mod test_utils;

pub use allow_list::{AllowList, UsbId};
pub use backend::{LibusbBackend, LocationKey, PlatformError, UsbBackend};
pub use descriptor::{BulkEndpoints, DescriptorError, Direction, Endpoint, parse_bulk_endpoints};
pub use enumerate::{ScanReport, find_bulk_interface};
pub use error::{Error, Result};
pub use manager::BulkUsb;
pub use monitor::{DeviceEvent, Subscription};
pub use session::{SessionHandle, TransferMode};
pub use settings::UsbSettings;
pub use table::{DeviceIdentity, DeviceInfo, MAX_DEVICES};
