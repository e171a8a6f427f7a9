//! Transport settings

use crate::allow_list::AllowList;
use crate::error::{Error, Result};
use crate::session::{DEFAULT_READ_CHUNK, DEFAULT_WRITE_CHUNK, TransferLimits};
use crate::table::MAX_DEVICES;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest single request accepted for either direction
const MAX_CHUNK: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Devices to pick up during scans, as `"0xVID:0xPID"`
    #[serde(default)]
    pub allowed_devices: Vec<String>,
    /// Start the hot-plug monitor at init
    #[serde(default)]
    pub hotplug: bool,
    /// Longest single wait for a change notification, and the rescan
    /// period on platforms without hot-plug support
    #[serde(default = "UsbSettings::default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Device table capacity
    #[serde(default = "UsbSettings::default_max_devices")]
    pub max_devices: usize,
    #[serde(default = "UsbSettings::default_read_chunk")]
    pub read_chunk_size: usize,
    #[serde(default = "UsbSettings::default_write_chunk")]
    pub write_chunk_size: usize,
    /// Timeout used by the untimed read/write calls
    #[serde(default = "UsbSettings::default_timeout")]
    pub default_timeout_ms: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            allowed_devices: Vec::new(),
            hotplug: false,
            poll_interval_ms: Self::default_poll_interval(),
            max_devices: Self::default_max_devices(),
            read_chunk_size: Self::default_read_chunk(),
            write_chunk_size: Self::default_write_chunk(),
            default_timeout_ms: Self::default_timeout(),
        }
    }
}

impl UsbSettings {
    fn default_poll_interval() -> u64 {
        250
    }

    fn default_max_devices() -> usize {
        MAX_DEVICES
    }

    fn default_read_chunk() -> usize {
        DEFAULT_READ_CHUNK
    }

    fn default_write_chunk() -> usize {
        DEFAULT_WRITE_CHUNK
    }

    fn default_timeout() -> u64 {
        5000 // 5 seconds
    }

    pub fn allow_list(&self) -> Result<AllowList> {
        AllowList::from_filters(&self.allowed_devices)
    }

    pub fn limits(&self) -> TransferLimits {
        TransferLimits {
            read_chunk: self.read_chunk_size,
            write_chunk: self.write_chunk_size,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Validate ranges and allow-list syntax
    pub fn validate(&self) -> Result<()> {
        self.allow_list()?;

        if self.max_devices == 0 || self.max_devices > MAX_DEVICES {
            return Err(Error::InvalidSetting(format!(
                "max_devices must be between 1 and {}, got {}",
                MAX_DEVICES, self.max_devices
            )));
        }

        for (name, size) in [
            ("read_chunk_size", self.read_chunk_size),
            ("write_chunk_size", self.write_chunk_size),
        ] {
            if size == 0 || size > MAX_CHUNK {
                return Err(Error::InvalidSetting(format!(
                    "{} must be between 1 and {}, got {}",
                    name, MAX_CHUNK, size
                )));
            }
        }

        if self.poll_interval_ms == 0 {
            return Err(Error::InvalidSetting(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.default_timeout_ms == 0 {
            return Err(Error::InvalidSetting(
                "default_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
