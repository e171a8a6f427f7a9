//! Vendor/product allow list consulted on every scan

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// A (vendor id, product id) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbId {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl UsbId {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}:{:#06x}", self.vendor_id, self.product_id)
    }
}

impl FromStr for UsbId {
    type Err = Error;

    /// Parse `"0xVID:0xPID"`; the `0x` prefix is optional
    fn from_str(s: &str) -> Result<Self> {
        let (vid, pid) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidSetting(format!("expected VID:PID, got '{}'", s)))?;

        Ok(Self::new(parse_hex_id(vid)?, parse_hex_id(pid)?))
    }
}

fn parse_hex_id(id: &str) -> Result<u16> {
    let trimmed = id.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if hex.is_empty() || hex.len() > 4 {
        return Err(Error::InvalidSetting(format!(
            "'{}' must be 1-4 hex digits",
            id
        )));
    }

    u16::from_str_radix(hex, 16)
        .map_err(|_| Error::InvalidSetting(format!("'{}' is not a valid hex number", id)))
}

/// Small ordered set of allowed devices
///
/// Insertion order is preserved; duplicates are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    entries: Vec<UsbId>,
}

impl AllowList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `"0xVID:0xPID"` filter strings
    pub fn from_filters<S: AsRef<str>>(filters: &[S]) -> Result<Self> {
        let mut list = Self::new();
        for filter in filters {
            list.add(filter.as_ref().parse()?);
        }
        Ok(list)
    }

    /// Add an entry; returns `false` if it was already present
    pub fn add(&mut self, id: UsbId) -> bool {
        if self.contains(id.vendor_id, id.product_id) {
            return false;
        }
        self.entries.push(id);
        true
    }

    /// Remove an entry; returns `false` if it was not present
    pub fn remove(&mut self, id: UsbId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| *entry != id);
        self.entries.len() != before
    }

    pub fn contains(&self, vendor_id: u16, product_id: u16) -> bool {
        self.entries.contains(&UsbId::new(vendor_id, product_id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &UsbId> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
