//! Device table
//!
//! Fixed-capacity arena of device slots addressed by small integer indices.
//! Always accessed through the manager's table mutex.

use crate::backend::{DeviceStrings, LocationKey};
use crate::descriptor::BulkEndpoints;
use crate::error::{Error, Result};
use crate::session::{Session, SessionHandle};
use serde::Serialize;
use std::sync::Arc;

/// Upper bound on table slots; slot occupancy is reported as a `u32` mask
pub const MAX_DEVICES: usize = 32;

/// Identity of a device as seen during enumeration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

impl DeviceIdentity {
    pub fn new(vendor_id: u16, product_id: u16, strings: DeviceStrings) -> Self {
        Self {
            vendor_id,
            product_id,
            manufacturer: strings.manufacturer,
            product: strings.product,
            serial_number: strings.serial_number,
        }
    }
}

/// Snapshot of one table entry handed to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub index: usize,
    #[serde(flatten)]
    pub identity: DeviceIdentity,
    pub location: LocationKey,
    pub endpoints: BulkEndpoints,
    pub is_open: bool,
    /// Open, but missing from the most recent scan
    pub stale: bool,
}

/// One known device
pub(crate) struct DeviceRecord {
    pub(crate) identity: DeviceIdentity,
    pub(crate) location: LocationKey,
    pub(crate) endpoints: BulkEndpoints,
    pub(crate) session: Option<Arc<Session>>,
    pub(crate) stale: bool,
}

impl DeviceRecord {
    pub(crate) fn new(
        identity: DeviceIdentity,
        location: LocationKey,
        endpoints: BulkEndpoints,
    ) -> Self {
        Self {
            identity,
            location,
            endpoints,
            session: None,
            stale: false,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Replace cached identity and endpoints, leaving the session alone
    pub(crate) fn refresh(&mut self, identity: DeviceIdentity, endpoints: BulkEndpoints) {
        self.identity = identity;
        self.endpoints = endpoints;
        self.stale = false;
    }

    pub(crate) fn info(&self, index: usize) -> DeviceInfo {
        DeviceInfo {
            index,
            identity: self.identity.clone(),
            location: self.location,
            endpoints: self.endpoints,
            is_open: self.is_open(),
            stale: self.stale,
        }
    }
}

/// Bounded, indexed collection of device records
pub(crate) struct DeviceTable {
    slots: Vec<Option<DeviceRecord>>,
    next_generation: u64,
}

impl DeviceTable {
    /// Create a table with `capacity` slots, clamped to `1..=MAX_DEVICES`
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_DEVICES);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            next_generation: 1,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&DeviceRecord> {
        self.slots.get(index)?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut DeviceRecord> {
        self.slots.get_mut(index)?.as_mut()
    }

    pub(crate) fn position_by_location(&self, location: LocationKey) -> Option<usize> {
        self.iter()
            .find(|(_, record)| record.location == location)
            .map(|(index, _)| index)
    }

    /// Place a record in the first empty slot
    pub(crate) fn insert(&mut self, record: DeviceRecord) -> Result<usize> {
        debug_assert!(self.position_by_location(record.location).is_none());

        let capacity = self.capacity();
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.is_none())
            .ok_or(Error::TableFull { capacity })?;

        *slot = Some(record);
        Ok(index)
    }

    pub(crate) fn remove(&mut self, index: usize) -> Option<DeviceRecord> {
        self.slots.get_mut(index)?.take()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &DeviceRecord)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|record| (index, record)))
    }

    /// Bit `i` set when slot `i` is occupied
    pub(crate) fn occupied_mask(&self) -> u32 {
        self.iter()
            .fold(0u32, |mask, (index, _)| mask | (1u32 << index))
    }

    pub(crate) fn next_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    /// Resolve a handle to its live session
    pub(crate) fn session(&self, handle: SessionHandle) -> Result<Arc<Session>> {
        self.get(handle.index)
            .and_then(|record| record.session.as_ref())
            .filter(|session| session.generation() == handle.generation)
            .cloned()
            .ok_or(Error::InvalidHandle)
    }

    /// Record behind a handle, provided the handle's session is current
    pub(crate) fn record_for(&self, handle: SessionHandle) -> Result<&DeviceRecord> {
        self.session(handle)?;
        self.get(handle.index).ok_or(Error::InvalidHandle)
    }

    /// Drop every record, closing any open sessions
    pub(crate) fn clear(&mut self) -> usize {
        let mut cleared = 0;
        for slot in self.slots.iter_mut() {
            if slot.take().is_some() {
                cleared += 1;
            }
        }
        cleared
    }
}
