//! Bulk USB manager
//!
//! [`BulkUsb`] is the caller-facing entry point: it owns the device table,
//! the allow list, the listener registry and, optionally, the hot-plug
//! monitor. The device table is the only shared mutable state and sits
//! behind a single mutex; transfers clone the session out of the table and
//! run with the lock released.

use crate::allow_list::{AllowList, UsbId};
use crate::backend::UsbBackend;
use crate::enumerate::{ScanReport, scan};
use crate::error::{Error, Result};
use crate::monitor::{DeviceEvent, Listeners, Monitor, Subscription};
use crate::session::{Session, SessionHandle, TransferLimits, TransferMode};
use crate::settings::UsbSettings;
use crate::table::{DeviceInfo, DeviceTable};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// State shared between the caller and the monitor thread
pub(crate) struct Shared {
    backend: Arc<dyn UsbBackend>,
    table: Mutex<DeviceTable>,
    allow_list: RwLock<AllowList>,
    listeners: Listeners,
    limits: TransferLimits,
    default_timeout: Duration,
    shut_down: AtomicBool,
}

impl Shared {
    pub(crate) fn backend(&self) -> &dyn UsbBackend {
        self.backend.as_ref()
    }

    fn lock_table(&self) -> MutexGuard<'_, DeviceTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::ShutDown);
        }
        Ok(())
    }

    /// Scan under the table lock, then notify with the lock released
    pub(crate) fn rescan(&self) -> Result<ScanReport> {
        self.ensure_running()?;

        let report = {
            let allow_list = self
                .allow_list
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            let mut table = self.lock_table();
            scan(self.backend.as_ref(), &allow_list, &mut table)?
        };

        self.listeners.notify(&report);
        Ok(report)
    }

    fn session(&self, handle: SessionHandle) -> Result<Arc<Session>> {
        self.ensure_running()?;
        self.lock_table().session(handle)
    }
}

/// Host-side bulk USB transport
pub struct BulkUsb {
    shared: Arc<Shared>,
    monitor: Mutex<Option<Monitor>>,
    poll_interval: Duration,
    /// Listener registered at init, if any
    init_subscription: Mutex<Option<Subscription>>,
}

impl BulkUsb {
    /// Initialize the transport, starting the monitor if `settings.hotplug`
    pub fn init(backend: Arc<dyn UsbBackend>, settings: &UsbSettings) -> Result<Self> {
        settings.validate()?;

        let shared = Arc::new(Shared {
            backend,
            table: Mutex::new(DeviceTable::new(settings.max_devices)),
            allow_list: RwLock::new(settings.allow_list()?),
            listeners: Listeners::default(),
            limits: settings.limits(),
            default_timeout: settings.default_timeout_duration(),
            shut_down: AtomicBool::new(false),
        });

        let bulk = Self {
            shared,
            monitor: Mutex::new(None),
            poll_interval: settings.poll_interval(),
            init_subscription: Mutex::new(None),
        };

        if settings.hotplug {
            bulk.start_monitor()?;
        }

        info!(
            "Bulk USB transport initialized ({} slots, hot-plug {})",
            settings.max_devices,
            if settings.hotplug { "on" } else { "off" }
        );
        Ok(bulk)
    }

    /// Initialize with a device-change callback registered before the
    /// monitor starts
    pub fn init_with_callback<F>(
        backend: Arc<dyn UsbBackend>,
        settings: &UsbSettings,
        callback: F,
    ) -> Result<Self>
    where
        F: Fn(DeviceEvent) + Send + Sync + 'static,
    {
        let deferred = UsbSettings {
            hotplug: false,
            ..settings.clone()
        };
        let bulk = Self::init(backend, &deferred)?;
        *bulk
            .init_subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(bulk.subscribe(callback));

        if settings.hotplug {
            bulk.start_monitor()?;
        }
        Ok(bulk)
    }

    /// Stop the monitor, close every session and empty the table
    ///
    /// Idempotent; later calls on this instance fail with `ShutDown`.
    pub fn exit(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        self.stop_monitor();
        let cleared = self.shared.lock_table().clear();
        self.init_subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        info!("Bulk USB transport shut down ({} devices released)", cleared);
    }

    /// Start the hot-plug monitor; no-op if already running
    pub fn start_monitor(&self) -> Result<()> {
        self.shared.ensure_running()?;

        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if monitor.is_none() {
            *monitor = Some(Monitor::spawn(Arc::clone(&self.shared), self.poll_interval)?);
        }
        Ok(())
    }

    /// Stop and join the hot-plug monitor
    pub fn stop_monitor(&self) {
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(mut monitor) = monitor {
            monitor.stop();
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Allow a (vendor, product) pair; returns `false` if already allowed
    pub fn add_allowed_device(&self, vendor_id: u16, product_id: u16) -> bool {
        self.shared
            .allow_list
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add(UsbId::new(vendor_id, product_id))
    }

    /// Disallow a (vendor, product) pair; returns `false` if it was not allowed
    ///
    /// Matching devices leave the table on the next scan unless open.
    pub fn remove_allowed_device(&self, vendor_id: u16, product_id: u16) -> bool {
        self.shared
            .allow_list
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(UsbId::new(vendor_id, product_id))
    }

    pub fn allowed_devices(&self) -> Vec<UsbId> {
        self.shared
            .allow_list
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Reconcile the table with attached devices and notify listeners
    pub fn rescan(&self) -> Result<ScanReport> {
        self.shared.rescan()
    }

    /// Rescan, then report the device count and the occupied-slot bitmask
    pub fn available_device_count(&self) -> Result<(usize, u32)> {
        self.rescan()?;

        let table = self.shared.lock_table();
        Ok((table.len(), table.occupied_mask()))
    }

    /// Snapshot of every table entry, without rescanning
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.shared
            .lock_table()
            .iter()
            .map(|(index, record)| record.info(index))
            .collect()
    }

    /// Identity and state of the device at `index`
    pub fn device_info(&self, index: usize) -> Result<DeviceInfo> {
        self.shared.ensure_running()?;
        self.shared
            .lock_table()
            .get(index)
            .map(|record| record.info(index))
            .ok_or(Error::InvalidIndex(index))
    }

    /// Identity and state of the device behind an open session
    pub fn session_info(&self, handle: SessionHandle) -> Result<DeviceInfo> {
        self.shared.ensure_running()?;
        self.shared
            .lock_table()
            .record_for(handle)
            .map(|record| record.info(handle.index))
    }

    /// Open the device at `index`
    ///
    /// Opening an already open device returns its existing handle.
    pub fn open(&self, index: usize) -> Result<SessionHandle> {
        self.shared.ensure_running()?;
        let mut table = self.shared.lock_table();

        let record = table.get(index).ok_or(Error::InvalidIndex(index))?;
        if let Some(session) = &record.session {
            debug!("Device {} already open", index);
            return Ok(SessionHandle {
                index,
                generation: session.generation(),
            });
        }

        let (location, endpoints) = (record.location, record.endpoints);
        let handle = self
            .shared
            .backend
            .open(location, endpoints.interface_number)
            .map_err(|e| {
                warn!("Failed to open device {} at {}: {}", index, location, e);
                Error::Platform(e)
            })?;

        let generation = table.next_generation();
        let record = table.get_mut(index).ok_or(Error::InvalidIndex(index))?;
        record.session = Some(Arc::new(Session::new(generation, endpoints, handle)));

        info!("Opened device {} at {}", index, location);
        Ok(SessionHandle { index, generation })
    }

    /// Close a session; closing a closed or stale handle is a no-op
    pub fn close(&self, handle: SessionHandle) {
        let mut table = self.shared.lock_table();

        let Some(record) = table.get_mut(handle.index) else {
            return;
        };
        let current = record
            .session
            .as_ref()
            .is_some_and(|session| session.generation() == handle.generation);

        if current {
            record.session = None;
            info!("Closed device {}", handle.index);
        }
    }

    /// Read with the default timeout
    pub fn read(&self, handle: SessionHandle, buf: &mut [u8]) -> Result<usize> {
        self.read_timed(handle, buf, self.shared.default_timeout)
    }

    /// Read up to `buf.len()` bytes within `timeout`
    ///
    /// A timeout yields the bytes gathered so far, possibly zero.
    pub fn read_timed(
        &self,
        handle: SessionHandle,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let session = self.shared.session(handle)?;
        session.read(buf, timeout, self.shared.limits.read_chunk)
    }

    /// Write with the default timeout
    pub fn write(&self, handle: SessionHandle, data: &[u8]) -> Result<usize> {
        self.write_timed(handle, data, self.shared.default_timeout)
    }

    /// Write `data`, applying `timeout` to each chunk
    ///
    /// Timeouts are rounded up to whole milliseconds; zero means the shortest
    /// wait the platform allows, not an unbounded one.
    pub fn write_timed(
        &self,
        handle: SessionHandle,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        let session = self.shared.session(handle)?;
        session.write(data, timeout, self.shared.limits.write_chunk)
    }

    /// Choose whether reads and writes may complete short
    pub fn set_mode(
        &self,
        handle: SessionHandle,
        short_read: bool,
        short_write: bool,
    ) -> Result<()> {
        self.shared.session(handle)?.set_mode(TransferMode {
            short_read,
            short_write,
        });
        Ok(())
    }

    pub fn transfer_mode(&self, handle: SessionHandle) -> Result<TransferMode> {
        Ok(self.shared.session(handle)?.mode())
    }

    /// Bytes already received and waiting to be read
    pub fn queued_bytes(&self, handle: SessionHandle) -> Result<usize> {
        Ok(self.shared.session(handle)?.queued())
    }

    /// Register a device-change listener
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(DeviceEvent) + Send + Sync + 'static,
    {
        self.shared.listeners.subscribe(callback)
    }

    /// Number of registered device-change listeners
    pub fn listener_count(&self) -> usize {
        self.shared.listeners.len()
    }

    /// Device-change events as an async channel
    ///
    /// Events are dropped with a warning if the receiver falls 256 behind.
    pub fn event_channel(&self) -> (Subscription, async_channel::Receiver<DeviceEvent>) {
        let (tx, rx) = async_channel::bounded(256);
        let subscription = self.subscribe(move |event| {
            if let Err(async_channel::TrySendError::Full(event)) = tx.try_send(event) {
                warn!("Event channel full, dropping {:?}", event);
            }
        });
        (subscription, rx)
    }
}

impl Drop for BulkUsb {
    fn drop(&mut self) {
        self.exit();
    }
}
