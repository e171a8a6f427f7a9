//! Hot-plug monitor
//!
//! A dedicated thread waits on the backend's change notification, rescans
//! under the table lock, and then notifies listeners with the lock released
//! so a listener may call back into the transport.

use crate::backend::PlatformError;
use crate::enumerate::ScanReport;
use crate::error::{Error, Result};
use crate::manager::Shared;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A change to the device table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceEvent {
    /// A new device occupies this index
    Added(usize),
    /// The device at this index is gone
    Removed(usize),
}

impl ScanReport {
    /// Events in report order: additions first, then removals
    pub fn events(&self) -> impl Iterator<Item = DeviceEvent> + '_ {
        self.added
            .iter()
            .map(|&index| DeviceEvent::Added(index))
            .chain(self.removed.iter().map(|&index| DeviceEvent::Removed(index)))
    }
}

type Callback = dyn Fn(DeviceEvent) + Send + Sync;

#[derive(Default)]
struct ListenerSet {
    next_id: u64,
    entries: Vec<(u64, Arc<Callback>)>,
}

/// Registry of device-change listeners
#[derive(Default)]
pub(crate) struct Listeners {
    inner: Arc<Mutex<ListenerSet>>,
}

impl Listeners {
    pub(crate) fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(DeviceEvent) + Send + Sync + 'static,
    {
        let mut set = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = set.next_id;
        set.next_id += 1;
        set.entries.push((id, Arc::new(callback)));

        Subscription {
            id,
            listeners: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver every event in `report`; must be called without the table lock
    pub(crate) fn notify(&self, report: &ScanReport) {
        if report.is_empty() {
            return;
        }

        let callbacks: Vec<Arc<Callback>> = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for event in report.events() {
            for callback in &callbacks {
                callback(event);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }
}

/// Keeps a listener registered; dropping it unsubscribes
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<ListenerSet>>,
}

impl Subscription {
    /// Unsubscribe explicitly
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entries
                .retain(|(id, _)| *id != self.id);
        }
    }
}

/// Background rescan thread
pub(crate) struct Monitor {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Monitor {
    /// Spawn the monitor thread
    ///
    /// `wait_slice` bounds each blocking wait, which is how often the stop
    /// flag is observed.
    pub(crate) fn spawn(shared: Arc<Shared>, wait_slice: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("usb-hotplug".to_string())
            .spawn(move || run(shared, thread_stop, wait_slice))
            .map_err(|e| {
                Error::Platform(PlatformError::Other {
                    message: format!("failed to spawn hot-plug thread: {}", e),
                })
            })?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Signal the thread and wait for it to exit
    pub(crate) fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);

        if let Some(thread) = self.thread.take() {
            // Dropped from a listener running on the monitor thread itself
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!("Hot-plug thread panicked");
            }
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: Arc<Shared>, stop: Arc<AtomicBool>, wait_slice: Duration) {
    info!("Hot-plug monitor started");

    while !stop.load(Ordering::Acquire) {
        let changed = match shared.backend().wait_for_change(wait_slice) {
            Ok(changed) => changed,
            Err(e) => {
                warn!("Waiting for device changes failed: {}", e);
                std::thread::sleep(wait_slice);
                false
            }
        };

        if stop.load(Ordering::Acquire) {
            break;
        }

        if changed {
            debug!("Device change notification, rescanning");
            if let Err(e) = shared.rescan() {
                warn!("Rescan after device change failed: {}", e);
            }
        }
    }

    info!("Hot-plug monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn report(added: &[usize], removed: &[usize]) -> ScanReport {
        ScanReport {
            added: added.to_vec(),
            removed: removed.to_vec(),
        }
    }

    #[test]
    fn test_subscription_drop_unsubscribes() {
        let listeners = Listeners::default();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let subscription = listeners.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(listeners.len(), 1);

        listeners.notify(&report(&[0, 1], &[2]));
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        drop(subscription);
        assert_eq!(listeners.len(), 0);
        listeners.notify(&report(&[3], &[]));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_event_order() {
        let events: Vec<_> = report(&[4], &[1, 2]).events().collect();
        assert_eq!(
            events,
            vec![
                DeviceEvent::Added(4),
                DeviceEvent::Removed(1),
                DeviceEvent::Removed(2)
            ]
        );
    }

    #[test]
    fn test_subscription_outlives_registry() {
        let listeners = Listeners::default();
        let subscription = listeners.subscribe(|_| {});
        drop(listeners);
        subscription.unsubscribe();
    }

    #[test]
    fn test_listener_may_subscribe_during_notify() {
        let listeners = Arc::new(Listeners::default());
        let nested = Arc::new(Mutex::new(Vec::new()));

        let registry = Arc::clone(&listeners);
        let store = Arc::clone(&nested);
        let _subscription = listeners.subscribe(move |_| {
            let inner = registry.subscribe(|_| {});
            store.lock().unwrap().push(inner);
        });

        listeners.notify(&report(&[0], &[]));
        assert_eq!(listeners.len(), 2);
    }
}
