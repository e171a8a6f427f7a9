//! Session and bulk transfer engine
//!
//! A [`Session`] owns the platform handle of one opened device plus its
//! receive buffer. The device table hands out `Arc<Session>` clones so that
//! transfers run without the table lock held; dropping the last clone
//! releases the platform handle.

use crate::backend::{BulkHandle, PlatformError};
use crate::descriptor::BulkEndpoints;
use crate::error::{Error, Result};
use bytes::{Buf, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default size of a single bulk IN request
pub const DEFAULT_READ_CHUNK: usize = 16 * 1024;

/// Default size of a single bulk OUT request
pub const DEFAULT_WRITE_CHUNK: usize = 16 * 1024;

/// Shortest timeout handed to the platform
///
/// libusb takes whole milliseconds and reads 0 as "no timeout", so anything
/// shorter is rounded up rather than truncated.
const MIN_PLATFORM_TIMEOUT: Duration = Duration::from_millis(1);

/// Round `timeout` up to whole milliseconds, never below one
fn platform_timeout(timeout: Duration) -> Duration {
    let millis = timeout.as_nanos().div_ceil(1_000_000);
    Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX)).max(MIN_PLATFORM_TIMEOUT)
}

/// Caller-visible reference to an open session
///
/// The generation distinguishes successive sessions on the same table slot,
/// so a handle that was closed never reaches a later session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub(crate) index: usize,
    pub(crate) generation: u64,
}

impl SessionHandle {
    /// Table index of the device this handle refers to
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Whether transfers may complete with fewer bytes than requested
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferMode {
    /// Return from a read as soon as any data is available
    pub short_read: bool,
    /// Return from a write after the first chunk the device accepts short
    pub short_write: bool,
}

/// Per-request size caps imposed by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLimits {
    pub read_chunk: usize,
    pub write_chunk: usize,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            read_chunk: DEFAULT_READ_CHUNK,
            write_chunk: DEFAULT_WRITE_CHUNK,
        }
    }
}

/// An opened device
pub(crate) struct Session {
    generation: u64,
    endpoints: BulkEndpoints,
    handle: Box<dyn BulkHandle>,
    /// Surplus bytes from earlier reads
    rx: Mutex<BytesMut>,
    short_read: AtomicBool,
    short_write: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        generation: u64,
        endpoints: BulkEndpoints,
        handle: Box<dyn BulkHandle>,
    ) -> Self {
        Self {
            generation,
            endpoints,
            handle,
            rx: Mutex::new(BytesMut::new()),
            short_read: AtomicBool::new(false),
            short_write: AtomicBool::new(false),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn mode(&self) -> TransferMode {
        TransferMode {
            short_read: self.short_read.load(Ordering::Relaxed),
            short_write: self.short_write.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set_mode(&self, mode: TransferMode) {
        self.short_read.store(mode.short_read, Ordering::Relaxed);
        self.short_write.store(mode.short_write, Ordering::Relaxed);
    }

    /// Bytes waiting in the receive buffer
    pub(crate) fn queued(&self) -> usize {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Read into `buf`, serving buffered bytes first
    ///
    /// `timeout` bounds the whole call. Running out of time is not an
    /// error: the bytes gathered so far (possibly none) are returned.
    /// An empty bulk packet also ends the call, with whatever was gathered.
    pub(crate) fn read(
        &self,
        buf: &mut [u8],
        timeout: Duration,
        chunk_size: usize,
    ) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        let short = self.short_read.load(Ordering::Relaxed);

        let mut filled = rx.len().min(buf.len());
        buf[..filled].copy_from_slice(&rx[..filled]);
        rx.advance(filled);

        let deadline = Instant::now() + timeout;
        let endpoint = self.endpoints.input.address;
        let mut chunk = Vec::new();

        while filled < buf.len() && !(short && filled > 0) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            if chunk.is_empty() {
                chunk = vec![0u8; chunk_size.max(1)];
            }

            match self
                .handle
                .read_bulk(endpoint, &mut chunk, platform_timeout(remaining))
            {
                Ok(0) => {
                    debug!("Bulk IN {:#04x} returned an empty packet", endpoint);
                    break;
                }
                Ok(received) => {
                    let take = received.min(buf.len() - filled);
                    buf[filled..filled + take].copy_from_slice(&chunk[..take]);
                    filled += take;
                    rx.extend_from_slice(&chunk[take..received]);
                }
                Err(PlatformError::Timeout) => {
                    debug!("Bulk IN {:#04x} timed out after {} bytes", endpoint, filled);
                    break;
                }
                Err(source) => {
                    warn!("Bulk IN {:#04x} failed: {}", endpoint, source);
                    return Err(Error::Transfer {
                        transferred: filled,
                        source,
                    });
                }
            }
        }

        Ok(filled)
    }

    /// Write `data` in chunks of at most `chunk_size`, one timed transfer each
    ///
    /// Stops at the first failing chunk; the error carries the count already
    /// written. A timed-out chunk ends the call with the partial count. A zero
    /// timeout gives each chunk the shortest wait the platform accepts.
    pub(crate) fn write(
        &self,
        data: &[u8],
        timeout: Duration,
        chunk_size: usize,
    ) -> Result<usize> {
        let short = self.short_write.load(Ordering::Relaxed);
        let timeout = platform_timeout(timeout);
        let endpoint = self.endpoints.output.address;
        let mut written = 0;

        for chunk in data.chunks(chunk_size.max(1)) {
            let mut sent = 0;

            while sent < chunk.len() {
                match self.handle.write_bulk(endpoint, &chunk[sent..], timeout) {
                    Ok(accepted) => {
                        sent += accepted;
                        written += accepted;

                        // A zero-byte acceptance would spin forever
                        if sent < chunk.len() && (short || accepted == 0) {
                            return Ok(written);
                        }
                    }
                    Err(PlatformError::Timeout) => {
                        debug!("Bulk OUT {:#04x} timed out after {} bytes", endpoint, written);
                        return Ok(written);
                    }
                    Err(source) => {
                        warn!("Bulk OUT {:#04x} failed: {}", endpoint, source);
                        return Err(Error::Transfer {
                            transferred: written,
                            source,
                        });
                    }
                }
            }
        }

        Ok(written)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!(
            "Closing session {} on interface {}",
            self.generation, self.endpoints.interface_number
        );
    }
}
