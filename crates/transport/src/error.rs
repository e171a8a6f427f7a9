//! Transport error types

use crate::backend::PlatformError;
use crate::descriptor::DescriptorError;
use thiserror::Error;

/// Errors surfaced by the transport layer
#[derive(Debug, Error)]
pub enum Error {
    /// Handle is closed, was never issued, or belongs to an older session
    #[error("invalid session handle")]
    InvalidHandle,

    /// Table slot is empty or out of range
    #[error("no device at index {0}")]
    InvalidIndex(usize),

    /// Device does not expose the expected bulk interface
    #[error("descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    /// Bulk transfer failed after moving `transferred` bytes
    #[error("transfer failed after {transferred} bytes: {source}")]
    Transfer {
        transferred: usize,
        #[source]
        source: PlatformError,
    },

    /// The platform enumeration call itself failed
    #[error("device enumeration failed: {0}")]
    Enumeration(#[source] PlatformError),

    /// Any other platform failure (open, claim, notification wait)
    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),

    /// Every table slot is occupied
    #[error("device table is full ({capacity} slots)")]
    TableFull { capacity: usize },

    /// Malformed allow-list entry or settings value
    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    /// The layer has been shut down
    #[error("transport has been shut down")]
    ShutDown,
}

impl Error {
    /// Bytes moved before the failure, for errors that carry progress
    pub fn transferred(&self) -> usize {
        match self {
            Error::Transfer { transferred, .. } => *transferred,
            _ => 0,
        }
    }
}

/// Type alias for transport results
pub type Result<T> = std::result::Result<T, Error>;
