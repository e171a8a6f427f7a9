//! Common utilities for bulk-usb
//!
//! Shared error type and logging setup used by the command-line tool.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::{LOG_LEVELS, setup_logging, validate_log_level};
