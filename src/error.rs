//! Error types for the MP-285 driver.
//!
//! `StageError` is the single error type returned by the library. The variants
//! are split so that a caller can tell *where* an operation failed:
//!
//! - **`Connection`**: the serial port could not be opened. The library never
//!   exits the process; the entry point decides what to do.
//! - **`Protocol`**: a reply frame was short or malformed. Missing fields are
//!   never guessed.
//! - **`Timeout`**: the device did not answer within the configured read
//!   timeout. Cached state is left untouched when this is returned.
//! - **`Range`**: a target position does not fit the 32-bit wire integer after
//!   unit conversion. Raised before anything is written to the link.
//! - **`LogWrite`**: the exchange with the stage succeeded but the CSV event
//!   log could not be written ("stage moved but logging failed").
//!
//! By using `#[from]`, `StageError` can be created from I/O and configuration
//! errors with the `?` operator.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the driver error type.
pub type StageResult<T> = std::result::Result<T, StageError>;

/// One of the three stage axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// X axis
    X,
    /// Y axis
    Y,
    /// Z axis
    Z,
}

impl Axis {
    /// All axes in wire order.
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Z => "Z",
        };
        f.write_str(name)
    }
}

/// Errors from the MP-285 driver.
#[derive(Error, Debug)]
pub enum StageError {
    /// The serial port could not be opened
    #[error("No connection to Sutter MP-285 on '{port}': {reason}")]
    Connection {
        /// Port name as configured
        port: String,
        /// Reason reported by the OS
        reason: String,
    },

    /// Malformed or truncated reply
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No complete reply within the read timeout
    #[error("No reply from MP-285 within {0:?}")]
    Timeout(Duration),

    /// Coordinate does not fit a 32-bit microstep value
    #[error("{axis} = {microns} µm overflows the 32-bit wire position at stepmult {stepmult}")]
    Range {
        /// Offending axis
        axis: Axis,
        /// Requested value in µm
        microns: f64,
        /// Conversion factor in use
        stepmult: u32,
    },

    /// The event log could not be written
    #[error("Failed to write event log '{}': {source}", path.display())]
    LogWrite {
        /// Log file
        path: PathBuf,
        /// Underlying CSV or I/O failure
        #[source]
        source: csv::Error,
    },

    /// Serial I/O failure
    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The session has been closed
    #[error("Serial port not connected")]
    SerialPortNotConnected,

    /// The link closed mid-reply
    #[error("Unexpected EOF from serial port")]
    SerialUnexpectedEof,

    /// Another exchange holds the link
    #[error("Serial link is busy with another exchange")]
    Busy,

    /// The MP-285 has no such operation
    #[error("MP-285 does not support operation: {0}")]
    Unsupported(&'static str),

    /// A cargo feature needed for this call is disabled
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// Invalid or unreadable settings
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl StageError {
    /// Wrap a log I/O failure for `path`.
    pub(crate) fn log_write(path: impl Into<PathBuf>, source: impl Into<csv::Error>) -> Self {
        StageError::LogWrite {
            path: path.into(),
            source: source.into(),
        }
    }

    /// True when the failure happened after the device exchange completed.
    pub fn is_log_failure(&self) -> bool {
        matches!(self, StageError::LogWrite { .. })
    }
}
