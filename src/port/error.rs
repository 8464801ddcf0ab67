//! Port-specific error types.
//!
//! Every variant that concerns a live device carries the device identity so
//! a message lifted out of a log still says which line misbehaved. Wrapped
//! `std::io::Error`s render the OS error code (`os error N`) when one exists.

use std::time::Duration;
use thiserror::Error;

/// Errors reported by the serial driver, its option codec and the registry.
#[derive(Debug, Error)]
pub enum PortError {
    /// The controller has no open handle.
    #[error("{device} disconnected")]
    Disconnected { device: String },

    /// `connect` was called while a handle is already open.
    #[error("{device}: link already open")]
    AlreadyConnected { device: String },

    /// The OS refused to open the device.
    #[error("{device} can't open: {source}")]
    Open {
        device: String,
        #[source]
        source: std::io::Error,
    },

    /// A transfer-level OS call failed (write, read, flush, break).
    #[error("{device} {op} error: {source}")]
    Io {
        device: String,
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// An overlapped completion did not arrive within the safety ceiling.
    #[error("{device} {op} error: completion not signalled within {ceiling:?}")]
    WaitElapsed {
        device: String,
        op: &'static str,
        ceiling: Duration,
    },

    /// The OS reported more bytes than were requested.
    #[error("{device} {op} error: {actual} bytes reported for a {requested} byte request")]
    SizeMismatch {
        device: String,
        op: &'static str,
        requested: usize,
        actual: usize,
    },

    /// A configuration or status query failed.
    #[error("{device} error calling {call}: {source}")]
    Os {
        device: String,
        call: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A read was requested into an empty buffer.
    #[error("{device} read capacity {capacity} must be positive")]
    BadCapacity { device: String, capacity: usize },

    /// The background event monitor could not be started.
    #[error("{device} can't start event monitor: {source}")]
    MonitorSpawn {
        device: String,
        #[source]
        source: std::io::Error,
    },

    /// Option key outside the supported vocabulary.
    #[error("Unsupported key \"{0}\"")]
    UnsupportedKey(String),

    /// Numeric option value that does not parse or is out of range.
    #[error("Bad number \"{value}\" for key \"{key}\"")]
    BadNumber { key: &'static str, value: String },

    /// Value outside the enumerated set for a key.
    #[error("Invalid {key} value \"{value}\"")]
    InvalidValue { key: &'static str, value: String },

    /// Option recognised but not available on this platform.
    #[error("Option {key} not supported on this platform")]
    UnsupportedOption { key: &'static str },

    /// Option that can only be set.
    #[error("Option {key} is write-only")]
    WriteOnly { key: &'static str },

    /// Rendered option value does not fit the caller's buffer.
    #[error("Value buffer for key '{key}' is too small")]
    ValueTooLarge { key: String },

    /// Capability the interface in question does not provide.
    #[error("{port}: {what} not supported")]
    NotSupported { port: String, what: &'static str },

    /// A port with this name is already registered.
    #[error("Port {0} already registered")]
    PortExists(String),

    /// No port with this name is registered.
    #[error("Port {0} not found")]
    PortNotFound(String),
}

/// Result type for driver operations.
pub type PortResult<T> = Result<T, PortError>;

impl PortError {
    /// Create a Disconnected error for a device.
    pub fn disconnected(device: impl Into<String>) -> Self {
        Self::Disconnected {
            device: device.into(),
        }
    }

    /// Create an Os error for a failed configuration/status call.
    pub fn os(device: impl Into<String>, call: &'static str, source: std::io::Error) -> Self {
        Self::Os {
            device: device.into(),
            call,
            source,
        }
    }

    /// Create an Io error for a failed transfer-level call.
    pub fn io(device: impl Into<String>, op: &'static str, source: std::io::Error) -> Self {
        Self::Io {
            device: device.into(),
            op,
            source,
        }
    }

    /// Whether the error left the connection closed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::WaitElapsed { .. } | Self::SizeMismatch { .. }
        )
    }
}
