//! Capability interfaces a port exposes to the framework.
//!
//! A registered port is reachable through three capabilities: [`Common`]
//! (connection management and reports), [`OptionAccess`] (named string
//! options) and [`Octet`] (byte-stream transfers). Interposition filters
//! implement [`Octet`] themselves and wrap the capability below them.

use bitflags::bitflags;
use crate::port::PortError;
use std::fmt;
use std::io;
use std::time::Duration;

/// Per-call context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoRequest {
    /// `None` leaves the OS-level timeouts as last programmed,
    /// `Some(ZERO)` never blocks, `Some(t)` bounds the call by `t`.
    pub timeout: Option<Duration>,
}

impl IoRequest {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    pub fn non_blocking() -> Self {
        Self::with_timeout(Duration::ZERO)
    }

    /// Reuse whatever timeout the port last programmed.
    pub fn keep_timeout() -> Self {
        Self { timeout: None }
    }
}

/// Tri-state outcome of a framework call.
#[derive(Debug)]
pub enum Status {
    Success,
    Timeout,
    Error(PortError),
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Status::Timeout)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Status::Error(_))
    }

    pub fn error(&self) -> Option<&PortError> {
        match self {
            Status::Error(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => f.write_str("success"),
            Status::Timeout => f.write_str("timeout"),
            Status::Error(e) => write!(f, "error: {e}"),
        }
    }
}

impl From<PortError> for Status {
    fn from(err: PortError) -> Self {
        Status::Error(err)
    }
}

bitflags! {
    /// Why a read stopped.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EomReason: u8 {
        /// The caller's buffer was filled.
        const CNT = 0x1;
        /// An input terminator was seen.
        const EOS = 0x2;
        /// The device signalled end of message.
        const END = 0x4;
    }
}

/// Result of a write. `transferred` is valid for every status.
#[derive(Debug)]
pub struct WriteOutcome {
    pub transferred: usize,
    pub status: Status,
}

impl WriteOutcome {
    pub fn new(transferred: usize, status: Status) -> Self {
        Self {
            transferred,
            status,
        }
    }

    pub fn failed(err: PortError) -> Self {
        Self::new(0, Status::Error(err))
    }
}

/// Result of a read. `transferred` is valid for every status.
#[derive(Debug)]
pub struct ReadOutcome {
    pub transferred: usize,
    pub eom: EomReason,
    pub status: Status,
}

impl ReadOutcome {
    pub fn new(transferred: usize, eom: EomReason, status: Status) -> Self {
        Self {
            transferred,
            eom,
            status,
        }
    }

    pub fn failed(err: PortError) -> Self {
        Self::new(0, EomReason::empty(), Status::Error(err))
    }
}

/// Connection management and diagnostics.
pub trait Common: Send + Sync {
    /// Write a human-readable report; higher levels add detail.
    fn report(&self, out: &mut dyn io::Write, level: u32) -> io::Result<()>;

    fn connect(&self) -> Result<(), PortError>;

    /// Close the connection. A no-op when not connected.
    fn disconnect(&self) -> Result<(), PortError>;
}

/// Named string options.
pub trait OptionAccess: Send + Sync {
    fn get_option(&self, key: &str) -> Result<String, PortError>;

    fn set_option(&self, key: &str, value: &str) -> Result<(), PortError>;

    /// Render `key` into a caller buffer of fixed capacity, leaving room for
    /// a terminating NUL. Returns the rendered length.
    fn get_option_into(&self, key: &str, buf: &mut [u8]) -> Result<usize, PortError> {
        let value = self.get_option(key)?;
        if value.len() >= buf.len() {
            return Err(PortError::ValueTooLarge {
                key: key.to_string(),
            });
        }
        buf[..value.len()].copy_from_slice(value.as_bytes());
        buf[value.len()] = 0;
        Ok(value.len())
    }
}

/// Byte-stream transfers.
pub trait Octet: Send + Sync {
    fn write(&self, req: &IoRequest, data: &[u8]) -> WriteOutcome;

    fn read(&self, req: &IoRequest, buf: &mut [u8]) -> ReadOutcome;

    /// Discard queued input.
    fn flush(&self, req: &IoRequest) -> Result<(), PortError>;

    /// Name used in "not supported" errors.
    fn port_name(&self) -> &str;

    fn set_input_eos(&self, _eos: &[u8]) -> Result<(), PortError> {
        Err(PortError::NotSupported {
            port: self.port_name().to_string(),
            what: "input EOS",
        })
    }

    fn get_input_eos(&self) -> Result<Vec<u8>, PortError> {
        Err(PortError::NotSupported {
            port: self.port_name().to_string(),
            what: "input EOS",
        })
    }

    fn set_output_eos(&self, _eos: &[u8]) -> Result<(), PortError> {
        Err(PortError::NotSupported {
            port: self.port_name().to_string(),
            what: "output EOS",
        })
    }

    fn get_output_eos(&self) -> Result<Vec<u8>, PortError> {
        Err(PortError::NotSupported {
            port: self.port_name().to_string(),
            what: "output EOS",
        })
    }
}

/// Receives connection transitions.
#[cfg_attr(test, mockall::automock)]
pub trait ConnectionObserver: Send + Sync {
    fn connected(&self, port: &str);

    fn disconnected(&self, port: &str);
}

/// Observer that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ConnectionObserver for NullObserver {
    fn connected(&self, _port: &str) {}

    fn disconnected(&self, _port: &str) {}
}
