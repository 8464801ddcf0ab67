//! Core traits for the OS-facing side of a serial line.
//!
//! `SerialDevice` is the narrow set of primitives the port controller needs
//! from an open handle. Both the native `serialport`-backed implementation
//! and the in-memory loopback line implement it, so the controller, monitor
//! and option codec are exercised the same way in tests and in the field.

use super::overlapped::Submitted;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Parity checking modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl Parity {
    pub fn as_str(self) -> &'static str {
        match self {
            Parity::None => "none",
            Parity::Odd => "odd",
            Parity::Even => "even",
            Parity::Mark => "mark",
            Parity::Space => "space",
        }
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    One,
    OnePointFive,
    Two,
}

impl StopBits {
    pub fn as_str(self) -> &'static str {
        match self {
            StopBits::One => "1",
            StopBits::OnePointFive => "1.5",
            StopBits::Two => "2",
        }
    }
}

/// DTR line behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtrControl {
    Disable,
    Enable,
    Handshake,
}

impl DtrControl {
    pub fn as_str(self) -> &'static str {
        match self {
            DtrControl::Disable => "disable",
            DtrControl::Enable => "enable",
            DtrControl::Handshake => "handshake",
        }
    }
}

/// RTS line behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RtsControl {
    Disable,
    Enable,
    Handshake,
    Toggle,
}

impl RtsControl {
    pub fn as_str(self) -> &'static str {
        match self {
            RtsControl::Disable => "disable",
            RtsControl::Enable => "enable",
            RtsControl::Handshake => "handshake",
            RtsControl::Toggle => "toggle",
        }
    }
}

/// Full device configuration record.
///
/// Always handled as a value: fetched fresh from the device, one field
/// changed, and the whole record written back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub baud_rate: u32,
    pub byte_size: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
    /// Whether the receiver checks parity.
    pub parity_check: bool,

    pub out_cts_flow: bool,
    pub rts_control: RtsControl,
    pub out_dsr_flow: bool,
    pub dtr_control: DtrControl,
    pub dsr_sensitivity: bool,

    /// XON/XOFF on transmission.
    pub out_x: bool,
    /// XON/XOFF on reception.
    pub in_x: bool,
    pub xon_char: u8,
    pub xoff_char: u8,
    pub xon_limit: u16,
    pub xoff_limit: u16,
    pub tx_continue_on_xoff: bool,

    pub error_char_enabled: bool,
    pub discard_null: bool,
    pub abort_on_error: bool,
    pub error_char: u8,
    pub eof_char: u8,
    pub event_char: u8,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            byte_size: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            parity_check: false,
            out_cts_flow: false,
            rts_control: RtsControl::Enable,
            out_dsr_flow: false,
            dtr_control: DtrControl::Enable,
            dsr_sensitivity: false,
            out_x: false,
            in_x: false,
            xon_char: 0x11,
            xoff_char: 0x13,
            xon_limit: 2048,
            xoff_limit: 512,
            tx_continue_on_xoff: false,
            error_char_enabled: false,
            discard_null: false,
            abort_on_error: false,
            error_char: 0,
            eof_char: 0,
            event_char: 0,
        }
    }
}

/// Driver queue sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommProperties {
    /// 0 when the OS does not impose a maximum.
    pub max_rx_queue: u32,
    pub max_tx_queue: u32,
    pub current_rx_queue: u32,
    pub current_tx_queue: u32,
}

/// OS-level read timeout programming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadTimeout {
    /// Return at once with whatever is queued, possibly nothing.
    Immediate,
    /// Return what has accumulated once this much time has passed.
    Total(Duration),
    #[default]
    Infinite,
}

/// OS-level write timeout programming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteTimeout {
    /// Accept what fits in the transmit queue and return.
    Immediate,
    /// Complete with the count transferred once this much time has passed.
    Total(Duration),
    #[default]
    Infinite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommTimeouts {
    pub read: ReadTimeout,
    pub write: WriteTimeout,
}

bitflags! {
    /// Hardware/line-status notifications a device can raise.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventMask: u32 {
        /// A byte was received and placed in the input queue.
        const RXCHAR = 0x0001;
        const RXFLAG = 0x0002;
        const TXEMPTY = 0x0004;
        const CTS = 0x0008;
        const DSR = 0x0010;
        const RLSD = 0x0020;
        const BREAK = 0x0040;
        const ERR = 0x0080;
        const RING = 0x0100;
    }
}

bitflags! {
    /// Line errors latched by the device until cleared.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LineErrors: u32 {
        const RXOVER = 0x0001;
        const OVERRUN = 0x0002;
        const RXPARITY = 0x0004;
        const FRAME = 0x0008;
        const BREAK = 0x0010;
    }
}

bitflags! {
    /// Queue purge actions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PurgeFlags: u32 {
        const TXABORT = 0x0001;
        const RXABORT = 0x0002;
        const TXCLEAR = 0x0004;
        const RXCLEAR = 0x0008;
    }
}

/// Queue occupancy and flow-control hold state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommStatus {
    pub cts_hold: bool,
    pub dsr_hold: bool,
    pub rlsd_hold: bool,
    pub xoff_hold: bool,
    pub xoff_sent: bool,
    pub eof: bool,
    pub txim: bool,
    pub in_queue: u32,
    pub out_queue: u32,
}

/// Modem control input lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModemStatus {
    pub cts: bool,
    pub dsr: bool,
    pub ring: bool,
    pub rlsd: bool,
}

/// Direct line manipulations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeFunction {
    ClrBreak,
    ClrDtr,
    ClrRts,
    SetBreak,
    SetDtr,
    SetRts,
    SetXoff,
    SetXon,
}

/// Primitives of an open serial handle.
///
/// Implementations must allow the event wait to be pending on one thread
/// while transfers run on another. A pending [`wait_event`] completes with
/// an empty mask once the mask is cleared to zero, and every call fails
/// after [`close`].
///
/// [`wait_event`]: SerialDevice::wait_event
/// [`close`]: SerialDevice::close
pub trait SerialDevice: Send + Sync + fmt::Debug {
    /// OS-level name of the device.
    fn name(&self) -> &str;

    fn comm_config(&self) -> io::Result<DeviceConfig>;

    fn set_comm_config(&self, config: &DeviceConfig) -> io::Result<()>;

    /// Second, independent query of the live configuration.
    fn comm_state(&self) -> io::Result<DeviceConfig> {
        self.comm_config()
    }

    fn properties(&self) -> io::Result<CommProperties>;

    fn setup_queues(&self, rx_size: u32, tx_size: u32) -> io::Result<()>;

    fn timeouts(&self) -> io::Result<CommTimeouts>;

    fn set_timeouts(&self, timeouts: &CommTimeouts) -> io::Result<()>;

    /// Start writing `data`; completion reports the count accepted.
    fn write(&self, data: &[u8]) -> io::Result<Submitted<usize>>;

    /// Start reading up to `len` bytes.
    fn read(&self, len: usize) -> io::Result<Submitted<Vec<u8>>>;

    /// Return and clear latched line errors together with queue state.
    fn clear_errors(&self) -> io::Result<(LineErrors, CommStatus)>;

    /// Like [`clear_errors`](SerialDevice::clear_errors) but leaves the
    /// latched errors in place.
    fn line_status(&self) -> io::Result<(LineErrors, CommStatus)>;

    fn purge(&self, flags: PurgeFlags) -> io::Result<()>;

    /// Block until queued output has been transmitted.
    fn flush_output(&self) -> io::Result<()>;

    fn set_break(&self) -> io::Result<()>;

    fn clear_break(&self) -> io::Result<()>;

    fn escape(&self, function: EscapeFunction) -> io::Result<()>;

    fn event_mask(&self) -> io::Result<EventMask>;

    fn set_event_mask(&self, mask: EventMask) -> io::Result<()>;

    /// Start waiting for the next notification matching the mask.
    fn wait_event(&self) -> io::Result<Submitted<EventMask>>;

    fn modem_status(&self) -> io::Result<ModemStatus>;

    /// Invalidate the handle.
    fn close(&self);
}

/// Opens devices by OS-level name.
pub trait DeviceDriver: Send + Sync + fmt::Debug {
    /// Open `path` for exclusive overlapped access.
    fn open(&self, path: &str) -> io::Result<Arc<dyn SerialDevice>>;
}

/// Put a bare device name into the platform's raw-device namespace.
pub fn normalize_device_path(name: &str) -> String {
    #[cfg(windows)]
    {
        const PREFIX: &str = r"\\.\";
        if name
            .get(..PREFIX.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(PREFIX))
        {
            name.to_string()
        } else {
            format!("{PREFIX}{name}")
        }
    }

    #[cfg(not(windows))]
    {
        if name.starts_with('/') {
            name.to_string()
        } else {
            format!("/dev/{name}")
        }
    }
}
