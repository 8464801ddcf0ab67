//! Native serial device built on the `serialport` crate.
//!
//! `serialport` exposes blocking transfers with a per-port timeout, so an
//! overlapped operation here is a deferred blocking loop that runs in short
//! slices on the caller's thread and gives up at the OS deadline or at the
//! caller's ceiling, whichever comes first. A cloned handle serves status
//! queries and line control while a transfer holds the main handle.
//!
//! Settings `serialport` cannot express (xon/xoff characters and limits,
//! error replacement, queue sizes) are kept in a shadow record and reported
//! back as configured.

use super::overlapped::{Overlapped, Submitted, WaitStatus};
use super::traits::{
    CommProperties, CommStatus, CommTimeouts, DeviceConfig, DeviceDriver, DtrControl,
    EscapeFunction, EventMask, LineErrors, ModemStatus, Parity, PurgeFlags, ReadTimeout,
    RtsControl, SerialDevice, StopBits, WriteTimeout,
};
use parking_lot::Mutex;
use serialport::{ClearBuffer, DataBits, FlowControl, SerialPort};
use std::cell::{Cell, RefCell};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Longest single blocking call inside a transfer or event poll.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Interval between status samples while an event wait is pending.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Opens OS serial ports through `serialport`.
#[derive(Debug, Clone)]
pub struct NativeDriver {
    default_baud: u32,
}

impl NativeDriver {
    pub fn new(default_baud: u32) -> Self {
        Self { default_baud }
    }
}

impl Default for NativeDriver {
    fn default() -> Self {
        Self::new(9600)
    }
}

impl DeviceDriver for NativeDriver {
    fn open(&self, path: &str) -> io::Result<Arc<dyn SerialDevice>> {
        let port = serialport::new(path, self.default_baud)
            .timeout(POLL_SLICE)
            .open()
            .map_err(io::Error::from)?;
        let control = port.try_clone().map_err(io::Error::from)?;
        debug!(device = path, baud = self.default_baud, "native port opened");

        let mut config = DeviceConfig {
            baud_rate: self.default_baud,
            ..DeviceConfig::default()
        };
        read_line_settings(&*control, &mut config)?;

        Ok(Arc::new(NativeDevice {
            inner: Arc::new(Inner {
                name: path.to_string(),
                io: Mutex::new(Some(port)),
                control: Mutex::new(Some(control)),
                shadow: Mutex::new(Shadow {
                    config,
                    queues: (4096, 4096),
                    timeouts: CommTimeouts::default(),
                    event_mask: EventMask::empty(),
                }),
                closed: AtomicBool::new(false),
            }),
        }))
    }
}

#[derive(Debug)]
struct Shadow {
    config: DeviceConfig,
    queues: (u32, u32),
    timeouts: CommTimeouts,
    event_mask: EventMask,
}

struct Inner {
    name: String,
    io: Mutex<Option<Box<dyn SerialPort>>>,
    control: Mutex<Option<Box<dyn SerialPort>>>,
    shadow: Mutex<Shadow>,
    closed: AtomicBool,
}

/// Open handle to an OS serial port.
pub struct NativeDevice {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for NativeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeDevice")
            .field("name", &self.inner.name)
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "the handle is invalid")
}

fn unsupported(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{what} not supported by this backend"),
    )
}

fn data_bits(byte_size: u8) -> io::Result<DataBits> {
    match byte_size {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "the parameter is incorrect",
        )),
    }
}

/// Fill the fields `serialport` knows about from the live port.
fn read_line_settings(port: &dyn SerialPort, config: &mut DeviceConfig) -> io::Result<()> {
    config.baud_rate = port.baud_rate().map_err(io::Error::from)?;
    config.byte_size = match port.data_bits().map_err(io::Error::from)? {
        DataBits::Five => 5,
        DataBits::Six => 6,
        DataBits::Seven => 7,
        DataBits::Eight => 8,
    };
    config.parity = match port.parity().map_err(io::Error::from)? {
        serialport::Parity::None => Parity::None,
        serialport::Parity::Odd => Parity::Odd,
        serialport::Parity::Even => Parity::Even,
    };
    config.parity_check = config.parity != Parity::None;
    config.stop_bits = match port.stop_bits().map_err(io::Error::from)? {
        serialport::StopBits::One => StopBits::One,
        serialport::StopBits::Two => StopBits::Two,
    };
    match port.flow_control().map_err(io::Error::from)? {
        FlowControl::None => {
            config.out_cts_flow = false;
            config.out_x = false;
            config.in_x = false;
        }
        FlowControl::Hardware => {
            config.out_cts_flow = true;
            config.rts_control = RtsControl::Handshake;
        }
        FlowControl::Software => {
            config.out_x = true;
            config.in_x = true;
        }
    }
    Ok(())
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

impl Inner {
    fn ensure_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(closed_error())
        } else {
            Ok(())
        }
    }

    fn with_control<R>(
        &self,
        f: impl FnOnce(&mut dyn SerialPort) -> serialport::Result<R>,
    ) -> io::Result<R> {
        self.ensure_open()?;
        let mut guard = self.control.lock();
        let port = guard.as_mut().ok_or_else(closed_error)?;
        f(&mut **port).map_err(io::Error::from)
    }

    fn with_io<R>(&self, f: impl FnOnce(&mut dyn SerialPort) -> io::Result<R>) -> io::Result<R> {
        self.ensure_open()?;
        let mut guard = self.io.lock();
        let port = guard.as_mut().ok_or_else(closed_error)?;
        f(&mut **port)
    }

    fn modem(&self) -> io::Result<ModemStatus> {
        self.with_control(|port| {
            Ok(ModemStatus {
                cts: port.read_clear_to_send()?,
                dsr: port.read_data_set_ready()?,
                ring: port.read_ring_indicator()?,
                rlsd: port.read_carrier_detect()?,
            })
        })
    }

    fn queues(&self) -> io::Result<(u32, u32)> {
        self.with_control(|port| Ok((port.bytes_to_read()?, port.bytes_to_write()?)))
    }

    /// Drive `step` in bounded slices until it yields a value, the OS
    /// deadline passes (`at_deadline` supplies the partial result) or the
    /// ceiling passes.
    fn run_sliced<T>(
        &self,
        os_deadline: Option<Instant>,
        ceiling: Option<Duration>,
        mut step: impl FnMut(&mut dyn SerialPort, Duration) -> io::Result<Option<T>>,
        at_deadline: impl Fn() -> T,
    ) -> WaitStatus<T> {
        let ceiling_at = ceiling.map(|c| Instant::now() + c);
        loop {
            let now = Instant::now();
            if os_deadline.is_some_and(|d| now >= d) {
                return WaitStatus::Completed(Ok(at_deadline()));
            }
            if ceiling_at.is_some_and(|c| now >= c) {
                return WaitStatus::Elapsed;
            }
            let slice = earliest(os_deadline, ceiling_at)
                .map(|t| t.saturating_duration_since(now))
                .unwrap_or(POLL_SLICE)
                .clamp(Duration::from_millis(1), POLL_SLICE);
            let result = self.with_io(|port| {
                port.set_timeout(slice).map_err(io::Error::from)?;
                step(port, slice)
            });
            match result {
                Ok(Some(value)) => return WaitStatus::Completed(Ok(value)),
                Ok(None) => {}
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => return WaitStatus::Completed(Err(e)),
            }
        }
    }
}

impl SerialDevice for NativeDevice {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn comm_config(&self) -> io::Result<DeviceConfig> {
        let mut config = self.inner.shadow.lock().config.clone();
        self.inner.with_control(|port| {
            config.baud_rate = port.baud_rate()?;
            Ok(())
        })?;
        Ok(config)
    }

    /// Second query, answered from the live port rather than the shadow.
    fn comm_state(&self) -> io::Result<DeviceConfig> {
        let mut config = self.inner.shadow.lock().config.clone();
        let mut guard = self.inner.control.lock();
        self.inner.ensure_open()?;
        let port = guard.as_mut().ok_or_else(closed_error)?;
        read_line_settings(&**port, &mut config)?;
        Ok(config)
    }

    fn set_comm_config(&self, config: &DeviceConfig) -> io::Result<()> {
        let bits = data_bits(config.byte_size)?;
        if config.baud_rate == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "the parameter is incorrect",
            ));
        }
        let parity = match config.parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
            Parity::Mark | Parity::Space => return Err(unsupported("mark/space parity")),
        };
        let stop_bits = match config.stop_bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
            StopBits::OnePointFive => return Err(unsupported("1.5 stop bits")),
        };
        let flow = if config.out_cts_flow || config.rts_control == RtsControl::Handshake {
            FlowControl::Hardware
        } else if config.out_x || config.in_x {
            FlowControl::Software
        } else {
            FlowControl::None
        };

        self.inner.with_control(|port| {
            port.set_baud_rate(config.baud_rate)?;
            port.set_data_bits(bits)?;
            port.set_parity(parity)?;
            port.set_stop_bits(stop_bits)?;
            port.set_flow_control(flow)?;
            match config.dtr_control {
                DtrControl::Enable => port.write_data_terminal_ready(true)?,
                DtrControl::Disable => port.write_data_terminal_ready(false)?,
                DtrControl::Handshake => {}
            }
            match config.rts_control {
                RtsControl::Enable => port.write_request_to_send(true)?,
                RtsControl::Disable => port.write_request_to_send(false)?,
                RtsControl::Handshake | RtsControl::Toggle => {}
            }
            Ok(())
        })?;
        self.inner.shadow.lock().config = config.clone();
        Ok(())
    }

    fn properties(&self) -> io::Result<CommProperties> {
        self.inner.ensure_open()?;
        let (rx, tx) = self.inner.shadow.lock().queues;
        Ok(CommProperties {
            max_rx_queue: 0,
            max_tx_queue: 0,
            current_rx_queue: rx,
            current_tx_queue: tx,
        })
    }

    /// Queue sizes are advisory here; the kernel owns the buffers.
    fn setup_queues(&self, rx_size: u32, tx_size: u32) -> io::Result<()> {
        self.inner.ensure_open()?;
        self.inner.shadow.lock().queues = (rx_size, tx_size);
        Ok(())
    }

    fn timeouts(&self) -> io::Result<CommTimeouts> {
        self.inner.ensure_open()?;
        Ok(self.inner.shadow.lock().timeouts)
    }

    fn set_timeouts(&self, timeouts: &CommTimeouts) -> io::Result<()> {
        self.inner.ensure_open()?;
        self.inner.shadow.lock().timeouts = *timeouts;
        Ok(())
    }

    fn write(&self, data: &[u8]) -> io::Result<Submitted<usize>> {
        self.inner.ensure_open()?;
        let timeout = self.inner.shadow.lock().timeouts.write;
        let os_deadline = match timeout {
            WriteTimeout::Immediate => {
                let n = self.inner.with_io(|port| {
                    port.set_timeout(Duration::from_millis(1))
                        .map_err(io::Error::from)?;
                    match port.write(data) {
                        Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
                        other => other,
                    }
                })?;
                return Ok(Submitted::Ready(n));
            }
            WriteTimeout::Total(d) => Some(Instant::now() + d),
            WriteTimeout::Infinite => None,
        };

        let inner = Arc::clone(&self.inner);
        let data = data.to_vec();
        Ok(Submitted::Pending(Overlapped::new(move |ceiling| {
            let offset = Cell::new(0);
            inner.run_sliced(
                os_deadline,
                ceiling,
                |port, _| {
                    let n = port.write(&data[offset.get()..])?;
                    offset.set(offset.get() + n);
                    trace!(bytes = n, "native write slice");
                    Ok((offset.get() == data.len()).then(|| offset.get()))
                },
                || offset.get(),
            )
        })))
    }

    fn read(&self, len: usize) -> io::Result<Submitted<Vec<u8>>> {
        self.inner.ensure_open()?;
        let timeout = self.inner.shadow.lock().timeouts.read;
        let os_deadline = match timeout {
            ReadTimeout::Immediate => {
                let data = self.inner.with_io(|port| {
                    let queued = port.bytes_to_read().map_err(io::Error::from)? as usize;
                    let mut buf = vec![0u8; queued.min(len)];
                    if buf.is_empty() {
                        return Ok(buf);
                    }
                    port.set_timeout(Duration::from_millis(1))
                        .map_err(io::Error::from)?;
                    let n = port.read(&mut buf)?;
                    buf.truncate(n);
                    Ok(buf)
                })?;
                return Ok(Submitted::Ready(data));
            }
            ReadTimeout::Total(d) => Some(Instant::now() + d),
            ReadTimeout::Infinite => None,
        };

        let inner = Arc::clone(&self.inner);
        Ok(Submitted::Pending(Overlapped::new(move |ceiling| {
            let buf = RefCell::new(Vec::with_capacity(len));
            inner.run_sliced(
                os_deadline,
                ceiling,
                |port, _| {
                    let mut buf = buf.borrow_mut();
                    let mut chunk = vec![0u8; len - buf.len()];
                    let n = port.read(&mut chunk)?;
                    buf.extend_from_slice(&chunk[..n]);
                    Ok((buf.len() == len).then(|| std::mem::take(&mut *buf)))
                },
                || std::mem::take(&mut *buf.borrow_mut()),
            )
        })))
    }

    /// Line errors are not surfaced by `serialport`; only queue and hold
    /// state are reported.
    fn clear_errors(&self) -> io::Result<(LineErrors, CommStatus)> {
        let (in_queue, out_queue) = self.inner.queues()?;
        let modem = self.inner.modem()?;
        let config = self.inner.shadow.lock().config.clone();
        Ok((
            LineErrors::empty(),
            CommStatus {
                cts_hold: config.out_cts_flow && !modem.cts,
                dsr_hold: config.out_dsr_flow && !modem.dsr,
                rlsd_hold: false,
                xoff_hold: false,
                xoff_sent: false,
                eof: false,
                txim: false,
                in_queue,
                out_queue,
            },
        ))
    }

    fn line_status(&self) -> io::Result<(LineErrors, CommStatus)> {
        self.clear_errors()
    }

    fn purge(&self, flags: PurgeFlags) -> io::Result<()> {
        let which = match (
            flags.contains(PurgeFlags::RXCLEAR),
            flags.contains(PurgeFlags::TXCLEAR),
        ) {
            (true, true) => ClearBuffer::All,
            (true, false) => ClearBuffer::Input,
            (false, true) => ClearBuffer::Output,
            (false, false) => return self.inner.ensure_open(),
        };
        self.inner.with_control(|port| port.clear(which))
    }

    fn flush_output(&self) -> io::Result<()> {
        self.inner.with_io(|port| port.flush())
    }

    fn set_break(&self) -> io::Result<()> {
        self.inner.with_control(|port| port.set_break())
    }

    fn clear_break(&self) -> io::Result<()> {
        self.inner.with_control(|port| port.clear_break())
    }

    fn escape(&self, function: EscapeFunction) -> io::Result<()> {
        match function {
            EscapeFunction::SetBreak => self.set_break(),
            EscapeFunction::ClrBreak => self.clear_break(),
            EscapeFunction::SetDtr => self
                .inner
                .with_control(|port| port.write_data_terminal_ready(true)),
            EscapeFunction::ClrDtr => self
                .inner
                .with_control(|port| port.write_data_terminal_ready(false)),
            EscapeFunction::SetRts => self
                .inner
                .with_control(|port| port.write_request_to_send(true)),
            EscapeFunction::ClrRts => self
                .inner
                .with_control(|port| port.write_request_to_send(false)),
            EscapeFunction::SetXoff | EscapeFunction::SetXon => Err(unsupported("xon/xoff escape")),
        }
    }

    fn event_mask(&self) -> io::Result<EventMask> {
        self.inner.ensure_open()?;
        Ok(self.inner.shadow.lock().event_mask)
    }

    fn set_event_mask(&self, mask: EventMask) -> io::Result<()> {
        if mask.is_empty() {
            // Clearing the mask must release a pending wait even after close.
            self.inner.shadow.lock().event_mask = mask;
            return Ok(());
        }
        self.inner.ensure_open()?;
        self.inner.shadow.lock().event_mask = mask;
        Ok(())
    }

    fn wait_event(&self) -> io::Result<Submitted<EventMask>> {
        let mut last_modem = self.inner.modem()?;
        let (mut last_in, mut last_out) = self.inner.queues()?;
        let inner = Arc::clone(&self.inner);

        Ok(Submitted::Pending(Overlapped::new(move |ceiling| {
            let ceiling_at = ceiling.map(|c| Instant::now() + c);
            loop {
                let mask = inner.shadow.lock().event_mask;
                if mask.is_empty() {
                    return WaitStatus::Completed(Ok(EventMask::empty()));
                }
                let sample = inner.queues().and_then(|q| Ok((q, inner.modem()?)));
                let ((in_queue, out_queue), modem) = match sample {
                    Ok(sample) => sample,
                    Err(e) => return WaitStatus::Completed(Err(e)),
                };

                let mut fired = EventMask::empty();
                if in_queue > last_in {
                    fired |= EventMask::RXCHAR;
                }
                if last_out > 0 && out_queue == 0 {
                    fired |= EventMask::TXEMPTY;
                }
                if modem.cts != last_modem.cts {
                    fired |= EventMask::CTS;
                }
                if modem.dsr != last_modem.dsr {
                    fired |= EventMask::DSR;
                }
                if modem.rlsd != last_modem.rlsd {
                    fired |= EventMask::RLSD;
                }
                if modem.ring && !last_modem.ring {
                    fired |= EventMask::RING;
                }
                last_in = in_queue;
                last_out = out_queue;
                last_modem = modem;

                let fired = fired & mask;
                if !fired.is_empty() {
                    return WaitStatus::Completed(Ok(fired));
                }
                if ceiling_at.is_some_and(|c| Instant::now() >= c) {
                    return WaitStatus::Elapsed;
                }
                std::thread::sleep(EVENT_POLL_INTERVAL);
            }
        })))
    }

    fn modem_status(&self) -> io::Result<ModemStatus> {
        self.inner.modem()
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shadow.lock().event_mask = EventMask::empty();
        self.inner.control.lock().take();
        self.inner.io.lock().take();
        debug!(device = %self.inner.name, "native port closed");
    }
}

impl Drop for NativeDevice {
    fn drop(&mut self) {
        self.close();
    }
}
