//! In-memory serial line for testing and demos.
//!
//! A [`LoopbackLine`] models the wire and the far end of a port: bytes the
//! port transmits are echoed back into its input queue (or collected for the
//! peer when echo is off), and the peer can inject input, stall the line,
//! flip modem lines and arm one-shot faults. [`LoopbackDevice`] is the handle
//! the controller sees; it implements the full [`SerialDevice`] contract,
//! including overlapped completion and pending event waits.
//!
//! # Example
//! ```
//! use asyn_serial::port::{DeviceDriver, LoopbackDriver, SerialDevice, WaitStatus};
//!
//! let driver = LoopbackDriver::new();
//! let device = driver.open("loop0").unwrap();
//! let written = device.write(b"AT\r\n").unwrap().complete(None);
//! assert!(matches!(written, WaitStatus::Completed(Ok(4))));
//! assert_eq!(driver.line("loop0").queued_input(), 4);
//! ```

use super::overlapped::{Overlapped, Submitted, WaitStatus};
use super::traits::{
    CommProperties, CommStatus, CommTimeouts, DeviceConfig, DeviceDriver, EscapeFunction,
    EventMask, LineErrors, ModemStatus, PurgeFlags, ReadTimeout, SerialDevice, WriteTimeout,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One-shot failure the next matching device call reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Write,
    Read,
    EventWait,
    Break,
}

#[derive(Debug)]
struct LineState {
    present: bool,
    open: bool,
    session: u64,
    config: DeviceConfig,
    /// When set, `comm_state` disagrees with `comm_config`.
    state_override: Option<DeviceConfig>,
    properties: CommProperties,
    timeouts: CommTimeouts,
    rx: VecDeque<u8>,
    /// Output accepted but not yet transmitted (only while stalled).
    tx: VecDeque<u8>,
    /// Output transmitted to the peer while echo is off.
    sent: Vec<u8>,
    echo: bool,
    draining: bool,
    break_on: bool,
    breaks: usize,
    dtr: bool,
    rts: bool,
    xoff_hold: bool,
    modem: ModemStatus,
    event_mask: EventMask,
    pending_events: EventMask,
    errors: LineErrors,
    fault: Option<Fault>,
}

impl Default for LineState {
    fn default() -> Self {
        Self {
            present: true,
            open: false,
            session: 0,
            config: DeviceConfig::default(),
            state_override: None,
            properties: CommProperties {
                max_rx_queue: 65536,
                max_tx_queue: 65536,
                current_rx_queue: 4096,
                current_tx_queue: 4096,
            },
            timeouts: CommTimeouts::default(),
            rx: VecDeque::new(),
            tx: VecDeque::new(),
            sent: Vec::new(),
            echo: true,
            draining: true,
            break_on: false,
            breaks: 0,
            dtr: false,
            rts: false,
            xoff_hold: false,
            modem: ModemStatus::default(),
            event_mask: EventMask::empty(),
            pending_events: EventMask::empty(),
            errors: LineErrors::empty(),
            fault: None,
        }
    }
}

impl LineState {
    fn raise(&mut self, events: EventMask) {
        let hit = events & self.event_mask;
        self.pending_events |= hit;
    }

    fn take_fault(&mut self, fault: Fault) -> bool {
        if self.fault == Some(fault) {
            self.fault = None;
            true
        } else {
            false
        }
    }

    /// Put bytes into the input queue, latching an overrun past capacity.
    fn receive(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let room = (self.properties.current_rx_queue as usize).saturating_sub(self.rx.len());
        let taken = room.min(data.len());
        self.rx.extend(&data[..taken]);
        if taken > 0 {
            self.raise(EventMask::RXCHAR);
        }
        if taken < data.len() {
            self.errors |= LineErrors::RXOVER;
            self.raise(EventMask::ERR);
        }
    }

    fn transmit(&mut self, data: &[u8]) {
        if self.echo {
            self.receive(data);
        } else {
            self.sent.extend_from_slice(data);
        }
        if self.tx.is_empty() {
            self.raise(EventMask::TXEMPTY);
        }
    }

    /// Accept as much of `data` as the line takes right now.
    fn accept(&mut self, data: &[u8]) -> usize {
        if self.draining {
            self.transmit(data);
            data.len()
        } else {
            let room = (self.properties.current_tx_queue as usize).saturating_sub(self.tx.len());
            let taken = room.min(data.len());
            self.tx.extend(&data[..taken]);
            taken
        }
    }

    fn comm_status(&self) -> CommStatus {
        CommStatus {
            cts_hold: self.config.out_cts_flow && !self.modem.cts,
            dsr_hold: self.config.out_dsr_flow && !self.modem.dsr,
            rlsd_hold: false,
            xoff_hold: self.xoff_hold,
            xoff_sent: false,
            eof: false,
            txim: false,
            in_queue: self.rx.len() as u32,
            out_queue: self.tx.len() as u32,
        }
    }

    fn take_input(&mut self, len: usize) -> Vec<u8> {
        let n = len.min(self.rx.len());
        self.rx.drain(..n).collect()
    }

    fn set_modem(&mut self, modem: ModemStatus) {
        let old = self.modem;
        let mut events = EventMask::empty();
        if old.cts != modem.cts {
            events |= EventMask::CTS;
        }
        if old.dsr != modem.dsr {
            events |= EventMask::DSR;
        }
        if old.rlsd != modem.rlsd {
            events |= EventMask::RLSD;
        }
        if modem.ring && !old.ring {
            events |= EventMask::RING;
        }
        self.modem = modem;
        self.raise(events);
    }
}

/// The wire plus the peer end of an in-memory serial port.
#[derive(Debug)]
pub struct LoopbackLine {
    name: String,
    state: Mutex<LineState>,
    changed: Condvar,
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "the handle is invalid")
}

fn fault_error(op: &str) -> io::Error {
    io::Error::other(format!("injected {op} fault"))
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

impl LoopbackLine {
    /// Create a present, echoing, draining line.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(LineState::default()),
            changed: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn update<R>(&self, f: impl FnOnce(&mut LineState) -> R) -> R {
        let mut st = self.state.lock();
        let result = f(&mut st);
        drop(st);
        self.changed.notify_all();
        result
    }

    /// Feed bytes into the port's input queue as if the peer sent them.
    pub fn inject(&self, data: &[u8]) {
        self.update(|st| st.receive(data));
    }

    /// Drain what the port transmitted while echo was off.
    pub fn take_sent(&self) -> Vec<u8> {
        self.update(|st| std::mem::take(&mut st.sent))
    }

    /// Route transmitted bytes back into the input queue.
    pub fn set_echo(&self, echo: bool) {
        self.update(|st| st.echo = echo);
    }

    /// Stop or resume transmission. A stalled line fills its transmit queue
    /// and then refuses further bytes.
    pub fn set_draining(&self, draining: bool) {
        self.update(|st| {
            st.draining = draining;
            if draining && !st.tx.is_empty() {
                let queued: Vec<u8> = st.tx.drain(..).collect();
                st.transmit(&queued);
            }
        });
    }

    pub fn set_modem_lines(&self, modem: ModemStatus) {
        self.update(|st| st.set_modem(modem));
    }

    /// Latch line errors and raise the error notification.
    pub fn raise_line_error(&self, errors: LineErrors) {
        self.update(|st| {
            st.errors |= errors;
            st.raise(EventMask::ERR);
        });
    }

    /// Arm a one-shot failure for the next matching call.
    pub fn inject_fault(&self, fault: Fault) {
        self.update(|st| st.fault = Some(fault));
    }

    /// Make the device vanish (or reappear) for subsequent opens.
    pub fn set_present(&self, present: bool) {
        self.update(|st| st.present = present);
    }

    /// Make the secondary configuration query disagree with the primary one.
    pub fn desync_state(&self) {
        self.update(|st| {
            let mut other = st.config.clone();
            other.xon_limit = other.xon_limit.wrapping_add(1);
            st.state_override = Some(other);
        });
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn queued_input(&self) -> usize {
        self.state.lock().rx.len()
    }

    pub fn queued_output(&self) -> usize {
        self.state.lock().tx.len()
    }

    /// Number of break conditions asserted since creation.
    pub fn break_count(&self) -> usize {
        self.state.lock().breaks
    }

    pub fn break_asserted(&self) -> bool {
        self.state.lock().break_on
    }

    pub fn event_mask(&self) -> EventMask {
        self.state.lock().event_mask
    }

    pub fn config(&self) -> DeviceConfig {
        self.state.lock().config.clone()
    }

    pub fn timeouts(&self) -> CommTimeouts {
        self.state.lock().timeouts
    }

    fn open_session(self: &Arc<Self>) -> io::Result<LoopbackDevice> {
        let session = self.update(|st| {
            if !st.present {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "the system cannot find the file specified",
                ));
            }
            if st.open {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "access is denied: device already open",
                ));
            }
            st.open = true;
            st.session += 1;
            Ok(st.session)
        })?;
        Ok(LoopbackDevice {
            line: Arc::clone(self),
            session,
        })
    }

    /// Block on the line until `ready` holds, the OS deadline passes or the
    /// wait ceiling passes. Returns `None` on the ceiling.
    fn wait_for<T>(
        &self,
        session: u64,
        os_deadline: Option<Instant>,
        ceiling: Option<Duration>,
        mut ready: impl FnMut(&mut LineState) -> Option<T>,
        mut at_deadline: impl FnMut(&mut LineState) -> T,
    ) -> WaitStatus<T> {
        let ceiling_at = ceiling.map(|c| Instant::now() + c);
        let mut st: MutexGuard<'_, LineState> = self.state.lock();
        loop {
            if !st.open || st.session != session {
                return WaitStatus::Completed(Err(closed_error()));
            }
            if let Some(value) = ready(&mut st) {
                drop(st);
                self.changed.notify_all();
                return WaitStatus::Completed(Ok(value));
            }
            let now = Instant::now();
            if os_deadline.is_some_and(|d| now >= d) {
                let value = at_deadline(&mut st);
                drop(st);
                self.changed.notify_all();
                return WaitStatus::Completed(Ok(value));
            }
            if ceiling_at.is_some_and(|c| now >= c) {
                return WaitStatus::Elapsed;
            }
            match earliest(os_deadline, ceiling_at) {
                Some(wake) => {
                    self.changed.wait_until(&mut st, wake);
                }
                None => self.changed.wait(&mut st),
            }
        }
    }
}

/// Handle to an open [`LoopbackLine`].
#[derive(Debug)]
pub struct LoopbackDevice {
    line: Arc<LoopbackLine>,
    session: u64,
}

impl LoopbackDevice {
    /// The line this handle is attached to.
    pub fn line(&self) -> &Arc<LoopbackLine> {
        &self.line
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut LineState) -> io::Result<R>) -> io::Result<R> {
        let mut st = self.line.state.lock();
        if !st.open || st.session != self.session {
            return Err(closed_error());
        }
        let result = f(&mut st);
        drop(st);
        self.line.changed.notify_all();
        result
    }
}

impl SerialDevice for LoopbackDevice {
    fn name(&self) -> &str {
        &self.line.name
    }

    fn comm_config(&self) -> io::Result<DeviceConfig> {
        self.with_state(|st| Ok(st.config.clone()))
    }

    fn set_comm_config(&self, config: &DeviceConfig) -> io::Result<()> {
        self.with_state(|st| {
            if config.baud_rate == 0 || !(5..=8).contains(&config.byte_size) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "the parameter is incorrect",
                ));
            }
            st.config = config.clone();
            if st.state_override.is_some() {
                st.state_override = None;
            }
            Ok(())
        })
    }

    fn comm_state(&self) -> io::Result<DeviceConfig> {
        self.with_state(|st| Ok(st.state_override.clone().unwrap_or_else(|| st.config.clone())))
    }

    fn properties(&self) -> io::Result<CommProperties> {
        self.with_state(|st| Ok(st.properties))
    }

    fn setup_queues(&self, rx_size: u32, tx_size: u32) -> io::Result<()> {
        self.with_state(|st| {
            let props = &mut st.properties;
            if rx_size == 0 || tx_size == 0 || rx_size > props.max_rx_queue || tx_size > props.max_tx_queue {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "the parameter is incorrect",
                ));
            }
            props.current_rx_queue = rx_size;
            props.current_tx_queue = tx_size;
            Ok(())
        })
    }

    fn timeouts(&self) -> io::Result<CommTimeouts> {
        self.with_state(|st| Ok(st.timeouts))
    }

    fn set_timeouts(&self, timeouts: &CommTimeouts) -> io::Result<()> {
        self.with_state(|st| {
            st.timeouts = *timeouts;
            Ok(())
        })
    }

    fn write(&self, data: &[u8]) -> io::Result<Submitted<usize>> {
        let (accepted, write_timeout) = self.with_state(|st| {
            if st.take_fault(Fault::Write) {
                return Err(fault_error("write"));
            }
            Ok((st.accept(data), st.timeouts.write))
        })?;
        if accepted == data.len() {
            return Ok(Submitted::Ready(accepted));
        }
        let os_deadline = match write_timeout {
            WriteTimeout::Immediate => return Ok(Submitted::Ready(accepted)),
            WriteTimeout::Total(d) => Some(Instant::now() + d),
            WriteTimeout::Infinite => None,
        };

        let line = Arc::clone(&self.line);
        let session = self.session;
        let rest = data[accepted..].to_vec();
        Ok(Submitted::Pending(Overlapped::new(move |ceiling| {
            let offset = Cell::new(0);
            line.wait_for(
                session,
                os_deadline,
                ceiling,
                |st| {
                    let done = offset.get() + st.accept(&rest[offset.get()..]);
                    offset.set(done);
                    (done == rest.len()).then_some(accepted + done)
                },
                |_| accepted + offset.get(),
            )
        })))
    }

    fn read(&self, len: usize) -> io::Result<Submitted<Vec<u8>>> {
        let (ready, read_timeout) = self.with_state(|st| {
            if st.take_fault(Fault::Read) {
                return Err(fault_error("read"));
            }
            let ready = match st.timeouts.read {
                ReadTimeout::Immediate => Some(st.take_input(len)),
                _ if st.rx.len() >= len => Some(st.take_input(len)),
                _ => None,
            };
            Ok((ready, st.timeouts.read))
        })?;
        if let Some(data) = ready {
            return Ok(Submitted::Ready(data));
        }
        let os_deadline = match read_timeout {
            ReadTimeout::Total(d) => Some(Instant::now() + d),
            _ => None,
        };

        let line = Arc::clone(&self.line);
        let session = self.session;
        Ok(Submitted::Pending(Overlapped::new(move |ceiling| {
            line.wait_for(
                session,
                os_deadline,
                ceiling,
                |st| (st.rx.len() >= len).then(|| st.take_input(len)),
                |st| st.take_input(len),
            )
        })))
    }

    fn clear_errors(&self) -> io::Result<(LineErrors, CommStatus)> {
        self.with_state(|st| {
            let status = st.comm_status();
            Ok((std::mem::take(&mut st.errors), status))
        })
    }

    fn line_status(&self) -> io::Result<(LineErrors, CommStatus)> {
        self.with_state(|st| Ok((st.errors, st.comm_status())))
    }

    fn purge(&self, flags: PurgeFlags) -> io::Result<()> {
        self.with_state(|st| {
            if flags.contains(PurgeFlags::RXCLEAR) {
                st.rx.clear();
            }
            if flags.contains(PurgeFlags::TXCLEAR) {
                st.tx.clear();
            }
            Ok(())
        })
    }

    fn flush_output(&self) -> io::Result<()> {
        self.with_state(|st| {
            if st.tx.is_empty() {
                Ok(())
            } else {
                Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "transmit queue stalled",
                ))
            }
        })
    }

    fn set_break(&self) -> io::Result<()> {
        self.with_state(|st| {
            if st.take_fault(Fault::Break) {
                return Err(fault_error("break"));
            }
            st.break_on = true;
            st.breaks += 1;
            if st.echo {
                st.errors |= LineErrors::BREAK;
                st.raise(EventMask::BREAK);
            }
            Ok(())
        })
    }

    fn clear_break(&self) -> io::Result<()> {
        self.with_state(|st| {
            st.break_on = false;
            Ok(())
        })
    }

    fn escape(&self, function: EscapeFunction) -> io::Result<()> {
        match function {
            EscapeFunction::SetBreak => return self.set_break(),
            EscapeFunction::ClrBreak => return self.clear_break(),
            _ => {}
        }
        self.with_state(|st| {
            // A loopback plug wires DTR to DSR and RTS to CTS.
            let mut modem = st.modem;
            match function {
                EscapeFunction::SetDtr => st.dtr = true,
                EscapeFunction::ClrDtr => st.dtr = false,
                EscapeFunction::SetRts => st.rts = true,
                EscapeFunction::ClrRts => st.rts = false,
                EscapeFunction::SetXoff => st.xoff_hold = true,
                EscapeFunction::SetXon => st.xoff_hold = false,
                EscapeFunction::SetBreak | EscapeFunction::ClrBreak => {}
            }
            modem.dsr = st.dtr;
            modem.cts = st.rts;
            st.set_modem(modem);
            Ok(())
        })
    }

    fn event_mask(&self) -> io::Result<EventMask> {
        self.with_state(|st| Ok(st.event_mask))
    }

    fn set_event_mask(&self, mask: EventMask) -> io::Result<()> {
        self.with_state(|st| {
            st.event_mask = mask;
            st.pending_events = st.pending_events & mask;
            Ok(())
        })
    }

    fn wait_event(&self) -> io::Result<Submitted<EventMask>> {
        self.with_state(|st| {
            if st.take_fault(Fault::EventWait) {
                return Err(fault_error("event wait"));
            }
            Ok(())
        })?;
        let line = Arc::clone(&self.line);
        let session = self.session;
        Ok(Submitted::Pending(Overlapped::new(move |ceiling| {
            line.wait_for(
                session,
                None,
                ceiling,
                |st| {
                    if st.event_mask.is_empty() {
                        return Some(EventMask::empty());
                    }
                    let fired = st.pending_events & st.event_mask;
                    if fired.is_empty() {
                        None
                    } else {
                        st.pending_events.remove(fired);
                        Some(fired)
                    }
                },
                |_| EventMask::empty(),
            )
        })))
    }

    fn modem_status(&self) -> io::Result<ModemStatus> {
        self.with_state(|st| Ok(st.modem))
    }

    fn close(&self) {
        let mut st = self.line.state.lock();
        if st.open && st.session == self.session {
            st.open = false;
            st.event_mask = EventMask::empty();
            st.pending_events = EventMask::empty();
            st.timeouts = CommTimeouts::default();
            st.break_on = false;
            st.tx.clear();
        }
        drop(st);
        self.line.changed.notify_all();
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens [`LoopbackDevice`]s, creating lines on first use.
#[derive(Debug, Default)]
pub struct LoopbackDriver {
    lines: Mutex<HashMap<String, Arc<LoopbackLine>>>,
}

impl LoopbackDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peer-side access to the line at `path`, creating it if needed.
    pub fn line(&self, path: &str) -> Arc<LoopbackLine> {
        let mut lines = self.lines.lock();
        Arc::clone(
            lines
                .entry(path.to_string())
                .or_insert_with(|| Arc::new(LoopbackLine::new(path))),
        )
    }
}

impl DeviceDriver for LoopbackDriver {
    fn open(&self, path: &str) -> io::Result<Arc<dyn SerialDevice>> {
        let device = self.line(path).open_session()?;
        Ok(Arc::new(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(driver: &LoopbackDriver, path: &str) -> Arc<dyn SerialDevice> {
        driver.open(path).expect("open loopback")
    }

    fn completed<T: std::fmt::Debug>(status: WaitStatus<T>) -> T {
        match status {
            WaitStatus::Completed(Ok(v)) => v,
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_echo_write_then_read() {
        let driver = LoopbackDriver::new();
        let device = open(&driver, "loop0");
        assert_eq!(completed(device.write(b"Hello").unwrap().complete(None)), 5);

        let data = completed(device.read(5).unwrap().complete(None));
        assert_eq!(data, b"Hello");
    }

    #[test]
    fn test_exclusive_open() {
        let driver = LoopbackDriver::new();
        let _first = open(&driver, "loop0");
        let err = driver.open("loop0").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_closed_handle_fails() {
        let driver = LoopbackDriver::new();
        let device = open(&driver, "loop0");
        device.close();
        assert!(device.comm_config().is_err());
        // A fresh session does not revive the old handle.
        let _second = open(&driver, "loop0");
        assert!(device.properties().is_err());
    }

    #[test]
    fn test_absent_device() {
        let driver = LoopbackDriver::new();
        driver.line("ghost").set_present(false);
        let err = driver.open("ghost").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_stalled_line_times_out_with_partial_count() {
        let driver = LoopbackDriver::new();
        let line = driver.line("loop0");
        let device = open(&driver, "loop0");
        device.setup_queues(4096, 4).unwrap();
        device
            .set_timeouts(&CommTimeouts {
                read: ReadTimeout::Immediate,
                write: WriteTimeout::Total(Duration::from_millis(30)),
            })
            .unwrap();
        line.set_draining(false);

        let n = completed(device.write(b"0123456789").unwrap().complete(None));
        assert_eq!(n, 4);
        assert_eq!(line.queued_output(), 4);
    }

    #[test]
    fn test_ceiling_elapses_before_os_deadline() {
        let driver = LoopbackDriver::new();
        let line = driver.line("loop0");
        let device = open(&driver, "loop0");
        device.setup_queues(4096, 1).unwrap();
        line.set_draining(false);

        let status = device
            .write(b"abc")
            .unwrap()
            .complete(Some(Duration::from_millis(20)));
        assert!(matches!(status, WaitStatus::Elapsed));
    }

    #[test]
    fn test_total_read_timeout_returns_partial() {
        let driver = LoopbackDriver::new();
        let line = driver.line("loop0");
        let device = open(&driver, "loop0");
        device
            .set_timeouts(&CommTimeouts {
                read: ReadTimeout::Total(Duration::from_millis(20)),
                write: WriteTimeout::Infinite,
            })
            .unwrap();
        line.inject(b"ab");
        let data = completed(device.read(8).unwrap().complete(None));
        assert_eq!(data, b"ab");
    }

    #[test]
    fn test_wait_event_reports_rxchar_and_mask_clear() {
        let driver = LoopbackDriver::new();
        let line = driver.line("loop0");
        let device = open(&driver, "loop0");
        device
            .set_event_mask(EventMask::RXCHAR | EventMask::ERR)
            .unwrap();

        line.inject(b"x");
        let fired = completed(device.wait_event().unwrap().complete(None));
        assert_eq!(fired, EventMask::RXCHAR);

        let pending = device.wait_event().unwrap();
        let waiter = std::thread::spawn(move || pending.complete(Some(Duration::from_secs(5))));
        std::thread::sleep(Duration::from_millis(20));
        device.set_event_mask(EventMask::empty()).unwrap();
        let fired = completed(waiter.join().unwrap());
        assert!(fired.is_empty());
    }

    #[test]
    fn test_wait_event_fails_after_close() {
        let driver = LoopbackDriver::new();
        let device = open(&driver, "loop0");
        device.set_event_mask(EventMask::RXCHAR).unwrap();
        let pending = device.wait_event().unwrap();
        device.close();
        assert!(matches!(
            pending.complete(Some(Duration::from_secs(1))),
            WaitStatus::Completed(Err(_))
        ));
    }

    #[test]
    fn test_rx_overflow_latches_error() {
        let driver = LoopbackDriver::new();
        let line = driver.line("loop0");
        let device = open(&driver, "loop0");
        device.setup_queues(2, 16).unwrap();
        line.inject(b"abcd");
        let (errors, status) = device.clear_errors().unwrap();
        assert!(errors.contains(LineErrors::RXOVER));
        assert_eq!(status.in_queue, 2);
        let (errors, _) = device.clear_errors().unwrap();
        assert!(errors.is_empty());
    }

    #[test]
    fn test_escape_drives_looped_modem_lines() {
        let driver = LoopbackDriver::new();
        let device = open(&driver, "loop0");
        device.escape(EscapeFunction::SetDtr).unwrap();
        device.escape(EscapeFunction::SetRts).unwrap();
        let modem = device.modem_status().unwrap();
        assert!(modem.dsr && modem.cts);
        device.escape(EscapeFunction::ClrRts).unwrap();
        assert!(!device.modem_status().unwrap().cts);
    }

    #[test]
    fn test_injected_fault_is_one_shot() {
        let driver = LoopbackDriver::new();
        let line = driver.line("loop0");
        let device = open(&driver, "loop0");
        line.inject_fault(Fault::Write);
        assert!(device.write(b"a").is_err());
        assert!(device.write(b"a").is_ok());
    }
}
