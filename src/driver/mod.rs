//! Serial port controller.
//!
//! [`PortController`] owns one serial line: the open device handle, the
//! per-direction timeout caches, the deadline timer and the event monitor.
//! It implements the framework capabilities ([`Common`], [`OptionAccess`],
//! [`Octet`]) on top of the overlapped device primitives.
//!
//! Transfers run without holding the link lock; callers serialise reads and
//! writes on one port. A hard I/O failure closes the link so later calls
//! fail fast with "disconnected" until the next `connect`.

pub mod monitor;
pub mod options;
pub mod report;
pub mod signal;

use self::monitor::{EventMonitor, MonitorShared};
use self::options::{OptionChange, OptionKey, OptionSnapshot};
use self::report::{write_report, ReportContext};
use self::signal::AutoResetEvent;
use crate::interface::{
    Common, ConnectionObserver, EomReason, IoRequest, Octet, OptionAccess, ReadOutcome, Status,
    WriteOutcome,
};
use crate::port::{
    DeviceDriver, EventMask, PortError, PortResult, PurgeFlags, ReadTimeout, SerialDevice,
    WaitStatus, WriteTimeout,
};
use crate::timer::{Timer, TimerQueue};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Notification bits the driver always keeps enabled.
pub const REQUIRED_EVENTS: EventMask = EventMask::RXCHAR.union(EventMask::ERR);

/// Timing constants of the transfer paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverSettings {
    /// Added to a positive write timeout to form the OS write deadline, so
    /// the deadline timer fires first.
    pub write_deadline_margin: Duration,
    /// Added to the OS deadline to bound every completion wait.
    pub wait_safety_margin: Duration,
    /// How long disconnect waits for the event monitor to exit.
    pub monitor_join_timeout: Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            write_deadline_margin: Duration::from_millis(100),
            wait_safety_margin: Duration::from_millis(1000),
            monitor_join_timeout: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug)]
struct LinkState {
    device: Option<Arc<dyn SerialDevice>>,
    monitor: Option<EventMonitor>,
    /// Last timeouts programmed into the OS; `None` until the first
    /// transfer after connect.
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    break_duration_ms: u32,
    break_delay_ms: u32,
    flush_on_write: bool,
    requested_mask: EventMask,
}

/// Controller for one serial line.
pub struct PortController {
    port_name: String,
    device_name: String,
    driver: Arc<dyn DeviceDriver>,
    observer: Arc<dyn ConnectionObserver>,
    settings: DriverSettings,
    timer: Timer,
    timed_out: Arc<AtomicBool>,
    rx_ready: Arc<AutoResetEvent>,
    monitor_shared: Arc<MonitorShared>,
    n_read: AtomicU64,
    n_written: AtomicU64,
    link: Mutex<LinkState>,
}

fn same_device(a: &Arc<dyn SerialDevice>, b: &Arc<dyn SerialDevice>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl PortController {
    /// Create a disconnected controller bound to a timer from `timers`.
    pub fn new(
        port_name: impl Into<String>,
        device_name: impl Into<String>,
        driver: Arc<dyn DeviceDriver>,
        timers: &TimerQueue,
        settings: DriverSettings,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Self {
        let port_name = port_name.into();
        let timed_out = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&timed_out);
        let timer_port = port_name.clone();
        let timer = timers.create_timer(move || {
            trace!(port = %timer_port, "write deadline expired");
            flag.store(true, Ordering::Release);
        });
        let rx_ready = Arc::new(AutoResetEvent::new());
        let monitor_shared = Arc::new(MonitorShared::new(Arc::clone(&rx_ready), EventMask::ERR));

        Self {
            port_name,
            device_name: device_name.into(),
            driver,
            observer,
            settings,
            timer,
            timed_out,
            rx_ready,
            monitor_shared,
            n_read: AtomicU64::new(0),
            n_written: AtomicU64::new(0),
            link: Mutex::new(LinkState {
                device: None,
                monitor: None,
                read_timeout: None,
                write_timeout: None,
                break_duration_ms: 0,
                break_delay_ms: 0,
                flush_on_write: false,
                requested_mask: EventMask::ERR,
            }),
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// OS-level device path.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().device.is_some()
    }

    /// Bytes written since the controller was created.
    pub fn bytes_written(&self) -> u64 {
        self.n_written.load(Ordering::Relaxed)
    }

    /// Bytes read since the controller was created.
    pub fn bytes_read(&self) -> u64 {
        self.n_read.load(Ordering::Relaxed)
    }

    /// Whether an event monitor thread is currently running.
    pub fn monitor_running(&self) -> bool {
        self.link
            .lock()
            .monitor
            .as_ref()
            .is_some_and(|m| !m.is_finished())
    }

    /// Open the device and start the event monitor.
    pub fn connect(&self) -> PortResult<()> {
        let mut link = self.link.lock();
        if link.device.is_some() {
            return Err(PortError::AlreadyConnected {
                device: self.device_name.clone(),
            });
        }
        debug!(port = %self.port_name, device = %self.device_name, "open connection");

        let device = self
            .driver
            .open(&self.device_name)
            .map_err(|source| PortError::Open {
                device: self.device_name.clone(),
                source,
            })?;

        // A break may be left over from a previous owner.
        if let Err(e) = device.clear_break() {
            debug!(device = %self.device_name, error = %e, "clear break on open failed");
        }
        if let Err(e) = device.flush_output() {
            device.close();
            return Err(PortError::os(&self.device_name, "flush buffers", e));
        }
        let mask = link.requested_mask | REQUIRED_EVENTS;
        if let Err(e) = device.set_event_mask(mask) {
            device.close();
            return Err(PortError::os(&self.device_name, "set event mask", e));
        }

        self.rx_ready.reset();
        self.monitor_shared.set_report_mask(link.requested_mask);
        let monitor = match EventMonitor::spawn(
            &self.port_name,
            Arc::clone(&device),
            Arc::clone(&self.monitor_shared),
        ) {
            Ok(monitor) => monitor,
            Err(source) => {
                let _ = device.set_event_mask(EventMask::empty());
                device.close();
                return Err(PortError::MonitorSpawn {
                    device: self.device_name.clone(),
                    source,
                });
            }
        };

        link.device = Some(device);
        link.monitor = Some(monitor);
        link.read_timeout = None;
        link.write_timeout = None;
        drop(link);

        info!(port = %self.port_name, device = %self.device_name, "connected");
        self.observer.connected(&self.port_name);
        Ok(())
    }

    /// Close the link. A no-op when already disconnected.
    pub fn disconnect(&self) -> PortResult<()> {
        let mut link = self.link.lock();
        let closed = self.close_link(&mut link);
        drop(link);

        if closed {
            self.observer.disconnected(&self.port_name);
        }
        Ok(())
    }

    /// Tear down the open link. Returns whether one was open. The caller
    /// notifies the observer once the link lock is released.
    fn close_link(&self, link: &mut LinkState) -> bool {
        let Some(device) = link.device.take() else {
            return false;
        };
        debug!(port = %self.port_name, device = %self.device_name, "close connection");

        // Clearing the mask is the monitor's exit signal; it must happen
        // before the handle goes away.
        if let Err(e) = device.set_event_mask(EventMask::empty()) {
            debug!(device = %self.device_name, error = %e, "clearing event mask failed");
        }
        if let Some(monitor) = link.monitor.take() {
            monitor.shutdown(self.settings.monitor_join_timeout);
        }
        device.close();
        link.read_timeout = None;
        link.write_timeout = None;

        info!(port = %self.port_name, device = %self.device_name, "disconnected");
        true
    }

    /// Close after a hard failure, unless the link was already replaced.
    fn close_if_current(&self, device: &Arc<dyn SerialDevice>) {
        let mut link = self.link.lock();
        if !link.device.as_ref().is_some_and(|d| same_device(d, device)) {
            return;
        }
        warn!(port = %self.port_name, "closing connection after I/O failure");
        let closed = self.close_link(&mut link);
        drop(link);

        if closed {
            self.observer.disconnected(&self.port_name);
        }
    }

    fn fail(&self, device: &Arc<dyn SerialDevice>, err: PortError) -> Status {
        warn!(port = %self.port_name, error = %err, "transfer failed");
        if err.is_fatal() {
            self.close_if_current(device);
        }
        Status::Error(err)
    }

    /// Write `data`, honouring the request timeout.
    pub fn write(&self, req: &IoRequest, data: &[u8]) -> WriteOutcome {
        let (device, timeout, flush_on_write, break_delay, break_duration) = {
            let mut link = self.link.lock();
            let Some(device) = link.device.clone() else {
                return WriteOutcome::failed(PortError::disconnected(&self.device_name));
            };
            if data.is_empty() {
                return WriteOutcome::new(0, Status::Success);
            }
            if let Some(requested) = req.timeout {
                if link.write_timeout != Some(requested) {
                    if let Err(err) = self.program_write_timeout(device.as_ref(), requested) {
                        return WriteOutcome::failed(err);
                    }
                    link.write_timeout = Some(requested);
                }
            }
            (
                device,
                link.write_timeout,
                link.flush_on_write,
                link.break_delay_ms,
                link.break_duration_ms,
            )
        };
        debug!(port = %self.port_name, len = data.len(), ?timeout, "write");

        // Bounded even before any timeout has been cached.
        let ceiling = timeout.map_or(self.settings.wait_safety_margin, |t| {
            t + self.settings.write_deadline_margin + self.settings.wait_safety_margin
        });
        let deadline = timeout.filter(|t| !t.is_zero());
        self.timed_out.store(false, Ordering::Release);
        if let Some(t) = deadline {
            self.timer.start_delay(t);
        }

        let mut written = 0;
        let mut status = Status::Success;
        while written < data.len() {
            let chunk = &data[written..];
            let n = match self.write_chunk(&device, chunk, ceiling) {
                Ok(n) => n,
                Err(err) => {
                    status = self.fail(&device, err);
                    break;
                }
            };
            if n < chunk.len() {
                self.timed_out.store(true, Ordering::Release);
            }
            if flush_on_write {
                if let Err(e) = device.flush_output() {
                    written += n;
                    status = self.fail(&device, PortError::io(&self.device_name, "flush", e));
                    break;
                }
            }
            trace!(port = %self.port_name, bytes = ?&chunk[..n], "wrote");
            written += n;
            if written == data.len() {
                break;
            }
            if self.timed_out.load(Ordering::Acquire) || timeout == Some(Duration::ZERO) {
                status = Status::Timeout;
                break;
            }
            if n == 0 {
                std::thread::yield_now();
            }
        }
        if deadline.is_some() {
            self.timer.cancel();
        }

        if break_duration > 0 && !status.is_error() {
            if let Err(err) = self.send_break(&device, break_delay, break_duration) {
                status = self.fail(&device, err);
            }
        }

        self.n_written.fetch_add(written as u64, Ordering::Relaxed);
        WriteOutcome::new(written, status)
    }

    fn program_write_timeout(&self, device: &dyn SerialDevice, timeout: Duration) -> PortResult<()> {
        let mut timeouts = device
            .timeouts()
            .map_err(|e| PortError::os(&self.device_name, "get timeouts", e))?;
        timeouts.write = if timeout.is_zero() {
            WriteTimeout::Immediate
        } else {
            WriteTimeout::Total(timeout + self.settings.write_deadline_margin)
        };
        device
            .set_timeouts(&timeouts)
            .map_err(|e| PortError::os(&self.device_name, "set timeouts", e))
    }

    fn write_chunk(
        &self,
        device: &Arc<dyn SerialDevice>,
        chunk: &[u8],
        ceiling: Duration,
    ) -> PortResult<usize> {
        let submitted = device
            .write(chunk)
            .map_err(|e| PortError::io(&self.device_name, "write", e))?;
        let n = match submitted.complete(Some(ceiling)) {
            WaitStatus::Completed(Ok(n)) => n,
            WaitStatus::Completed(Err(e)) => return Err(PortError::io(&self.device_name, "write", e)),
            WaitStatus::Elapsed => {
                return Err(PortError::WaitElapsed {
                    device: self.device_name.clone(),
                    op: "write",
                    ceiling,
                })
            }
        };
        if n > chunk.len() {
            return Err(PortError::SizeMismatch {
                device: self.device_name.clone(),
                op: "write",
                requested: chunk.len(),
                actual: n,
            });
        }
        Ok(n)
    }

    fn send_break(&self, device: &Arc<dyn SerialDevice>, delay_ms: u32, duration_ms: u32) -> PortResult<()> {
        device
            .flush_output()
            .map_err(|e| PortError::io(&self.device_name, "flush", e))?;
        if delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(u64::from(delay_ms)));
        }
        device
            .set_break()
            .map_err(|e| PortError::io(&self.device_name, "set break", e))?;
        std::thread::sleep(Duration::from_millis(u64::from(duration_ms)));
        device
            .clear_break()
            .map_err(|e| PortError::io(&self.device_name, "clear break", e))?;
        debug!(port = %self.port_name, delay_ms, duration_ms, "break sent");
        Ok(())
    }

    /// Read into `buf`, honouring the request timeout.
    pub fn read(&self, req: &IoRequest, buf: &mut [u8]) -> ReadOutcome {
        let (device, timeout) = {
            let mut link = self.link.lock();
            let Some(device) = link.device.clone() else {
                return ReadOutcome::failed(PortError::disconnected(&self.device_name));
            };
            if buf.is_empty() {
                return ReadOutcome::failed(PortError::BadCapacity {
                    device: self.device_name.clone(),
                    capacity: 0,
                });
            }
            if let Some(requested) = req.timeout {
                if link.read_timeout != Some(requested) {
                    if let Err(err) = self.program_read_timeout(device.as_ref(), requested) {
                        return ReadOutcome::failed(err);
                    }
                    link.read_timeout = Some(requested);
                }
            }
            (device, link.read_timeout)
        };
        debug!(port = %self.port_name, capacity = buf.len(), ?timeout, "read");

        let ceiling = timeout.map_or(self.settings.wait_safety_margin, |t| {
            t + self.settings.wait_safety_margin
        });
        let mut total = 0;
        let mut status = Status::Success;
        if let Err(err) = self.read_into(&device, timeout, ceiling, buf, &mut total) {
            status = self.fail(&device, err);
        }
        if total == 0 && status.is_success() {
            status = Status::Timeout;
        }

        let mut eom = EomReason::empty();
        if total < buf.len() {
            buf[total] = 0;
        } else {
            eom |= EomReason::CNT;
        }
        if total > 0 {
            trace!(port = %self.port_name, bytes = ?&buf[..total], "read");
        }
        self.n_read.fetch_add(total as u64, Ordering::Relaxed);
        ReadOutcome::new(total, eom, status)
    }

    fn program_read_timeout(&self, device: &dyn SerialDevice, timeout: Duration) -> PortResult<()> {
        let mut timeouts = device
            .timeouts()
            .map_err(|e| PortError::os(&self.device_name, "get timeouts", e))?;
        timeouts.read = if timeout.is_zero() {
            ReadTimeout::Immediate
        } else {
            ReadTimeout::Total(timeout)
        };
        device
            .set_timeouts(&timeouts)
            .map_err(|e| PortError::os(&self.device_name, "set timeouts", e))
    }

    /// One byte first, then whatever else is already queued.
    fn read_into(
        &self,
        device: &Arc<dyn SerialDevice>,
        timeout: Option<Duration>,
        ceiling: Duration,
        buf: &mut [u8],
        total: &mut usize,
    ) -> PortResult<()> {
        if let Some(budget) = timeout {
            if !self.await_input(device.as_ref(), budget)? {
                return Ok(());
            }
        }

        let first = self.read_chunk(device, 1, ceiling)?;
        buf[..first.len()].copy_from_slice(&first);
        *total = first.len();
        if *total == 0 || *total == buf.len() {
            return Ok(());
        }

        let (_, status) = device
            .line_status()
            .map_err(|e| PortError::io(&self.device_name, "line status", e))?;
        let more = (status.in_queue as usize).min(buf.len() - *total);
        if more > 0 {
            let rest = self.read_chunk(device, more, ceiling)?;
            buf[*total..*total + rest.len()].copy_from_slice(&rest);
            *total += rest.len();
        }
        Ok(())
    }

    /// Wait until the input queue is non-empty or `budget` runs out.
    fn await_input(&self, device: &dyn SerialDevice, budget: Duration) -> PortResult<bool> {
        let deadline = Instant::now() + budget;
        loop {
            let (errors, status) = device
                .clear_errors()
                .map_err(|e| PortError::io(&self.device_name, "line status", e))?;
            if !errors.is_empty() {
                warn!(port = %self.port_name, ?errors, "line errors cleared");
            }
            if status.in_queue > 0 {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            self.rx_ready.wait_timeout(remaining);
        }
    }

    fn read_chunk(
        &self,
        device: &Arc<dyn SerialDevice>,
        len: usize,
        ceiling: Duration,
    ) -> PortResult<Vec<u8>> {
        let submitted = device
            .read(len)
            .map_err(|e| PortError::io(&self.device_name, "read", e))?;
        let data = match submitted.complete(Some(ceiling)) {
            WaitStatus::Completed(Ok(data)) => data,
            WaitStatus::Completed(Err(e)) => return Err(PortError::io(&self.device_name, "read", e)),
            WaitStatus::Elapsed => {
                return Err(PortError::WaitElapsed {
                    device: self.device_name.clone(),
                    op: "read",
                    ceiling,
                })
            }
        };
        if data.len() > len {
            return Err(PortError::SizeMismatch {
                device: self.device_name.clone(),
                op: "read",
                requested: len,
                actual: data.len(),
            });
        }
        Ok(data)
    }

    /// Discard queued input.
    pub fn flush(&self) -> PortResult<()> {
        let device = self
            .link
            .lock()
            .device
            .clone()
            .ok_or_else(|| PortError::disconnected(&self.device_name))?;
        debug!(port = %self.port_name, "flush");
        device
            .purge(PurgeFlags::RXCLEAR)
            .map_err(|e| PortError::os(&self.device_name, "purge", e))
    }

    pub fn get_option(&self, key: &str) -> PortResult<String> {
        let link = self.link.lock();
        let device = link
            .device
            .as_ref()
            .ok_or_else(|| PortError::disconnected(&self.device_name))?;
        let key = OptionKey::parse(key)?;
        let config = device
            .comm_config()
            .map_err(|e| PortError::os(&self.device_name, "get config", e))?;
        let properties = device
            .properties()
            .map_err(|e| PortError::os(&self.device_name, "get properties", e))?;
        let value = options::render(
            key,
            &OptionSnapshot {
                config: &config,
                properties: &properties,
                break_duration_ms: link.break_duration_ms,
                break_delay_ms: link.break_delay_ms,
                flush_on_write: link.flush_on_write,
                requested_mask: link.requested_mask,
            },
        )?;
        trace!(port = %self.port_name, key = key.as_str(), %value, "get option");
        Ok(value)
    }

    pub fn set_option(&self, key: &str, value: &str) -> PortResult<()> {
        let mut link = self.link.lock();
        let device = link
            .device
            .clone()
            .ok_or_else(|| PortError::disconnected(&self.device_name))?;
        let key = OptionKey::parse(key)?;
        debug!(port = %self.port_name, key = key.as_str(), value, "set option");

        // Fetched fresh so fields changed behind our back are preserved.
        let config = device
            .comm_config()
            .map_err(|e| PortError::os(&self.device_name, "get config", e))?;
        let properties = device
            .properties()
            .map_err(|e| PortError::os(&self.device_name, "get properties", e))?;

        match options::parse_change(key, value, &config, &properties)? {
            OptionChange::Config(updated) => device
                .set_comm_config(&updated)
                .map_err(|e| PortError::os(&self.device_name, "set config", e))?,
            OptionChange::Queues { rx, tx } => device
                .setup_queues(rx, tx)
                .map_err(|e| PortError::os(&self.device_name, "setup queues", e))?,
            OptionChange::BreakDuration(ms) => link.break_duration_ms = ms,
            OptionChange::BreakDelay(ms) => link.break_delay_ms = ms,
            OptionChange::FlushOnWrite(on) => link.flush_on_write = on,
            OptionChange::EventMask(mask) => {
                device
                    .set_event_mask(mask | REQUIRED_EVENTS)
                    .map_err(|e| PortError::os(&self.device_name, "set event mask", e))?;
                link.requested_mask = mask;
                self.monitor_shared.set_report_mask(mask);
            }
            OptionChange::Purge(flags) => device
                .purge(flags)
                .map_err(|e| PortError::os(&self.device_name, "purge", e))?,
            OptionChange::Escape(function) => device
                .escape(function)
                .map_err(|e| PortError::os(&self.device_name, "escape", e))?,
        }
        Ok(())
    }

    /// Write a diagnostic report; see [`report`] for the levels.
    pub fn report(&self, out: &mut dyn io::Write, level: u32) -> io::Result<()> {
        let link = self.link.lock();
        let ctx = ReportContext {
            port_name: &self.port_name,
            device_name: &self.device_name,
            device: link.device.as_deref(),
            n_written: self.bytes_written(),
            n_read: self.bytes_read(),
            break_duration_ms: link.break_duration_ms,
            break_delay_ms: link.break_delay_ms,
            flush_on_write: link.flush_on_write,
            requested_mask: link.requested_mask,
            read_timeout: link.read_timeout,
            write_timeout: link.write_timeout,
            monitor: &self.monitor_shared,
            monitor_running: link.monitor.as_ref().is_some_and(|m| !m.is_finished()),
        };
        write_report(out, level, &ctx)
    }
}

impl std::fmt::Debug for PortController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortController")
            .field("port_name", &self.port_name)
            .field("device_name", &self.device_name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Drop for PortController {
    fn drop(&mut self) {
        let closed = {
            let mut link = self.link.lock();
            self.close_link(&mut link)
        };
        if closed {
            self.observer.disconnected(&self.port_name);
        }
    }
}

impl Common for PortController {
    fn report(&self, out: &mut dyn io::Write, level: u32) -> io::Result<()> {
        PortController::report(self, out, level)
    }

    fn connect(&self) -> PortResult<()> {
        PortController::connect(self)
    }

    fn disconnect(&self) -> PortResult<()> {
        PortController::disconnect(self)
    }
}

impl OptionAccess for PortController {
    fn get_option(&self, key: &str) -> PortResult<String> {
        PortController::get_option(self, key)
    }

    fn set_option(&self, key: &str, value: &str) -> PortResult<()> {
        PortController::set_option(self, key, value)
    }
}

impl Octet for PortController {
    fn write(&self, req: &IoRequest, data: &[u8]) -> WriteOutcome {
        PortController::write(self, req, data)
    }

    fn read(&self, req: &IoRequest, buf: &mut [u8]) -> ReadOutcome {
        PortController::read(self, req, buf)
    }

    fn flush(&self, _req: &IoRequest) -> PortResult<()> {
        PortController::flush(self)
    }

    fn port_name(&self) -> &str {
        &self.port_name
    }
}
