//! Background watcher for line-status notifications.
//!
//! One monitor thread runs per open port. It arms a wait for the conditions
//! in the device's notification mask, releases the read path's byte-arrival
//! signal on `RXCHAR`, and logs the conditions the caller asked to see. The
//! thread exits when the mask is cleared to zero, when a stop is requested,
//! or when any wait on the handle fails. It never closes the connection
//! itself.

use super::signal::AutoResetEvent;
use crate::port::{EventMask, SerialDevice, WaitStatus};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A batch of conditions reported by one completed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorEvent {
    pub at: DateTime<Local>,
    pub fired: EventMask,
}

/// State shared between a controller and its monitor threads.
///
/// Outlives individual connections so reports keep the last event seen.
#[derive(Debug)]
pub struct MonitorShared {
    rx_ready: Arc<AutoResetEvent>,
    report_mask: AtomicU32,
    last_event: Mutex<Option<MonitorEvent>>,
    events: AtomicU64,
}

impl MonitorShared {
    pub fn new(rx_ready: Arc<AutoResetEvent>, report_mask: EventMask) -> Self {
        Self {
            rx_ready,
            report_mask: AtomicU32::new(report_mask.bits()),
            last_event: Mutex::new(None),
            events: AtomicU64::new(0),
        }
    }

    /// Conditions that get a diagnostic line when they fire.
    pub fn report_mask(&self) -> EventMask {
        EventMask::from_bits_truncate(self.report_mask.load(Ordering::Acquire))
    }

    pub fn set_report_mask(&self, mask: EventMask) {
        self.report_mask.store(mask.bits(), Ordering::Release);
    }

    pub fn last_event(&self) -> Option<MonitorEvent> {
        *self.last_event.lock()
    }

    /// Completed waits since the controller was created.
    pub fn event_count(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    fn record(&self, fired: EventMask) -> MonitorEvent {
        let event = MonitorEvent {
            at: Local::now(),
            fired,
        };
        *self.last_event.lock() = Some(event);
        self.events.fetch_add(1, Ordering::Relaxed);
        event
    }
}

/// Handle to a running monitor thread.
#[derive(Debug)]
pub struct EventMonitor {
    port: String,
    stop: Arc<AtomicBool>,
    done: mpsc::Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl EventMonitor {
    /// Start watching `device` on a dedicated thread.
    pub fn spawn(
        port: &str,
        device: Arc<dyn SerialDevice>,
        shared: Arc<MonitorShared>,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done) = mpsc::channel();
        let thread_port = port.to_string();
        let thread_stop = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name(format!("{port}-events"))
            .spawn(move || {
                run(&thread_port, device.as_ref(), &shared, &thread_stop);
                let _ = done_tx.send(());
            })?;
        debug!(port, "event monitor started");

        Ok(Self {
            port: port.to_string(),
            stop,
            done,
            handle: Some(handle),
        })
    }

    /// Whether the thread has left its loop.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Ask the thread to stop and wait up to `bound` for it to exit.
    ///
    /// The caller clears the device's notification mask first so a pending
    /// wait completes. Returns `false` and detaches the thread if it did not
    /// exit in time.
    pub fn shutdown(mut self, bound: Duration) -> bool {
        self.stop.store(true, Ordering::Release);
        match self.done.recv_timeout(bound) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    if handle.join().is_err() {
                        warn!(port = %self.port, "event monitor panicked");
                    }
                }
                debug!(port = %self.port, "event monitor joined");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    port = %self.port,
                    bound_ms = bound.as_millis() as u64,
                    "event monitor did not exit in time; detaching"
                );
                self.handle.take();
                false
            }
        }
    }
}

fn run(port: &str, device: &dyn SerialDevice, shared: &MonitorShared, stop: &AtomicBool) {
    loop {
        if stop.load(Ordering::Acquire) {
            debug!(port, "event monitor stop requested");
            break;
        }
        let mask = match device.event_mask() {
            Ok(mask) => mask,
            Err(e) => {
                debug!(port, error = %e, "event mask query failed; monitor exiting");
                break;
            }
        };
        if mask.is_empty() {
            debug!(port, "event mask cleared; monitor exiting");
            break;
        }

        let fired = match device.wait_event().map(|op| op.complete(None)) {
            Ok(WaitStatus::Completed(Ok(fired))) => fired,
            Ok(WaitStatus::Completed(Err(e))) | Err(e) => {
                debug!(port, error = %e, "event wait failed; monitor exiting");
                break;
            }
            Ok(WaitStatus::Elapsed) => continue,
        };
        if fired.is_empty() {
            continue;
        }

        if fired.contains(EventMask::RXCHAR) {
            shared.rx_ready.set();
        }
        let event = shared.record(fired);

        let shown = fired & shared.report_mask();
        for (name, _) in shown.iter_names() {
            let at = event.at.format("%Y/%m/%d %H:%M:%S%.6f").to_string();
            if name == "ERR" || name == "BREAK" {
                warn!(port, event = name, %at, "line condition");
            } else {
                info!(port, event = name, %at, "line condition");
            }
        }
    }
}
