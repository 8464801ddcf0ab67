//! Enforce a minimum spacing between writes.

use crate::interface::{IoRequest, Octet, ReadOutcome, WriteOutcome};
use crate::port::PortResult;
use crate::registry::PortRegistry;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, trace};

/// Delays each write until `min_delay` has passed since the previous one
/// completed. The filter's installation counts as the first write.
pub struct ThrottleFilter {
    inner: Arc<dyn Octet>,
    min_delay: Duration,
    last_write: Mutex<Instant>,
}

impl ThrottleFilter {
    pub fn new(inner: Arc<dyn Octet>, min_delay: Duration) -> Self {
        Self {
            inner,
            min_delay,
            last_write: Mutex::new(Instant::now()),
        }
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }
}

impl Octet for ThrottleFilter {
    fn write(&self, req: &IoRequest, data: &[u8]) -> WriteOutcome {
        let mut last = self.last_write.lock();
        let remaining = self.min_delay.saturating_sub(last.elapsed());
        if !remaining.is_zero() {
            trace!(
                port = self.inner.port_name(),
                delay_ms = remaining.as_millis() as u64,
                "throttling write"
            );
            std::thread::sleep(remaining);
        }
        let outcome = self.inner.write(req, data);
        *last = Instant::now();
        outcome
    }

    fn read(&self, req: &IoRequest, buf: &mut [u8]) -> ReadOutcome {
        self.inner.read(req, buf)
    }

    fn flush(&self, req: &IoRequest) -> PortResult<()> {
        self.inner.flush(req)
    }

    fn port_name(&self) -> &str {
        self.inner.port_name()
    }

    fn set_input_eos(&self, eos: &[u8]) -> PortResult<()> {
        self.inner.set_input_eos(eos)
    }

    fn get_input_eos(&self) -> PortResult<Vec<u8>> {
        self.inner.get_input_eos()
    }

    fn set_output_eos(&self, eos: &[u8]) -> PortResult<()> {
        self.inner.set_output_eos(eos)
    }

    fn get_output_eos(&self) -> PortResult<Vec<u8>> {
        self.inner.get_output_eos()
    }
}

/// Interpose a throttle filter on `port`.
pub fn configure_throttle(
    registry: &PortRegistry,
    port: &str,
    min_delay: Duration,
) -> PortResult<()> {
    registry.interpose_octet(port, |inner| {
        Arc::new(ThrottleFilter::new(inner, min_delay)) as Arc<dyn Octet>
    })?;
    info!(
        port,
        min_delay_ms = min_delay.as_millis() as u64,
        "throttle filter installed"
    );
    Ok(())
}
