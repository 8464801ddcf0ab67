//! Remove configured bytes from the stream.

use super::terminate;
use crate::interface::{IoRequest, Octet, ReadOutcome, Status, WriteOutcome};
use crate::port::PortResult;
use crate::registry::PortRegistry;
use std::sync::Arc;
use tracing::{info, trace};

/// Drops every byte of `strip_in` from reads and every byte of `strip_out`
/// from writes.
pub struct StripFilter {
    inner: Arc<dyn Octet>,
    strip_in: Vec<u8>,
    strip_out: Vec<u8>,
}

impl StripFilter {
    pub fn new(inner: Arc<dyn Octet>, strip_in: &[u8], strip_out: &[u8]) -> Self {
        Self {
            inner,
            strip_in: strip_in.to_vec(),
            strip_out: strip_out.to_vec(),
        }
    }
}

/// Keep the bytes of `data[..len]` not in `set`, compacting in place.
fn compact(data: &mut [u8], len: usize, set: &[u8]) -> usize {
    let mut kept = 0;
    for i in 0..len {
        let byte = data[i];
        if !set.contains(&byte) {
            data[kept] = byte;
            kept += 1;
        }
    }
    kept
}

/// How many caller bytes a forwarded count of `sent` filtered bytes covers.
///
/// Stripped bytes directly after the last sent byte count as consumed.
fn consumed(data: &[u8], set: &[u8], sent: usize) -> usize {
    let mut remaining = sent;
    for (i, byte) in data.iter().enumerate() {
        if set.contains(byte) {
            continue;
        }
        if remaining == 0 {
            return i;
        }
        remaining -= 1;
    }
    data.len()
}

impl Octet for StripFilter {
    fn write(&self, req: &IoRequest, data: &[u8]) -> WriteOutcome {
        if self.strip_out.is_empty() {
            return self.inner.write(req, data);
        }
        let filtered: Vec<u8> = data
            .iter()
            .copied()
            .filter(|b| !self.strip_out.contains(b))
            .collect();
        if filtered.is_empty() {
            trace!(port = self.inner.port_name(), len = data.len(), "write fully stripped");
            return WriteOutcome::new(data.len(), Status::Success);
        }
        let outcome = self.inner.write(req, &filtered);
        WriteOutcome::new(
            consumed(data, &self.strip_out, outcome.transferred),
            outcome.status,
        )
    }

    fn read(&self, req: &IoRequest, buf: &mut [u8]) -> ReadOutcome {
        let mut outcome = self.inner.read(req, buf);
        if !self.strip_in.is_empty() && outcome.transferred > 0 {
            let kept = compact(buf, outcome.transferred, &self.strip_in);
            if kept != outcome.transferred {
                trace!(
                    port = self.inner.port_name(),
                    removed = outcome.transferred - kept,
                    "stripped input"
                );
            }
            outcome.transferred = kept;
            terminate(buf, kept);
        }
        outcome
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

/// Interpose a strip filter on `port`.
pub fn configure_strip(
    registry: &PortRegistry,
    port: &str,
    strip_in: &[u8],
    strip_out: &[u8],
) -> PortResult<()> {
    registry.interpose_octet(port, |inner| {
        Arc::new(StripFilter::new(inner, strip_in, strip_out)) as Arc<dyn Octet>
    })?;
    info!(
        port,
        strip_in = ?String::from_utf8_lossy(strip_in),
        strip_out = ?String::from_utf8_lossy(strip_out),
        "strip filter installed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_removes_set_members() {
        let mut data = *b"a\rb\nc";
        let kept = compact(&mut data, 5, b"\r\n");
        assert_eq!(&data[..kept], b"abc");
    }

    #[test]
    fn test_consumed_counts_trailing_stripped() {
        // "ab\r\ncd" with CR/LF stripped forwards "abcd".
        let data = b"ab\r\ncd";
        assert_eq!(consumed(data, b"\r\n", 0), 0);
        assert_eq!(consumed(data, b"\r\n", 1), 1);
        assert_eq!(consumed(data, b"\r\n", 2), 4);
        assert_eq!(consumed(data, b"\r\n", 4), 6);
    }
}
