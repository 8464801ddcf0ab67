//! End-of-string processing.
//!
//! The output terminator is appended to every write. On input, bytes from
//! the port below are buffered and a read returns as soon as the input
//! terminator is seen; bytes that followed it stay buffered for the next
//! read.

use super::terminate;
use crate::interface::{EomReason, IoRequest, Octet, ReadOutcome, Status, WriteOutcome};
use crate::port::{PortError, PortResult};
use memchr::memmem;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

/// Longest terminator accepted in either direction.
pub const MAX_EOS_LEN: usize = 2;

/// Size of each read issued to the port below.
const CHUNK: usize = 2048;

#[derive(Debug, Default)]
struct EosState {
    input: Vec<u8>,
    output: Vec<u8>,
    /// Received bytes not yet handed to a caller.
    pending: Vec<u8>,
}

/// Terminator handling over a raw byte stream.
pub struct EosFilter {
    inner: Arc<dyn Octet>,
    state: Mutex<EosState>,
}

impl EosFilter {
    pub fn new(inner: Arc<dyn Octet>) -> Self {
        Self {
            inner,
            state: Mutex::new(EosState::default()),
        }
    }

    /// Bytes received past the last delivered terminator.
    pub fn buffered(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn check_len(&self, eos: &[u8]) -> PortResult<()> {
        if eos.len() > MAX_EOS_LEN {
            return Err(PortError::InvalidValue {
                key: "eos",
                value: String::from_utf8_lossy(eos).into_owned(),
            });
        }
        Ok(())
    }
}

/// Move up to `buf.len()` pending bytes into `buf`, stopping at the first
/// terminator. Returns `None` when neither a terminator nor a full buffer
/// ends the message yet.
fn take_message(pending: &mut Vec<u8>, eos: &[u8], buf: &mut [u8]) -> Option<(usize, EomReason)> {
    if !eos.is_empty() {
        if let Some(at) = memmem::find(pending, eos) {
            if at <= buf.len() {
                buf[..at].copy_from_slice(&pending[..at]);
                pending.drain(..at + eos.len());
                return Some((at, EomReason::EOS));
            }
        }
    }
    if pending.len() >= buf.len() {
        let n = buf.len();
        buf.copy_from_slice(&pending[..n]);
        pending.drain(..n);
        return Some((n, EomReason::CNT));
    }
    None
}

impl Octet for EosFilter {
    fn write(&self, req: &IoRequest, data: &[u8]) -> WriteOutcome {
        let output = self.state.lock().output.clone();
        if output.is_empty() {
            return self.inner.write(req, data);
        }
        let mut framed = Vec::with_capacity(data.len() + output.len());
        framed.extend_from_slice(data);
        framed.extend_from_slice(&output);
        let outcome = self.inner.write(req, &framed);
        WriteOutcome::new(outcome.transferred.min(data.len()), outcome.status)
    }

    fn read(&self, req: &IoRequest, buf: &mut [u8]) -> ReadOutcome {
        if buf.is_empty() {
            return self.inner.read(req, buf);
        }
        let mut state = self.state.lock();
        if state.input.is_empty() && state.pending.is_empty() {
            drop(state);
            return self.inner.read(req, buf);
        }

        let mut chunk = vec![0u8; CHUNK];
        loop {
            let EosState { input, pending, .. } = &mut *state;
            if let Some((n, eom)) = take_message(pending, input, buf) {
                trace!(port = self.inner.port_name(), n, eom = ?eom, "message delivered");
                terminate(buf, n);
                return ReadOutcome::new(n, eom, Status::Success);
            }
            if input.is_empty() && !pending.is_empty() {
                // Terminator cleared while bytes were buffered.
                let n = pending.len();
                buf[..n].copy_from_slice(pending);
                pending.clear();
                terminate(buf, n);
                return ReadOutcome::new(n, EomReason::empty(), Status::Success);
            }

            let lower = self.inner.read(req, &mut chunk);
            pending.extend_from_slice(&chunk[..lower.transferred]);
            let ended = lower.eom.contains(EomReason::END);
            if lower.status.is_success() && !ended {
                continue;
            }

            // The port below stopped: deliver what a terminator or the
            // buffer size allows, else everything buffered.
            if let Some((n, eom)) = take_message(pending, input, buf) {
                terminate(buf, n);
                return ReadOutcome::new(n, eom, Status::Success);
            }
            let n = pending.len();
            buf[..n].copy_from_slice(pending);
            pending.clear();
            terminate(buf, n);
            let eom = if ended {
                EomReason::END
            } else {
                EomReason::empty()
            };
            return ReadOutcome::new(n, eom, lower.status);
        }
    }

    fn flush(&self, req: &IoRequest) -> PortResult<()> {
        let dropped = std::mem::take(&mut self.state.lock().pending);
        if !dropped.is_empty() {
            debug!(port = self.inner.port_name(), dropped = dropped.len(), "discarded buffered input");
        }
        self.inner.flush(req)
    }

    fn port_name(&self) -> &str {
        self.inner.port_name()
    }

    fn set_input_eos(&self, eos: &[u8]) -> PortResult<()> {
        self.check_len(eos)?;
        self.state.lock().input = eos.to_vec();
        debug!(port = self.inner.port_name(), eos = ?String::from_utf8_lossy(eos), "input EOS set");
        Ok(())
    }

    fn get_input_eos(&self) -> PortResult<Vec<u8>> {
        Ok(self.state.lock().input.clone())
    }

    fn set_output_eos(&self, eos: &[u8]) -> PortResult<()> {
        self.check_len(eos)?;
        self.state.lock().output = eos.to_vec();
        debug!(port = self.inner.port_name(), eos = ?String::from_utf8_lossy(eos), "output EOS set");
        Ok(())
    }

    fn get_output_eos(&self) -> PortResult<Vec<u8>> {
        Ok(self.state.lock().output.clone())
    }
}
