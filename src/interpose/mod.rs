//! Interposition filters.
//!
//! Each filter implements [`Octet`](crate::interface::Octet) over the
//! capability it wraps and is installed with
//! [`PortRegistry::interpose_octet`](crate::registry::PortRegistry::interpose_octet),
//! so later lookups of the port find the filter first. Calls a filter does
//! not transform are forwarded unchanged.

pub mod eos;
pub mod strip;
pub mod throttle;

pub use eos::EosFilter;
pub use strip::{configure_strip, StripFilter};
pub use throttle::{configure_throttle, ThrottleFilter};

/// Null-terminate `buf` after `len` bytes when there is room.
pub(crate) fn terminate(buf: &mut [u8], len: usize) {
    if let Some(slot) = buf.get_mut(len) {
        *slot = 0;
    }
}
