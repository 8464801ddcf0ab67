//! Auto-reset event used to announce byte arrival to the read path.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Signal that releases one waiter and re-arms itself.
///
/// A `set` with no waiter present is remembered until the next wait, so a
/// notification racing the reader's queue poll is never lost. Waiters must
/// still re-check the real condition after waking.
#[derive(Debug, Default)]
pub struct AutoResetEvent {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl AutoResetEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *self.signalled.lock() = true;
        self.cond.notify_one();
    }

    /// Drop a pending signal.
    pub fn reset(&self) {
        *self.signalled.lock() = false;
    }

    /// Wait up to `timeout`. Returns `true` if the event was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signalled = self.signalled.lock();
        while !*signalled {
            if self.cond.wait_until(&mut signalled, deadline).timed_out() {
                break;
            }
        }
        std::mem::replace(&mut *signalled, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_set_before_wait_is_remembered() {
        let event = AutoResetEvent::new();
        event.set();
        assert!(event.wait_timeout(Duration::ZERO));
        // Consumed: the next wait times out.
        assert!(!event.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_releases_waiter_from_other_thread() {
        let event = Arc::new(AutoResetEvent::new());
        let setter = Arc::clone(&event);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            setter.set();
        });
        assert!(event.wait_timeout(Duration::from_secs(2)));
        handle.join().unwrap();
    }

    #[test]
    fn test_reset_discards_pending_signal() {
        let event = AutoResetEvent::new();
        event.set();
        event.reset();
        assert!(!event.wait_timeout(Duration::from_millis(5)));
    }
}
