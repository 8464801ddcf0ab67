//! Overlapped-operation model.
//!
//! A device call either completes on the spot ([`Submitted::Ready`]) or hands
//! back an [`Overlapped`] operation whose completion the caller waits for,
//! bounded by a ceiling of its choosing. An operation that outlives the
//! ceiling reports [`WaitStatus::Elapsed`] and is abandoned.

use std::fmt;
use std::io;
use std::time::Duration;

/// Result of waiting on an overlapped operation.
#[derive(Debug)]
pub enum WaitStatus<T> {
    /// The operation completed, successfully or not.
    Completed(io::Result<T>),
    /// The ceiling passed before completion was signalled.
    Elapsed,
}

type Completion<T> = Box<dyn FnOnce(Option<Duration>) -> WaitStatus<T> + Send>;

/// An in-flight operation. Owns any scratch buffer it needs.
pub struct Overlapped<T> {
    completion: Completion<T>,
}

impl<T> Overlapped<T> {
    /// Wrap a completion routine. The routine receives the wait ceiling
    /// (`None` waits without bound) and must honour it.
    pub fn new<F>(completion: F) -> Self
    where
        F: FnOnce(Option<Duration>) -> WaitStatus<T> + Send + 'static,
    {
        Self {
            completion: Box::new(completion),
        }
    }

    /// Block until the operation completes or `ceiling` elapses.
    pub fn wait(self, ceiling: Option<Duration>) -> WaitStatus<T> {
        (self.completion)(ceiling)
    }
}

impl<T> fmt::Debug for Overlapped<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Overlapped { .. }")
    }
}

/// Outcome of starting a device operation.
#[derive(Debug)]
pub enum Submitted<T> {
    Ready(T),
    Pending(Overlapped<T>),
}

impl<T> Submitted<T> {
    /// Collapse into a completion, waiting on a pending operation if needed.
    pub fn complete(self, ceiling: Option<Duration>) -> WaitStatus<T> {
        match self {
            Submitted::Ready(value) => WaitStatus::Completed(Ok(value)),
            Submitted::Pending(op) => op.wait(ceiling),
        }
    }
}
