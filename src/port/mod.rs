//! OS-facing side of a serial line.
//!
//! [`SerialDevice`] is the seam between the port controller and the
//! operating system. [`NativeDriver`] opens real ports through `serialport`;
//! [`LoopbackDriver`] provides in-memory lines for tests and demos.

pub mod error;
pub mod loopback;
pub mod native;
pub mod overlapped;
pub mod traits;

pub use error::{PortError, PortResult};
pub use loopback::{Fault, LoopbackDevice, LoopbackDriver, LoopbackLine};
pub use native::{NativeDevice, NativeDriver};
pub use overlapped::{Overlapped, Submitted, WaitStatus};
pub use traits::*;
