//! Asyn Serial Library
//!
//! An octet driver for serial lines in the style of an asyn port framework:
//! a per-port controller with deadline-bounded overlapped transfers, a
//! background line-event monitor, a string option codec, diagnostic reports
//! and interposable byte-stream filters.
//!
//! # Modules
//!
//! - `config`: Configuration management with TOML support
//! - `driver`: Port controller, event monitor, option codec and reports
//! - `error`: Application-level error for the client binary
//! - `interface`: Capability traits a port exposes to the framework
//! - `interpose`: Strip, throttle and end-of-string filters
//! - `logging`: Tracing subscriber setup
//! - `port`: OS device contract with native and loopback backends
//! - `registry`: Named port table and `configure_serial_port`
//! - `timer`: Shared deadline timer service

pub mod config;
pub mod driver;
pub mod error;
pub mod interface;
pub mod interpose;
pub mod logging;
pub mod port;
pub mod registry;
pub mod timer;

// Re-export commonly used types for convenience
pub use driver::{DriverSettings, PortController};
pub use error::AppError;
pub use interface::{
    Common, ConnectionObserver, EomReason, IoRequest, Octet, OptionAccess, ReadOutcome, Status,
    WriteOutcome,
};
pub use port::{LoopbackDriver, NativeDriver, PortError, PortResult};
pub use registry::{configure_serial_port, PortAttributes, PortRegistry};
pub use timer::TimerQueue;

// Re-export config types
pub use config::{Config, ConfigError, ConfigLoader, ConfigResult};
