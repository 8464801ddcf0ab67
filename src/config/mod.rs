//! Configuration module for asyn-serial.
//!
//! This module provides TOML-based configuration with environment variable overrides.
//!
//! # Configuration Resolution
//!
//! Configuration is loaded from the following locations (in order of priority):
//!
//! 1. `ASYN_SERIAL_CONFIG` environment variable (explicit path)
//! 2. `./asyn-serial.toml` (current directory)
//! 3. `~/.config/asyn-serial/asyn-serial.toml` (XDG on Linux/macOS)
//! 4. `%APPDATA%\asyn-serial\asyn-serial.toml` (Windows)
//! 5. Built-in defaults (no file required)
//!
//! # Environment Overrides
//!
//! Scalar values can be overridden via environment variables.
//! The pattern is: `ASYN_SERIAL_<SECTION>_<KEY>`
//!
//! Examples:
//! - `ASYN_SERIAL_SERIAL_DEFAULT_BAUD=19200`
//! - `ASYN_SERIAL_LOGGING_FORMAT=json`
//!
//! # Example
//!
//! ```toml
//! [serial]
//! wait_safety_margin_ms = 1000
//!
//! [[ports]]
//! name = "L0"
//! device = "ttyUSB0"
//!
//! [ports.options]
//! baud = "19200"
//! parity = "even"
//! ```

mod error;
mod loader;
mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::{
    get_default_config_dir, get_default_config_path, resolve_config_path, ConfigLoader,
};
pub use schema::{Config, LogFormat, LoggingConfig, PortDefinition, SerialConfig};
