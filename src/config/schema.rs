//! Configuration schema definitions.
//!
//! This module defines the structure of the configuration file using serde.
//! All configuration sections are defined here with appropriate defaults.

use crate::driver::DriverSettings;
use crate::registry::PortAttributes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Driver timing and defaults
    pub serial: SerialConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Ports configured at startup
    pub ports: Vec<PortDefinition>,
}

/// Serial driver configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Baud rate the native backend opens devices at
    pub default_baud: u32,
    /// Read timeout used by the client when none is given
    pub read_timeout_ms: u64,
    /// Write timeout used by the client when none is given
    pub write_timeout_ms: u64,
    /// Added to a write timeout to form the OS write deadline
    pub write_deadline_margin_ms: u64,
    /// Added to the OS deadline to bound completion waits
    pub wait_safety_margin_ms: u64,
    /// Bound on waiting for the event monitor at disconnect
    pub monitor_join_timeout_ms: u64,
    /// Port aliases for convenience
    #[serde(default)]
    pub port_aliases: HashMap<String, String>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            default_baud: 9600,
            read_timeout_ms: 1000,
            write_timeout_ms: 1000,
            write_deadline_margin_ms: 100,
            wait_safety_margin_ms: 1000,
            monitor_join_timeout_ms: 1000,
            port_aliases: HashMap::new(),
        }
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Timing constants for port controllers.
    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            write_deadline_margin: Duration::from_millis(self.write_deadline_margin_ms),
            wait_safety_margin: Duration::from_millis(self.wait_safety_margin_ms),
            monitor_join_timeout: Duration::from_millis(self.monitor_join_timeout_ms),
        }
    }

    /// Resolve a device name through aliases
    pub fn resolve_port(&self, name: &str) -> String {
        self.port_aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }
}

/// A `[[ports]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDefinition {
    /// Registry name, e.g. `L0`
    pub name: String,
    /// Device path or alias
    pub device: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    #[serde(default = "default_true")]
    pub process_eos: bool,
    /// Option key/value pairs applied after connect
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl PortDefinition {
    pub fn attributes(&self) -> PortAttributes {
        PortAttributes {
            priority: self.priority,
            auto_connect: self.auto_connect,
            process_eos: self.process_eos,
        }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    /// Log file path (optional)
    pub file: Option<PathBuf>,
    /// Log format: "json", "pretty", "compact"
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format
    Json,
    /// Pretty format with colors
    #[default]
    Pretty,
    /// Compact format
    Compact,
}
