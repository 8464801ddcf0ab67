//! Configuration loader with file resolution and environment override support.

use super::error::{ConfigError, ConfigResult};
use super::schema::{Config, LogFormat};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Environment variable prefix for overrides
const ENV_PREFIX: &str = "ASYN_SERIAL";

/// Config file name
const CONFIG_FILE_NAME: &str = "asyn-serial.toml";

/// Directory under the platform config dir
const CONFIG_DIR_NAME: &str = "asyn-serial";

/// Environment variable for explicit config path
const CONFIG_PATH_ENV: &str = "ASYN_SERIAL_CONFIG";

/// Configuration loader with resolution and override logic.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Resolved config file path (if any)
    pub config_path: Option<PathBuf>,
    /// The loaded configuration
    pub config: Config,
}

impl ConfigLoader {
    /// Load configuration using standard resolution order.
    ///
    /// Resolution priority (highest to lowest):
    /// 1. `ASYN_SERIAL_CONFIG` environment variable (explicit path)
    /// 2. `./asyn-serial.toml` (current directory)
    /// 3. `~/.config/asyn-serial/asyn-serial.toml` (XDG on Linux/macOS)
    /// 4. `%APPDATA%\asyn-serial\asyn-serial.toml` (Windows)
    /// 5. Built-in defaults (no file required)
    ///
    /// Environment variables can override any config file values.
    pub fn load() -> ConfigResult<Self> {
        let config_path = resolve_config_path();

        let mut config = if let Some(ref path) = config_path {
            load_from_file(path)?
        } else {
            Config::default()
        };

        apply_env_overrides(&mut config)?;
        validate(&config)?;

        Ok(Self { config_path, config })
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(ConfigError::NotFound(path));
        }
        let mut config = load_from_file(&path)?;
        apply_env_overrides(&mut config)?;
        validate(&config)?;

        Ok(Self {
            config_path: Some(path),
            config,
        })
    }

    /// Create a loader with default configuration (no file).
    pub fn with_defaults() -> Self {
        let mut config = Config::default();
        // Still apply env overrides even with defaults
        let _ = apply_env_overrides(&mut config);

        Self {
            config_path: None,
            config,
        }
    }

    /// Get the loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Consume the loader and return the configuration.
    pub fn into_config(self) -> Config {
        self.config
    }

    /// Save the current configuration to a specific file.
    pub fn save_to(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        save_to_file(&self.config, path.as_ref())
    }
}

/// Resolve the configuration file path using standard locations.
pub fn resolve_config_path() -> Option<PathBuf> {
    // 1. Explicit environment variable
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. Current directory
    let cwd_config = PathBuf::from(CONFIG_FILE_NAME);
    if cwd_config.exists() {
        return Some(cwd_config);
    }

    // 3. XDG config directory (Linux/macOS) or APPDATA (Windows)
    if let Some(path) = get_default_config_path() {
        if path.exists() {
            return Some(path);
        }
    }

    None
}

/// Get the platform-specific config directory.
fn get_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}

/// Load configuration from a file.
fn load_from_file(path: &Path) -> ConfigResult<Config> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;

    toml::from_str(&content).map_err(|source| ConfigError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Save configuration to a file.
fn save_to_file(config: &Config, path: &Path) -> ConfigResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Unwritable {
            path: path.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Unwritable {
        path: path.to_path_buf(),
        source,
    })
}

fn env_var(key: &str) -> (String, Option<String>) {
    let name = format!("{ENV_PREFIX}_{key}");
    let value = std::env::var(&name).ok();
    (name, value)
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str, what: &str) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::bad_override(name, format!("not a valid {what}")))
}

/// Apply environment variable overrides to the configuration.
///
/// Environment variables follow the pattern: `ASYN_SERIAL_<SECTION>_<KEY>`
/// For example:
/// - `ASYN_SERIAL_SERIAL_DEFAULT_BAUD=19200`
/// - `ASYN_SERIAL_SERIAL_READ_TIMEOUT_MS=500`
/// - `ASYN_SERIAL_LOGGING_FORMAT=json`
fn apply_env_overrides(config: &mut Config) -> ConfigResult<()> {
    let serial = &mut config.serial;
    if let (name, Some(val)) = env_var("SERIAL_DEFAULT_BAUD") {
        serial.default_baud = parse_env(&name, &val, "baud rate")?;
    }
    if let (name, Some(val)) = env_var("SERIAL_READ_TIMEOUT_MS") {
        serial.read_timeout_ms = parse_env(&name, &val, "timeout")?;
    }
    if let (name, Some(val)) = env_var("SERIAL_WRITE_TIMEOUT_MS") {
        serial.write_timeout_ms = parse_env(&name, &val, "timeout")?;
    }
    if let (name, Some(val)) = env_var("SERIAL_WRITE_DEADLINE_MARGIN_MS") {
        serial.write_deadline_margin_ms = parse_env(&name, &val, "margin")?;
    }
    if let (name, Some(val)) = env_var("SERIAL_WAIT_SAFETY_MARGIN_MS") {
        serial.wait_safety_margin_ms = parse_env(&name, &val, "margin")?;
    }
    if let (name, Some(val)) = env_var("SERIAL_MONITOR_JOIN_TIMEOUT_MS") {
        serial.monitor_join_timeout_ms = parse_env(&name, &val, "timeout")?;
    }

    let logging = &mut config.logging;
    if let (_, Some(val)) = env_var("LOGGING_LEVEL") {
        logging.level = val;
    }
    if let (name, Some(val)) = env_var("LOGGING_FORMAT") {
        logging.format = match val.to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => return Err(ConfigError::bad_override(name, "expected json, pretty or compact")),
        };
    }
    if let (_, Some(val)) = env_var("LOGGING_FILE") {
        logging.file = (!val.is_empty()).then(|| PathBuf::from(val));
    }

    Ok(())
}

/// Reject values the driver cannot use.
fn validate(config: &Config) -> ConfigResult<()> {
    if config.serial.default_baud == 0 {
        return Err(ConfigError::bad_value("serial.default_baud", "must be positive"));
    }
    let mut seen = HashSet::new();
    for port in &config.ports {
        if port.name.is_empty() {
            return Err(ConfigError::bad_value("ports.name", "must not be empty"));
        }
        if !seen.insert(port.name.as_str()) {
            return Err(ConfigError::DuplicatePort(port.name.clone()));
        }
        if port.device.is_empty() {
            return Err(ConfigError::MissingDevice {
                port: port.name.clone(),
            });
        }
    }
    Ok(())
}

/// Get the default config directory for creating new config files.
pub fn get_default_config_dir() -> Option<PathBuf> {
    get_config_dir().map(|d| d.join(CONFIG_DIR_NAME))
}

/// Get the default config file path for creating new config files.
pub fn get_default_config_path() -> Option<PathBuf> {
    get_default_config_dir().map(|d| d.join(CONFIG_FILE_NAME))
}
