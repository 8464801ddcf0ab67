//! Errors raised while locating, parsing and checking `asyn-serial.toml`.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration at {}", .0.display())]
    NotFound(PathBuf),

    #[error("cannot read {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not valid TOML: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("configuration cannot be rendered as TOML: {0}")]
    Unrenderable(#[from] toml::ser::Error),

    #[error("cannot write {}: {source}", path.display())]
    Unwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Two `[[ports]]` tables share a name.
    #[error("port {0} is defined more than once")]
    DuplicatePort(String),

    #[error("port {port} names no device")]
    MissingDevice { port: String },

    #[error("{key} {reason}")]
    BadValue { key: String, reason: String },

    /// An `ASYN_SERIAL_*` override that does not parse.
    #[error("{var}: {reason}")]
    BadOverride { var: String, reason: String },
}

impl ConfigError {
    pub fn bad_value(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BadValue {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn bad_override(var: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BadOverride {
            var: var.into(),
            reason: reason.into(),
        }
    }

    /// The file the error concerns, when there is one.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::NotFound(path)
            | Self::Unreadable { path, .. }
            | Self::Malformed { path, .. }
            | Self::Unwritable { path, .. } => Some(path),
            _ => None,
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_culprit() {
        assert_eq!(
            ConfigError::DuplicatePort("S0".into()).to_string(),
            "port S0 is defined more than once"
        );
        assert_eq!(
            ConfigError::MissingDevice { port: "S1".into() }.to_string(),
            "port S1 names no device"
        );
        assert_eq!(
            ConfigError::bad_value("serial.default_baud", "must be positive").to_string(),
            "serial.default_baud must be positive"
        );
    }

    #[test]
    fn test_path_only_for_file_errors() {
        let missing = ConfigError::NotFound(PathBuf::from("/etc/asyn-serial.toml"));
        assert_eq!(missing.path(), Some(Path::new("/etc/asyn-serial.toml")));
        assert_eq!(missing.to_string(), "no configuration at /etc/asyn-serial.toml");
        assert!(ConfigError::bad_override("ASYN_SERIAL_X", "bad").path().is_none());
    }
}
