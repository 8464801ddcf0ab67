use crate::config::ConfigError;
use crate::port::PortError;
use std::fmt;

/// Unified application error type for the client binary.
///
/// Library operations report `PortError` or `ConfigError`; this type only
/// gathers them at the top level so `main` can print one message.
#[derive(Debug)]
pub enum AppError {
    Port(PortError),
    Config(ConfigError),
    InvalidArgument(String),
    Logging(String),
    IoError(std::io::Error),
    SerdeError(serde_json::Error),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port(e) => write!(f, "{e}"),
            Self::Config(e) => write!(f, "Configuration error: {e}"),
            Self::InvalidArgument(details) => write!(f, "Invalid argument: {details}"),
            Self::Logging(details) => write!(f, "Failed to initialise logging: {details}"),
            Self::IoError(e) => write!(f, "An I/O error occurred: {e}"),
            Self::SerdeError(e) => write!(f, "A serialization error occurred: {e}"),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Port(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::IoError(e) => Some(e),
            Self::SerdeError(e) => Some(e),
            Self::InvalidArgument(_) | Self::Logging(_) => None,
        }
    }
}

// Implement `From` conversions to allow the `?` operator to work seamlessly.
impl From<PortError> for AppError {
    fn from(err: PortError) -> Self {
        AppError::Port(err)
    }
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::Config(err)
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::IoError(err)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::SerdeError(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_error_passes_through() {
        let err: AppError = PortError::disconnected("COM1").into();
        assert_eq!(err.to_string(), "COM1 disconnected");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_invalid_argument_display() {
        let err = AppError::InvalidArgument("bad escape".into());
        assert_eq!(err.to_string(), "Invalid argument: bad escape");
    }
}
