use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Bad geometry or a capability mismatch, detected before hardware is touched
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Open/configure/disconnect failure reported by the camera hardware
    #[error("Device error [{device}]: {reason}")]
    Device { device: String, reason: String },

    /// Malformed streaming target, detected before any network I/O
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Build a device error from anything printable
    pub fn device(device: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Device {
            device: device.into(),
            reason: reason.to_string(),
        }
    }

    /// Short machine-readable kind, used in events and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Device { .. } => "device",
            Self::InvalidEndpoint(_) => "invalid_endpoint",
            Self::Connection(_) => "connection",
            Self::Auth(_) => "auth",
            Self::InvalidState(_) => "invalid_state",
            Self::Internal(_) => "internal",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_display() {
        let err = AppError::device("back", "disconnected");
        assert_eq!(err.to_string(), "Device error [back]: disconnected");
        assert_eq!(err.kind(), "device");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: AppError = io.into();
        assert!(matches!(err, AppError::Io(_)));
    }
}
