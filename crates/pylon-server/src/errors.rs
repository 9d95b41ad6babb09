//! Server error types.

use pylon_core::message::MessageError;
use thiserror::Error;

/// Errors that can occur when loading or parsing settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Failed to read the settings file from disk.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the settings file.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A settings value was invalid (e.g., out of range).
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Errors raised while starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address we tried to bind.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Accepting or inspecting a connection failed.
    #[error("listener I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The configured route dictionary is inconsistent.
    #[error("invalid route dictionary: {0}")]
    Routes(#[from] MessageError),
    /// Settings could not be loaded.
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_error_display() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let err = SettingsError::Json(json_err);
        assert!(err.to_string().contains("parse settings JSON"));
    }

    #[test]
    fn invalid_value_display() {
        let err = SettingsError::InvalidValue("port out of range".to_string());
        assert_eq!(err.to_string(), "invalid settings value: port out of range");
    }

    #[test]
    fn bind_error_names_the_address() {
        let err = ServerError::Bind {
            addr: "0.0.0.0:3250".into(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(err.to_string(), "failed to bind 0.0.0.0:3250: in use");
    }

    #[test]
    fn route_error_from_conversion() {
        let err: ServerError = MessageError::DuplicatedCode(3).into();
        assert!(matches!(err, ServerError::Routes(MessageError::DuplicatedCode(3))));
    }
}
