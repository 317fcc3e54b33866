use std::io;
use thiserror::Error;

/// Error types for the KeContact engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Command parameters rejected before any network I/O
    #[error("Invalid {field}: {reason}")]
    Validation {
        /// Name of the offending parameter
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// Inbound payload that could not be classified
    #[error("Parse error: {reason} (payload {raw:?})")]
    Parse {
        /// Raw payload, kept for diagnostics
        raw: String,
        /// Why decoding failed
        reason: String,
    },

    #[error("Command `{command}` timed out after {attempts} attempts")]
    Timeout {
        /// Wire form of the command
        command: String,
        /// Number of transmissions made
        attempts: u32,
    },

    #[error("Command `{command}` rejected by station: {reply}")]
    Rejected {
        /// Wire form of the command
        command: String,
        /// NAK payload sent by the station
        reply: String,
    },

    #[error("Setup error: {0}")]
    Setup(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unsupported command: {0}")]
    Unsupported(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new validation error for the named field
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Error::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Creates a new parse error carrying the raw payload
    pub fn parse(raw: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Parse {
            raw: raw.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new setup error
    pub fn setup(msg: impl Into<String>) -> Self {
        Error::Setup(msg.into())
    }

    /// Creates a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Creates a new unsupported command error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    /// Creates a new cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Error::Cancelled(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Name of the offending field for validation errors
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Error::Validation { field, .. } => Some(field),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::validation("current", "must be 0 or between 6 and 63 A");
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(err.field(), Some("current"));
        assert_eq!(err.to_string(), "Invalid current: must be 0 or between 6 and 63 A");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.field(), None);
    }

    #[test]
    fn test_timeout_message() {
        let err = Error::Timeout {
            command: "curr 6000".to_string(),
            attempts: 4,
        };
        assert_eq!(err.to_string(), "Command `curr 6000` timed out after 4 attempts");
    }
}
