//! Feeder errors

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while configuring or talking to the feeder controller
#[derive(Error, Debug)]
pub enum FeederError {
    /// A configuration value failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Discovery found no matching port
    #[error("Device not found: no serial port matched the controller signature")]
    DeviceNotFound,

    /// Serial I/O failed; the connection has been torn down
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Operation needs an open connection
    #[error("Not connected to the feeder controller")]
    NotConnected,

    /// `connect` while a connection is open
    #[error("Already connected")]
    AlreadyConnected,

    /// Argument outside its permitted range; nothing was sent
    #[error("{quantity} {value} is out of range [{min}, {max}]")]
    OutOfRange {
        /// What was checked, e.g. "feed distance"
        quantity: &'static str,
        /// Rejected value
        value: f64,
        /// Smallest accepted value
        min: f64,
        /// Largest accepted value
        max: f64,
    },

    /// No reply line arrived within the response window
    #[error("No response to '{command}' within {:.1}s", .waited.as_secs_f64())]
    Timeout {
        /// Command that went unanswered
        command: String,
        /// Response window that elapsed
        waited: Duration,
    },

    /// Reply arrived but could not be interpreted
    #[error("Unexpected response to '{command}': {reply:?}")]
    InvalidResponse {
        /// Command being answered
        command: String,
        /// Lines as received
        reply: Vec<String>,
    },

    /// Controller answered with an error line
    #[error("Controller rejected '{command}': {reply}")]
    DeviceRejected {
        /// Command that was refused
        command: String,
        /// The error line
        reply: String,
    },

    /// Config file could not be read or parsed
    #[error("Config error: {0}")]
    Config(String),
}

impl FeederError {
    /// True when the error left the connection torn down
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, FeederError::TransportError(_))
    }
}

impl From<std::io::Error> for FeederError {
    fn from(err: std::io::Error) -> Self {
        FeederError::TransportError(err.to_string())
    }
}

impl From<serde_json::Error> for FeederError {
    fn from(err: serde_json::Error) -> Self {
        FeederError::Config(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, FeederError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_command_and_window() {
        let err = FeederError::Timeout {
            command: "?".to_string(),
            waited: Duration::from_millis(1000),
        };
        assert_eq!(err.to_string(), "No response to '?' within 1.0s");
    }

    #[test]
    fn test_out_of_range_message() {
        let err = FeederError::OutOfRange {
            quantity: "feed distance (mm)",
            value: 9999.0,
            min: 0.0,
            max: 1000.0,
        };
        assert_eq!(
            err.to_string(),
            "feed distance (mm) 9999 is out of range [0, 1000]"
        );
    }

    #[test]
    fn test_io_error_maps_to_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: FeederError = io.into();
        assert!(err.is_fatal_to_connection());
        assert!(err.to_string().contains("pipe closed"));
    }

    #[test]
    fn test_device_not_found_is_distinct_from_timeout() {
        let missing = FeederError::DeviceNotFound.to_string();
        let silent = FeederError::Timeout {
            command: "POS".to_string(),
            waited: Duration::from_millis(1500),
        }
        .to_string();
        assert_ne!(missing, silent);
        assert!(missing.contains("not found"));
        assert!(silent.ends_with("within 1.5s"));
    }
}
