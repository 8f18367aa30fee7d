//! # Error Module
//!
//! Error types for the modem driver, built on `thiserror`.
//!
//! Only channel-level failures (discovery, open, write) and bad requests are
//! errors. The outcome of an individual SMS send is carried by
//! [`SendStatus`](crate::sms::SendStatus) instead, so a timed-out or rejected
//! message never aborts a batch.

use thiserror::Error;

/// Result type alias for modem operations.
pub type Result<T> = std::result::Result<T, ModemError>;

/// Main error type for the modem driver.
#[derive(Debug, Error)]
pub enum ModemError {
    /// No enumerated serial port matched the modem fingerprint.
    #[error("{expected} not found. Please connect modem.")]
    PortNotFound { expected: String },

    /// Failed to open serial port.
    #[error("Failed to open serial port '{port_name}': {reason}")]
    PortOpen { port_name: String, reason: String },

    /// Failed to enumerate serial ports.
    #[error("Failed to list serial ports: {0}")]
    PortList(String),

    /// Failed to write to serial port.
    #[error("Failed to write to serial port: {0}")]
    PortWrite(String),

    /// Channel communication error.
    #[error("Channel communication error: {0}")]
    Channel(String),

    /// The caller supplied an unusable request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration file could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Config(#[from] ron::error::SpannedError),

    /// File I/O error.
    #[error("File I/O error: {0}")]
    FileIo(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ModemError {
    /// Creates a new port-not-found error for the expected device path.
    #[must_use]
    pub fn port_not_found(expected: impl Into<String>) -> Self {
        Self::PortNotFound {
            expected: expected.into(),
        }
    }

    /// Creates a new port open error.
    #[must_use]
    pub fn port_open(port_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PortOpen {
            port_name: port_name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new port write error.
    #[must_use]
    pub fn port_write(msg: impl Into<String>) -> Self {
        Self::PortWrite(msg.into())
    }

    /// Creates a new channel error.
    #[must_use]
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }

    /// Creates a new invalid request error.
    #[must_use]
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Creates a new invalid configuration error.
    #[must_use]
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
