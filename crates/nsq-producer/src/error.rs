//! Error types for the producer.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for producer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for producer operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration failed validation.
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),

    /// The operation needs a live connection and there is none.
    #[error("not connected")]
    NotConnected,

    /// The producer has been permanently stopped.
    #[error("stopped")]
    Stopped,

    /// The caller's context was cancelled.
    #[error("context canceled")]
    Cancelled,

    /// The caller's context deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The broker answered with an error frame.
    #[error("{0}")]
    Protocol(String),

    /// The broker rejected or garbled the connection handshake.
    #[error("identify failed: {0}")]
    Identify(String),

    /// The broker requires authentication.
    #[error("auth failed: {0}")]
    Auth(String),

    /// A command could not be built from the caller's input.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// Connecting took longer than the configured dial timeout.
    #[error("dial timed out after {0:?}")]
    DialTimeout(Duration),

    /// Serializing or deserializing a JSON body failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error is scoped to a single caller's context rather than the
    /// connection.
    #[must_use]
    pub const fn is_context_error(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A duration option is outside its allowed range.
    #[error("{name} {value:?} must be between {min:?} and {max:?}")]
    OutOfRange {
        /// The option name.
        name: &'static str,
        /// The rejected value.
        value: Duration,
        /// Smallest allowed value.
        min: Duration,
        /// Largest allowed value.
        max: Duration,
    },

    /// The heartbeat would never arrive before the read deadline.
    #[error("heartbeat_interval {heartbeat:?} must be less than read_timeout {read_timeout:?}")]
    HeartbeatTooSlow {
        /// Configured heartbeat interval.
        heartbeat: Duration,
        /// Configured read timeout.
        read_timeout: Duration,
    },

    /// The sample rate is a percentage below 100.
    #[error("sample_rate {0} must be between 0 and 99")]
    SampleRate(u8),

    /// A required string option is empty.
    #[error("{0} must not be empty")]
    Empty(&'static str),
}
