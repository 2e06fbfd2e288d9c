//! Stream error types
//!
//! Transport failures surface as [`StreamError`]. Handler failures never do:
//! they are carried as `eyre::Report` into the retry/DLQ decision instead.

use core_config::ConfigError;
use thiserror::Error;

/// Errors raised by the workflow stream core
#[derive(Error, Debug)]
pub enum StreamError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Message payload could not be turned into a workflow event
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Initial connection could not be established within the retry budget
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Metrics recorder/exporter could not be installed
    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl StreamError {
    /// The consumer group already exists (XGROUP CREATE race)
    pub fn is_busygroup(&self) -> bool {
        self.redis_message().is_some_and(|m| is_busygroup_message(&m))
    }

    /// The stream or its consumer group does not exist
    pub fn is_nogroup(&self) -> bool {
        self.redis_message().is_some_and(|m| is_nogroup_message(&m))
    }

    /// The server does not know the command (e.g. XAUTOCLAIM before Redis 6.2)
    pub fn is_unknown_command(&self) -> bool {
        self.redis_message()
            .is_some_and(|m| is_unknown_command_message(&m))
    }

    /// Connection dropped, refused or timed out
    pub fn is_connection_error(&self) -> bool {
        match self {
            StreamError::Redis(e) => {
                e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
            }
            StreamError::ConnectionFailed(_) => true,
            _ => false,
        }
    }

    fn redis_message(&self) -> Option<String> {
        match self {
            StreamError::Redis(e) => Some(e.to_string()),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::Serialization(err.to_string())
    }
}

// Redis reports these conditions only through the error text.
fn is_busygroup_message(msg: &str) -> bool {
    msg.contains("BUSYGROUP")
}

fn is_nogroup_message(msg: &str) -> bool {
    msg.contains("NOGROUP")
}

fn is_unknown_command_message(msg: &str) -> bool {
    msg.to_ascii_lowercase().contains("unknown command")
}
