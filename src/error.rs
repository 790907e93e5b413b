//! Error types for the visitor intelligence engine.

use thiserror::Error;

/// Errors raised while handing a report to the dispatcher or the sink.
///
/// None of these reach an HTTP client; callers log them and move on.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The queue is at capacity and the report was dropped.
    #[error("dispatch queue is full")]
    QueueFull,

    /// The worker pool has shut down.
    #[error("dispatcher is closed")]
    Closed,

    /// The sink did not answer within the configured timeout.
    #[error("sink timed out after {0} ms")]
    Timeout(u64),

    /// The sink answered with a non-success status.
    #[error("sink returned status {0}")]
    Status(u16),

    /// Transport-level failure talking to the sink.
    #[error("sink transport error: {0}")]
    Transport(String),
}

/// Errors raised while loading configuration data.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A data file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// File path
        path: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// A data file could not be parsed.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// File path
        path: String,
        /// Parser message
        message: String,
    },

    /// A CIDR range could not be parsed.
    #[error("invalid CIDR range: {0}")]
    InvalidCidr(String),
}
