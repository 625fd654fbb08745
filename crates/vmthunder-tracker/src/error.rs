//! Tracker client error types

use thiserror::Error;

/// Error talking to the tracker
#[derive(Error, Debug)]
pub enum TrackerError {
    /// Tracker could not be reached
    #[error("tracker unavailable: {0}")]
    Unavailable(String),

    /// Request timed out
    #[error("tracker request timed out")]
    Timeout,

    /// Tracker answered with a non-success status
    #[error("tracker returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// Response body could not be decoded
    #[error("invalid tracker response: {0}")]
    Decode(String),

    /// Client could not be built
    #[error("tracker configuration error: {0}")]
    Configuration(String),
}

/// Result type for tracker operations
pub type TrackerResult<T> = Result<T, TrackerError>;
