//! Driver error types

use std::path::PathBuf;
use thiserror::Error;

/// Error raised by a storage stack collaborator
#[derive(Error, Debug)]
pub enum DriverError {
    /// The tool could not be started at all
    #[error("failed to execute {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The tool ran and exited non-zero
    #[error("{command} failed (exit {code}): {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The tool succeeded but printed something we cannot interpret
    #[error("unexpected output from {command}: {output}")]
    Parse { command: String, output: String },

    /// An attached device never showed up
    #[error("device did not appear: {}", .0.display())]
    DeviceNotFound(PathBuf),

    /// Host address lookup failed
    #[error("interface {0} not found or has no IPv4 address")]
    InterfaceNotFound(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for driver operations
pub type DriverResult<T> = Result<T, DriverError>;
