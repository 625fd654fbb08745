//! Session and instance error types

use std::path::PathBuf;

use thiserror::Error;
use vmthunder_drivers::DriverError;
use vmthunder_tracker::TrackerError;

/// VMThunder core error
#[derive(Error, Debug)]
pub enum ThunderError {
    /// A storage collaborator failed
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// The tracker call failed
    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    /// Attaching the VM's private volume produced no usable link
    #[error("could not find snapshot link file {}", .0.display())]
    SnapshotLinkNotFound(PathBuf),

    /// The link resolved to a device that does not exist
    #[error("could not find snapshot device {}", .0.display())]
    SnapshotDeviceNotFound(PathBuf),

    /// VM already registered with the session
    #[error("VM already registered: {0}")]
    VmAlreadyRegistered(String),

    /// VM not registered with the session
    #[error("VM not registered: {0}")]
    VmNotRegistered(String),

    /// No session for this volume
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Deploy called with an empty connection set
    #[error("no connections given for volume {0}")]
    NoConnections(String),

    /// An active connection has no recorded device path
    #[error("no device path recorded for connection {0}")]
    MissingPath(String),

    /// A chain resource was built or released out of order
    #[error("invalid device chain transition: {0}")]
    InvalidTransition(String),

    /// Parents did not become ready in time
    #[error("timed out waiting for parents of volume {0}")]
    DeployTimeout(String),

    /// Extension point without an implementation
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations
pub type ThunderResult<T> = Result<T, ThunderError>;
