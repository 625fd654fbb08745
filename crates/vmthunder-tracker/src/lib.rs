//! VMThunder tracker client
//!
//! The tracker keeps per-volume peer membership (login / heartbeat /
//! logout) and answers each host with the parents it should fetch the
//! volume from, spreading load across a distribution tree instead of
//! every host pulling from one source.

pub mod client;
pub mod error;
pub mod types;

pub use client::{HttpTracker, Tracker};
pub use error::{TrackerError, TrackerResult};
pub use types::{HeartbeatResponse, LoginRequest, LogoutRequest, ParentAssignment, SessionAssignment};
