//! VMThunder Common - Shared types and configuration
//!
//! This crate provides the connection and peer descriptors, deterministic
//! device names, and configuration structures used across all VMThunder
//! components.

pub mod config;
pub mod naming;
pub mod types;

pub use config::Config;
pub use types::*;
