//! VMThunder core
//!
//! - [`Session`]: everything one host builds for one base volume (upstream
//!   logins, multipath, cache, origin, exported target) and how it follows
//!   the tracker's distribution tree.
//! - [`Instance`]: one VM's writable snapshot over a session's origin.
//! - [`SessionManager`]: the host-wide registry that serializes work per
//!   volume and drives heartbeats.

pub mod backends;
pub mod chain;
pub mod connections;
pub mod error;
pub mod heartbeat;
pub mod instance;
pub mod manager;
pub mod session;

#[cfg(test)]
mod testing;

pub use backends::{Backends, SessionOptions};
pub use chain::DeviceChain;
pub use connections::{ConnectionTable, Upstream};
pub use error::{ThunderError, ThunderResult};
pub use heartbeat::{heartbeat_loop, heartbeat_once};
pub use instance::Instance;
pub use manager::SessionManager;
pub use session::{Session, SessionStatus};
