//! VMThunder storage drivers
//!
//! Narrow, independently mockable interfaces to the host storage stack,
//! plus implementations that drive the usual Linux admin tools.
//!
//! | Trait          | Implementation      | Tool                  |
//! |----------------|---------------------|-----------------------|
//! | `BlockMapper`  | `DmSetup`           | `dmsetup`, `blockdev` |
//! | `TargetAdmin`  | `TgtAdm`            | `tgtadm`              |
//! | `Connector`    | `IscsiConnector`    | `iscsiadm`            |
//! | `CacheLayer`   | `FlashCacheGroup`   | `fcg`                 |
//!
//! All calls block on an external process; failures surface as
//! [`DriverError`] and are never retried here.

pub mod cache;
pub mod cmd;
pub mod connector;
pub mod dm;
pub mod error;
pub mod host;
pub mod target;

pub use cache::{CacheLayer, FlashCacheGroup};
pub use cmd::CommandRunner;
pub use connector::{Connector, DeviceInfo, IscsiConnector, resolve_device};
pub use dm::{BlockMapper, DmSetup, multipath_table};
pub use error::{DriverError, DriverResult};
pub use target::{TargetAdmin, TgtAdm};
