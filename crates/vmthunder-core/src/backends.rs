//! Collaborators and tunables shared by every session on a host

use std::sync::Arc;
use std::time::Duration;

use vmthunder_common::Config;
use vmthunder_drivers::{BlockMapper, CacheLayer, Connector, TargetAdmin};
use vmthunder_tracker::Tracker;

/// Storage and membership collaborators.
///
/// Built once at startup and cloned into each session and instance.
#[derive(Clone)]
pub struct Backends {
    pub mapper: Arc<dyn BlockMapper>,
    pub targets: Arc<dyn TargetAdmin>,
    pub connector: Arc<dyn Connector>,
    pub cache: Arc<dyn CacheLayer>,
    pub tracker: Arc<dyn Tracker>,
}

/// Per-host session settings
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Address advertised to the tracker for our exported target
    pub host_address: String,
    pub iscsi_port: u16,
    pub export_lun: u32,
    /// Sleep between tracker polls while parents are pending
    pub poll_interval: Duration,
    /// Pause between removing the target and detaching the cache
    pub settle_delay: Duration,
    /// Wrap each VM's copy-on-write device with the cache layer
    pub snapshot_with_cache: bool,
}

impl SessionOptions {
    pub fn from_config(config: &Config, host_address: impl Into<String>) -> Self {
        Self {
            host_address: host_address.into(),
            iscsi_port: config.host.iscsi_port,
            export_lun: config.host.export_lun,
            poll_interval: config.tracker.poll_interval(),
            settle_delay: config.storage.settle_delay(),
            snapshot_with_cache: config.storage.snapshot_with_cache,
        }
    }
}
