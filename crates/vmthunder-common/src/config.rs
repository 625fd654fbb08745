//! Configuration types for VMThunder
//!
//! Every field has a serde default so a partial TOML file is enough.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Agent daemon configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Control API listen address
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Log level (trace / debug / info / warn / error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            log_level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:7448".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// How this host is advertised to peers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostConfig {
    /// Explicit IPv4 address to advertise; wins over `interface`
    #[serde(default)]
    pub address: Option<String>,
    /// Interface whose IPv4 address is advertised
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Port exported targets are reachable on
    #[serde(default = "default_iscsi_port")]
    pub iscsi_port: u16,
    /// LUN exported targets carry the volume on
    #[serde(default = "default_export_lun")]
    pub export_lun: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            address: None,
            interface: default_interface(),
            iscsi_port: default_iscsi_port(),
            export_lun: default_export_lun(),
        }
    }
}

fn default_interface() -> String {
    "br100".to_string()
}

fn default_iscsi_port() -> u16 {
    3260
}

fn default_export_lun() -> u32 {
    1
}

/// Tracker (peer distribution service) configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Tracker base URL
    #[serde(default = "default_tracker_endpoint")]
    pub endpoint: String,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Interval between parent readiness polls in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Interval between heartbeats in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Upper bound on waiting for parents during deploy; unbounded if unset
    #[serde(default)]
    pub deploy_timeout_ms: Option<u64>,
}

impl TrackerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn deploy_timeout(&self) -> Option<Duration> {
        self.deploy_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_tracker_endpoint(),
            timeout_ms: default_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            deploy_timeout_ms: None,
        }
    }
}

fn default_tracker_endpoint() -> String {
    "http://10.107.11.120:7447".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

/// Local storage stack configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory device-mapper nodes appear under
    #[serde(default = "default_dm_prefix")]
    pub dm_prefix: String,
    /// Pause between target/origin removal and cache/multipath removal
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Wrap each VM's private device in the cache layer
    #[serde(default)]
    pub snapshot_with_cache: bool,
    /// Flashcache group the cache layer allocates from
    #[serde(default = "default_cache_group")]
    pub cache_group: String,
    /// Command prefix for privileged tools (e.g. `sudo`)
    #[serde(default)]
    pub root_helper: Option<String>,
    /// How long to wait for an attached target's device link to appear
    #[serde(default = "default_device_wait_ms")]
    pub device_wait_ms: u64,
}

impl StorageConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn device_wait(&self) -> Duration {
        Duration::from_millis(self.device_wait_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dm_prefix: default_dm_prefix(),
            settle_delay_ms: default_settle_delay_ms(),
            snapshot_with_cache: false,
            cache_group: default_cache_group(),
            root_helper: None,
            device_wait_ms: default_device_wait_ms(),
        }
    }
}

fn default_dm_prefix() -> String {
    "/dev/mapper/".to_string()
}

fn default_settle_delay_ms() -> u64 {
    1000
}

fn default_cache_group() -> String {
    "ssd".to_string()
}

fn default_device_wait_ms() -> u64 {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host.interface, "br100");
        assert_eq!(config.host.iscsi_port, 3260);
        assert_eq!(config.host.export_lun, 1);
        assert_eq!(config.storage.dm_prefix, "/dev/mapper/");
        assert_eq!(config.tracker.poll_interval(), Duration::from_secs(1));
        assert!(config.tracker.deploy_timeout().is_none());
        assert!(!config.storage.snapshot_with_cache);
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [tracker]
            endpoint = "http://tracker:7447"
            deploy_timeout_ms = 30000

            [storage]
            snapshot_with_cache = true
            "#,
        )
        .unwrap();
        assert_eq!(config.tracker.endpoint, "http://tracker:7447");
        assert_eq!(config.tracker.deploy_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.tracker.heartbeat_interval_ms, 10_000);
        assert!(config.storage.snapshot_with_cache);
        assert_eq!(config.agent.listen, "0.0.0.0:7448");
    }
}
