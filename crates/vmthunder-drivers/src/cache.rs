//! Cache acceleration layer (flashcache groups)

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;
use vmthunder_common::naming;

use crate::cmd::CommandRunner;
use crate::error::DriverResult;

/// Wraps block devices with an acceleration layer
#[async_trait]
pub trait CacheLayer: Send + Sync {
    /// Wrap `device`, returning the cached device node
    async fn attach(&self, device: &Path) -> DriverResult<PathBuf>;

    /// Remove the wrap around `device`
    async fn detach(&self, device: &Path) -> DriverResult<()>;
}

/// [`CacheLayer`] backed by the `fcg` flashcache group tool
#[derive(Clone, Debug)]
pub struct FlashCacheGroup {
    runner: CommandRunner,
    group: String,
    prefix: String,
}

impl FlashCacheGroup {
    pub fn new(runner: CommandRunner, group: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            runner,
            group: group.into(),
            prefix: prefix.into(),
        }
    }

    /// Node the cached wrap of `device` appears at
    pub fn cached_path(&self, device: &Path) -> PathBuf {
        let name = naming::cached_name(&device.to_string_lossy());
        PathBuf::from(format!("{}{}", self.prefix, name))
    }
}

#[async_trait]
impl CacheLayer for FlashCacheGroup {
    async fn attach(&self, device: &Path) -> DriverResult<PathBuf> {
        let device_arg = device.to_string_lossy();
        self.runner
            .run("fcg", &["add-disk", "--group", &self.group, &device_arg])
            .await?;
        let cached = self.cached_path(device);
        info!(device = %device.display(), cached = %cached.display(), group = %self.group, "cache attached");
        Ok(cached)
    }

    async fn detach(&self, device: &Path) -> DriverResult<()> {
        let device_arg = device.to_string_lossy();
        self.runner
            .run("fcg", &["rm-disk", "--group", &self.group, &device_arg])
            .await?;
        info!(device = %device.display(), group = %self.group, "cache detached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_path() {
        let cache = FlashCacheGroup::new(CommandRunner::default(), "ssd", "/dev/mapper/");
        assert_eq!(
            cache.cached_path(Path::new("/dev/mapper/multipath_vol1")),
            PathBuf::from("/dev/mapper/cached_multipath_vol1")
        );
    }
}
