//! Device-mapper table management
//!
//! Architecture of one volume on one host:
//! ```text
//! upstream paths (/dev/sdX, /dev/sdY)
//!   → multipath_<volume>   "0 $SZ multipath ... <path> 128 <path> 128"
//!   → cache layer          (cached_multipath_<volume>)
//!   → origin_<volume>      "0 $SZ snapshot-origin <cached>"
//!
//! Per-VM:
//!   snapshot_<vm>          "0 $SZ snapshot <origin> <cow> P 8"
//! ```
//!
//! All operations go through `dmsetup` and `blockdev`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use crate::cmd::CommandRunner;
use crate::error::{DriverError, DriverResult};

/// Weight every multipath path is given
pub const PATH_WEIGHT: u32 = 128;

/// Chunk size (in sectors) of persistent snapshots
pub const SNAPSHOT_CHUNK_SECTORS: u32 = 8;

/// Build a round-robin multipath table over `paths`.
///
/// Format: `0 <sectors> multipath 0 0 1 1 queue-length 0 <n> 1 <path> 128 ...`
pub fn multipath_table<P: AsRef<Path>>(sector_count: u64, paths: &[P]) -> String {
    let mut table = format!(
        "0 {} multipath 0 0 1 1 queue-length 0 {} 1",
        sector_count,
        paths.len()
    );
    for path in paths {
        table.push_str(&format!(" {} {}", path.as_ref().display(), PATH_WEIGHT));
    }
    table
}

/// Creates, reloads and removes named block mappings
#[async_trait]
pub trait BlockMapper: Send + Sync {
    /// Device node of the mapping called `name`
    fn device_path(&self, name: &str) -> PathBuf;

    /// Copy-on-write snapshot of `origin` backed by `cow_device`
    async fn snapshot(&self, origin: &Path, name: &str, cow_device: &Path)
    -> DriverResult<PathBuf>;

    /// Multipath aggregation over `devices`
    async fn multipath(&self, name: &str, devices: &[PathBuf]) -> DriverResult<PathBuf>;

    /// Snapshot origin on top of `backing`
    async fn origin(&self, name: &str, backing: &Path) -> DriverResult<PathBuf>;

    /// Atomically replace the live table of `name`
    async fn reload_table(&self, name: &str, table: &str) -> DriverResult<()>;

    /// Remove mapping `name`
    async fn remove_table(&self, name: &str) -> DriverResult<()>;

    /// Size of `device` in 512-byte sectors
    async fn sector_count(&self, device: &Path) -> DriverResult<u64>;
}

/// [`BlockMapper`] backed by `dmsetup`
#[derive(Clone, Debug)]
pub struct DmSetup {
    runner: CommandRunner,
    prefix: String,
}

impl DmSetup {
    pub fn new(runner: CommandRunner, prefix: impl Into<String>) -> Self {
        Self {
            runner,
            prefix: prefix.into(),
        }
    }

    async fn create(&self, name: &str, table: &str) -> DriverResult<PathBuf> {
        self.runner
            .run_with_stdin("dmsetup", &["create", name], table)
            .await?;
        let path = self.device_path(name);
        info!(dm_name = %name, table = %table, "dm device created");
        Ok(path)
    }
}

#[async_trait]
impl BlockMapper for DmSetup {
    fn device_path(&self, name: &str) -> PathBuf {
        PathBuf::from(format!("{}{}", self.prefix, name))
    }

    async fn snapshot(
        &self,
        origin: &Path,
        name: &str,
        cow_device: &Path,
    ) -> DriverResult<PathBuf> {
        let size = self.sector_count(origin).await?;
        let table = format!(
            "0 {} snapshot {} {} P {}",
            size,
            origin.display(),
            cow_device.display(),
            SNAPSHOT_CHUNK_SECTORS
        );
        self.create(name, &table).await
    }

    async fn multipath(&self, name: &str, devices: &[PathBuf]) -> DriverResult<PathBuf> {
        let first = devices.first().ok_or_else(|| DriverError::Parse {
            command: format!("dmsetup create {name}"),
            output: "multipath needs at least one device".to_string(),
        })?;
        let size = self.sector_count(first).await?;
        let table = multipath_table(size, devices);
        self.create(name, &table).await
    }

    async fn origin(&self, name: &str, backing: &Path) -> DriverResult<PathBuf> {
        let size = self.sector_count(backing).await?;
        let table = format!("0 {} snapshot-origin {}", size, backing.display());
        self.create(name, &table).await
    }

    async fn reload_table(&self, name: &str, table: &str) -> DriverResult<()> {
        // suspend queues new I/O, in-flight I/O completes against the old
        // table, resume swaps in the new one.
        self.runner.run("dmsetup", &["suspend", name]).await?;
        let reloaded = self
            .runner
            .run_with_stdin("dmsetup", &["reload", name], table)
            .await;
        self.runner.run("dmsetup", &["resume", name]).await?;
        reloaded?;
        info!(dm_name = %name, table = %table, "dm table reloaded");
        Ok(())
    }

    async fn remove_table(&self, name: &str) -> DriverResult<()> {
        self.runner.run("dmsetup", &["remove", name]).await?;
        info!(dm_name = %name, "dm device removed");
        Ok(())
    }

    async fn sector_count(&self, device: &Path) -> DriverResult<u64> {
        let device = device.to_string_lossy();
        let out = self.runner.run("blockdev", &["--getsz", &device]).await?;
        parse_sector_count(&out).ok_or_else(|| DriverError::Parse {
            command: format!("blockdev --getsz {device}"),
            output: out.trim().to_string(),
        })
    }
}

fn parse_sector_count(out: &str) -> Option<u64> {
    out.trim().parse().ok()
}
