//! iSCSI target export through `tgtadm`

use std::path::Path;

use async_trait::async_trait;
use tracing::info;
use vmthunder_common::TargetHandle;

use crate::cmd::CommandRunner;
use crate::error::DriverResult;

/// Exports local devices as iSCSI targets
#[async_trait]
pub trait TargetAdmin: Send + Sync {
    /// Export `backing` under `iqn`, returning the new target id
    async fn create_target(&self, iqn: &str, backing: &Path) -> DriverResult<u32>;

    /// Remove an exported target
    async fn remove_target(&self, target: &TargetHandle) -> DriverResult<()>;

    /// Whether a target named `iqn` is already exported
    async fn exists(&self, iqn: &str) -> DriverResult<bool>;

    /// Number of live initiator connections on target `tid`
    async fn live_connection_count(&self, tid: u32) -> DriverResult<usize>;
}

/// [`TargetAdmin`] backed by the tgt daemon
#[derive(Clone, Debug)]
pub struct TgtAdm {
    runner: CommandRunner,
    lun: u32,
}

impl TgtAdm {
    pub fn new(runner: CommandRunner, lun: u32) -> Self {
        Self { runner, lun }
    }

    async fn list_targets(&self) -> DriverResult<Vec<(u32, String)>> {
        let out = self
            .runner
            .run("tgtadm", &["--lld", "iscsi", "--mode", "target", "--op", "show"])
            .await?;
        Ok(parse_targets(&out))
    }
}

#[async_trait]
impl TargetAdmin for TgtAdm {
    async fn create_target(&self, iqn: &str, backing: &Path) -> DriverResult<u32> {
        let tid = next_tid(&self.list_targets().await?);
        let tid_arg = tid.to_string();
        let lun_arg = self.lun.to_string();
        let backing_arg = backing.to_string_lossy();

        self.runner
            .run(
                "tgtadm",
                &[
                    "--lld", "iscsi", "--mode", "target", "--op", "new", "--tid", &tid_arg,
                    "--targetname", iqn,
                ],
            )
            .await?;
        self.runner
            .run(
                "tgtadm",
                &[
                    "--lld",
                    "iscsi",
                    "--mode",
                    "logicalunit",
                    "--op",
                    "new",
                    "--tid",
                    &tid_arg,
                    "--lun",
                    &lun_arg,
                    "--backing-store",
                    &backing_arg,
                ],
            )
            .await?;
        self.runner
            .run(
                "tgtadm",
                &[
                    "--lld",
                    "iscsi",
                    "--mode",
                    "target",
                    "--op",
                    "bind",
                    "--tid",
                    &tid_arg,
                    "--initiator-address",
                    "ALL",
                ],
            )
            .await?;

        info!(tid, iqn = %iqn, backing = %backing.display(), "iSCSI target exported");
        Ok(tid)
    }

    async fn remove_target(&self, target: &TargetHandle) -> DriverResult<()> {
        let tid_arg = target.tid.to_string();
        self.runner
            .run(
                "tgtadm",
                &[
                    "--lld", "iscsi", "--mode", "target", "--op", "delete", "--force", "--tid",
                    &tid_arg,
                ],
            )
            .await?;
        info!(tid = target.tid, iqn = %target.iqn, "iSCSI target removed");
        Ok(())
    }

    async fn exists(&self, iqn: &str) -> DriverResult<bool> {
        Ok(self.list_targets().await?.iter().any(|(_, name)| name == iqn))
    }

    async fn live_connection_count(&self, tid: u32) -> DriverResult<usize> {
        let tid_arg = tid.to_string();
        let out = self
            .runner
            .run(
                "tgtadm",
                &["--lld", "iscsi", "--mode", "conn", "--op", "show", "--tid", &tid_arg],
            )
            .await?;
        Ok(count_connections(&out))
    }
}

/// Parse `tgtadm --mode target --op show` into `(tid, iqn)` pairs.
///
/// Target headers look like `Target 1: iqn.2010-10.org.openstack:vol1`.
fn parse_targets(out: &str) -> Vec<(u32, String)> {
    out.lines()
        .filter_map(|line| {
            let rest = line.strip_prefix("Target ")?;
            let (tid, iqn) = rest.split_once(':')?;
            Some((tid.trim().parse().ok()?, iqn.trim().to_string()))
        })
        .collect()
}

fn next_tid(targets: &[(u32, String)]) -> u32 {
    targets.iter().map(|(tid, _)| *tid).max().unwrap_or(0) + 1
}

fn count_connections(out: &str) -> usize {
    out.lines()
        .filter(|line| line.trim_start().starts_with("Connection:"))
        .count()
}
