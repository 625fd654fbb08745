//! iSCSI initiator side: attach and detach remote targets

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info};
use vmthunder_common::ConnectionDescriptor;

use crate::cmd::CommandRunner;
use crate::error::{DriverError, DriverResult};

/// `iscsiadm` exit code for "session already exists"
const ISCSI_ERR_SESS_EXISTS: i32 = 15;
/// `iscsiadm` exit code for "no matching session"
const ISCSI_ERR_NO_OBJS_FOUND: i32 = 21;

/// What an attach produced
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Local link or device node for the attached target
    pub path: PathBuf,
}

/// Attaches remote block targets to this host
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, connection: &ConnectionDescriptor) -> DriverResult<DeviceInfo>;

    async fn disconnect(&self, connection: &ConnectionDescriptor) -> DriverResult<()>;
}

/// [`Connector`] backed by open-iscsi
#[derive(Clone, Debug)]
pub struct IscsiConnector {
    runner: CommandRunner,
    by_path_dir: PathBuf,
    device_wait: Duration,
}

impl IscsiConnector {
    pub fn new(runner: CommandRunner, device_wait: Duration) -> Self {
        Self {
            runner,
            by_path_dir: PathBuf::from("/dev/disk/by-path"),
            device_wait,
        }
    }

    /// Link udev creates for `connection`
    pub fn device_link(&self, connection: &ConnectionDescriptor) -> PathBuf {
        self.by_path_dir.join(connection.by_path_name())
    }

    async fn iscsiadm(
        &self,
        connection: &ConnectionDescriptor,
        extra: &[&str],
        ok_codes: &[i32],
    ) -> DriverResult<String> {
        let mut args = vec![
            "-m",
            "node",
            "-T",
            connection.iqn.as_str(),
            "-p",
            connection.portal.as_str(),
        ];
        args.extend_from_slice(extra);
        self.runner.run_allowing("iscsiadm", &args, ok_codes).await
    }
}

#[async_trait]
impl Connector for IscsiConnector {
    async fn connect(&self, connection: &ConnectionDescriptor) -> DriverResult<DeviceInfo> {
        self.iscsiadm(connection, &["--op", "new"], &[]).await?;
        self.iscsiadm(connection, &["--login"], &[ISCSI_ERR_SESS_EXISTS])
            .await?;

        let path = self.device_link(connection);
        wait_for_device(&path, self.device_wait).await?;
        info!(portal = %connection.portal, iqn = %connection.iqn, path = %path.display(), "iSCSI target attached");
        Ok(DeviceInfo { path })
    }

    async fn disconnect(&self, connection: &ConnectionDescriptor) -> DriverResult<()> {
        self.iscsiadm(connection, &["--logout"], &[ISCSI_ERR_NO_OBJS_FOUND])
            .await?;
        self.iscsiadm(connection, &["--op", "delete"], &[ISCSI_ERR_NO_OBJS_FOUND])
            .await?;
        info!(portal = %connection.portal, iqn = %connection.iqn, "iSCSI target detached");
        Ok(())
    }
}

/// Canonical device behind `path`.
///
/// Follows symlinks like `realpath`; a path that cannot be resolved is
/// returned unchanged.
pub fn resolve_device(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Poll until `path` exists or `timeout` elapses.
pub async fn wait_for_device(path: &Path, timeout: Duration) -> DriverResult<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(DriverError::DeviceNotFound(path.to_path_buf()));
        }
        debug!(path = %path.display(), "waiting for device");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
