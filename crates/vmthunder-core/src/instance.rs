//! Per-VM snapshot overlay
//!
//! Each VM gets a private copy-on-write volume attached over iSCSI. The
//! instance builds `snapshot_<vm>` over the session's shared origin with
//! that volume as the COW store, then replaces the by-path link the
//! hypervisor opens with a symlink to the snapshot.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use vmthunder_common::{ConnectionDescriptor, naming};
use vmthunder_drivers::{DeviceInfo, resolve_device};

use crate::backends::Backends;
use crate::error::{ThunderError, ThunderResult};
use crate::session::Session;

pub struct Instance {
    vm_name: String,
    volume_name: String,
    connection: ConnectionDescriptor,
    /// Link the hypervisor opens
    snapshot_link: PathBuf,
    /// Device the link pointed at when we attached
    snapshot_dev: PathBuf,
    snapshot_path: Option<PathBuf>,
    /// Cache wrap around `snapshot_dev`, when one was allocated
    cached_cow: Option<PathBuf>,
    snapshot_with_cache: bool,
    backends: Backends,
}

impl Instance {
    /// Attach the VM's private volume and resolve its device.
    ///
    /// Fails if the attach leaves no link or the link leads nowhere.
    /// The session is only read.
    pub async fn new(
        vm_name: impl Into<String>,
        session: &Session,
        snapshot_connection: ConnectionDescriptor,
    ) -> ThunderResult<Self> {
        let vm_name = vm_name.into();
        let backends = session.backends().clone();
        let device = backends.connector.connect(&snapshot_connection).await?;
        let snapshot_link = device.path;

        if !tokio::fs::try_exists(&snapshot_link).await.unwrap_or(false) {
            return Err(ThunderError::SnapshotLinkNotFound(snapshot_link));
        }
        let snapshot_dev = resolve_device(&snapshot_link);
        if snapshot_dev != snapshot_link && !tokio::fs::try_exists(&snapshot_dev).await.unwrap_or(false) {
            return Err(ThunderError::SnapshotDeviceNotFound(snapshot_dev));
        }
        debug!(vm = %vm_name, link = %snapshot_link.display(), dev = %snapshot_dev.display(), "snapshot volume attached");

        Ok(Self {
            vm_name,
            volume_name: session.volume_name().to_string(),
            connection: snapshot_connection,
            snapshot_link,
            snapshot_dev,
            snapshot_path: None,
            cached_cow: None,
            snapshot_with_cache: session.options().snapshot_with_cache,
            backends,
        })
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    pub fn volume_name(&self) -> &str {
        &self.volume_name
    }

    pub fn connection(&self) -> &ConnectionDescriptor {
        &self.connection
    }

    pub fn snapshot_link(&self) -> &Path {
        &self.snapshot_link
    }

    pub fn snapshot_dev(&self) -> &Path {
        &self.snapshot_dev
    }

    /// Snapshot mapping, once built
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Build the snapshot, publish it at the link and register the VM.
    /// Returns the published link.
    pub async fn start_vm(&mut self, session: &mut Session, origin_path: &Path) -> ThunderResult<PathBuf> {
        if session.contains_vm(&self.vm_name) {
            return Err(ThunderError::VmAlreadyRegistered(self.vm_name.clone()));
        }
        let snapshot = self.create_snapshot(origin_path).await?;
        self.link_snapshot(&snapshot).await?;
        session.add_vm(&self.vm_name)?;
        info!(vm = %self.vm_name, volume = %self.volume_name, link = %self.snapshot_link.display(), "VM started");
        Ok(self.snapshot_link.clone())
    }

    /// Remove the snapshot and link and unregister the VM
    pub async fn del_vm(&mut self, session: &mut Session) -> ThunderResult<()> {
        self.delete_snapshot().await?;
        self.unlink_snapshot().await?;
        session.rm_vm(&self.vm_name)?;
        info!(vm = %self.vm_name, volume = %self.volume_name, "VM deleted");
        Ok(())
    }

    /// Alternative attach path for the VM's private volume. No backend
    /// provides one yet.
    pub async fn connect_snapshot(&self, _connection: &ConnectionDescriptor) -> ThunderResult<DeviceInfo> {
        Err(ThunderError::NotImplemented("connect_snapshot".to_string()))
    }

    async fn create_snapshot(&mut self, origin_path: &Path) -> ThunderResult<PathBuf> {
        let cow = if self.snapshot_with_cache {
            let cached = self.backends.cache.attach(&self.snapshot_dev).await?;
            self.cached_cow = Some(cached.clone());
            cached
        } else {
            self.snapshot_dev.clone()
        };
        let snapshot = self
            .backends
            .mapper
            .snapshot(origin_path, &naming::snapshot_name(&self.vm_name), &cow)
            .await?;
        self.snapshot_path = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn delete_snapshot(&mut self) -> ThunderResult<()> {
        self.backends
            .mapper
            .remove_table(&naming::snapshot_name(&self.vm_name))
            .await?;
        self.snapshot_path = None;
        if self.cached_cow.take().is_some() {
            self.backends.cache.detach(&self.snapshot_dev).await?;
        }
        Ok(())
    }

    /// Point the link at the snapshot, replacing whatever was there.
    async fn link_snapshot(&self, target: &Path) -> ThunderResult<()> {
        remove_link(&self.snapshot_link).await?;
        tokio::fs::symlink(target, &self.snapshot_link).await?;
        debug!(link = %self.snapshot_link.display(), target = %target.display(), "snapshot linked");
        Ok(())
    }

    async fn unlink_snapshot(&self) -> ThunderResult<()> {
        remove_link(&self.snapshot_link).await?;
        debug!(link = %self.snapshot_link.display(), "snapshot unlinked");
        Ok(())
    }
}

/// Remove `path` itself (not what it points to); absent is fine.
async fn remove_link(path: &Path) -> ThunderResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
