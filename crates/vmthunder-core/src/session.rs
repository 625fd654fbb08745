//! Per-volume session
//!
//! A session owns everything one host builds for one base volume:
//!
//! ```text
//! upstream logins (root source or tracker-assigned parents)
//!   -> multipath_<volume>
//!   -> cache layer
//!   -> origin_<volume>            shared base for every VM snapshot
//!   -> exported target            so other hosts can use us as a parent
//! ```
//!
//! Sessions never lock themselves; the manager serializes access by
//! holding each one behind its own mutex.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use vmthunder_common::{
    ConnectionDescriptor, Connections, ParentDescriptor, TargetHandle, naming,
};
use vmthunder_drivers::{multipath_table, resolve_device};
use vmthunder_tracker::{LoginRequest, ParentAssignment};

use crate::backends::{Backends, SessionOptions};
use crate::chain::DeviceChain;
use crate::connections::ConnectionTable;
use crate::error::{ThunderError, ThunderResult};

/// Snapshot of a session for status reporting
#[derive(Clone, Debug, Serialize)]
pub struct SessionStatus {
    pub volume_name: String,
    /// Another operation holds the session; remaining fields are empty
    pub busy: bool,
    pub peer_id: String,
    pub logged_in: bool,
    pub multipath: Option<PathBuf>,
    pub cache: Option<PathBuf>,
    pub origin: Option<PathBuf>,
    pub target_id: Option<u32>,
    pub connections: Vec<ConnectionDescriptor>,
    pub vms: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl SessionStatus {
    pub fn busy(volume_name: &str) -> Self {
        Self {
            volume_name: volume_name.to_string(),
            busy: true,
            peer_id: String::new(),
            logged_in: false,
            multipath: None,
            cache: None,
            origin: None,
            target_id: None,
            connections: Vec::new(),
            vms: Vec::new(),
            created_at: None,
        }
    }
}

pub struct Session {
    volume_name: String,
    backends: Backends,
    options: SessionOptions,
    /// Connections handed to the first deploy; fallback when the tracker
    /// assigns no parents
    root: Vec<ConnectionDescriptor>,
    connections: ConnectionTable,
    chain: DeviceChain,
    /// Registered with the tracker as a peer
    logged_in: bool,
    peer_id: String,
    vms: BTreeSet<String>,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(volume_name: impl Into<String>, backends: Backends, options: SessionOptions) -> Self {
        Self {
            volume_name: volume_name.into(),
            backends,
            options,
            root: Vec::new(),
            connections: ConnectionTable::new(),
            chain: DeviceChain::new(),
            logged_in: false,
            peer_id: String::new(),
            vms: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    pub fn volume_name(&self) -> &str {
        &self.volume_name
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    pub(crate) fn backends(&self) -> &Backends {
        &self.backends
    }

    pub(crate) fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn chain(&self) -> &DeviceChain {
        &self.chain
    }

    pub fn has_multipath(&self) -> bool {
        self.chain.multipath().is_some()
    }

    pub fn has_cache(&self) -> bool {
        self.chain.cache().is_some()
    }

    pub fn has_origin(&self) -> bool {
        self.chain.origin().is_some()
    }

    pub fn has_target(&self) -> bool {
        self.chain.target().is_some()
    }

    pub fn target_id(&self) -> Option<u32> {
        self.chain.target().map(|t| t.tid)
    }

    /// Built origin, if any
    pub fn origin_path(&self) -> Option<&Path> {
        self.chain.origin()
    }

    pub fn root_connections(&self) -> &[ConnectionDescriptor] {
        &self.root
    }

    pub fn active_connections(&self) -> Vec<ConnectionDescriptor> {
        self.connections.descriptors()
    }

    pub fn path_of(&self, connection: &ConnectionDescriptor) -> Option<&Path> {
        self.connections.path_of(connection)
    }

    pub fn has_vm(&self) -> bool {
        !self.vms.is_empty()
    }

    pub fn contains_vm(&self, vm_name: &str) -> bool {
        self.vms.contains(vm_name)
    }

    pub fn vm_names(&self) -> Vec<String> {
        self.vms.iter().cloned().collect()
    }

    pub fn add_vm(&mut self, vm_name: &str) -> ThunderResult<()> {
        if !self.vms.insert(vm_name.to_string()) {
            error!(volume = %self.volume_name, vm = %vm_name, "VM already registered");
            return Err(ThunderError::VmAlreadyRegistered(vm_name.to_string()));
        }
        debug!(volume = %self.volume_name, vm = %vm_name, "VM registered");
        Ok(())
    }

    pub fn rm_vm(&mut self, vm_name: &str) -> ThunderResult<()> {
        if !self.vms.remove(vm_name) {
            error!(volume = %self.volume_name, vm = %vm_name, "VM not registered");
            return Err(ThunderError::VmNotRegistered(vm_name.to_string()));
        }
        debug!(volume = %self.volume_name, vm = %vm_name, "VM unregistered");
        Ok(())
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            volume_name: self.volume_name.clone(),
            busy: false,
            peer_id: self.peer_id.clone(),
            logged_in: self.logged_in,
            multipath: self.chain.multipath().map(Path::to_path_buf),
            cache: self.chain.cache().map(Path::to_path_buf),
            origin: self.chain.origin().map(Path::to_path_buf),
            target_id: self.target_id(),
            connections: self.connections.descriptors(),
            vms: self.vm_names(),
            created_at: Some(self.created_at),
        }
    }

    /// Bring the volume up on this host and return the origin path.
    ///
    /// Waits (without bound) until the tracker reports every assigned
    /// parent ready; callers that need a limit drop or time out the
    /// returned future. Repeat calls after a successful deploy return the
    /// existing origin without touching anything.
    pub async fn deploy_image(&mut self, connections: impl Into<Connections>) -> ThunderResult<PathBuf> {
        if self.logged_in {
            if let Some(origin) = self.chain.origin() {
                debug!(volume = %self.volume_name, "already deployed");
                return Ok(origin.to_path_buf());
            }
        }

        let connections = connections.into().into_vec();
        if connections.is_empty() {
            return Err(ThunderError::NoConnections(self.volume_name.clone()));
        }
        self.root = connections.clone();

        let assignment = self.wait_for_parents().await?;
        let upstream = if assignment.parents.is_empty() {
            connections.clone()
        } else {
            translate(&assignment.parents)
        };
        info!(
            volume = %self.volume_name,
            peer_id = %self.peer_id,
            upstream = upstream.len(),
            from_root = assignment.parents.is_empty(),
            "deploying volume"
        );

        self.login_targets(&upstream).await?;

        if self.has_multipath() {
            self.add_path(None).await?;
        } else {
            let paths = self.connections.paths();
            let multipath = self
                .backends
                .mapper
                .multipath(&naming::multipath_name(&self.volume_name), &paths)
                .await?;
            self.chain.set_multipath(multipath);
            self.attach_cache().await?;

            // The source IQN names the volume everywhere in the tree.
            let iqn = connections[0].iqn.clone();
            if self.backends.targets.exists(&iqn).await? {
                debug!(volume = %self.volume_name, iqn = %iqn, "target already exported");
            } else {
                self.export_target(&iqn).await?;
            }
        }

        self.ensure_origin().await
    }

    async fn wait_for_parents(&mut self) -> ThunderResult<ParentAssignment> {
        loop {
            let assignment = self
                .backends
                .tracker
                .get(&self.volume_name, &self.options.host_address)
                .await?;
            self.peer_id.clone_from(&assignment.peer_id);
            if assignment.all_ready() {
                return Ok(assignment);
            }
            debug!(
                volume = %self.volume_name,
                parents = assignment.parents.len(),
                "parents pending"
            );
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    async fn attach_cache(&mut self) -> ThunderResult<PathBuf> {
        if let Some(cache) = self.chain.cache() {
            return Ok(cache.to_path_buf());
        }
        let multipath = self
            .chain
            .multipath()
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                ThunderError::InvalidTransition("cache requires a multipath device".to_string())
            })?;
        let cached = self.backends.cache.attach(&multipath).await?;
        self.chain.set_cache(cached.clone())?;
        Ok(cached)
    }

    async fn export_target(&mut self, iqn: &str) -> ThunderResult<()> {
        let cached = self.attach_cache().await?;
        let tid = self.backends.targets.create_target(iqn, &cached).await?;
        self.chain.set_target(TargetHandle {
            tid,
            iqn: iqn.to_string(),
        })?;

        self.backends
            .tracker
            .login(&LoginRequest {
                session_name: self.volume_name.clone(),
                peer_id: self.peer_id.clone(),
                host: self.options.host_address.clone(),
                port: self.options.iscsi_port,
                iqn: iqn.to_string(),
                lun: self.options.export_lun,
            })
            .await?;
        self.logged_in = true;
        info!(volume = %self.volume_name, tid, iqn = %iqn, "exported and registered with tracker");
        Ok(())
    }

    async fn ensure_origin(&mut self) -> ThunderResult<PathBuf> {
        if let Some(origin) = self.chain.origin() {
            return Ok(origin.to_path_buf());
        }
        let cached = self.attach_cache().await?;
        let origin = self
            .backends
            .mapper
            .origin(&naming::origin_name(&self.volume_name), &cached)
            .await?;
        self.chain.set_origin(origin.clone())?;
        info!(volume = %self.volume_name, origin = %origin.display(), "origin ready");
        Ok(origin)
    }

    /// Tear the chain down if nothing depends on it.
    ///
    /// Returns `Ok(false)` while VMs are attached or a child host still
    /// has a live connection on our target; a later retry may succeed.
    pub async fn destroy(&mut self) -> ThunderResult<bool> {
        if self.has_vm() {
            debug!(volume = %self.volume_name, vms = self.vms.len(), "VMs attached, not destroying");
            return Ok(false);
        }

        if self.logged_in {
            self.backends
                .tracker
                .logout(&self.volume_name, &self.peer_id)
                .await?;
            self.logged_in = false;
        }

        if let Some(target) = self.chain.target() {
            let live = self
                .backends
                .targets
                .live_connection_count(target.tid)
                .await?;
            if live > 0 {
                info!(volume = %self.volume_name, tid = target.tid, live, "children still attached");
                return Ok(false);
            }
        }

        self.teardown().await?;
        info!(volume = %self.volume_name, "session destroyed");
        Ok(true)
    }

    /// Release whatever the chain no longer needs.
    async fn teardown(&mut self) -> ThunderResult<()> {
        if self.has_vm() {
            warn!(volume = %self.volume_name, vms = ?self.vms, "VMs attached, keeping origin");
        } else if self.chain.origin().is_some() {
            self.backends
                .mapper
                .remove_table(&naming::origin_name(&self.volume_name))
                .await?;
            self.chain.take_origin();
        }

        if let Some(target) = self.chain.target().cloned() {
            self.backends.targets.remove_target(&target).await?;
            self.chain.take_target();
        }

        // Give tgtd time to drop its hold on the cached device.
        tokio::time::sleep(self.options.settle_delay).await;

        if self.chain.cache().is_some() && self.chain.can_detach_cache() {
            if let Some(multipath) = self.chain.multipath().map(Path::to_path_buf) {
                self.backends.cache.detach(&multipath).await?;
            }
            self.chain.take_cache()?;
        }

        if self.chain.multipath().is_some() && self.chain.can_remove_multipath() {
            self.backends
                .mapper
                .remove_table(&naming::multipath_name(&self.volume_name))
                .await?;
            self.chain.take_multipath()?;
        }

        // Upstream paths back the multipath for as long as it exists.
        if self.chain.multipath().is_none() {
            for connection in self.connections.descriptors() {
                self.logout_target(&connection).await?;
            }
        }
        Ok(())
    }

    /// Swap upstream connections by explicit lists, then release what is
    /// no longer needed.
    pub async fn adjust_structure(
        &mut self,
        delete_connections: &[ConnectionDescriptor],
        add_connections: &[ConnectionDescriptor],
    ) -> ThunderResult<()> {
        info!(
            volume = %self.volume_name,
            delete = delete_connections.len(),
            add = add_connections.len(),
            "adjusting structure"
        );
        self.login_targets(add_connections).await?;

        let mut dropped = Vec::new();
        for connection in delete_connections {
            if let Some(upstream) = self.connections.remove(connection) {
                dropped.push(upstream.connection);
            }
        }

        self.add_path(None).await?;

        for connection in &dropped {
            self.backends.connector.disconnect(connection).await?;
        }

        self.teardown().await
    }

    /// Follow the parent list pushed with a heartbeat.
    ///
    /// An empty list means "go back to the source".
    pub async fn adjust_for_heartbeat(&mut self, parents: &[ParentDescriptor]) -> ThunderResult<()> {
        let mut wanted = if parents.is_empty() {
            self.root.clone()
        } else {
            translate(parents)
        };
        let mut seen = BTreeSet::new();
        wanted.retain(|c| seen.insert(c.key()));
        if wanted.is_empty() {
            warn!(volume = %self.volume_name, "no parents and no root connections, ignoring heartbeat");
            return Ok(());
        }

        self.login_targets(&wanted).await?;
        self.add_path(Some(&wanted)).await?;

        let stale: Vec<ConnectionDescriptor> = self
            .connections
            .descriptors()
            .into_iter()
            .filter(|c| !wanted.contains(c))
            .collect();
        for connection in &stale {
            self.logout_target(connection).await?;
        }
        self.connections.reorder(&wanted);

        info!(
            volume = %self.volume_name,
            upstream = wanted.len(),
            dropped = stale.len(),
            "upstream adjusted"
        );
        Ok(())
    }

    /// Rewrite the multipath table so it lists exactly `connections`
    /// (the active set when none are given). No-op for an empty set.
    pub async fn add_path(&mut self, connections: Option<&[ConnectionDescriptor]>) -> ThunderResult<()> {
        let connections = match connections {
            Some(given) if !given.is_empty() => given.to_vec(),
            _ => self.connections.descriptors(),
        };
        if connections.is_empty() {
            debug!(volume = %self.volume_name, "no paths to load");
            return Ok(());
        }

        let paths = connections
            .iter()
            .map(|c| {
                self.connections
                    .path_of(c)
                    .map(Path::to_path_buf)
                    .ok_or_else(|| ThunderError::MissingPath(c.key().to_string()))
            })
            .collect::<ThunderResult<Vec<_>>>()?;

        let sectors = self.backends.mapper.sector_count(&paths[0]).await?;
        let table = multipath_table(sectors, &paths);
        self.backends
            .mapper
            .reload_table(&naming::multipath_name(&self.volume_name), &table)
            .await?;
        Ok(())
    }

    /// Log in to each connection not already active.
    async fn login_targets(&mut self, connections: &[ConnectionDescriptor]) -> ThunderResult<()> {
        for connection in connections {
            self.login_target(connection).await?;
        }
        Ok(())
    }

    async fn login_target(&mut self, connection: &ConnectionDescriptor) -> ThunderResult<()> {
        if self.connections.contains(connection) {
            return Ok(());
        }
        let device = self.backends.connector.connect(connection).await?;
        let path = resolve_device(&device.path);
        debug!(volume = %self.volume_name, connection = %connection, path = %path.display(), "upstream login");
        self.connections.insert(connection.clone(), path);
        Ok(())
    }

    async fn logout_target(&mut self, connection: &ConnectionDescriptor) -> ThunderResult<()> {
        if !self.connections.contains(connection) {
            return Ok(());
        }
        self.backends.connector.disconnect(connection).await?;
        self.connections.remove(connection);
        debug!(volume = %self.volume_name, connection = %connection, "upstream logout");
        Ok(())
    }
}

fn translate(parents: &[ParentDescriptor]) -> Vec<ConnectionDescriptor> {
    parents.iter().map(ParentDescriptor::to_connection).collect()
}
