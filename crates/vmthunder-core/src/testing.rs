//! In-memory collaborators for session and manager tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use vmthunder_common::{
    ConnectionDescriptor, ConnectionKey, ParentDescriptor, PeerStatus, TargetHandle, naming,
};
use vmthunder_drivers::{
    BlockMapper, CacheLayer, Connector, DeviceInfo, DriverError, DriverResult, TargetAdmin,
};
use vmthunder_tracker::{
    HeartbeatResponse, LoginRequest, ParentAssignment, Tracker, TrackerError, TrackerResult,
};

use crate::backends::{Backends, SessionOptions};

pub const PREFIX: &str = "/dev/mapper/";
pub const DEFAULT_SECTORS: u64 = 2048;

#[derive(Default)]
pub struct FakeState {
    /// Every collaborator call, in order
    pub calls: Vec<String>,
    /// Last table written per mapping name
    pub tables: HashMap<String, String>,
    pub sector_counts: HashMap<PathBuf, u64>,
    /// Link returned by `connect` per connection; default is a by-path name
    pub links: HashMap<ConnectionKey, PathBuf>,
    pub exported: HashMap<String, u32>,
    pub live_connections: usize,
    /// Replies to `get`; the last one repeats
    pub assignments: VecDeque<ParentAssignment>,
    pub heartbeat: HeartbeatResponse,
    pub logins: Vec<LoginRequest>,
    /// Call prefixes that fail
    pub failing: HashSet<String>,
}

#[derive(Default)]
pub struct FakeStack {
    state: Mutex<FakeState>,
}

impl FakeStack {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn backends(self: &Arc<Self>) -> Backends {
        Backends {
            mapper: self.clone(),
            targets: self.clone(),
            connector: self.clone(),
            cache: self.clone(),
            tracker: self.clone(),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn push_assignment(&self, assignment: ParentAssignment) {
        self.state.lock().assignments.push_back(assignment);
    }

    pub fn fail(&self, prefix: &str) {
        self.state.lock().failing.insert(prefix.to_string());
    }

    fn record(&self, call: String) -> DriverResult<()> {
        let mut state = self.state.lock();
        let failed = state.failing.iter().any(|p| call.starts_with(p.as_str()));
        state.calls.push(call.clone());
        if failed {
            return Err(DriverError::CommandFailed {
                command: call,
                code: 1,
                stderr: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn record_tracker(&self, call: String) -> TrackerResult<()> {
        self.record(call)
            .map_err(|e| TrackerError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl BlockMapper for FakeStack {
    fn device_path(&self, name: &str) -> PathBuf {
        PathBuf::from(format!("{PREFIX}{name}"))
    }

    async fn snapshot(
        &self,
        origin: &Path,
        name: &str,
        cow_device: &Path,
    ) -> DriverResult<PathBuf> {
        self.record(format!(
            "dm.snapshot {name} {} {}",
            origin.display(),
            cow_device.display()
        ))?;
        Ok(self.device_path(name))
    }

    async fn multipath(&self, name: &str, devices: &[PathBuf]) -> DriverResult<PathBuf> {
        let listed: Vec<String> = devices.iter().map(|d| d.display().to_string()).collect();
        self.record(format!("dm.multipath {name} {}", listed.join(",")))?;
        Ok(self.device_path(name))
    }

    async fn origin(&self, name: &str, backing: &Path) -> DriverResult<PathBuf> {
        self.record(format!("dm.origin {name} {}", backing.display()))?;
        Ok(self.device_path(name))
    }

    async fn reload_table(&self, name: &str, table: &str) -> DriverResult<()> {
        self.record(format!("dm.reload {name}"))?;
        self.state
            .lock()
            .tables
            .insert(name.to_string(), table.to_string());
        Ok(())
    }

    async fn remove_table(&self, name: &str) -> DriverResult<()> {
        self.record(format!("dm.remove {name}"))
    }

    async fn sector_count(&self, device: &Path) -> DriverResult<u64> {
        Ok(self
            .state
            .lock()
            .sector_counts
            .get(device)
            .copied()
            .unwrap_or(DEFAULT_SECTORS))
    }
}

#[async_trait]
impl TargetAdmin for FakeStack {
    async fn create_target(&self, iqn: &str, backing: &Path) -> DriverResult<u32> {
        self.record(format!("target.create {iqn} {}", backing.display()))?;
        let mut state = self.state.lock();
        let tid = u32::try_from(state.exported.len()).unwrap_or(0) + 1;
        state.exported.insert(iqn.to_string(), tid);
        Ok(tid)
    }

    async fn remove_target(&self, target: &TargetHandle) -> DriverResult<()> {
        self.record(format!("target.remove {}", target.tid))?;
        self.state.lock().exported.remove(&target.iqn);
        Ok(())
    }

    async fn exists(&self, iqn: &str) -> DriverResult<bool> {
        Ok(self.state.lock().exported.contains_key(iqn))
    }

    async fn live_connection_count(&self, _tid: u32) -> DriverResult<usize> {
        Ok(self.state.lock().live_connections)
    }
}

#[async_trait]
impl Connector for FakeStack {
    async fn connect(&self, connection: &ConnectionDescriptor) -> DriverResult<DeviceInfo> {
        self.record(format!("connect {}", connection.key()))?;
        let path = self
            .state
            .lock()
            .links
            .get(&connection.key())
            .cloned()
            .unwrap_or_else(|| {
                PathBuf::from("/dev/disk/by-path").join(connection.by_path_name())
            });
        Ok(DeviceInfo { path })
    }

    async fn disconnect(&self, connection: &ConnectionDescriptor) -> DriverResult<()> {
        self.record(format!("disconnect {}", connection.key()))
    }
}

#[async_trait]
impl CacheLayer for FakeStack {
    async fn attach(&self, device: &Path) -> DriverResult<PathBuf> {
        self.record(format!("cache.attach {}", device.display()))?;
        Ok(PathBuf::from(format!(
            "{PREFIX}{}",
            naming::cached_name(&device.to_string_lossy())
        )))
    }

    async fn detach(&self, device: &Path) -> DriverResult<()> {
        self.record(format!("cache.detach {}", device.display()))
    }
}

#[async_trait]
impl Tracker for FakeStack {
    async fn login(&self, request: &LoginRequest) -> TrackerResult<()> {
        self.record_tracker(format!("tracker.login {}", request.session_name))?;
        self.state.lock().logins.push(request.clone());
        Ok(())
    }

    async fn get(&self, session_name: &str, _host: &str) -> TrackerResult<ParentAssignment> {
        self.record_tracker(format!("tracker.get {session_name}"))?;
        let mut state = self.state.lock();
        let assignment = if state.assignments.len() > 1 {
            state.assignments.pop_front()
        } else {
            state.assignments.front().cloned()
        };
        Ok(assignment.unwrap_or_else(|| ParentAssignment {
            peer_id: "peer-1".to_string(),
            parents: Vec::new(),
        }))
    }

    async fn logout(&self, session_name: &str, peer_id: &str) -> TrackerResult<()> {
        self.record_tracker(format!("tracker.logout {session_name} {peer_id}"))
    }

    async fn heartbeat(&self) -> TrackerResult<HeartbeatResponse> {
        self.record_tracker("tracker.heartbeat".to_string())?;
        Ok(self.state.lock().heartbeat.clone())
    }
}

pub fn options() -> SessionOptions {
    SessionOptions {
        host_address: "10.0.0.2".to_string(),
        iscsi_port: 3260,
        export_lun: 1,
        poll_interval: Duration::from_millis(1),
        settle_delay: Duration::ZERO,
        snapshot_with_cache: false,
    }
}

/// Root connection used by most tests
pub fn root() -> ConnectionDescriptor {
    ConnectionDescriptor::new("10.0.0.1:3260", "iqn.p", 1)
}

pub fn parent(host: &str, iqn: &str, status: PeerStatus) -> ParentDescriptor {
    ParentDescriptor {
        host: host.to_string(),
        port: 3260,
        iqn: iqn.to_string(),
        lun: 1,
        status,
    }
}

pub fn assignment(parents: Vec<ParentDescriptor>) -> ParentAssignment {
    ParentAssignment {
        peer_id: "peer-1".to_string(),
        parents,
    }
}
