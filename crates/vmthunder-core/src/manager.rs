//! Host-wide registry of sessions and instances
//!
//! One [`Session`] per volume, each behind its own async mutex so all
//! operations on a volume run one at a time while different volumes
//! proceed in parallel. The maps themselves are only locked briefly and
//! never across an await.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use vmthunder_common::{ConnectionDescriptor, Connections};
use vmthunder_tracker::HeartbeatResponse;

use crate::backends::{Backends, SessionOptions};
use crate::error::{ThunderError, ThunderResult};
use crate::instance::Instance;
use crate::session::{Session, SessionStatus};

type SessionHandle = Arc<AsyncMutex<Session>>;

pub struct SessionManager {
    backends: Backends,
    options: SessionOptions,
    deploy_timeout: Option<Duration>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    instances: Mutex<HashMap<String, Instance>>,
    /// VM names with a boot in flight
    booting: Mutex<HashSet<String>>,
    /// VM-less volumes whose last destroy was refused or failed
    pending_destroy: Mutex<HashSet<String>>,
}

/// Holds a VM name for the duration of a boot
struct VmReservation<'a> {
    booting: &'a Mutex<HashSet<String>>,
    vm_name: String,
}

impl Drop for VmReservation<'_> {
    fn drop(&mut self) {
        self.booting.lock().remove(&self.vm_name);
    }
}

impl SessionManager {
    pub fn new(backends: Backends, options: SessionOptions, deploy_timeout: Option<Duration>) -> Self {
        Self {
            backends,
            options,
            deploy_timeout,
            sessions: RwLock::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            booting: Mutex::new(HashSet::new()),
            pending_destroy: Mutex::new(HashSet::new()),
        }
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn has_session(&self, volume_name: &str) -> bool {
        self.sessions.read().contains_key(volume_name)
    }

    pub fn has_instance(&self, vm_name: &str) -> bool {
        self.instances.lock().contains_key(vm_name)
    }

    /// Claim `vm_name` unless it is registered or already booting.
    fn reserve_vm(&self, vm_name: &str) -> ThunderResult<VmReservation<'_>> {
        let instances = self.instances.lock();
        let mut booting = self.booting.lock();
        if instances.contains_key(vm_name) || !booting.insert(vm_name.to_string()) {
            return Err(ThunderError::VmAlreadyRegistered(vm_name.to_string()));
        }
        Ok(VmReservation {
            booting: &self.booting,
            vm_name: vm_name.to_string(),
        })
    }

    fn get_or_create(&self, volume_name: &str) -> SessionHandle {
        if let Some(handle) = self.sessions.read().get(volume_name) {
            return handle.clone();
        }
        self.sessions
            .write()
            .entry(volume_name.to_string())
            .or_insert_with(|| {
                debug!(volume = %volume_name, "new session");
                Arc::new(AsyncMutex::new(Session::new(
                    volume_name,
                    self.backends.clone(),
                    self.options.clone(),
                )))
            })
            .clone()
    }

    /// Lock the session registered for `volume_name`, creating it if needed.
    ///
    /// A session can be destroyed and dropped from the map while we wait
    /// for its lock; in that case start over with a fresh one.
    pub(crate) async fn lock_session(&self, volume_name: &str) -> OwnedMutexGuard<Session> {
        loop {
            let handle = self.get_or_create(volume_name);
            let guard = handle.clone().lock_owned().await;
            let current = self
                .sessions
                .read()
                .get(volume_name)
                .is_some_and(|h| Arc::ptr_eq(h, &handle));
            if current {
                return guard;
            }
        }
    }

    fn existing(&self, volume_name: &str) -> ThunderResult<SessionHandle> {
        self.sessions
            .read()
            .get(volume_name)
            .cloned()
            .ok_or_else(|| ThunderError::SessionNotFound(volume_name.to_string()))
    }

    fn forget(&self, volume_name: &str, handle: &SessionHandle) {
        let mut sessions = self.sessions.write();
        if sessions.get(volume_name).is_some_and(|h| Arc::ptr_eq(h, handle)) {
            sessions.remove(volume_name);
        }
        self.pending_destroy.lock().remove(volume_name);
    }

    /// Deploy `volume_name` if needed, then snapshot it for `vm_name`.
    /// Returns the link the VM should boot from.
    pub async fn boot_vm(
        &self,
        volume_name: &str,
        vm_name: &str,
        connections: impl Into<Connections>,
        snapshot_connection: ConnectionDescriptor,
    ) -> ThunderResult<PathBuf> {
        let reservation = self.reserve_vm(vm_name)?;
        let mut session = self.lock_session(volume_name).await;

        match self
            .start_on(&mut session, vm_name, connections.into(), snapshot_connection)
            .await
        {
            Ok((instance, link)) => {
                self.pending_destroy.lock().remove(volume_name);
                self.instances.lock().insert(vm_name.to_string(), instance);
                drop(reservation);
                Ok(link)
            }
            Err(e) => {
                if !session.has_vm() {
                    self.pending_destroy.lock().insert(volume_name.to_string());
                }
                Err(e)
            }
        }
    }

    async fn start_on(
        &self,
        session: &mut Session,
        vm_name: &str,
        connections: Connections,
        snapshot_connection: ConnectionDescriptor,
    ) -> ThunderResult<(Instance, PathBuf)> {
        let volume_name = session.volume_name().to_string();
        let deploy = session.deploy_image(connections);
        let origin = match self.deploy_timeout {
            Some(limit) => tokio::time::timeout(limit, deploy)
                .await
                .map_err(|_| ThunderError::DeployTimeout(volume_name))??,
            None => deploy.await?,
        };

        let mut instance = Instance::new(vm_name, session, snapshot_connection).await?;
        let link = instance.start_vm(session, &origin).await?;
        Ok((instance, link))
    }

    /// Tear down `vm_name` and, if it was the last VM, its session.
    ///
    /// Returns whether the session was destroyed. A refused or failed destroy is
    /// retried by [`SessionManager::retry_destroy`].
    pub async fn delete_vm(&self, vm_name: &str) -> ThunderResult<bool> {
        let mut instance = self
            .instances
            .lock()
            .remove(vm_name)
            .ok_or_else(|| ThunderError::VmNotRegistered(vm_name.to_string()))?;
        let volume_name = instance.volume_name().to_string();

        let handle = match self.existing(&volume_name) {
            Ok(handle) => handle,
            Err(e) => {
                self.instances.lock().insert(vm_name.to_string(), instance);
                return Err(e);
            }
        };
        let mut session = handle.clone().lock_owned().await;

        if let Err(e) = instance.del_vm(&mut session).await {
            self.instances.lock().insert(vm_name.to_string(), instance);
            return Err(e);
        }

        let result = session.destroy().await;
        let idle = !session.has_vm();
        drop(session);
        match result {
            Ok(true) => {
                self.forget(&volume_name, &handle);
                Ok(true)
            }
            Ok(false) => {
                if idle {
                    self.pending_destroy.lock().insert(volume_name);
                }
                Ok(false)
            }
            Err(e) => {
                if idle {
                    self.pending_destroy.lock().insert(volume_name);
                }
                Err(e)
            }
        }
    }

    /// Retry destroys that were refused or failed earlier. Returns how many
    /// sessions were torn down. Sessions mid-operation are left for the next
    /// round.
    pub async fn retry_destroy(&self) -> usize {
        let pending: Vec<String> = self.pending_destroy.lock().iter().cloned().collect();
        let mut destroyed = 0;
        for volume_name in pending {
            let Ok(handle) = self.existing(&volume_name) else {
                self.pending_destroy.lock().remove(&volume_name);
                continue;
            };
            let Ok(mut session) = handle.clone().try_lock_owned() else {
                debug!(volume = %volume_name, "session busy, retrying later");
                continue;
            };
            if session.has_vm() {
                self.pending_destroy.lock().remove(&volume_name);
                continue;
            }
            match session.destroy().await {
                Ok(true) => {
                    drop(session);
                    self.forget(&volume_name, &handle);
                    destroyed += 1;
                }
                Ok(false) => debug!(volume = %volume_name, "still busy"),
                Err(e) => warn!(volume = %volume_name, error = %e, "destroy retry failed"),
            }
        }
        destroyed
    }

    /// Apply the parent lists from a heartbeat to the sessions we hold.
    ///
    /// Failures are logged per session and do not stop the others. Sessions
    /// mid-operation (e.g. still waiting for parents) are skipped; the next
    /// heartbeat carries the list again.
    pub async fn apply_heartbeat(&self, response: &HeartbeatResponse) -> usize {
        let mut adjusted = 0;
        for assignment in &response.sessions {
            let Ok(handle) = self.existing(&assignment.session_name) else {
                debug!(volume = %assignment.session_name, "heartbeat for unknown session");
                continue;
            };
            let Ok(mut session) = handle.try_lock() else {
                debug!(volume = %assignment.session_name, "session busy, skipping heartbeat");
                continue;
            };
            if !session.has_multipath() {
                debug!(volume = %assignment.session_name, "session not deployed, skipping");
                continue;
            }
            match session.adjust_for_heartbeat(&assignment.parents).await {
                Ok(()) => adjusted += 1,
                Err(e) => warn!(volume = %assignment.session_name, error = %e, "heartbeat adjust failed"),
            }
        }
        adjusted
    }

    pub async fn adjust_structure(
        &self,
        volume_name: &str,
        delete_connections: &[ConnectionDescriptor],
        add_connections: &[ConnectionDescriptor],
    ) -> ThunderResult<()> {
        let handle = self.existing(volume_name)?;
        let mut session = handle.lock().await;
        session
            .adjust_structure(delete_connections, add_connections)
            .await
    }

    /// Status of every session; sessions mid-operation are reported busy
    pub fn status(&self) -> Vec<SessionStatus> {
        let handles: Vec<(String, SessionHandle)> = self
            .sessions
            .read()
            .iter()
            .map(|(name, handle)| (name.clone(), handle.clone()))
            .collect();
        let mut statuses: Vec<SessionStatus> = handles
            .into_iter()
            .map(|(name, handle)| {
                let status = match handle.try_lock() {
                    Ok(session) => session.status(),
                    Err(_) => SessionStatus::busy(&name),
                };
                status
            })
            .collect();
        statuses.sort_by(|a, b| a.volume_name.cmp(&b.volume_name));
        statuses
    }

    /// Destroy every VM-less session, e.g. on shutdown
    pub async fn shutdown(&self) {
        let volumes: Vec<String> = self.sessions.read().keys().cloned().collect();
        for volume_name in volumes {
            self.pending_destroy.lock().insert(volume_name);
        }
        let destroyed = self.retry_destroy().await;
        info!(destroyed, remaining = self.session_count(), "session manager shut down");
    }
}
