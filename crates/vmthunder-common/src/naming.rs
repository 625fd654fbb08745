//! Deterministic device-mapper names
//!
//! Names are scoped per host. They must stay stable across restarts so an
//! agent can find mappings it created earlier.

/// Device-mapper name of a volume's origin mapping
pub fn origin_name(volume_name: &str) -> String {
    format!("origin_{volume_name}")
}

/// Device-mapper name of a volume's multipath aggregation
pub fn multipath_name(volume_name: &str) -> String {
    format!("multipath_{volume_name}")
}

/// Device-mapper name of a VM's snapshot mapping
pub fn snapshot_name(vm_name: &str) -> String {
    format!("snapshot_{vm_name}")
}

/// Device-mapper name of the cache wrapped around `device`
pub fn cached_name(device: &str) -> String {
    let base = device.rsplit('/').next().unwrap_or(device);
    format!("cached_{base}")
}
