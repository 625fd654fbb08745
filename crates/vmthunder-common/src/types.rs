//! Core types for VMThunder
//!
//! Connection descriptors identify an upstream iSCSI target. Parent
//! descriptors are what the tracker hands out when it assigns peers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of an upstream connection: portal plus IQN.
///
/// The LUN is deliberately not part of the key, two descriptors that differ
/// only by LUN name the same upstream target.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionKey {
    pub portal: String,
    pub iqn: String,
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.portal, self.iqn)
    }
}

/// One upstream iSCSI target endpoint
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// `host:port`
    #[serde(rename = "target_portal", alias = "portal")]
    pub portal: String,
    /// iSCSI qualified name
    #[serde(rename = "target_iqn", alias = "iqn")]
    pub iqn: String,
    /// Logical unit number
    #[serde(rename = "target_lun", alias = "lun")]
    pub lun: u32,
}

impl ConnectionDescriptor {
    /// Create a new connection descriptor
    pub fn new(portal: impl Into<String>, iqn: impl Into<String>, lun: u32) -> Self {
        Self {
            portal: portal.into(),
            iqn: iqn.into(),
            lun,
        }
    }

    /// Identity key (portal + IQN)
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey {
            portal: self.portal.clone(),
            iqn: self.iqn.clone(),
        }
    }

    /// Name of the udev by-path link the initiator creates for this target
    pub fn by_path_name(&self) -> String {
        format!("ip-{}-iscsi-{}-lun-{}", self.portal, self.iqn, self.lun)
    }
}

impl PartialEq for ConnectionDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.portal == other.portal && self.iqn == other.iqn
    }
}

impl Eq for ConnectionDescriptor {}

impl Hash for ConnectionDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.portal.hash(state);
        self.iqn.hash(state);
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} lun {}", self.portal, self.iqn, self.lun)
    }
}

/// One descriptor or a set of them.
///
/// Callers may hand a single descriptor where a set is expected; it is
/// normalized into a one-element set.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Connections {
    One(ConnectionDescriptor),
    Many(Vec<ConnectionDescriptor>),
}

impl Connections {
    /// Normalize into an ordered list
    pub fn into_vec(self) -> Vec<ConnectionDescriptor> {
        match self {
            Self::One(connection) => vec![connection],
            Self::Many(connections) => connections,
        }
    }
}

impl From<ConnectionDescriptor> for Connections {
    fn from(connection: ConnectionDescriptor) -> Self {
        Self::One(connection)
    }
}

impl From<Vec<ConnectionDescriptor>> for Connections {
    fn from(connections: Vec<ConnectionDescriptor>) -> Self {
        Self::Many(connections)
    }
}

/// Readiness of a parent peer as reported by the tracker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    /// Parent has not finished building its own chain yet
    Pending,
    /// Parent exports a usable target
    Ready,
}

/// A parent peer assigned by the tracker
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentDescriptor {
    pub host: String,
    pub port: u16,
    pub iqn: String,
    pub lun: u32,
    pub status: PeerStatus,
}

impl ParentDescriptor {
    /// Whether the parent is ready to serve children
    pub fn is_ready(&self) -> bool {
        self.status == PeerStatus::Ready
    }

    /// Translate into the descriptor used to log in to this parent
    pub fn to_connection(&self) -> ConnectionDescriptor {
        ConnectionDescriptor {
            portal: format!("{}:{}", self.host, self.port),
            iqn: self.iqn.clone(),
            lun: self.lun,
        }
    }
}

/// Exported iSCSI target handle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetHandle {
    /// Numeric target id
    pub tid: u32,
    /// Name the target was exported under
    pub iqn: String,
}
