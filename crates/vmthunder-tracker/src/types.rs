//! Tracker wire types

use serde::{Deserialize, Serialize};
use vmthunder_common::ParentDescriptor;

/// Registration of a peer that now exports a volume
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub session_name: String,
    pub peer_id: String,
    pub host: String,
    pub port: u16,
    pub iqn: String,
    pub lun: u32,
}

/// Release of a peer slot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogoutRequest {
    pub session_name: String,
    pub peer_id: String,
}

/// Where this host sits in a volume's distribution tree
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentAssignment {
    /// Peer id the tracker assigned to this host
    pub peer_id: String,
    /// Parents to fetch the volume from; empty means "go to the source"
    #[serde(default)]
    pub parents: Vec<ParentDescriptor>,
}

impl ParentAssignment {
    /// All parents report ready (vacuously true for an empty list)
    pub fn all_ready(&self) -> bool {
        self.parents.iter().all(ParentDescriptor::is_ready)
    }
}

/// Parent list pushed for one session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAssignment {
    pub session_name: String,
    #[serde(default)]
    pub parents: Vec<ParentDescriptor>,
}

/// Answer to a heartbeat
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub sessions: Vec<SessionAssignment>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmthunder_common::PeerStatus;

    #[test]
    fn test_all_ready() {
        let mut assignment: ParentAssignment = serde_json::from_str(
            r#"{"peer_id":"p1","parents":[
                {"host":"10.0.0.5","port":3260,"iqn":"iqn.a","lun":1,"status":"ready"},
                {"host":"10.0.0.6","port":3260,"iqn":"iqn.b","lun":1,"status":"pending"}
            ]}"#,
        )
        .unwrap();
        assert!(!assignment.all_ready());
        assignment.parents[1].status = PeerStatus::Ready;
        assert!(assignment.all_ready());
        assert!(ParentAssignment::default().all_ready());
    }

    #[test]
    fn test_heartbeat_defaults() {
        let response: HeartbeatResponse = serde_json::from_str("{}").unwrap();
        assert!(response.sessions.is_empty());
    }
}
