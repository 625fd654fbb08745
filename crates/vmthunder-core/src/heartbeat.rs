//! Periodic tracker heartbeat

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ThunderResult;
use crate::manager::SessionManager;

/// Send one heartbeat, apply the returned parent lists and retry any
/// refused destroys. Returns how many sessions were adjusted.
pub async fn heartbeat_once(manager: &SessionManager) -> ThunderResult<usize> {
    let response = manager.backends().tracker.heartbeat().await?;
    let adjusted = manager.apply_heartbeat(&response).await;
    let destroyed = manager.retry_destroy().await;
    debug!(
        sessions = response.sessions.len(),
        adjusted, destroyed, "heartbeat applied"
    );
    Ok(adjusted)
}

/// Long-running background task: heartbeat every `interval`.
pub async fn heartbeat_loop(manager: Arc<SessionManager>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Err(e) = heartbeat_once(&manager).await {
            warn!(error = %e, "heartbeat failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeStack, options, root};
    use vmthunder_tracker::{HeartbeatResponse, SessionAssignment};

    #[tokio::test]
    async fn test_heartbeat_once() {
        let stack = FakeStack::new();
        let manager = SessionManager::new(stack.backends(), options(), None);
        stack.state().heartbeat = HeartbeatResponse {
            sessions: vec![SessionAssignment {
                session_name: "vol1".to_string(),
                parents: Vec::new(),
            }],
        };

        // Nothing held yet
        assert_eq!(heartbeat_once(&manager).await.unwrap(), 0);

        let mut session = manager.lock_session("vol1").await;
        session.deploy_image(root()).await.unwrap();
        drop(session);
        stack.clear_calls();

        assert_eq!(heartbeat_once(&manager).await.unwrap(), 1);
        assert_eq!(
            stack.calls(),
            vec!["tracker.heartbeat", "dm.reload multipath_vol1"]
        );
    }

    #[tokio::test]
    async fn test_heartbeat_tracker_down() {
        let stack = FakeStack::new();
        stack.fail("tracker.heartbeat");
        let manager = SessionManager::new(stack.backends(), options(), None);
        assert!(heartbeat_once(&manager).await.is_err());
    }
}
