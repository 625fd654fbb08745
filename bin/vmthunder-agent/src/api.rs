//! Control API
//!
//! Compute-node drivers call this to boot and delete VMs; operators use it
//! to inspect sessions and force an upstream change.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use vmthunder_common::{ConnectionDescriptor, Connections};
use vmthunder_core::{SessionManager, SessionStatus, ThunderError};

type Result<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct BootRequest {
    pub vm_name: String,
    pub connections: Connections,
    pub snapshot_connection: ConnectionDescriptor,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BootResponse {
    pub vm_name: String,
    pub link: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub vm_name: String,
    /// False while children still use our target; retried by the heartbeat loop
    pub destroyed: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct AdjustRequest {
    #[serde(default)]
    pub delete: Vec<ConnectionDescriptor>,
    #[serde(default)]
    pub add: Vec<ConnectionDescriptor>,
}

/// Error returned to API callers
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<ThunderError> for ApiError {
    fn from(e: ThunderError) -> Self {
        let status = match &e {
            ThunderError::VmNotRegistered(_) | ThunderError::SessionNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ThunderError::VmAlreadyRegistered(_) => StatusCode::CONFLICT,
            ThunderError::NoConnections(_) => StatusCode::BAD_REQUEST,
            ThunderError::DeployTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ThunderError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %e, "request failed");
        }
        Self {
            status,
            message: e.to_string(),
        }
    }
}

pub fn router(manager: Arc<SessionManager>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/sessions", get(list_sessions))
        .route("/v1/volumes/{volume}/vms", post(boot_vm))
        .route("/v1/volumes/{volume}/adjust", post(adjust_structure))
        .route("/v1/vms/{vm_name}", delete(delete_vm))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

async fn health() -> &'static str {
    "ok"
}

async fn list_sessions(State(manager): State<Arc<SessionManager>>) -> Json<Vec<SessionStatus>> {
    Json(manager.status())
}

async fn boot_vm(
    State(manager): State<Arc<SessionManager>>,
    Path(volume): Path<String>,
    Json(req): Json<BootRequest>,
) -> Result<Json<BootResponse>> {
    let link = manager
        .boot_vm(&volume, &req.vm_name, req.connections, req.snapshot_connection)
        .await?;
    info!(volume = %volume, vm = %req.vm_name, link = %link.display(), "VM booted");
    Ok(Json(BootResponse {
        vm_name: req.vm_name,
        link,
    }))
}

async fn delete_vm(
    State(manager): State<Arc<SessionManager>>,
    Path(vm_name): Path<String>,
) -> Result<Json<DeleteResponse>> {
    let destroyed = manager.delete_vm(&vm_name).await?;
    Ok(Json(DeleteResponse { vm_name, destroyed }))
}

async fn adjust_structure(
    State(manager): State<Arc<SessionManager>>,
    Path(volume): Path<String>,
    Json(req): Json<AdjustRequest>,
) -> Result<StatusCode> {
    manager
        .adjust_structure(&volume, &req.delete, &req.add)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vmthunder_core::{Backends, SessionOptions};
    use vmthunder_drivers::{CommandRunner, DmSetup, FlashCacheGroup, IscsiConnector, TgtAdm};
    use vmthunder_tracker::HttpTracker;

    /// Manager wired to real collaborators; the routes under test never
    /// reach them.
    fn manager() -> Arc<SessionManager> {
        let runner = CommandRunner::new(None);
        let backends = Backends {
            mapper: Arc::new(DmSetup::new(runner.clone(), "/dev/mapper/")),
            targets: Arc::new(TgtAdm::new(runner.clone(), 1)),
            connector: Arc::new(IscsiConnector::new(runner.clone(), Duration::from_secs(1))),
            cache: Arc::new(FlashCacheGroup::new(runner, "ssd", "/dev/mapper/")),
            tracker: Arc::new(
                HttpTracker::with_timeout("http://127.0.0.1:9", Duration::from_millis(100))
                    .unwrap(),
            ),
        };
        let options = SessionOptions {
            host_address: "127.0.0.1".to_string(),
            iscsi_port: 3260,
            export_lun: 1,
            poll_interval: Duration::from_millis(10),
            settle_delay: Duration::ZERO,
            snapshot_with_cache: false,
        };
        Arc::new(SessionManager::new(backends, options, None))
    }

    async fn serve() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(manager())).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_health_and_sessions() {
        let base = serve().await;
        let client = reqwest::Client::new();

        let health = client.get(format!("{base}/health")).send().await.unwrap();
        assert_eq!(health.status(), 200);
        assert_eq!(health.text().await.unwrap(), "ok");

        let sessions: Vec<serde_json::Value> = client
            .get(format!("{base}/v1/sessions"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_vm_and_volume() {
        let base = serve().await;
        let client = reqwest::Client::new();

        let response = client
            .delete(format!("{base}/v1/vms/ghost"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"], "VM not registered: ghost");

        let response = client
            .post(format!("{base}/v1/volumes/vol9/adjust"))
            .json(&serde_json::json!({ "delete": [], "add": [] }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn test_boot_without_connections() {
        let base = serve().await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{base}/v1/volumes/vol1/vms"))
            .json(&serde_json::json!({
                "vm_name": "vm1",
                "connections": [],
                "snapshot_connection": {
                    "target_portal": "10.0.0.3:3260",
                    "target_iqn": "iqn.vm1",
                    "target_lun": 1
                }
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    }

    #[test]
    fn test_error_status_mapping() {
        let conflict = ApiError::from(ThunderError::VmAlreadyRegistered("vm1".to_string()));
        assert_eq!(conflict.status, StatusCode::CONFLICT);
        let timeout = ApiError::from(ThunderError::DeployTimeout("vol1".to_string()));
        assert_eq!(timeout.status, StatusCode::GATEWAY_TIMEOUT);
        let other = ApiError::from(ThunderError::MissingPath("x".to_string()));
        assert_eq!(other.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
