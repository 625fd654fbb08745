//! Tracker client
//!
//! The tracker computes, per volume, which peers each host should fetch
//! from. One client is built at startup and shared by every session.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;
use vmthunder_common::config::TrackerConfig;

use crate::error::{TrackerError, TrackerResult};
use crate::types::{HeartbeatResponse, LoginRequest, LogoutRequest, ParentAssignment};

/// Peer membership service
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Register this host as a peer exporting `request.iqn`
    async fn login(&self, request: &LoginRequest) -> TrackerResult<()>;

    /// Fetch this host's peer id and parent list for a session
    async fn get(&self, session_name: &str, host: &str) -> TrackerResult<ParentAssignment>;

    /// Release this host's peer slot
    async fn logout(&self, session_name: &str, peer_id: &str) -> TrackerResult<()>;

    /// Periodic liveness ping; returns the current parent lists
    async fn heartbeat(&self) -> TrackerResult<HeartbeatResponse>;
}

/// [`Tracker`] speaking JSON over HTTP
pub struct HttpTracker {
    endpoint: String,
    http_client: reqwest::Client,
}

impl HttpTracker {
    /// Create a client from configuration
    pub fn new(config: &TrackerConfig) -> TrackerResult<Self> {
        Self::with_timeout(&config.endpoint, config.timeout())
    }

    /// Create a client for `endpoint` with a per-request timeout
    pub fn with_timeout(endpoint: &str, timeout: Duration) -> TrackerResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TrackerError::Configuration(e.to_string()))?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    /// Tracker base URL
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn check(response: reqwest::Response) -> TrackerResult<reqwest::Response> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TrackerError::Status { status, body });
        }
        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> TrackerResult<T> {
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| TrackerError::Decode(e.to_string()))
    }
}

fn transport_error(e: reqwest::Error) -> TrackerError {
    if e.is_timeout() {
        TrackerError::Timeout
    } else {
        TrackerError::Unavailable(e.to_string())
    }
}

#[async_trait]
impl Tracker for HttpTracker {
    async fn login(&self, request: &LoginRequest) -> TrackerResult<()> {
        let response = self
            .http_client
            .post(self.url("/v1/volumes/login"))
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;
        Self::check(response).await?;
        debug!(session = %request.session_name, peer_id = %request.peer_id, "tracker login");
        Ok(())
    }

    async fn get(&self, session_name: &str, host: &str) -> TrackerResult<ParentAssignment> {
        let response = self
            .http_client
            .get(self.url(&format!("/v1/volumes/{session_name}")))
            .query(&[("host", host)])
            .send()
            .await
            .map_err(transport_error)?;
        Self::decode(response).await
    }

    async fn logout(&self, session_name: &str, peer_id: &str) -> TrackerResult<()> {
        let request = LogoutRequest {
            session_name: session_name.to_string(),
            peer_id: peer_id.to_string(),
        };
        let response = self
            .http_client
            .post(self.url("/v1/volumes/logout"))
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        Self::check(response).await?;
        debug!(session = %session_name, peer_id = %peer_id, "tracker logout");
        Ok(())
    }

    async fn heartbeat(&self) -> TrackerResult<HeartbeatResponse> {
        let response = self
            .http_client
            .post(self.url("/v1/members/heartbeat"))
            .send()
            .await
            .map_err(transport_error)?;
        Self::decode(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;
    use vmthunder_common::{ParentDescriptor, PeerStatus};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn test_get_parents() {
        let router = Router::new().route(
            "/v1/volumes/{session}",
            get(
                |Path(session): Path<String>, Query(q): Query<HashMap<String, String>>| async move {
                    Json(ParentAssignment {
                        peer_id: format!("{session}@{}", q["host"]),
                        parents: vec![ParentDescriptor {
                            host: "10.0.0.5".to_string(),
                            port: 3260,
                            iqn: "iqn.parent".to_string(),
                            lun: 1,
                            status: PeerStatus::Ready,
                        }],
                    })
                },
            ),
        );
        let endpoint = serve(router).await;
        let tracker = HttpTracker::with_timeout(&endpoint, Duration::from_secs(5)).unwrap();

        let assignment = tracker.get("vol1", "10.0.0.2").await.unwrap();
        assert_eq!(assignment.peer_id, "vol1@10.0.0.2");
        assert_eq!(assignment.parents.len(), 1);
        assert!(assignment.all_ready());
    }

    #[tokio::test]
    async fn test_login_and_logout() {
        let router = Router::new()
            .route(
                "/v1/volumes/login",
                post(|Json(req): Json<LoginRequest>| async move {
                    assert_eq!(req.port, 3260);
                    StatusCode::OK
                }),
            )
            .route(
                "/v1/volumes/logout",
                post(|Json(_req): Json<LogoutRequest>| async { StatusCode::NO_CONTENT }),
            );
        let endpoint = serve(router).await;
        let tracker = HttpTracker::with_timeout(&endpoint, Duration::from_secs(5)).unwrap();

        tracker
            .login(&LoginRequest {
                session_name: "vol1".to_string(),
                peer_id: "p1".to_string(),
                host: "10.0.0.2".to_string(),
                port: 3260,
                iqn: "iqn.p".to_string(),
                lun: 1,
            })
            .await
            .unwrap();
        tracker.logout("vol1", "p1").await.unwrap();
    }

    #[tokio::test]
    async fn test_error_status() {
        let router = Router::new().route(
            "/v1/members/heartbeat",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "draining") }),
        );
        let endpoint = serve(router).await;
        let tracker = HttpTracker::with_timeout(&endpoint, Duration::from_secs(5)).unwrap();

        match tracker.heartbeat().await.unwrap_err() {
            TrackerError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "draining");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_endpoint_trailing_slash() {
        let tracker =
            HttpTracker::with_timeout("http://tracker:7447/", Duration::from_secs(1)).unwrap();
        assert_eq!(tracker.endpoint(), "http://tracker:7447");
        assert_eq!(tracker.url("/v1/volumes/login"), "http://tracker:7447/v1/volumes/login");
    }
}
