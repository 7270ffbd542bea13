// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use crate::error::HostvisorError;
use crate::manager::state::StatusReport;
use crate::ports::ServiceEndpoints;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
struct DebugState {
    host_version: String,
    status: watch::Receiver<StatusReport>,
}

#[derive(Debug, Serialize)]
struct VersionResponse {
    host_version: String,
    backend_version: Option<String>,
    ports: Option<ServiceEndpoints>,
}

async fn version(State(state): State<DebugState>) -> Json<VersionResponse> {
    let status = state.status.borrow().clone();
    Json(VersionResponse {
        host_version: state.host_version,
        backend_version: status.backend_version.map(|v| v.to_string()),
        ports: status.endpoints,
    })
}

async fn status(State(state): State<DebugState>) -> Json<StatusReport> {
    Json(state.status.borrow().clone())
}

fn router(state: DebugState) -> Router {
    Router::new()
        .route("/json/version", get(version))
        .route("/status", get(status))
        .with_state(state)
}

/// Binds the loopback listener, preferring ipv4 and falling back to ipv6.
pub async fn bind_loopback(port: u16) -> Result<TcpListener, HostvisorError> {
    match TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await {
        Ok(listener) => Ok(listener),
        Err(err) => {
            warn!("failed to bind 127.0.0.1:{port} ({err}), trying [::1]:{port}");
            TcpListener::bind(SocketAddr::from((Ipv6Addr::LOCALHOST, port)))
                .await
                .map_err(|source| HostvisorError::DebugListenerBindFailure { port, source })
        }
    }
}

/// The introspection listener on the cdp port, served by the supervisor itself.
pub struct DebugServer {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl DebugServer {
    /// Spawns the listener. Failing to bind is logged and otherwise ignored.
    pub fn start(
        port: u16,
        host_version: String,
        status: watch::Receiver<StatusReport>,
    ) -> DebugServer {
        let shutdown = CancellationToken::new();
        let app = router(DebugState {
            host_version,
            status,
        });

        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            let listener = match bind_loopback(port).await {
                Ok(listener) => listener,
                Err(err) => {
                    error!("the debug listener is unavailable: {err}");
                    return;
                }
            };
            info!("debug listener available on port {port}");

            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!("the debug listener has failed: {err}")
            }
            debug!("the debug listener has stopped");
        });

        DebugServer { shutdown, handle }
    }

    pub fn stop(self) {
        self.shutdown.cancel();
        // we don't wait around for in-flight requests
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use semver::Version;
    use tower::ServiceExt;

    fn running_status() -> StatusReport {
        let mut status = StatusReport::initial(false);
        status.backend_version = Some(Version::new(2, 0, 0));
        status.endpoints = Some(ServiceEndpoints {
            cdp: 9000,
            http_mcp: 9100,
            agent: 9200,
            extension: 9300,
        });
        status
    }

    #[tokio::test]
    async fn version_endpoint() -> anyhow::Result<()> {
        let (_tx, rx) = watch::channel(running_status());
        let app = router(DebugState {
            host_version: "3.0.0".to_string(),
            status: rx,
        });

        let response = app
            .oneshot(Request::get("/json/version").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        let value: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(value["host_version"], "3.0.0");
        assert_eq!(value["backend_version"], "2.0.0");
        assert_eq!(value["ports"]["agent"], 9200);
        Ok(())
    }

    #[tokio::test]
    async fn status_endpoint_follows_updates() -> anyhow::Result<()> {
        let (tx, rx) = watch::channel(StatusReport::initial(false));
        let app = router(DebugState {
            host_version: "3.0.0".to_string(),
            status: rx,
        });
        tx.send_replace(running_status());

        let response = app
            .oneshot(Request::get("/status").body(Body::empty())?)
            .await?;
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        let value: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(value["state"], "stopped");
        assert_eq!(value["backend_version"], "2.0.0");
        assert_eq!(value["binary_source"]["kind"], "bundled");
        Ok(())
    }

    #[tokio::test]
    async fn listener_serves_on_the_requested_port() -> anyhow::Result<()> {
        let port = {
            let probe = TcpListener::bind("127.0.0.1:0").await?;
            probe.local_addr()?.port()
        };
        let (_tx, rx) = watch::channel(running_status());
        let server = DebugServer::start(port, "3.0.0".to_string(), rx);

        let url = format!("http://127.0.0.1:{port}/json/version");
        let mut response = None;
        for _ in 0..50 {
            if let Ok(res) = reqwest::get(&url).await {
                response = Some(res);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        let response = response.expect("debug listener never came up");
        assert!(response.status().is_success());

        server.stop();
        Ok(())
    }
}
