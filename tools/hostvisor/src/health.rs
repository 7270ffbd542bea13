// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use crate::error::HostvisorError;
use reqwest::StatusCode;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;
use tracing::{debug, warn};

pub const HEALTH_PATH: &str = "/health";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

impl Display for HealthStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "unhealthy ({reason})"),
        }
    }
}

/// Probes the health endpoint of the backend's http control plane.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    client: reqwest::Client,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(timeout: Duration) -> Result<Self, HostvisorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|source| HostvisorError::HttpClientBuildFailure { source })?;

        Ok(HealthChecker { client, timeout })
    }

    /// Any transport failure, timeout or non-200 response is considered unhealthy.
    pub async fn probe(&self, port: u16) -> HealthStatus {
        let url = format!("http://127.0.0.1:{port}{HEALTH_PATH}");
        debug!("probing {url}");

        let status = match self.client.get(&url).send().await {
            Ok(response) if response.status() == StatusCode::OK => HealthStatus::Healthy,
            Ok(response) => HealthStatus::Unhealthy {
                reason: format!("received status code {}", response.status()),
            },
            Err(err) if err.is_timeout() => HealthStatus::Unhealthy {
                reason: format!(
                    "no response within {}",
                    humantime::format_duration(self.timeout)
                ),
            },
            Err(err) => HealthStatus::Unhealthy {
                reason: err.to_string(),
            },
        };

        if !status.is_healthy() {
            warn!("health check of {url} failed: {status}");
        }
        status
    }
}
