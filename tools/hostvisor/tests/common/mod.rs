// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use ed25519_dalek::{Signer, SigningKey};
use flate2::write::GzEncoder;
use flate2::Compression;
use hostvisor::config::Config;
use hostvisor::manager::{ServiceHandle, StatusReport};
use hostvisor::ports::PortProbe;
use hostvisor::upgrades::{FetchError, FetchLimits, Fetcher};
use hostvisor_appcast::Platform;
use reqwest::StatusCode;
use semver::Version;
use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use url::Url;

pub const BINARY_NAME: &str = "backend_server";
pub const FEED_URL: &str = "https://releases.hostvisor.test/feed.xml";

pub fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

pub fn other_signing_key() -> SigningKey {
    SigningKey::from_bytes(&[13u8; 32])
}

/// Every port is reported as free. Nothing in these tests actually listens on them.
pub struct AnyPort;

impl PortProbe for AnyPort {
    fn is_available(&self, _: u16) -> bool {
        true
    }
}

pub fn write_script(path: &Path, body: &str) -> anyhow::Result<()> {
    fs::create_dir_all(path.parent().unwrap())?;
    fs::write(path, format!("#!/bin/sh\n{body}\n"))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

/// gzipped tarball laid out as a resources directory, with the backend at `bin/<name>`
pub fn backend_archive(script: &str) -> anyhow::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    let content = format!("#!/bin/sh\n{script}\n");

    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder.append_data(
        &mut header,
        format!("bin/{BINARY_NAME}"),
        content.as_bytes(),
    )?;

    Ok(builder.into_inner()?.finish()?)
}

pub fn test_config(root: &Path) -> Config {
    let mut config = Config::new();
    config.hostvisor.id = "integration".to_string();
    config.backend.binary_name = BINARY_NAME.to_string();
    config.backend.execution_dir = root.join("exec");
    config.backend.bundled_resources_dir = root.join("bundled");
    config.backend.bundled_version = Version::new(1, 9, 0);

    // nothing serves the health endpoint of the scripted backends
    config.health.check_interval = Duration::from_secs(3600);
    config.health.process_check_interval = Duration::from_secs(3600);

    config.crash_tracking.launch_retry_delay = Duration::from_millis(200);

    config.updater.enabled = false;
    config.updater.manifest_url = Some(FEED_URL.parse().unwrap());
    config.updater.public_key = STANDARD.encode(signing_key().verifying_key().as_bytes());
    config.updater.initial_delay = Duration::from_secs(3600);
    config.updater.check_interval = Duration::from_secs(3600);
    config
}

pub struct Release {
    pub version: Version,
    pub url: String,
    pub archive: Vec<u8>,
    pub signature: String,
}

impl Release {
    pub fn new(version: &str, script: &str) -> anyhow::Result<Self> {
        let archive = backend_archive(script)?;
        let signature = STANDARD.encode(signing_key().sign(&archive).to_bytes());
        Ok(Release {
            version: version.parse()?,
            url: format!("https://releases.hostvisor.test/backend-{version}.tar.gz"),
            archive,
            signature,
        })
    }

    pub fn signed_by(mut self, key: &SigningKey) -> Self {
        self.signature = STANDARD.encode(key.sign(&self.archive).to_bytes());
        self
    }
}

/// A release feed announcing `releases` for the platform the tests run on.
pub fn feed(releases: &[&Release]) -> String {
    let platform = Platform::current().unwrap();
    let items: String = releases
        .iter()
        .map(|release| {
            format!(
                r#"
    <item>
      <title>Version {version}</title>
      <sparkle:version>{version}</sparkle:version>
      <pubDate>Wed, 12 Nov 2025 17:30:00 -0700</pubDate>
      <enclosure url="{url}" sparkle:os="{os}" sparkle:arch="{arch}" sparkle:edSignature="{signature}" length="{length}" type="application/gzip"/>
    </item>"#,
                version = release.version,
                url = release.url,
                os = platform.os,
                arch = platform.arch,
                signature = release.signature,
                length = release.archive.len(),
            )
        })
        .collect();

    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<rss version="2.0" xmlns:sparkle="http://www.andymatuschak.org/xml-namespaces/sparkle">
  <channel>
    <title>backend</title>{items}
  </channel>
</rss>"#
    )
}

/// Serves fixed responses from memory and records every requested url.
#[derive(Default)]
pub struct MemoryFetcher {
    responses: HashMap<String, Bytes>,
    requests: Mutex<Vec<Url>>,
}

impl MemoryFetcher {
    pub fn serving(releases: &[&Release]) -> Self {
        let mut responses = HashMap::new();
        responses.insert(FEED_URL.to_string(), Bytes::from(feed(releases)));
        for release in releases {
            responses.insert(release.url.clone(), Bytes::from(release.archive.clone()));
        }
        MemoryFetcher {
            responses,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<Url> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, url: &Url, limits: FetchLimits) -> Result<Bytes, FetchError> {
        self.requests.lock().unwrap().push(url.clone());
        let Some(response) = self.responses.get(url.as_str()) else {
            return Err(FetchError::UnexpectedStatus {
                status: StatusCode::NOT_FOUND,
            });
        };
        if response.len() as u64 > limits.max_size {
            return Err(FetchError::ResponseTooLarge {
                limit: limits.max_size,
            });
        }
        Ok(response.clone())
    }
}

pub async fn wait_for(
    handle: &ServiceHandle,
    predicate: impl FnMut(&StatusReport) -> bool,
) -> anyhow::Result<StatusReport> {
    Ok(tokio::time::timeout(Duration::from_secs(20), handle.wait_for_status(predicate)).await??)
}

#[derive(Clone)]
struct HealthState {
    healthy_marker: PathBuf,
    unhealthy_delay: Duration,
    requests: Arc<AtomicUsize>,
    failures: Arc<AtomicUsize>,
}

async fn health(State(state): State<HealthState>) -> axum::http::StatusCode {
    state.requests.fetch_add(1, Ordering::SeqCst);
    if state.healthy_marker.exists() {
        return axum::http::StatusCode::OK;
    }
    tokio::time::sleep(state.unhealthy_delay).await;
    state.failures.fetch_add(1, Ordering::SeqCst);
    axum::http::StatusCode::SERVICE_UNAVAILABLE
}

/// Stands in for the backend's `/health` endpoint on an ephemeral loopback port.
/// It reports healthy only while `healthy_marker` exists, and holds every unhealthy
/// response back for `unhealthy_delay`.
pub struct HealthEndpoint {
    pub port: u16,
    requests: Arc<AtomicUsize>,
    failures: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl HealthEndpoint {
    pub async fn serve(healthy_marker: PathBuf, unhealthy_delay: Duration) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let port = listener.local_addr()?.port();

        let requests = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/health", get(health))
            .with_state(HealthState {
                healthy_marker,
                unhealthy_delay,
                requests: requests.clone(),
                failures: failures.clone(),
            });
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(HealthEndpoint {
            port,
            requests,
            failures,
            task,
        })
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Number of unhealthy responses that have been sent out.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

impl Drop for HealthEndpoint {
    fn drop(&mut self) {
        self.task.abort()
    }
}

/// Probes the backend health (and the process) every 100ms, against `endpoint`.
pub fn with_fast_health_checks(config: &mut Config, endpoint: &HealthEndpoint) {
    config.health.check_interval = Duration::from_millis(100);
    config.health.process_check_interval = Duration::from_millis(100);
    config.ports.overrides.http_mcp = Some(endpoint.port);
}
