// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use crate::config::Config;
use crate::error::HostvisorError;
use crate::manager::handle::ServiceHandle;
use crate::manager::state::SupervisorState;
use crate::upgrades::download::{discard_pending, download_verified_artifact};
use crate::upgrades::fetch::{FetchLimits, Fetcher};
use crate::upgrades::signature::UpdateVerifier;
use crate::upgrades::versions::VersionStore;
use hostvisor_appcast::{Platform, ReleaseManifest};
use semver::Version;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    BackendNotRunning,
    UpToDate,
    Updated { version: Version },
}

/// Periodically checks the release feed and installs newer backend versions.
pub struct Updater {
    manifest_url: Url,
    check_interval: Duration,
    initial_delay: Duration,
    manifest_limits: FetchLimits,
    package_limits: FetchLimits,
    pending_dir: PathBuf,
    platform: Platform,

    fetcher: Arc<dyn Fetcher>,
    verifier: UpdateVerifier,
    store: VersionStore,
    handle: ServiceHandle,
}

impl Updater {
    pub fn new(
        config: &Config,
        store: VersionStore,
        fetcher: Arc<dyn Fetcher>,
        handle: ServiceHandle,
    ) -> Result<Self, HostvisorError> {
        let updater = &config.updater;
        let manifest_url = updater.resolved_manifest_url()?;
        let Some(platform) = Platform::current() else {
            return Err(HostvisorError::UnsupportedPlatform);
        };
        let verifier = UpdateVerifier::from_base64(&updater.public_key)?;

        Ok(Updater {
            manifest_url,
            check_interval: updater.check_interval.max(Duration::from_secs(1)),
            initial_delay: updater.initial_delay,
            manifest_limits: FetchLimits::new(
                updater.manifest_fetch_timeout,
                updater.max_manifest_size,
            ),
            package_limits: FetchLimits::new(updater.download_timeout, updater.max_package_size),
            pending_dir: config.pending_update_dir(),
            platform,
            fetcher,
            verifier,
            store,
            handle,
        })
    }

    /// Overrides the platform whose artifacts get installed.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(self, shutdown: CancellationToken) {
        info!(
            "checking {} for backend updates every {}",
            self.manifest_url,
            humantime::format_duration(self.check_interval)
        );

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(self.initial_delay) => {}
        }

        let mut check_interval = interval(self.check_interval);
        check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = check_interval.tick() => {}
            }

            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.check_for_update() => outcome,
            };
            match outcome {
                Ok(UpdateOutcome::Updated { version }) => info!("updated the backend to {version}"),
                Ok(UpdateOutcome::UpToDate) => debug!("the backend is up to date"),
                Ok(UpdateOutcome::BackendNotRunning) => {
                    debug!("the backend is not running, skipping the update check")
                }
                // try again next cycle
                Err(err) => warn!("the update check has failed: {err}"),
            }
        }
        debug!("the updater has stopped");
    }

    /// A single update cycle: feed, selection, download, verification, installation, pruning
    /// and finally the coordinated restart into the new version.
    pub async fn check_for_update(&self) -> Result<UpdateOutcome, HostvisorError> {
        let status = self.handle.status();
        let Some(current) = status.backend_version else {
            return Ok(UpdateOutcome::BackendNotRunning);
        };
        if status.state != SupervisorState::Running {
            return Ok(UpdateOutcome::BackendNotRunning);
        }

        let raw = self
            .fetcher
            .fetch(&self.manifest_url, self.manifest_limits)
            .await
            .map_err(|source| HostvisorError::ManifestFetchFailure {
                url: self.manifest_url.clone(),
                source,
            })?;
        let manifest = ReleaseManifest::parse_bytes(&raw)?;
        debug!("the release feed contains {} usable items", manifest.len());

        let store = self.store.clone();
        let rejected = tokio::task::spawn_blocking(move || store.rejected_versions()).await??;

        let Some((item, artifact)) =
            manifest.first_upgrade_candidate(&current, &self.platform, |v| rejected.contains(v))
        else {
            return Ok(UpdateOutcome::UpToDate);
        };
        let version = item.version.clone();
        info!("backend {version} is available (currently running {current})");

        let store = self.store.clone();
        let target = version.clone();
        let installed = tokio::task::spawn_blocking(move || store.is_installed(&target)).await?;
        if installed {
            info!("backend {version} is already installed");
        } else {
            let archive = download_verified_artifact(
                self.fetcher.as_ref(),
                &self.verifier,
                &self.pending_dir,
                &version,
                artifact,
                self.package_limits,
            )
            .await?;

            let store = self.store.clone();
            let target = version.clone();
            tokio::task::spawn_blocking(move || {
                let res = store.install_from_archive(&target, &archive);
                discard_pending(&archive);
                res
            })
            .await??;
        }

        let store = self.store.clone();
        let mut protected = vec![version.clone(), current];
        tokio::task::spawn_blocking(move || {
            if let Ok(marker) = store.marker() {
                protected.extend(marker.active);
            }
            protected.dedup();
            if let Err(err) = store.prune(&protected) {
                warn!("failed to prune old backend versions: {err}")
            }
        })
        .await?;

        self.handle.restart_for_update(version.clone()).await?;
        Ok(UpdateOutcome::Updated { version })
    }
}

/// A running updater task.
pub struct UpdaterHandle {
    shutdown: CancellationToken,
    _task: JoinHandle<()>,
}

impl UpdaterHandle {
    pub fn spawn(updater: Updater) -> Self {
        let shutdown = CancellationToken::new();
        let task = updater.start(shutdown.clone());
        UpdaterHandle {
            shutdown,
            _task: task,
        }
    }

    /// Signals the updater to stop without waiting for it.
    pub fn stop(self) {
        self.shutdown.cancel()
    }
}
