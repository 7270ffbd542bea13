// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use crate::daemon::launch_config::{BackendConfigFile, Directories, Flags, Instance};
use crate::daemon::{launch, BackendProcess, LaunchRequest, LaunchTarget};
use crate::error::HostvisorError;
use crate::helpers::init_path;
use crate::lock::LockHandle;
use crate::ports::{PortArbiter, PortOverrides, PortProbe, ServiceEndpoints};
use crate::prefs::Preferences;
use crate::upgrades::versions::VersionStore;
use semver::Version;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, warn};

pub(crate) enum Preparation {
    /// Another supervisor holds the lock.
    Deferred,
    Ready {
        lock: LockHandle,
        endpoints: ServiceEndpoints,
        install_id: String,
    },
}

/// Blocking part of `Start`: takes the lock, resolves the ports and the install id.
pub(crate) struct PrepareJob {
    pub(crate) lock_path: PathBuf,
    pub(crate) execution_dir: PathBuf,
    pub(crate) probe: Arc<dyn PortProbe>,
    pub(crate) defaults: ServiceEndpoints,
    pub(crate) overrides: PortOverrides,
    pub(crate) configured_install_id: Option<String>,
    pub(crate) prefs: Preferences,
}

impl PrepareJob {
    pub(crate) fn run(self) -> Result<Preparation, HostvisorError> {
        init_path(&self.execution_dir)?;
        let Some(lock) = LockHandle::try_acquire(&self.lock_path)? else {
            return Ok(Preparation::Deferred);
        };

        let preferred = self.prefs.remembered_ports(self.defaults);
        let endpoints = PortArbiter::new(self.probe.as_ref()).resolve_all(preferred, &self.overrides);
        if let Err(err) = self.prefs.set_ports(endpoints) {
            warn!("failed to remember the resolved ports: {err}")
        }

        let install_id = self
            .prefs
            .ensure_install_id(self.configured_install_id.as_deref())?;

        Ok(Preparation::Ready {
            lock,
            endpoints,
            install_id,
        })
    }
}

pub(crate) enum PortPlan {
    /// Ports that were just resolved.
    Keep(ServiceEndpoints),

    /// Ports of a previous launch that have to be re-probed.
    Revalidate(ServiceEndpoints),
}

pub(crate) struct LaunchedBackend {
    pub(crate) process: BackendProcess,

    /// Whether the launched binary is an update-managed version.
    pub(crate) from_store: bool,
}

pub(crate) struct LaunchReport {
    pub(crate) endpoints: Option<ServiceEndpoints>,

    /// Update-managed versions that got invalidated while preparing the launch.
    pub(crate) invalidated: Vec<Version>,

    /// The update-managed version this launch has attempted, if any.
    pub(crate) attempted: Option<Version>,

    pub(crate) outcome: Result<LaunchedBackend, HostvisorError>,
}

impl LaunchReport {
    pub(crate) fn failed(err: HostvisorError) -> Self {
        LaunchReport {
            endpoints: None,
            invalidated: Vec::new(),
            attempted: None,
            outcome: Err(err),
        }
    }
}

/// Blocking part of every launch: version bookkeeping, port (re)validation,
/// the backend config file and the process spawn itself.
pub(crate) struct LaunchJob {
    /// Present only if update-managed versions may be launched.
    pub(crate) store: Option<VersionStore>,
    pub(crate) activate: Option<Version>,
    pub(crate) invalidate: Option<Version>,

    pub(crate) probe: Arc<dyn PortProbe>,
    pub(crate) ports: PortPlan,
    pub(crate) overrides: PortOverrides,

    pub(crate) prefs: Preferences,
    pub(crate) bundled: LaunchTarget,
    pub(crate) config_path: PathBuf,
    pub(crate) execution_dir: PathBuf,
    pub(crate) install_id: String,
    pub(crate) host_version: String,
}

impl LaunchJob {
    fn update_version_store(&mut self, invalidated: &mut Vec<Version>) {
        let Some(store) = &self.store else {
            return;
        };
        if let Some(version) = self.invalidate.take() {
            match store.invalidate_active(Some(&version)) {
                Ok(Some(rejected)) => invalidated.push(rejected),
                Ok(None) => {}
                Err(err) => error!("failed to invalidate backend {version}: {err}"),
            }
        }
        if let Some(version) = self.activate.take() {
            if let Err(err) = store.activate(&version) {
                error!("failed to activate backend {version}: {err}")
            }
        }
    }

    pub(crate) fn run(mut self) -> LaunchReport {
        let mut invalidated = Vec::new();
        self.update_version_store(&mut invalidated);

        let arbiter = PortArbiter::new(self.probe.as_ref());
        let endpoints = match self.ports {
            PortPlan::Keep(endpoints) => endpoints,
            PortPlan::Revalidate(previous) => {
                let endpoints = arbiter.revalidate(previous, &self.overrides);
                if endpoints != previous {
                    if let Err(err) = self.prefs.set_ports(endpoints) {
                        warn!("failed to remember the resolved ports: {err}")
                    }
                }
                endpoints
            }
        };

        let installed = self
            .store
            .as_ref()
            .and_then(|store| store.best_installed());
        let attempted = installed.as_ref().map(|installed| installed.version.clone());
        let preferred = match installed {
            Some(installed) => LaunchTarget::new(
                installed.executable,
                installed.resources_dir,
                installed.version,
            ),
            None => self.bundled.clone(),
        };

        let request = LaunchRequest {
            preferred,
            fallback: self.bundled.clone(),
            config_path: self.config_path.clone(),
            config: BackendConfigFile {
                ports: endpoints,
                directories: Directories {
                    resources: self.bundled.resources_dir.clone(),
                    execution: self.execution_dir.clone(),
                },
                flags: Flags {
                    allow_remote_in_mcp: self.prefs.allow_remote_in_mcp(),
                },
                instance: Instance {
                    install_id: self.install_id.clone(),
                    host_version: self.host_version.clone(),
                    backend_version: self.bundled.version.to_string(),
                },
            },
        };

        let outcome = launch(request).map(|outcome| {
            if outcome.used_fallback {
                // it was believed to be installed, but it isn't there
                if let (Some(store), Some(missing)) = (&self.store, &attempted) {
                    match store.invalidate_active(Some(missing)) {
                        Ok(Some(rejected)) => invalidated.push(rejected),
                        Ok(None) => {}
                        Err(err) => error!("failed to invalidate backend {missing}: {err}"),
                    }
                }
            }

            if let Err(err) = self
                .prefs
                .set_backend_version(outcome.process.version().to_string())
            {
                warn!("failed to remember the backend version: {err}")
            }
            if self.prefs.restart_requested() {
                if let Err(err) = self.prefs.set_restart_requested(false) {
                    warn!("failed to reset the restart request: {err}")
                }
            }

            LaunchedBackend {
                from_store: attempted.is_some() && !outcome.used_fallback,
                process: outcome.process,
            }
        });

        LaunchReport {
            endpoints: Some(endpoints),
            invalidated,
            attempted,
            outcome,
        }
    }
}
