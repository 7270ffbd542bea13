// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use crate::cli::try_load_config;
use hostvisor::config::Config;
use hostvisor::error::HostvisorError;
use hostvisor::logging::setup_tracing_logger;
use hostvisor::manager::ServiceManager;
use hostvisor::ports::parse_port_override;
use std::path::PathBuf;
use tokio::runtime;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

// there are never more than a handful of blocking jobs in flight
const MAX_BLOCKING_THREADS: usize = 16;

#[derive(clap::Args, Debug)]
pub(crate) struct Args {
    /// Path to the toml config file. If not provided, the defaults are used.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Never start the backend.
    #[arg(long)]
    disable_server: bool,

    /// Disable automatic backend updates.
    #[arg(long)]
    disable_updater: bool,

    /// Override the url of the release feed.
    #[arg(long)]
    manifest_url: Option<Url>,

    /// Override the directory containing the bundled backend and its resources.
    #[arg(long)]
    resources_dir: Option<PathBuf>,

    /// Override the directory holding the lock, the generated backend config and all
    /// update-managed versions.
    #[arg(long)]
    execution_dir: Option<PathBuf>,

    /// Pin the cdp (debug listener) port.
    #[arg(long)]
    cdp_port: Option<String>,

    /// Pin the http mcp port.
    #[arg(long)]
    http_mcp_port: Option<String>,

    /// Pin the agent port.
    #[arg(long)]
    agent_port: Option<String>,

    /// Pin the extension port.
    #[arg(long)]
    extension_port: Option<String>,

    /// Disable `hostvisor` logs (but not the ones of the backend).
    #[arg(long)]
    disable_logs: bool,
}

impl Args {
    pub(crate) fn override_config(&self, config: &mut Config) {
        if self.disable_server {
            config.backend.disabled = true;
        }
        if self.disable_updater {
            config.updater.enabled = false;
        }
        if let Some(manifest_url) = &self.manifest_url {
            config.updater.manifest_url = Some(manifest_url.clone())
        }
        if let Some(resources_dir) = &self.resources_dir {
            config.backend.bundled_resources_dir = resources_dir.clone()
        }
        if let Some(execution_dir) = &self.execution_dir {
            config.backend.execution_dir = execution_dir.clone()
        }
        if self.disable_logs {
            config.hostvisor.debug.disable_logs = true;
        }

        let overrides = &mut config.ports.overrides;
        if let Some(raw) = &self.cdp_port {
            overrides.cdp = parse_port_override("cdp", raw);
        }
        if let Some(raw) = &self.http_mcp_port {
            overrides.http_mcp = parse_port_override("http mcp", raw);
        }
        if let Some(raw) = &self.agent_port {
            overrides.agent = parse_port_override("agent", raw);
        }
        if let Some(raw) = &self.extension_port {
            overrides.extension = parse_port_override("extension", raw);
        }
    }
}

async fn wait_for_signal() {
    let (mut sigterm, mut sigquit) =
        match (signal(SignalKind::terminate()), signal(SignalKind::quit())) {
            (Ok(sigterm), Ok(sigquit)) => (sigterm, sigquit),
            (Err(err), _) | (_, Err(err)) => {
                warn!("failed to set up the signal handlers ({err}). only SIGINT is going to be handled");
                if let Err(err) = tokio::signal::ctrl_c().await {
                    error!("failed to listen for SIGINT: {err}");
                }
                return;
            }
        };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT");
        },
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigquit.recv() => {
            info!("Received SIGQUIT");
        }
    }
}

pub(crate) fn execute(args: Args) -> Result<(), HostvisorError> {
    let mut config = try_load_config(args.config.as_deref())?;
    // before applying the overrides, so that rejected ones get logged
    if !(args.disable_logs || config.hostvisor.debug.disable_logs) {
        setup_tracing_logger();
    }
    args.override_config(&mut config);

    info!(
        "starting hostvisor '{}' for {} (bundled version {})",
        config.hostvisor.id, config.backend.binary_name, config.backend.bundled_version
    );

    // well, if the creation of the runtime failed, there isn't much we could do
    #[allow(clippy::expect_used)]
    let rt = runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(MAX_BLOCKING_THREADS)
        .build()
        .expect("failed to create the runtime");

    rt.block_on(async move {
        let shutdown = CancellationToken::new();
        let (manager, handle) = ServiceManager::new(config);
        let manager_task = manager.with_shutdown(shutdown.clone()).spawn();

        handle.start()?;
        wait_for_signal().await;

        info!("shutting down");
        shutdown.cancel();
        if let Err(err) = manager_task.await {
            error!("the service manager has panicked: {err}");
        }
        Ok(())
    })
}
