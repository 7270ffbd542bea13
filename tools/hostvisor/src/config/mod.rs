// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use crate::error::HostvisorError;
use crate::ports::{PortOverrides, ServiceEndpoints};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_HOSTVISOR_ID: &str = "default";
pub const DEFAULT_BINARY_NAME: &str = "backend_server";

pub const BACKEND_CONFIG_FILENAME: &str = "server_config.json";
pub const LOCK_FILENAME: &str = "server.lock";
pub const VERSIONS_DIR: &str = "versions";
pub const CURRENT_VERSION_FILENAME: &str = "current_version";
pub const PENDING_UPDATE_DIR: &str = "pending_update";
pub const PREFERENCES_FILENAME: &str = "preferences.json";
pub const BIN_DIR: &str = "bin";

pub const DEFAULT_CDP_PORT: u16 = 9000;
pub const DEFAULT_HTTP_MCP_PORT: u16 = 9100;
pub const DEFAULT_AGENT_PORT: u16 = 9200;
pub const DEFAULT_EXTENSION_PORT: u16 = 9300;

const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_PROCESS_CHECK_INTERVAL: Duration = Duration::from_secs(10);

const DEFAULT_STARTUP_GRACE_PERIOD: Duration = Duration::from_secs(30);
const DEFAULT_MAX_STARTUP_FAILURES: u32 = 3;
const DEFAULT_LAUNCH_RETRY_DELAY: Duration = Duration::from_secs(10);

const DEFAULT_UPDATE_CHECK_INTERVAL: Duration = Duration::from_secs(15 * 60);
const DEFAULT_UPDATE_INITIAL_DELAY: Duration = Duration::from_secs(60);
const DEFAULT_MANIFEST_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DEFAULT_MAX_MANIFEST_SIZE: u64 = 512 * 1024;
const DEFAULT_MAX_PACKAGE_SIZE: u64 = 200 * 1024 * 1024;
const DEFAULT_VERSIONS_TO_KEEP: usize = 2;

pub const DEFAULT_MANIFEST_URL: &str = "https://cdn.uzdabrazor.com/appcast-server.xml";
pub const ALPHA_MANIFEST_URL: &str = "https://cdn.uzdabrazor.com/appcast-server.alpha.xml";

/// Base64 encoded ed25519 key every release artifact must be signed with.
pub const UPDATE_PUBLIC_KEY: &str = "LzQmcNuTsdB3/dsivo0eeN+jPfDoriRHAkkEJcfFs2A=";

fn default_execution_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("hostvisor")
}

// the bundled backend ships next to the host executable
fn default_bundled_resources_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_default()
        .join("backend")
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub hostvisor: Hostvisor,

    pub host: Host,

    pub backend: Backend,

    pub ports: Ports,

    pub health: Health,

    pub crash_tracking: CrashTracking,

    pub updater: Updater,
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    pub fn read_from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, HostvisorError> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).map_err(|source| HostvisorError::ConfigLoadFailure {
                path: path.to_path_buf(),
                source,
            })?;

        toml::from_str(&content).map_err(|source| HostvisorError::ConfigParseFailure {
            path: path.to_path_buf(),
            source: Box::new(source),
        })
    }

    pub fn save_to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), HostvisorError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            crate::helpers::init_path(parent)?;
        }
        fs::write(path, content).map_err(|source| HostvisorError::ConfigSaveFailure {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn execution_dir(&self) -> &Path {
        &self.backend.execution_dir
    }

    pub fn backend_config_path(&self) -> PathBuf {
        self.execution_dir().join(BACKEND_CONFIG_FILENAME)
    }

    pub fn lock_file_path(&self) -> PathBuf {
        self.execution_dir().join(LOCK_FILENAME)
    }

    pub fn versions_dir(&self) -> PathBuf {
        self.execution_dir().join(VERSIONS_DIR)
    }

    pub fn pending_update_dir(&self) -> PathBuf {
        self.execution_dir().join(PENDING_UPDATE_DIR)
    }

    pub fn preferences_path(&self) -> PathBuf {
        self.execution_dir().join(PREFERENCES_FILENAME)
    }

    pub fn bundled_binary_path(&self) -> PathBuf {
        self.backend
            .bundled_resources_dir
            .join(BIN_DIR)
            .join(&self.backend.binary_name)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Hostvisor {
    /// Human readable identifier of this supervisor instance, used in logs.
    pub id: String,

    pub debug: HostvisorDebug,
}

impl Default for Hostvisor {
    fn default() -> Self {
        Hostvisor {
            id: DEFAULT_HOSTVISOR_ID.to_string(),
            debug: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostvisorDebug {
    pub disable_logs: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Host {
    /// Version string of the host application, forwarded to the backend.
    pub version: String,

    /// Stable identifier of this installation. Generated and persisted in the preferences if not set.
    pub install_id: Option<String>,
}

impl Default for Host {
    fn default() -> Self {
        Host {
            version: env!("CARGO_PKG_VERSION").to_string(),
            install_id: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Backend {
    /// Name of the backend executable, located under `bin/` of every resources directory.
    pub binary_name: String,

    /// Version of the backend binary shipped together with the host.
    pub bundled_version: Version,

    pub bundled_resources_dir: PathBuf,

    /// Per-installation directory holding the lock, the generated backend config,
    /// the preferences and all update-managed versions.
    pub execution_dir: PathBuf,

    /// If set, the backend is never started.
    pub disabled: bool,
}

impl Default for Backend {
    fn default() -> Self {
        Backend {
            binary_name: DEFAULT_BINARY_NAME.to_string(),
            bundled_version: Version::new(0, 0, 0),
            bundled_resources_dir: default_bundled_resources_dir(),
            execution_dir: default_execution_dir(),
            disabled: false,
        }
    }
}

/// Preferred ports, used whenever nothing has been remembered in the preferences.
#[derive(Debug, Clone, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Ports {
    pub cdp: u16,
    pub http_mcp: u16,
    pub agent: u16,
    pub extension: u16,

    /// Ports explicitly requested by the operator. They are used as-is, without probing.
    #[serde(skip)]
    pub overrides: PortOverrides,
}

impl Ports {
    pub fn defaults(&self) -> ServiceEndpoints {
        ServiceEndpoints {
            cdp: self.cdp,
            http_mcp: self.http_mcp,
            agent: self.agent,
            extension: self.extension,
        }
    }
}

impl Default for Ports {
    fn default() -> Self {
        Ports {
            cdp: DEFAULT_CDP_PORT,
            http_mcp: DEFAULT_HTTP_MCP_PORT,
            agent: DEFAULT_AGENT_PORT,
            extension: DEFAULT_EXTENSION_PORT,
            overrides: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Health {
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub check_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub process_check_interval: Duration,
}

impl Default for Health {
    fn default() -> Self {
        Health {
            check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
            process_check_interval: DEFAULT_PROCESS_CHECK_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CrashTracking {
    /// Exits happening within this period after a launch count towards the crash loop detection.
    #[serde(with = "humantime_serde")]
    pub startup_grace_period: Duration,

    pub max_startup_failures: u32,

    #[serde(with = "humantime_serde")]
    pub launch_retry_delay: Duration,
}

impl Default for CrashTracking {
    fn default() -> Self {
        CrashTracking {
            startup_grace_period: DEFAULT_STARTUP_GRACE_PERIOD,
            max_startup_failures: DEFAULT_MAX_STARTUP_FAILURES,
            launch_retry_delay: DEFAULT_LAUNCH_RETRY_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateChannel {
    #[default]
    Stable,
    Alpha,
}

impl UpdateChannel {
    pub fn manifest_url(&self) -> &'static str {
        match self {
            UpdateChannel::Stable => DEFAULT_MANIFEST_URL,
            UpdateChannel::Alpha => ALPHA_MANIFEST_URL,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Updater {
    pub enabled: bool,

    pub channel: UpdateChannel,

    /// Replaces the feed of the selected channel.
    pub manifest_url: Option<Url>,

    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub manifest_fetch_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub download_timeout: Duration,

    pub max_manifest_size: u64,

    pub max_package_size: u64,

    pub versions_to_keep: usize,

    /// Base64 encoded ed25519 public key used for verifying the release artifacts.
    /// Never read from nor written to the config file.
    #[serde(skip)]
    pub public_key: String,
}

impl Updater {
    pub fn resolved_manifest_url(&self) -> Result<Url, url::ParseError> {
        match &self.manifest_url {
            Some(url) => Ok(url.clone()),
            None => self.channel.manifest_url().parse(),
        }
    }
}

impl Default for Updater {
    fn default() -> Self {
        Updater {
            enabled: true,
            channel: UpdateChannel::Stable,
            manifest_url: None,
            check_interval: DEFAULT_UPDATE_CHECK_INTERVAL,
            initial_delay: DEFAULT_UPDATE_INITIAL_DELAY,
            manifest_fetch_timeout: DEFAULT_MANIFEST_FETCH_TIMEOUT,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            max_manifest_size: DEFAULT_MAX_MANIFEST_SIZE,
            max_package_size: DEFAULT_MAX_PACKAGE_SIZE,
            versions_to_keep: DEFAULT_VERSIONS_TO_KEEP,
            public_key: UPDATE_PUBLIC_KEY.to_string(),
        }
    }
}
