// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use crate::error::HostvisorError;
use crate::helpers::write_atomically;
use crate::ports::{is_port_allowed, ServiceEndpoints};
use notify::event::EventKind;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const CHANGES_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferenceValues {
    pub cdp_port: Option<u16>,
    pub http_mcp_port: Option<u16>,
    pub agent_port: Option<u16>,
    pub extension_port: Option<u16>,

    pub allow_remote_in_mcp: bool,

    /// Set by the host (or the operator) to request a backend restart. Reset once honoured.
    pub restart_requested: bool,

    /// Version of the most recently launched backend.
    pub backend_version: Option<String>,

    pub install_id: Option<String>,
}

impl PreferenceValues {
    fn diff(&self, new: &PreferenceValues) -> Vec<PreferenceChange> {
        let mut changes = Vec::new();
        if self.allow_remote_in_mcp != new.allow_remote_in_mcp {
            changes.push(PreferenceChange::AllowRemoteInMcp(new.allow_remote_in_mcp))
        }
        if self.restart_requested != new.restart_requested {
            changes.push(PreferenceChange::RestartRequested(new.restart_requested))
        }
        if (self.cdp_port, self.http_mcp_port, self.agent_port, self.extension_port)
            != (new.cdp_port, new.http_mcp_port, new.agent_port, new.extension_port)
        {
            changes.push(PreferenceChange::Ports)
        }
        if self.backend_version != new.backend_version {
            changes.push(PreferenceChange::BackendVersion(new.backend_version.clone()))
        }
        changes
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreferenceChange {
    AllowRemoteInMcp(bool),
    RestartRequested(bool),
    Ports,
    BackendVersion(Option<String>),
}

/// Host-wide preferences persisted as json. Cloning is cheap and all clones share the same state.
#[derive(Clone)]
pub struct Preferences {
    inner: Arc<PreferencesInner>,
}

struct PreferencesInner {
    path: PathBuf,
    values: Mutex<PreferenceValues>,
    changes: broadcast::Sender<PreferenceChange>,
}

// `None` if the file doesn't exist
fn read_values(path: &Path) -> Result<Option<PreferenceValues>, HostvisorError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(HostvisorError::PreferencesLoadFailure {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|source| HostvisorError::MalformedPreferences {
            path: path.to_path_buf(),
            source,
        })
}

fn remembered_port(name: &str, stored: Option<u16>, default: u16) -> u16 {
    match stored {
        Some(port) if is_port_allowed(port) => port,
        Some(port) => {
            warn!("ignoring the remembered {name} port {port}. using {default} instead");
            default
        }
        None => default,
    }
}

impl Preferences {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, HostvisorError> {
        let path = path.as_ref().to_path_buf();
        let values = read_values(&path)?.unwrap_or_default();
        Ok(Self::with_values(path, values))
    }

    /// Loads the preferences, starting from scratch if the existing file can't be used.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        Self::load(path).unwrap_or_else(|err| {
            warn!("{err}. starting with default preferences");
            Self::with_values(path.to_path_buf(), PreferenceValues::default())
        })
    }

    fn with_values(path: PathBuf, values: PreferenceValues) -> Self {
        let (changes, _) = broadcast::channel(CHANGES_CHANNEL_CAPACITY);
        Preferences {
            inner: Arc::new(PreferencesInner {
                path,
                values: Mutex::new(values),
                changes,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn lock(&self) -> MutexGuard<'_, PreferenceValues> {
        self.inner
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn values(&self) -> PreferenceValues {
        self.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PreferenceChange> {
        self.inner.changes.subscribe()
    }

    fn broadcast(&self, changes: Vec<PreferenceChange>) {
        for change in changes {
            debug!("preference changed: {change:?}");
            // no subscribers is fine
            let _ = self.inner.changes.send(change);
        }
    }

    // the file is written before the in-memory state is updated (under the same lock),
    // so a concurrent reload can never observe stale content as a change
    fn update<F>(&self, f: F) -> Result<(), HostvisorError>
    where
        F: FnOnce(&mut PreferenceValues),
    {
        let mut guard = self.lock();
        let mut updated = guard.clone();
        f(&mut updated);
        if updated == *guard {
            return Ok(());
        }

        let serialised = serde_json::to_vec_pretty(&updated)?;
        write_atomically(&self.inner.path, &serialised).map_err(|source| {
            HostvisorError::PreferencesSaveFailure {
                path: self.inner.path.clone(),
                source,
            }
        })?;

        let changes = guard.diff(&updated);
        *guard = updated;
        drop(guard);

        self.broadcast(changes);
        Ok(())
    }

    /// Re-reads the file and broadcasts whatever differs from the known state.
    /// A removed file leaves the known state untouched.
    pub fn reload(&self) -> Result<(), HostvisorError> {
        let mut guard = self.lock();
        let Some(fresh) = read_values(&self.inner.path)? else {
            debug!(
                "{} no longer exists. keeping the current preferences",
                self.inner.path.display()
            );
            return Ok(());
        };
        let changes = guard.diff(&fresh);
        *guard = fresh;
        drop(guard);

        if !changes.is_empty() {
            info!("preferences were modified externally");
        }
        self.broadcast(changes);
        Ok(())
    }

    /// Returns the remembered ports, using `defaults` for anything that was never stored
    /// or that the arbiter would never hand out.
    pub fn remembered_ports(&self, defaults: ServiceEndpoints) -> ServiceEndpoints {
        let values = self.lock();
        ServiceEndpoints {
            cdp: remembered_port("cdp", values.cdp_port, defaults.cdp),
            http_mcp: remembered_port("http_mcp", values.http_mcp_port, defaults.http_mcp),
            agent: remembered_port("agent", values.agent_port, defaults.agent),
            extension: remembered_port("extension", values.extension_port, defaults.extension),
        }
    }

    pub fn set_ports(&self, endpoints: ServiceEndpoints) -> Result<(), HostvisorError> {
        self.update(|values| {
            values.cdp_port = Some(endpoints.cdp);
            values.http_mcp_port = Some(endpoints.http_mcp);
            values.agent_port = Some(endpoints.agent);
            values.extension_port = Some(endpoints.extension);
        })
    }

    pub fn allow_remote_in_mcp(&self) -> bool {
        self.lock().allow_remote_in_mcp
    }

    pub fn set_allow_remote_in_mcp(&self, allow: bool) -> Result<(), HostvisorError> {
        self.update(|values| values.allow_remote_in_mcp = allow)
    }

    pub fn restart_requested(&self) -> bool {
        self.lock().restart_requested
    }

    pub fn set_restart_requested(&self, requested: bool) -> Result<(), HostvisorError> {
        self.update(|values| values.restart_requested = requested)
    }

    pub fn set_backend_version<S: Into<String>>(&self, version: S) -> Result<(), HostvisorError> {
        let version = version.into();
        self.update(|values| values.backend_version = Some(version))
    }

    /// Returns the install identifier. An explicitly configured one always wins,
    /// otherwise the stored one is used, generating (and persisting) a new one if needed.
    pub fn ensure_install_id(&self, configured: Option<&str>) -> Result<String, HostvisorError> {
        if let Some(configured) = configured {
            return Ok(configured.to_string());
        }
        if let Some(existing) = self.lock().install_id.clone() {
            return Ok(existing);
        }

        let generated = uuid::Uuid::new_v4().to_string();
        info!("generated new install id {generated}");
        self.update(|values| {
            values.install_id.get_or_insert_with(|| generated.clone());
        })?;

        Ok(self.lock().install_id.clone().unwrap_or(generated))
    }

    /// Starts watching the preferences file for modifications made by other processes.
    /// Watching stops once the returned watcher is dropped.
    pub fn watch(&self) -> Result<PreferencesWatcher, HostvisorError> {
        let path = self.inner.path.clone();
        let directory = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        crate::helpers::init_path(&directory)?;

        // the file is replaced through renames, so the whole directory has to be watched
        let file_name = path.file_name().map(|name| name.to_os_string());
        let preferences = self.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    let relevant = event
                        .paths
                        .iter()
                        .any(|changed| changed.file_name() == file_name.as_deref());
                    if relevant {
                        if let Err(err) = preferences.reload() {
                            warn!("failed to reload the preferences: {err}")
                        }
                    }
                }
                Err(err) => warn!("preferences watcher error: {err}"),
            })
            .map_err(|source| HostvisorError::FileWatchFailure {
                path: directory.clone(),
                source,
            })?;

        watcher
            .watch(&directory, RecursiveMode::NonRecursive)
            .map_err(|source| HostvisorError::FileWatchFailure {
                path: directory.clone(),
                source,
            })?;

        Ok(PreferencesWatcher { _watcher: watcher })
    }
}

pub struct PreferencesWatcher {
    _watcher: RecommendedWatcher,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn setters_persist_and_broadcast() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("preferences.json");

        let prefs = Preferences::load(&path)?;
        let mut changes = prefs.subscribe();

        prefs.set_allow_remote_in_mcp(true)?;
        assert_eq!(changes.try_recv()?, PreferenceChange::AllowRemoteInMcp(true));

        // setting the same value again is not a change
        prefs.set_allow_remote_in_mcp(true)?;
        assert!(matches!(changes.try_recv(), Err(TryRecvError::Empty)));

        let reloaded = Preferences::load(&path)?;
        assert!(reloaded.allow_remote_in_mcp());
        Ok(())
    }

    #[test]
    fn remembered_ports_fall_back_to_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let prefs = Preferences::load(dir.path().join("preferences.json"))?;
        let defaults = ServiceEndpoints {
            cdp: 9000,
            http_mcp: 9100,
            agent: 9200,
            extension: 9300,
        };
        assert_eq!(prefs.remembered_ports(defaults), defaults);

        let stored = ServiceEndpoints {
            cdp: 9001,
            http_mcp: 9101,
            agent: 9201,
            extension: 9301,
        };
        prefs.set_ports(stored)?;
        assert_eq!(prefs.remembered_ports(defaults), stored);
        Ok(())
    }

    #[test]
    fn unusable_remembered_ports_are_ignored() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("preferences.json");
        let stored = PreferenceValues {
            cdp_port: Some(0),
            http_mcp_port: Some(80),
            agent_port: Some(6667),
            extension_port: Some(9301),
            ..Default::default()
        };
        fs::write(&path, serde_json::to_vec(&stored)?)?;

        let prefs = Preferences::load(&path)?;
        let defaults = ServiceEndpoints {
            cdp: 9000,
            http_mcp: 9100,
            agent: 9200,
            extension: 9300,
        };
        let remembered = prefs.remembered_ports(defaults);
        assert_eq!(remembered.cdp, 9000);
        assert_eq!(remembered.http_mcp, 9100);
        assert_eq!(remembered.agent, 9200);
        assert_eq!(remembered.extension, 9301);
        Ok(())
    }

    #[test]
    fn removed_file_keeps_the_known_values() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("preferences.json");

        let prefs = Preferences::load(&path)?;
        prefs.set_allow_remote_in_mcp(true)?;
        let mut changes = prefs.subscribe();

        fs::remove_file(&path)?;
        prefs.reload()?;

        assert!(matches!(changes.try_recv(), Err(TryRecvError::Empty)));
        assert!(prefs.allow_remote_in_mcp());
        Ok(())
    }

    #[test]
    fn install_id_is_generated_once() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("preferences.json");

        let prefs = Preferences::load(&path)?;
        let generated = prefs.ensure_install_id(None)?;
        assert_eq!(prefs.ensure_install_id(None)?, generated);
        assert_eq!(Preferences::load(&path)?.ensure_install_id(None)?, generated);
        assert_eq!(prefs.ensure_install_id(Some("configured"))?, "configured");
        Ok(())
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("preferences.json");
        fs::write(&path, b"{ not json")?;

        assert!(Preferences::load(&path).is_err());
        let prefs = Preferences::load_or_default(&path);
        assert_eq!(prefs.values(), PreferenceValues::default());
        Ok(())
    }

    #[test]
    fn reload_broadcasts_external_modifications() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("preferences.json");

        let prefs = Preferences::load(&path)?;
        let mut changes = prefs.subscribe();

        let external = PreferenceValues {
            restart_requested: true,
            ..Default::default()
        };
        fs::write(&path, serde_json::to_vec(&external)?)?;
        prefs.reload()?;

        assert_eq!(changes.try_recv()?, PreferenceChange::RestartRequested(true));
        assert!(prefs.restart_requested());
        Ok(())
    }

    #[tokio::test]
    async fn watcher_picks_up_external_modifications() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("preferences.json");

        let prefs = Preferences::load(&path)?;
        let mut changes = prefs.subscribe();
        let _watcher = prefs.watch()?;

        let external = PreferenceValues {
            allow_remote_in_mcp: true,
            ..Default::default()
        };
        write_atomically(&path, &serde_json::to_vec(&external)?)?;

        let change = tokio::time::timeout(Duration::from_secs(10), changes.recv()).await??;
        assert_eq!(change, PreferenceChange::AllowRemoteInMcp(true));
        Ok(())
    }
}
