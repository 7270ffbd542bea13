// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use crate::config::{BIN_DIR, CURRENT_VERSION_FILENAME};
use crate::error::HostvisorError;
use crate::helpers::{init_path, write_atomically};
use flate2::read::GzDecoder;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Contents of the `current_version` marker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMarker {
    /// The update-managed version that should be launched. `None` means the bundled binary.
    pub active: Option<Version>,

    /// The version that was active before `active`, used as the rollback target.
    pub previous: Option<Version>,

    /// Versions that have been invalidated and must never be activated or installed again.
    #[serde(default)]
    pub rejected: Vec<Version>,

    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl VersionMarker {
    pub fn is_rejected(&self, version: &Version) -> bool {
        self.rejected.contains(version)
    }
}

/// Paths of an installed version ready to be launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledBackend {
    pub version: Version,
    pub executable: PathBuf,
    pub resources_dir: PathBuf,
}

/// The on-disk record of the update-managed backend versions.
///
/// Layout:
/// ```text
/// versions/
/// ├── current_version
/// ├── 1.9.3/bin/<binary_name>
/// └── 2.0.0/bin/<binary_name>
/// ```
/// A freshly installed version and the one it replaces both have to survive until the
/// update restart went through.
pub const MIN_VERSIONS_TO_KEEP: usize = 2;

#[derive(Debug, Clone)]
pub struct VersionStore {
    root: PathBuf,
    binary_name: String,
    versions_to_keep: usize,
}

impl VersionStore {
    pub fn new<P: Into<PathBuf>, S: Into<String>>(
        root: P,
        binary_name: S,
        versions_to_keep: usize,
    ) -> Self {
        VersionStore {
            root: root.into(),
            binary_name: binary_name.into(),
            versions_to_keep: versions_to_keep.max(MIN_VERSIONS_TO_KEEP),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn version_dir(&self, version: &Version) -> PathBuf {
        self.root.join(version.to_string())
    }

    pub fn executable_for(&self, version: &Version) -> PathBuf {
        self.version_dir(version)
            .join(BIN_DIR)
            .join(&self.binary_name)
    }

    pub fn marker_path(&self) -> PathBuf {
        self.root.join(CURRENT_VERSION_FILENAME)
    }

    pub fn is_installed(&self, version: &Version) -> bool {
        self.executable_for(version).is_file()
    }

    pub fn marker(&self) -> Result<VersionMarker, HostvisorError> {
        let path = self.marker_path();
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(VersionMarker::default())
            }
            Err(source) => return Err(HostvisorError::VersionDirectoryFailure { path, source }),
        };
        serde_json::from_slice(&raw)
            .map_err(|source| HostvisorError::MalformedVersionMarker { path, source })
    }

    fn save_marker(&self, mut marker: VersionMarker) -> Result<(), HostvisorError> {
        marker.updated_at = Some(OffsetDateTime::now_utc());
        let path = self.marker_path();
        let serialised = serde_json::to_vec_pretty(&marker)?;
        write_atomically(&path, &serialised)
            .map_err(|source| HostvisorError::VersionDirectoryFailure { path, source })
    }

    /// All installed versions, in ascending order.
    pub fn installed_versions(&self) -> Result<Vec<Version>, HostvisorError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(HostvisorError::VersionDirectoryFailure {
                    path: self.root.clone(),
                    source,
                })
            }
        };

        let mut versions = Vec::new();
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            // in-progress installations and anything else that isn't a version is skipped
            let Some(version) = entry
                .file_name()
                .to_str()
                .and_then(|name| Version::parse(name).ok())
            else {
                continue;
            };
            versions.push(version)
        }
        versions.sort();
        Ok(versions)
    }

    /// The version that should be launched, unless the bundled binary should be used.
    /// The executable is not guaranteed to exist.
    pub fn best_installed(&self) -> Option<InstalledBackend> {
        let marker = match self.marker() {
            Ok(marker) => marker,
            Err(err) => {
                warn!("{err}. using the bundled backend");
                return None;
            }
        };
        let version = marker.active?;
        Some(InstalledBackend {
            executable: self.executable_for(&version),
            resources_dir: self.version_dir(&version),
            version,
        })
    }

    /// Unpacks a gzipped tarball into a fresh version directory. The archive root is the resources
    /// directory of the new version, so it has to contain `bin/<binary_name>`.
    /// The version directory only appears once the archive was fully unpacked and validated.
    pub fn install_from_archive<P: AsRef<Path>>(
        &self,
        version: &Version,
        archive: P,
    ) -> Result<PathBuf, HostvisorError> {
        let archive = archive.as_ref();
        init_path(&self.root)?;

        let staging = tempfile::Builder::new()
            .prefix(".install-")
            .tempdir_in(&self.root)
            .map_err(|source| HostvisorError::VersionDirectoryFailure {
                path: self.root.clone(),
                source,
            })?;

        let extraction_failure = |source: io::Error| HostvisorError::ArchiveExtractionFailure {
            path: archive.to_path_buf(),
            source,
        };
        let file = File::open(archive).map_err(extraction_failure)?;
        tar::Archive::new(GzDecoder::new(BufReader::new(file)))
            .unpack(staging.path())
            .map_err(extraction_failure)?;

        let staged_binary = staging.path().join(BIN_DIR).join(&self.binary_name);
        if !staged_binary.is_file() {
            return Err(HostvisorError::MissingBinaryInArchive {
                version: version.clone(),
                expected: PathBuf::from(BIN_DIR).join(&self.binary_name),
            });
        }
        fs::set_permissions(&staged_binary, fs::Permissions::from_mode(0o755)).map_err(
            |source| HostvisorError::VersionDirectoryFailure {
                path: staged_binary.clone(),
                source,
            },
        )?;

        let target = self.version_dir(version);
        if target.exists() {
            warn!("{} already exists, replacing it", target.display());
            fs::remove_dir_all(&target).map_err(|source| {
                HostvisorError::VersionDirectoryFailure {
                    path: target.clone(),
                    source,
                }
            })?;
        }
        fs::rename(staging.path(), &target).map_err(|source| {
            HostvisorError::VersionDirectoryFailure {
                path: target.clone(),
                source,
            }
        })?;

        info!("installed backend {version} into {}", target.display());
        Ok(target)
    }

    /// Makes `version` the one launched from now on. The currently active version becomes the
    /// rollback target.
    pub fn activate(&self, version: &Version) -> Result<(), HostvisorError> {
        if !self.is_installed(version) {
            return Err(HostvisorError::VersionNotInstalled {
                version: version.clone(),
            });
        }

        let mut marker = self.marker()?;
        if marker.active.as_ref() == Some(version) {
            return Ok(());
        }
        marker.previous = marker.active.take();
        marker.active = Some(version.clone());
        marker.rejected.retain(|rejected| rejected != version);
        self.save_marker(marker)?;

        info!("activated backend {version}");
        Ok(())
    }

    /// Rejects the active version, restoring the previous one if it's still usable, or the bundled
    /// binary otherwise. If `expected` is set, nothing happens unless it is the active version.
    /// Returns the rejected version, if any.
    pub fn invalidate_active(
        &self,
        expected: Option<&Version>,
    ) -> Result<Option<Version>, HostvisorError> {
        let mut marker = self.marker()?;
        let Some(active) = marker.active.clone() else {
            return Ok(None);
        };
        if let Some(expected) = expected {
            if expected != &active {
                debug!("not invalidating {expected}, as {active} is the active version");
                return Ok(None);
            }
        }

        if !marker.is_rejected(&active) {
            marker.rejected.push(active.clone());
        }
        marker.active = marker
            .previous
            .take()
            .filter(|previous| !marker.rejected.contains(previous) && self.is_installed(previous));
        match &marker.active {
            Some(previous) => warn!("invalidated backend {active}, rolling back to {previous}"),
            None => warn!("invalidated backend {active}, rolling back to the bundled binary"),
        }
        self.save_marker(marker)?;

        Ok(Some(active))
    }

    pub fn rejected_versions(&self) -> Result<Vec<Version>, HostvisorError> {
        Ok(self.marker()?.rejected)
    }

    /// Removes the oldest installed versions beyond the retention count. The newest version and
    /// anything in `protected` are always kept, and they count towards the retention limit.
    /// Protected versions take precedence, so more than `versions_to_keep` directories remain
    /// only when the protected set alone exceeds it. Returns the removed versions.
    pub fn prune(&self, protected: &[Version]) -> Result<Vec<Version>, HostvisorError> {
        let mut installed = self.installed_versions()?;
        installed.reverse();

        let mut keep: Vec<Version> = Vec::new();
        if let Some(newest) = installed.first() {
            keep.push(newest.clone());
        }
        for version in protected {
            if installed.contains(version) && !keep.contains(version) {
                keep.push(version.clone())
            }
        }
        for version in &installed {
            if keep.len() >= self.versions_to_keep {
                break;
            }
            if !keep.contains(version) {
                keep.push(version.clone())
            }
        }

        let mut removed = Vec::new();
        for version in installed.into_iter().filter(|v| !keep.contains(v)) {
            let dir = self.version_dir(&version);
            debug!("pruning {}", dir.display());
            fs::remove_dir_all(&dir)
                .map_err(|source| HostvisorError::VersionDirectoryFailure { path: dir, source })?;
            removed.push(version);
        }
        if !removed.is_empty() {
            info!("pruned old backend versions: {removed:?}");
        }
        Ok(removed)
    }
}
