// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use crate::error::HostvisorError;
use crate::helpers::{calculate_file_checksum, init_path};
use crate::upgrades::fetch::{FetchLimits, Fetcher};
use crate::upgrades::signature::UpdateVerifier;
use hostvisor_appcast::ReleaseArtifact;
use semver::Version;
use sha2::Sha256;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use url::Url;

/// Downloads the artifact of `version`, checks its declared length and its signature and only then
/// stores it under `pending_dir`. Returns the path of the stored archive.
/// On any failure nothing is left behind on disk.
pub(crate) async fn download_verified_artifact(
    fetcher: &dyn Fetcher,
    verifier: &UpdateVerifier,
    pending_dir: &Path,
    version: &Version,
    artifact: &ReleaseArtifact,
    limits: FetchLimits,
) -> Result<PathBuf, HostvisorError> {
    let url: Url = artifact
        .url
        .parse()
        .map_err(|source| HostvisorError::MalformedArtifactUrl {
            raw: artifact.url.clone(),
            source,
        })?;

    // don't even bother downloading if the signature can't be used
    let signature = verifier.decode_signature(version, &artifact.signature)?;

    info!("downloading backend {version} from {url}");
    let bytes = fetcher.fetch(&url, limits).await.map_err(|source| {
        HostvisorError::ArtifactDownloadFailure {
            version: version.clone(),
            url: url.clone(),
            source,
        }
    })?;

    if bytes.len() as u64 != artifact.length {
        return Err(HostvisorError::ArtifactLengthMismatch {
            version: version.clone(),
            expected: artifact.length,
            actual: bytes.len() as u64,
        });
    }
    verifier.verify(version, &bytes, &signature)?;
    info!("the signature of backend {version} is valid");

    let pending_dir = pending_dir.to_path_buf();
    let target = pending_dir.join(format!("{version}.tar.gz"));
    tokio::task::spawn_blocking(move || {
        init_path(&pending_dir)?;
        let write_failure = |source: std::io::Error| HostvisorError::ArtifactWriteFailure {
            path: target.clone(),
            source,
        };
        if let Err(source) = fs::write(&target, &bytes) {
            discard_pending(&target);
            return Err(write_failure(source));
        }
        match calculate_file_checksum::<Sha256, _>(&target) {
            Ok(checksum) => info!(
                "stored {} (sha256: {})",
                target.display(),
                hex::encode(checksum)
            ),
            Err(source) => {
                discard_pending(&target);
                return Err(write_failure(source));
            }
        }
        Ok(target)
    })
    .await?
}

pub(crate) fn discard_pending(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove {}: {err}", path.display())
        }
    }
}
