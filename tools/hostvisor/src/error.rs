// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use crate::upgrades::fetch::FetchError;
use hostvisor_appcast::ManifestError;
use semver::Version;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum HostvisorError {
    #[error("failed to initialise the path at '{}': {source}", path.display())]
    PathInitFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to load config file using path '{}'. detailed message: {source}", path.display())]
    ConfigLoadFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file at '{}'. detailed message: {source}", path.display())]
    ConfigParseFailure {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },

    #[error("failed to save config file using path '{}'. detailed message: {source}", path.display())]
    ConfigSaveFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialise the config: {0}")]
    ConfigSerializationFailure(#[from] toml::ser::Error),

    #[error("failed to open the lock file at '{}': {source}", path.display())]
    LockFileOpenFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to lock '{}': {source}", path.display())]
    LockFailure {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("neither the backend binary at '{}' nor the bundled one at '{}' exist", path.display(), fallback.display())]
    BackendBinaryNotFound { path: PathBuf, fallback: PathBuf },

    #[error("failed to write the backend config file to '{}': {source}", path.display())]
    BackendConfigWriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialise json data: {0}")]
    JsonSerializationFailure(#[from] serde_json::Error),

    #[error("failed to launch the backend binary at '{}': {source}", path.display())]
    BackendLaunchFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("the launched backend process has no pid (it has already been reaped)")]
    BackendWithoutPid,

    #[error("failed to send the kill signal to process {pid}: {source}")]
    ProcessKillFailure {
        pid: u32,
        #[source]
        source: nix::Error,
    },

    #[error("failed to read preferences from '{}': {source}", path.display())]
    PreferencesLoadFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("the preferences at '{}' are malformed: {source}", path.display())]
    MalformedPreferences {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to persist preferences to '{}': {source}", path.display())]
    PreferencesSaveFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to watch '{}' for changes: {source}", path.display())]
    FileWatchFailure {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("failed to bind the debug listener on port {port}: {source}")]
    DebugListenerBindFailure {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to build the http client: {source}")]
    HttpClientBuildFailure {
        #[source]
        source: reqwest::Error,
    },

    #[error("the service manager is no longer running")]
    ServiceManagerUnavailable,

    #[error("the release feed url is malformed: {source}")]
    MalformedManifestUrl {
        #[from]
        source: url::ParseError,
    },

    #[error("release artifacts are not published for this platform ({os}-{arch})", os = std::env::consts::OS, arch = std::env::consts::ARCH)]
    UnsupportedPlatform,

    #[error("failed to fetch the release feed from {url}: {source}")]
    ManifestFetchFailure {
        url: Url,
        #[source]
        source: FetchError,
    },

    #[error("failed to parse the release feed: {0}")]
    ManifestParseFailure(#[from] ManifestError),

    #[error("'{raw}' is not a valid artifact url: {source}")]
    MalformedArtifactUrl {
        raw: String,
        #[source]
        source: url::ParseError,
    },

    #[error("failed to download the artifact of version {version} from {url}: {source}")]
    ArtifactDownloadFailure {
        version: Version,
        url: Url,
        #[source]
        source: FetchError,
    },

    #[error("the artifact of version {version} has {actual} bytes while the release feed declared {expected}")]
    ArtifactLengthMismatch {
        version: Version,
        expected: u64,
        actual: u64,
    },

    #[error("the configured update public key is invalid: {reason}")]
    InvalidPublicKey { reason: String },

    #[error("the signature of version {version} is malformed: {reason}")]
    MalformedSignature { version: Version, reason: String },

    #[error("the signature of version {version} does not match its artifact")]
    SignatureVerificationFailure { version: Version },

    #[error("failed to store the downloaded artifact at '{}': {source}", path.display())]
    ArtifactWriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to unpack the archive '{}': {source}", path.display())]
    ArchiveExtractionFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("the archive of version {version} does not contain the backend binary (expected '{}')", expected.display())]
    MissingBinaryInArchive { version: Version, expected: PathBuf },

    #[error("failed to modify the versions directory at '{}': {source}", path.display())]
    VersionDirectoryFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("the version marker at '{}' is malformed: {source}", path.display())]
    MalformedVersionMarker {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("version {version} is not installed")]
    VersionNotInstalled { version: Version },

    #[error("the service manager refused or failed to restart into version {version}")]
    UpdateRestartFailure { version: Version },

    #[error("blocking task failed to complete: {0}")]
    BlockingTaskFailure(#[from] tokio::task::JoinError),
}
