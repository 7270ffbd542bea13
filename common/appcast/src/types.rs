// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use crate::error::ManifestError;
use crate::parser::parse_items;
use crate::platform::Platform;
use semver::Version;
use serde::Serialize;
use time::OffsetDateTime;

/// A single downloadable archive of a release, built for one OS/architecture combination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseArtifact {
    pub url: String,

    /// `macos`, `linux` or `windows`
    pub os: String,

    /// `arm64` or `x86_64`
    pub arch: String,

    /// Detached ed25519 signature of the archive, base64 encoded.
    pub signature: String,

    /// Declared size of the archive in bytes.
    pub length: u64,
}

impl ReleaseArtifact {
    pub fn matches(&self, platform: &Platform) -> bool {
        self.os == platform.os && self.arch == platform.arch
    }
}

/// One published version of the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseItem {
    pub version: Version,

    /// Publish date of this release. Set to the unix epoch if the feed had no parseable date.
    #[serde(with = "time::serde::rfc3339")]
    pub publish_date: OffsetDateTime,

    pub artifacts: Vec<ReleaseArtifact>,
}

impl ReleaseItem {
    pub fn artifact_for(&self, platform: &Platform) -> Option<&ReleaseArtifact> {
        self.artifacts.iter().find(|a| a.matches(platform))
    }

    pub fn artifact_for_current_platform(&self) -> Option<&ReleaseArtifact> {
        self.artifact_for(&Platform::current()?)
    }
}

/// All valid items of a release feed, in document order (newest first).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReleaseManifest {
    items: Vec<ReleaseItem>,
}

impl ReleaseManifest {
    pub fn new(items: Vec<ReleaseItem>) -> Self {
        ReleaseManifest { items }
    }

    pub fn parse(raw: &str) -> Result<Self, ManifestError> {
        parse_items(raw).map(ReleaseManifest::new)
    }

    pub fn parse_bytes(raw: &[u8]) -> Result<Self, ManifestError> {
        let raw = std::str::from_utf8(raw).map_err(|_| ManifestError::InvalidEncoding)?;
        Self::parse(raw)
    }

    pub fn items(&self) -> &[ReleaseItem] {
        &self.items
    }

    pub fn into_items(self) -> Vec<ReleaseItem> {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// The first retained item of the feed.
    pub fn latest(&self) -> Option<&ReleaseItem> {
        self.items.first()
    }

    /// First item (in document order) that is strictly newer than `current`, is not excluded
    /// by `skip` and ships an artifact for the given platform.
    pub fn first_upgrade_candidate<F>(
        &self,
        current: &Version,
        platform: &Platform,
        skip: F,
    ) -> Option<(&ReleaseItem, &ReleaseArtifact)>
    where
        F: Fn(&Version) -> bool,
    {
        self.items
            .iter()
            .filter(|item| &item.version > current && !skip(&item.version))
            .find_map(|item| item.artifact_for(platform).map(|artifact| (item, artifact)))
    }
}
