// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

//! Parsing of the (Sparkle-style) release feed that announces new backend versions.
//!
//! The feed is an RSS document where each `<item>` describes one published version and each
//! `<enclosure>` inside it one downloadable artifact for a particular OS/architecture pair:
//!
//! ```xml
//! <rss xmlns:sparkle="http://www.andymatuschak.org/xml-namespaces/sparkle">
//!   <channel>
//!     <item>
//!       <sparkle:version>0.30.0</sparkle:version>
//!       <pubDate>Wed, 12 Nov 2025 17:30:00 -0700</pubDate>
//!       <enclosure
//!         url="https://..."
//!         sparkle:os="macos"
//!         sparkle:arch="arm64"
//!         sparkle:edSignature="base64..."
//!         length="12345678"
//!         type="application/gzip"/>
//!     </item>
//!   </channel>
//! </rss>
//! ```

pub mod error;
pub mod parser;
pub mod platform;
pub mod types;

pub use error::ManifestError;
pub use platform::Platform;
pub use types::{ReleaseArtifact, ReleaseItem, ReleaseManifest};
