// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

pub mod download;
pub mod fetch;
pub mod signature;
pub mod updater;
pub mod versions;

pub use fetch::{FetchError, FetchLimits, Fetcher, HttpFetcher};
pub use signature::UpdateVerifier;
pub use updater::{UpdateOutcome, Updater, UpdaterHandle};
pub use versions::{VersionMarker, VersionStore};
