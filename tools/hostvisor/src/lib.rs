// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

#![warn(clippy::expect_used)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::todo)]
#![warn(clippy::dbg_macro)]

#[cfg(unix)]
pub mod config;

#[cfg(unix)]
pub mod daemon;

#[cfg(unix)]
pub mod debug_server;

#[cfg(unix)]
pub mod error;

#[cfg(unix)]
pub mod health;

#[cfg(unix)]
pub mod helpers;

#[cfg(unix)]
pub mod lock;

#[cfg(unix)]
pub mod logging;

#[cfg(unix)]
pub mod manager;

#[cfg(unix)]
pub mod ports;

#[cfg(unix)]
pub mod prefs;

#[cfg(unix)]
pub mod upgrades;

#[cfg(unix)]
pub use config::Config;

#[cfg(unix)]
pub use error::HostvisorError;

#[cfg(unix)]
pub use manager::{ServiceHandle, ServiceManager};
