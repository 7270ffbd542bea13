// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

#![warn(clippy::expect_used)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::todo)]
#![warn(clippy::dbg_macro)]

#[cfg(unix)]
pub(crate) mod cli;

#[cfg(unix)]
fn main() -> anyhow::Result<()> {
    use clap::Parser;

    let args = crate::cli::Cli::parse();

    Ok(args.execute()?)
}

#[cfg(not(unix))]
#[allow(clippy::panic)]
fn main() {
    panic!("hostvisor is not supported on this platform")
}
