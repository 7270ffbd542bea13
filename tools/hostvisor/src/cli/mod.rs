// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, Subcommand, ValueEnum};
use hostvisor::error::HostvisorError;
use hostvisor::Config;
use std::fmt::{self, Display, Formatter};
use std::path::Path;
use tracing::debug;

mod build_info;
mod manifest;
mod run;

#[derive(Parser, Debug)]
#[clap(author = "Nymtech", version, about)]
pub(crate) struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

impl Cli {
    pub(crate) fn execute(self) -> Result<(), HostvisorError> {
        match self.command {
            Commands::Run(args) => run::execute(*args),
            Commands::Manifest(args) => manifest::execute(args),
            Commands::BuildInfo(args) => build_info::execute(args),
        }
    }
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Run the supervisor, keeping the backend alive and up to date until interrupted
    Run(Box<run::Args>),

    /// Fetch the release feed and show the versions it offers
    Manifest(manifest::Args),

    /// Show build information of this binary
    BuildInfo(build_info::Args),
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl Display for OutputFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Defaults, optionally overlaid by the toml file at `path`.
pub(crate) fn try_load_config(path: Option<&Path>) -> Result<Config, HostvisorError> {
    match path {
        Some(path) => {
            debug!("loading config from {}", path.display());
            Config::read_from_toml_file(path)
        }
        None => Ok(Config::new()),
    }
}
