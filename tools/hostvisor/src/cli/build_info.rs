// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use crate::cli::OutputFormat;
use hostvisor::error::HostvisorError;
use serde::Serialize;

#[derive(clap::Args, Debug)]
pub(crate) struct Args {
    #[arg(short, long, default_value_t = OutputFormat::default())]
    output: OutputFormat,
}

#[derive(Debug, Serialize)]
struct BuildInformation {
    binary_name: &'static str,
    build_version: &'static str,
    target_os: &'static str,
    target_arch: &'static str,
    debug_assertions: bool,
}

impl BuildInformation {
    fn new() -> Self {
        BuildInformation {
            binary_name: env!("CARGO_PKG_NAME"),
            build_version: env!("CARGO_PKG_VERSION"),
            target_os: std::env::consts::OS,
            target_arch: std::env::consts::ARCH,
            debug_assertions: cfg!(debug_assertions),
        }
    }

    fn pretty_print(&self) -> String {
        format!(
            "{:<20}{}\n{:<20}{}\n{:<20}{}-{}\n{:<20}{}",
            "Binary Name:",
            self.binary_name,
            "Build Version:",
            self.build_version,
            "Target:",
            self.target_os,
            self.target_arch,
            "Debug Assertions:",
            self.debug_assertions,
        )
    }
}

pub(crate) fn execute(args: Args) -> Result<(), HostvisorError> {
    let info = BuildInformation::new();
    match args.output {
        OutputFormat::Text => println!("{}", info.pretty_print()),
        OutputFormat::Json => println!("{}", serde_json::to_string(&info)?),
    }
    Ok(())
}
