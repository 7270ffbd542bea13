// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use crate::cli::{try_load_config, OutputFormat};
use hostvisor::error::HostvisorError;
use hostvisor::upgrades::{FetchLimits, Fetcher, HttpFetcher};
use hostvisor_appcast::{Platform, ReleaseItem, ReleaseManifest};
use semver::Version;
use serde::Serialize;
use std::path::PathBuf;
use tokio::runtime;
use url::Url;

#[derive(clap::Args, Debug)]
pub(crate) struct Args {
    /// Path to the toml config file, used for the feed url and the fetch limits.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Url of the release feed. Takes precedence over the one from the config.
    #[arg(long)]
    manifest_url: Option<Url>,

    #[arg(short, long, default_value_t = OutputFormat::default())]
    output: OutputFormat,
}

#[derive(Serialize)]
struct ManifestSummary<'a> {
    url: &'a Url,
    platform: Option<&'a Platform>,

    /// Newest version with an artifact for this platform.
    installable: Option<&'a Version>,
    items: &'a [ReleaseItem],
}

fn print_text(summary: &ManifestSummary) {
    println!("release feed: {}", summary.url);
    match summary.platform {
        Some(platform) => println!("platform: {platform}"),
        None => println!("platform: unsupported"),
    }
    if summary.items.is_empty() {
        println!("the feed does not contain any valid releases");
        return;
    }

    for item in summary.items {
        println!(
            "\n{} (published {})",
            item.version,
            item.publish_date.date()
        );
        for artifact in &item.artifacts {
            let marker = match summary.platform {
                Some(platform) if artifact.matches(platform) => "*",
                _ => " ",
            };
            println!(
                "  {marker} {}-{}: {} ({} bytes)",
                artifact.os, artifact.arch, artifact.url, artifact.length
            );
        }
    }

    match summary.installable {
        Some(version) => println!("\nnewest installable version: {version}"),
        None => println!("\nno release is installable on this platform"),
    }
}

pub(crate) fn execute(args: Args) -> Result<(), HostvisorError> {
    let config = try_load_config(args.config.as_deref())?;
    let url = match args.manifest_url {
        Some(url) => url,
        None => config.updater.resolved_manifest_url()?,
    };
    let limits = FetchLimits::new(
        config.updater.manifest_fetch_timeout,
        config.updater.max_manifest_size,
    );

    #[allow(clippy::expect_used)]
    let rt = runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to create the runtime");

    let raw = rt.block_on(async {
        let fetcher = HttpFetcher::new()?;
        fetcher
            .fetch(&url, limits)
            .await
            .map_err(|source| HostvisorError::ManifestFetchFailure {
                url: url.clone(),
                source,
            })
    })?;
    let manifest = ReleaseManifest::parse_bytes(&raw)?;

    let platform = Platform::current();
    let installable = platform.as_ref().and_then(|platform| {
        manifest
            .items()
            .iter()
            .find(|item| item.artifact_for(platform).is_some())
            .map(|item| &item.version)
    });
    let summary = ManifestSummary {
        url: &url,
        platform: platform.as_ref(),
        installable,
        items: manifest.items(),
    };

    match args.output {
        OutputFormat::Text => print_text(&summary),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
    }
    Ok(())
}
