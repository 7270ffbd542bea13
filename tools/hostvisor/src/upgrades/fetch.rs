// Copyright 2025 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use crate::error::HostvisorError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::StreamExt;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

const LOGGING_RATE: Duration = Duration::from_millis(500);

// don't bother with progress for anything smaller
const PROGRESS_THRESHOLD: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("the request did not complete within {}", humantime::format_duration(*timeout))]
    Timeout { timeout: Duration },

    #[error("received unexpected status code {status}")]
    UnexpectedStatus { status: StatusCode },

    #[error("the response exceeded the size limit of {limit} bytes")]
    ResponseTooLarge { limit: u64 },

    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchLimits {
    pub timeout: Duration,
    pub max_size: u64,
}

impl FetchLimits {
    pub fn new(timeout: Duration, max_size: u64) -> Self {
        FetchLimits { timeout, max_size }
    }
}

/// The "fetch url, get bytes, with timeout" primitive used by the updater.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &Url, limits: FetchLimits) -> Result<Bytes, FetchError>;
}

fn log_progress_bar(downloaded: u64, length: u64) {
    let percentage = downloaded as f32 * 100. / length as f32;

    let width = 40;
    let filled = ((percentage * width as f32 / 100.) as usize).min(width);
    let empty = width - filled;

    let filled = format!("{:#^width$}", "", width = filled);
    let empty = format!("{: ^width$}", "", width = empty);

    let mb_downloaded = downloaded as f64 / (1024. * 1024.);
    let mb_total = length as f64 / (1024. * 1024.);

    info!("[{filled}{empty}] {mb_downloaded:.2}MB/{mb_total:.2}MB ({percentage:.2}%)");
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, HostvisorError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("hostvisor/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| HostvisorError::HttpClientBuildFailure { source })?;

        Ok(HttpFetcher { client })
    }

    async fn fetch_bounded(&self, url: &Url, max_size: u64) -> Result<Bytes, FetchError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::UnexpectedStatus { status });
        }

        let maybe_length = response.content_length();
        if let Some(length) = maybe_length {
            if length > max_size {
                return Err(FetchError::ResponseTooLarge { limit: max_size });
            }
        }
        let show_progress = maybe_length.is_some_and(|length| length >= PROGRESS_THRESHOLD);

        let mut source = response.bytes_stream();
        let mut buf = BytesMut::with_capacity(maybe_length.unwrap_or_default() as usize);
        let mut last_logged = tokio::time::Instant::now();
        while let Some(chunk) = source.next().await {
            let chunk = chunk?;
            if (buf.len() + chunk.len()) as u64 > max_size {
                return Err(FetchError::ResponseTooLarge { limit: max_size });
            }
            buf.extend_from_slice(&chunk);

            if let Some(length) = maybe_length {
                if show_progress && last_logged.elapsed() > LOGGING_RATE {
                    log_progress_bar(buf.len() as u64, length);
                    last_logged = tokio::time::Instant::now();
                }
            }
        }
        if show_progress {
            log_progress_bar(buf.len() as u64, buf.len() as u64)
        }

        debug!("fetched {} bytes from {url}", buf.len());
        Ok(buf.freeze())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &Url, limits: FetchLimits) -> Result<Bytes, FetchError> {
        tokio::time::timeout(limits.timeout, self.fetch_bounded(url, limits.max_size))
            .await
            .map_err(|_| FetchError::Timeout {
                timeout: limits.timeout,
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> anyhow::Result<Url> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        tokio::spawn(async move { axum::serve(listener, router).await });
        Ok(format!("http://{address}/").parse()?)
    }

    fn router() -> Router {
        Router::new()
            .route("/small", get(|| async { "tiny" }))
            .route("/large", get(|| async { vec![0u8; 4096] }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            )
    }

    #[tokio::test]
    async fn fetching_within_limits() -> anyhow::Result<()> {
        let base = serve(router()).await?;
        let fetcher = HttpFetcher::new()?;

        let bytes = fetcher
            .fetch(&base.join("small")?, FetchLimits::new(Duration::from_secs(5), 1024))
            .await?;
        assert_eq!(&bytes[..], b"tiny");
        Ok(())
    }

    #[tokio::test]
    async fn oversized_response_is_rejected() -> anyhow::Result<()> {
        let base = serve(router()).await?;
        let fetcher = HttpFetcher::new()?;

        let res = fetcher
            .fetch(&base.join("large")?, FetchLimits::new(Duration::from_secs(5), 1024))
            .await;
        assert!(matches!(res, Err(FetchError::ResponseTooLarge { limit: 1024 })));
        Ok(())
    }

    #[tokio::test]
    async fn non_success_status_is_rejected() -> anyhow::Result<()> {
        let base = serve(router()).await?;
        let fetcher = HttpFetcher::new()?;

        let res = fetcher
            .fetch(&base.join("missing")?, FetchLimits::new(Duration::from_secs(5), 1024))
            .await;
        assert!(matches!(
            res,
            Err(FetchError::UnexpectedStatus {
                status: StatusCode::NOT_FOUND
            })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn slow_response_times_out() -> anyhow::Result<()> {
        let base = serve(router()).await?;
        let fetcher = HttpFetcher::new()?;

        let res = fetcher
            .fetch(
                &base.join("slow")?,
                FetchLimits::new(Duration::from_millis(200), 1024),
            )
            .await;
        assert!(matches!(res, Err(FetchError::Timeout { .. })));
        Ok(())
    }
}
