//! Snapshot persistence, page capture and HTTP fetch utilities.

mod snapshots;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use reqwest::header::{ACCEPT_LANGUAGE, USER_AGENT};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, Instrument};

pub use snapshots::{SnapshotStore, StoreError};

pub const CRATE_NAME: &str = "bostad-storage";

/// Keeps the text of a page that failed extraction so a changed layout can be
/// inspected later. One file per source per day; a later failure the same day
/// replaces it.
#[derive(Debug, Clone)]
pub struct PageCapture {
    dir: PathBuf,
}

impl PageCapture {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, date: NaiveDate, source_id: &str) -> PathBuf {
        self.dir.join(format!("{}-{source_id}.txt", date.format("%Y-%m-%d")))
    }

    /// Write `reason` and the page text to `<dir>/<date>-<source>.txt`.
    pub async fn keep_failed_page(
        &self,
        date: NaiveDate,
        source_id: &str,
        reason: &str,
        page_text: &str,
    ) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating capture directory {}", self.dir.display()))?;
        let path = self.path_for(date, source_id);
        fs::write(&path, format!("{reason}\n\n{page_text}\n"))
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

/// Per-request options for fetching a page.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Sent as `Accept-Language`.
    pub locale: Option<String>,
    pub user_agent: Option<String>,
    /// Upper bound for the request plus the settle delay.
    pub timeout: Duration,
    /// Fixed wait after the body arrives, before the text is handed on.
    pub settle_delay: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            locale: None,
            user_agent: None,
            timeout: Duration::from_secs(60),
            settle_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub connect_timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("timed out after {after:?} fetching {url}")]
    Timeout { url: String, after: Duration },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.connect_timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// Fetch `url` and wait the settle delay, all bounded by `options.timeout`.
    ///
    /// No retries: a failed fetch fails the current run only.
    pub async fn fetch_page(
        &self,
        url: &str,
        options: &FetchOptions,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url, timeout_ms = options.timeout.as_millis() as u64);
        let timed_out = || FetchError::Timeout {
            url: url.to_string(),
            after: options.timeout,
        };

        match tokio::time::timeout(options.timeout, self.fetch_settled(url, options))
            .instrument(span)
            .await
        {
            Ok(Err(FetchError::Request(err))) if err.is_timeout() => Err(timed_out()),
            Ok(result) => result,
            Err(_elapsed) => Err(timed_out()),
        }
    }

    async fn fetch_settled(
        &self,
        url: &str,
        options: &FetchOptions,
    ) -> Result<FetchedResponse, FetchError> {
        let mut request = self.client.get(url);
        if let Some(user_agent) = &options.user_agent {
            request = request.header(USER_AGENT, user_agent.as_str());
        }
        if let Some(locale) = &options.locale {
            request = request.header(ACCEPT_LANGUAGE, locale.as_str());
        }

        let resp = request.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?.to_vec();
        info!(status = status.as_u16(), bytes = body.len(), "page loaded");

        if !options.settle_delay.is_zero() {
            tokio::time::sleep(options.settle_delay).await;
        }

        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}
