//! Flat file sources
//!
//! A source only locates and opens the compressed file for a date. Decoding
//! stays in `TradeAggregator`, so every source feeds the same streaming path.

use crate::error::{PipelineError, Result};
use crate::types::FileKind;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::time::Duration;

/// Compressed byte stream for one (date, kind)
pub type SourceStream = Box<dyn Read + Send>;

#[async_trait]
pub trait FlatFileSource: Send + Sync {
    /// Open the gzip file for a date; failures map to `SourceUnavailable`
    async fn open(&self, date: NaiveDate, kind: FileKind) -> Result<SourceStream>;

    /// Human-readable location for logging
    fn describe(&self) -> String;
}

/// Local mirror laid out like the provider bucket
pub struct LocalFlatFiles {
    root: PathBuf,
}

impl LocalFlatFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, date: NaiveDate, kind: FileKind) -> PathBuf {
        self.root.join(kind.object_key(date))
    }
}

#[async_trait]
impl FlatFileSource for LocalFlatFiles {
    async fn open(&self, date: NaiveDate, kind: FileKind) -> Result<SourceStream> {
        let path = self.path_for(date, kind);
        log::info!("📂 Opening {}", path.display());

        let file = File::open(&path).map_err(|e| PipelineError::SourceUnavailable {
            date,
            reason: format!("{}: {}", path.display(), e),
        })?;

        Ok(Box::new(file))
    }

    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }
}

/// HTTP(S) endpoint serving the provider layout under a base URL
///
/// The compressed body is held in memory once and decoded as a stream; the
/// decompressed file is never materialized.
pub struct HttpFlatFiles {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpFlatFiles {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PipelineError::Worker(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn url_for(&self, date: NaiveDate, kind: FileKind) -> String {
        format!("{}/{}", self.base_url, kind.object_key(date))
    }
}

#[async_trait]
impl FlatFileSource for HttpFlatFiles {
    async fn open(&self, date: NaiveDate, kind: FileKind) -> Result<SourceStream> {
        let url = self.url_for(date, kind);
        log::info!("🌐 Downloading {}", url);

        let unavailable = |reason: String| PipelineError::SourceUnavailable { date, reason };

        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| unavailable(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            if status == reqwest::StatusCode::FORBIDDEN || status == reqwest::StatusCode::UNAUTHORIZED {
                log::error!("❌ Access denied to {} (check FLATFILE_TOKEN and plan entitlements)", url);
            }
            return Err(unavailable(format!("HTTP {} for {}", status, url)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| unavailable(format!("body read failed: {}", e)))?;

        log::info!("   └─ {} bytes compressed", body.len());
        Ok(Box::new(Cursor::new(body)))
    }

    fn describe(&self) -> String {
        self.base_url.clone()
    }
}
