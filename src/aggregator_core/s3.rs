//! S3-compatible flat file source (the provider's bucket, or any mirror)

use super::source::{FlatFileSource, SourceStream};
use crate::config::S3Settings;
use crate::error::{PipelineError, Result};
use crate::types::FileKind;
use async_trait::async_trait;
use chrono::NaiveDate;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use std::io::Cursor;
use std::sync::Arc;

/// Reads `<bucket>/<object key>` through any `ObjectStore`
///
/// Built from `S3Settings` for the real bucket; tests hand in an in-memory
/// store with the same key layout.
pub struct S3FlatFiles {
    store: Arc<dyn ObjectStore>,
    endpoint: String,
    bucket: String,
}

impl S3FlatFiles {
    pub fn new(settings: &S3Settings) -> Result<Self> {
        let endpoint = settings.endpoint.trim_end_matches('/').to_string();
        let store = AmazonS3Builder::new()
            .with_endpoint(endpoint.clone())
            .with_bucket_name(settings.bucket.clone())
            .with_region(settings.region.clone())
            .with_access_key_id(settings.access_key.clone())
            .with_secret_access_key(settings.secret_key.clone())
            .with_allow_http(endpoint.starts_with("http://"))
            .build()
            .map_err(|e| PipelineError::Worker(format!("failed to build S3 client: {}", e)))?;

        Ok(Self {
            store: Arc::new(store),
            endpoint,
            bucket: settings.bucket.clone(),
        })
    }

    pub fn with_store(store: Arc<dyn ObjectStore>, endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
        }
    }

    pub fn object_path(&self, date: NaiveDate, kind: FileKind) -> ObjectPath {
        ObjectPath::from(kind.object_key(date))
    }

    /// Path-style URL of the object, for logs and error messages
    pub fn object_url(&self, date: NaiveDate, kind: FileKind) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, kind.object_key(date))
    }
}

#[async_trait]
impl FlatFileSource for S3FlatFiles {
    async fn open(&self, date: NaiveDate, kind: FileKind) -> Result<SourceStream> {
        let url = self.object_url(date, kind);
        log::info!("🪣 Fetching {}", url);

        let unavailable = |reason: String| PipelineError::SourceUnavailable { date, reason };

        let object = match self.store.get(&self.object_path(date, kind)).await {
            Ok(object) => object,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(unavailable(format!("no such key: {}", url)));
            }
            Err(e) => {
                log::error!(
                    "❌ S3 request for {} failed (check POLYGON_S3_ACCESS_KEY/POLYGON_S3_SECRET_KEY and plan entitlements)",
                    url
                );
                return Err(unavailable(format!("S3 request failed for {}: {}", url, e)));
            }
        };

        let body = object
            .bytes()
            .await
            .map_err(|e| unavailable(format!("body read failed: {}", e)))?;

        log::info!("   └─ {} bytes compressed", body.len());
        Ok(Box::new(Cursor::new(body)))
    }

    fn describe(&self) -> String {
        format!("s3:{}/{}", self.endpoint, self.bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use object_store::PutPayload;
    use std::io::Read;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    fn settings() -> S3Settings {
        S3Settings {
            endpoint: "https://files.polygon.io/".to_string(),
            bucket: "flatfiles".to_string(),
            region: "us-east-1".to_string(),
            access_key: "AKIDEXAMPLE".to_string(),
            secret_key: "wJalrXUtnFEMI".to_string(),
        }
    }

    #[test]
    fn test_object_key_and_url_layout() {
        let source = S3FlatFiles::new(&settings()).unwrap();

        assert_eq!(
            source.object_path(date(), FileKind::Trades).as_ref(),
            "us_stocks_sip/trades_v1/2024/03/2024-03-15.csv.gz"
        );
        assert_eq!(
            source.object_url(date(), FileKind::DayAggs),
            "https://files.polygon.io/flatfiles/us_stocks_sip/day_aggs_v1/2024/03/2024-03-15.csv.gz"
        );
        assert_eq!(source.describe(), "s3:https://files.polygon.io/flatfiles");
    }

    #[tokio::test]
    async fn test_reads_object_under_provider_key() {
        let store = Arc::new(InMemory::new());
        let key = ObjectPath::from(FileKind::DayAggs.object_key(date()));
        store.put(&key, PutPayload::from(b"payload".to_vec())).await.unwrap();
        let source = S3FlatFiles::with_store(store, "https://files.polygon.io", "flatfiles");

        let mut stream = source.open(date(), FileKind::DayAggs).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"payload");
    }

    #[tokio::test]
    async fn test_missing_key_is_unavailable() {
        let source = S3FlatFiles::with_store(Arc::new(InMemory::new()), "https://files.polygon.io", "flatfiles");

        let err = match source.open(date(), FileKind::Trades).await {
            Ok(_) => panic!("expected missing key error"),
            Err(e) => e,
        };
        match &err {
            PipelineError::SourceUnavailable { reason, .. } => {
                assert!(reason.contains("no such key"));
                assert!(reason.contains("trades_v1/2024/03/2024-03-15.csv.gz"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.is_retryable());
    }
}
