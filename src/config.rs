//! Pipeline configuration from environment variables

use crate::detector::BaselineWindow;
use std::env;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    InvalidValue { var: &'static str, reason: String },
}

/// Filters applied to tick-level trade rows before aggregation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeFilter {
    /// Keep only trades reported through a TRF (exchange 4 + non-empty trf_id)
    pub dark_pool_only: bool,

    /// Drop trades smaller than this many shares
    pub min_trade_size: u64,
}

impl Default for TradeFilter {
    fn default() -> Self {
        Self {
            dark_pool_only: false,
            min_trade_size: 1,
        }
    }
}

impl TradeFilter {
    /// True when neither rule can discard a row
    pub fn is_noop(&self) -> bool {
        !self.dark_pool_only && self.min_trade_size <= 1
    }
}

/// Credentials and location for an S3-compatible flat file bucket
#[derive(Clone, PartialEq)]
pub struct S3Settings {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
}

impl S3Settings {
    pub const DEFAULT_ENDPOINT: &'static str = "https://files.polygon.io";
    pub const DEFAULT_BUCKET: &'static str = "flatfiles";
    pub const DEFAULT_REGION: &'static str = "us-east-1";
}

impl std::fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Settings")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Configuration for the end-of-day pipeline
///
/// Loaded from environment variables with defaults matching the daily job.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Trading days in the rolling baseline window
    pub lookback_days: usize,

    /// Exclusive lower bound on z-score for an anomaly
    pub z_score_threshold: f64,

    pub filter: TradeFilter,

    /// Ingest tick-level trade files instead of daily bar files
    pub use_trades_files: bool,

    /// Root of a local flat file mirror
    pub flatfile_root: PathBuf,

    /// HTTP(S) base URL for flat files; takes precedence over `flatfile_root`
    pub flatfile_base_url: Option<String>,

    /// Bearer token for the HTTP source
    pub flatfile_token: Option<String>,

    /// S3 bucket source; takes precedence over both of the above
    pub flatfile_s3: Option<S3Settings>,

    /// Parallel batch folders during aggregation
    pub aggregate_workers: usize,

    /// Rows per aggregation batch
    pub aggregate_batch_rows: usize,

    /// Upper bound on any single stage for one date
    pub stage_timeout_secs: u64,

    /// Dates aggregated concurrently during backfill
    pub backfill_concurrency: usize,

    pub baseline_window: BaselineWindow,

    /// Delete anomalies that no longer qualify when a date is re-detected
    pub prune_stale_anomalies: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: "anomalies.db".to_string(),
            lookback_days: 5,
            z_score_threshold: 3.0,
            filter: TradeFilter::default(),
            use_trades_files: false,
            flatfile_root: PathBuf::from("./data/flatfiles"),
            flatfile_base_url: None,
            flatfile_token: None,
            flatfile_s3: None,
            aggregate_workers: default_workers(),
            aggregate_batch_rows: 50_000,
            stage_timeout_secs: 1_800,
            backfill_concurrency: 2,
            baseline_window: BaselineWindow::Trailing,
            prune_stale_anomalies: false,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `DARKFLOW_DB_PATH` (default: anomalies.db)
    /// - `LOOKBACK_DAYS` (default: 5)
    /// - `Z_SCORE_THRESHOLD` (default: 3.0)
    /// - `DARK_POOL_ONLY` (default: false)
    /// - `MIN_TRADE_SIZE` (default: 1)
    /// - `USE_TRADES_FILES` (default: false)
    /// - `FLATFILE_ROOT` (default: ./data/flatfiles)
    /// - `FLATFILE_BASE_URL`, `FLATFILE_TOKEN` (default: unset)
    /// - `POLYGON_S3_ACCESS_KEY`, `POLYGON_S3_SECRET_KEY` (default: unset;
    ///   both set selects the S3 source)
    /// - `FLATFILE_S3_ENDPOINT` (default: https://files.polygon.io)
    /// - `FLATFILE_S3_BUCKET` (default: flatfiles)
    /// - `FLATFILE_S3_REGION` (default: us-east-1)
    /// - `AGGREGATE_WORKERS` (default: available parallelism)
    /// - `AGGREGATE_BATCH_ROWS` (default: 50000)
    /// - `STAGE_TIMEOUT_SECS` (default: 1800)
    /// - `BACKFILL_CONCURRENCY` (default: 2)
    /// - `BASELINE_WINDOW` (default: trailing)
    /// - `PRUNE_STALE_ANOMALIES` (default: false)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let baseline_window = match lookup("BASELINE_WINDOW") {
            Some(raw) => BaselineWindow::from_str(&raw).ok_or_else(|| ConfigError::InvalidValue {
                var: "BASELINE_WINDOW",
                reason: format!("expected 'trailing' or 'prior', got '{}'", raw),
            })?,
            None => defaults.baseline_window,
        };

        let flatfile_s3 = match (non_empty(&lookup, "POLYGON_S3_ACCESS_KEY"), non_empty(&lookup, "POLYGON_S3_SECRET_KEY")) {
            (Some(access_key), Some(secret_key)) => Some(S3Settings {
                endpoint: non_empty(&lookup, "FLATFILE_S3_ENDPOINT")
                    .unwrap_or_else(|| S3Settings::DEFAULT_ENDPOINT.to_string()),
                bucket: non_empty(&lookup, "FLATFILE_S3_BUCKET").unwrap_or_else(|| S3Settings::DEFAULT_BUCKET.to_string()),
                region: non_empty(&lookup, "FLATFILE_S3_REGION").unwrap_or_else(|| S3Settings::DEFAULT_REGION.to_string()),
                access_key,
                secret_key,
            }),
            (None, None) => None,
            (Some(_), None) => {
                return Err(ConfigError::InvalidValue {
                    var: "POLYGON_S3_SECRET_KEY",
                    reason: "required when POLYGON_S3_ACCESS_KEY is set".to_string(),
                })
            }
            (None, Some(_)) => {
                return Err(ConfigError::InvalidValue {
                    var: "POLYGON_S3_ACCESS_KEY",
                    reason: "required when POLYGON_S3_SECRET_KEY is set".to_string(),
                })
            }
        };

        let config = Self {
            db_path: lookup("DARKFLOW_DB_PATH").unwrap_or(defaults.db_path),
            lookback_days: parse_var(&lookup, "LOOKBACK_DAYS", defaults.lookback_days)?,
            z_score_threshold: parse_var(&lookup, "Z_SCORE_THRESHOLD", defaults.z_score_threshold)?,
            filter: TradeFilter {
                dark_pool_only: parse_bool(&lookup, "DARK_POOL_ONLY", defaults.filter.dark_pool_only)?,
                min_trade_size: parse_var(&lookup, "MIN_TRADE_SIZE", defaults.filter.min_trade_size)?,
            },
            use_trades_files: parse_bool(&lookup, "USE_TRADES_FILES", defaults.use_trades_files)?,
            flatfile_root: lookup("FLATFILE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.flatfile_root),
            flatfile_base_url: non_empty(&lookup, "FLATFILE_BASE_URL"),
            flatfile_token: non_empty(&lookup, "FLATFILE_TOKEN"),
            flatfile_s3,
            aggregate_workers: parse_var(&lookup, "AGGREGATE_WORKERS", defaults.aggregate_workers)?,
            aggregate_batch_rows: parse_var(&lookup, "AGGREGATE_BATCH_ROWS", defaults.aggregate_batch_rows)?,
            stage_timeout_secs: parse_var(&lookup, "STAGE_TIMEOUT_SECS", defaults.stage_timeout_secs)?,
            backfill_concurrency: parse_var(&lookup, "BACKFILL_CONCURRENCY", defaults.backfill_concurrency)?,
            baseline_window,
            prune_stale_anomalies: parse_bool(&lookup, "PRUNE_STALE_ANOMALIES", defaults.prune_stale_anomalies)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lookback_days == 0 {
            return Err(ConfigError::InvalidValue {
                var: "LOOKBACK_DAYS",
                reason: "must be at least 1".to_string(),
            });
        }

        if !self.z_score_threshold.is_finite() {
            return Err(ConfigError::InvalidValue {
                var: "Z_SCORE_THRESHOLD",
                reason: "must be a finite number".to_string(),
            });
        }

        for (var, value) in [
            ("AGGREGATE_WORKERS", self.aggregate_workers),
            ("AGGREGATE_BATCH_ROWS", self.aggregate_batch_rows),
            ("BACKFILL_CONCURRENCY", self.backfill_concurrency),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    var,
                    reason: "must be at least 1".to_string(),
                });
            }
        }

        if self.stage_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                var: "STAGE_TIMEOUT_SECS",
                reason: "must be at least 1".to_string(),
            });
        }

        if let Some(url) = &self.flatfile_base_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::InvalidValue {
                    var: "FLATFILE_BASE_URL",
                    reason: "must start with http:// or https://".to_string(),
                });
            }
        }

        if let Some(s3) = &self.flatfile_s3 {
            if !s3.endpoint.starts_with("http://") && !s3.endpoint.starts_with("https://") {
                return Err(ConfigError::InvalidValue {
                    var: "FLATFILE_S3_ENDPOINT",
                    reason: "must start with http:// or https://".to_string(),
                });
            }
            if s3.bucket.contains('/') {
                return Err(ConfigError::InvalidValue {
                    var: "FLATFILE_S3_BUCKET",
                    reason: format!("'{}' is not a bucket name", s3.bucket),
                });
            }
        }

        Ok(())
    }

    /// Stored records per ticker read when building a baseline for one date:
    /// the date itself plus `lookback_days` earlier records, however far apart
    pub fn history_records(&self) -> usize {
        self.lookback_days + 1
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn non_empty<F>(lookup: &F, var: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var).filter(|s| !s.trim().is_empty())
}

fn parse_var<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
            var,
            reason: format!("'{}': {}", raw, e),
        }),
        None => Ok(default),
    }
}

fn parse_bool<F>(lookup: &F, var: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                var,
                reason: format!("expected a boolean, got '{}'", other),
            }),
        },
        None => Ok(default),
    }
}
