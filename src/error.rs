//! Error taxonomy for the ingestion and anomaly pipeline
//!
//! Row-level problems never appear here: malformed rows are skipped and
//! counted in `AggregateStats`. Everything in `PipelineError` is reported per
//! date to whoever drives the pipeline.

use crate::config::ConfigError;
use crate::store::StoreError;
use chrono::NaiveDate;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network or object-storage failure while opening the source file
    #[error("source unavailable for {date}: {reason}")]
    SourceUnavailable { date: NaiveDate, reason: String },

    /// The file was reachable but could not be decompressed or decoded
    #[error("corrupt source for {date}: {reason}")]
    CorruptSource { date: NaiveDate, reason: String },

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{stage} timed out after {secs}s")]
    Timeout { stage: &'static str, secs: u64 },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("worker task failed: {0}")]
    Worker(String),
}

impl PipelineError {
    /// Whether the caller may retry the same date later
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::SourceUnavailable { .. }
            | PipelineError::Store(_)
            | PipelineError::Cancelled
            | PipelineError::Timeout { .. }
            | PipelineError::Worker(_) => true,
            PipelineError::CorruptSource { .. } | PipelineError::Config(_) => false,
        }
    }
}
