//! Darkflow - end-of-day equity trade aggregation and anomaly detection
//!
//! Compressed daily flat files are reduced to per-ticker daily bars, a
//! rolling baseline of transaction counts is maintained per ticker, and days
//! whose count sits far above the baseline are recorded as anomalies.

pub mod aggregator_core;
pub mod cancel;
pub mod config;
pub mod detector;
pub mod error;
pub mod pipeline;
pub mod report;
pub mod store;
pub mod types;

pub use config::{PipelineConfig, S3Settings, TradeFilter};
pub use error::{PipelineError, Result};
pub use pipeline::{DateReport, PipelineEngine};
pub use types::{AnomalyEntry, BaselineEntry, DailyAggregate, FileKind};
