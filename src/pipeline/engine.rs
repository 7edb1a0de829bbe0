//! Pipeline Engine - per-date orchestration of the three stages
//!
//! ## Architecture
//!
//! ```text
//! FlatFileSource::open(date)
//!     ↓ (spawn_blocking, stage timeout, cancel flag)
//! TradeAggregator::aggregate()
//!     ↓ RecordStore::upsert_daily_aggregates   (one transaction)
//! BaselineBuilder::build_for_date()
//!     ↓ RecordStore::upsert_baselines          (one transaction)
//! AnomalyScorer::score()
//!     ↓ RecordStore::upsert_anomalies          (one transaction)
//! DateReport
//! ```
//!
//! Every stage computes its full result before writing anything, so a
//! failure, timeout or cancellation leaves the store exactly as it was for
//! that stage. Re-running a date overwrites by `(ticker, date)`.

use crate::aggregator_core::{
    AggregateOutput, AggregateStats, FlatFileSource, HttpFlatFiles, LocalFlatFiles, S3FlatFiles, TradeAggregator,
};
use crate::cancel::CancelFlag;
use crate::config::PipelineConfig;
use crate::detector::{AnomalyScorer, BaselineBuilder};
use crate::error::{PipelineError, Result};
use crate::store::{RecordStore, SqliteRecordStore};
use crate::types::{AnomalyEntry, BaselineEntry, FileKind};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

/// Outcome of processing one date
///
/// A failed date carries zero counts and the error message.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DateReport {
    pub date: Option<NaiveDate>,
    pub aggregates: usize,
    pub baselines: usize,
    pub insufficient_history: usize,
    pub anomalies: usize,
    pub pruned: usize,
    pub rows_read: u64,
    pub rows_malformed: u64,
    pub error: Option<String>,
}

impl DateReport {
    fn new(date: NaiveDate) -> Self {
        Self {
            date: Some(date),
            ..Self::default()
        }
    }

    pub fn failed(date: NaiveDate, err: &PipelineError) -> Self {
        Self {
            error: Some(err.to_string()),
            ..Self::new(date)
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of the baseline stage for one date
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BaselineOutcome {
    pub entries: Vec<BaselineEntry>,
    pub insufficient_history: usize,
}

/// Result of the detection stage for one date
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionOutcome {
    pub anomalies: Vec<AnomalyEntry>,
    pub pruned: usize,
}

pub struct PipelineEngine {
    store: Arc<dyn RecordStore>,
    source: Arc<dyn FlatFileSource>,
    config: PipelineConfig,
    aggregator: Arc<TradeAggregator>,
    baselines: BaselineBuilder,
    scorer: AnomalyScorer,

    /// Root flag; each aggregation run gets a child of it
    cancel: CancelFlag,
}

impl PipelineEngine {
    pub fn new(store: Arc<dyn RecordStore>, source: Arc<dyn FlatFileSource>, config: PipelineConfig) -> Self {
        let aggregator = TradeAggregator::new(config.aggregate_workers, config.aggregate_batch_rows);
        let baselines = BaselineBuilder::new(config.lookback_days, config.baseline_window);
        let scorer = AnomalyScorer::new(config.z_score_threshold);

        Self {
            store,
            source,
            config,
            aggregator: Arc::new(aggregator),
            baselines,
            scorer,
            cancel: CancelFlag::new(),
        }
    }

    /// Wire the SQLite store and the configured flat file source
    ///
    /// S3 credentials select the bucket source, then `FLATFILE_BASE_URL`
    /// selects the HTTP source; otherwise files are read from the local
    /// mirror under `FLATFILE_ROOT`.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::open(&config.db_path)?);
        let source: Arc<dyn FlatFileSource> = match (&config.flatfile_s3, &config.flatfile_base_url) {
            (Some(s3), _) => Arc::new(S3FlatFiles::new(s3)?),
            (None, Some(url)) => Arc::new(HttpFlatFiles::new(url.clone(), config.flatfile_token.clone())?),
            (None, None) => Arc::new(LocalFlatFiles::new(config.flatfile_root.clone())),
        };

        log::info!("🔧 Flat file source: {}", source.describe());
        Ok(Self::new(store, source, config))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn RecordStore> {
        Arc::clone(&self.store)
    }

    /// Handle that stops all in-flight and future work of this engine
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn file_kind(&self) -> FileKind {
        if self.config.use_trades_files {
            FileKind::Trades
        } else {
            FileKind::DayAggs
        }
    }

    /// Stage 1: aggregate the date's flat file and persist the bars
    ///
    /// An empty file writes nothing and is not an error.
    pub async fn aggregate(&self, date: NaiveDate) -> Result<AggregateOutput> {
        let output = self.compute_aggregates(date).await?;
        if output.is_empty() {
            return Ok(output);
        }

        let rows = output.clone().into_sorted();
        self.with_timeout("persist aggregates", self.store.upsert_daily_aggregates(&rows))
            .await??;

        log::info!("💾 {} daily aggregates stored for {}", rows.len(), date);
        Ok(output)
    }

    /// Decode and fold the date's file without touching the store
    pub async fn compute_aggregates(&self, date: NaiveDate) -> Result<AggregateOutput> {
        self.ensure_not_cancelled()?;

        let kind = self.file_kind();
        let run = self.cancel.child();
        let started = Instant::now();

        let work = self.open_and_fold(date, kind, run.clone());

        let secs = self.config.stage_timeout_secs;
        let output = match tokio::time::timeout(std::time::Duration::from_secs(secs), work).await {
            Ok(result) => result?,
            Err(_) => {
                run.cancel();
                log::warn!("⏱️  Aggregation for {} exceeded {}s, cancelled", date, secs);
                return Err(PipelineError::Timeout {
                    stage: "aggregate",
                    secs,
                });
            }
        };

        log::debug!(
            "⚡ Aggregated {} in {:.2}s ({} tickers)",
            date,
            started.elapsed().as_secs_f64(),
            output.stats.tickers
        );
        Ok(output)
    }

    async fn open_and_fold(&self, date: NaiveDate, kind: FileKind, run: CancelFlag) -> Result<AggregateOutput> {
        let stream = self.source.open(date, kind).await?;
        let aggregator = Arc::clone(&self.aggregator);
        let filter = self.config.filter;

        tokio::task::spawn_blocking(move || aggregator.aggregate(date, kind, stream, &filter, &run))
            .await
            .map_err(|e| PipelineError::Worker(e.to_string()))?
    }

    /// Stage 2: rebuild baselines for `date` from stored history
    ///
    /// Only the entry for `date` is written per ticker. Tickers short of
    /// `lookback_days` records are counted and skipped.
    pub async fn build_baselines(&self, date: NaiveDate) -> Result<BaselineOutcome> {
        self.ensure_not_cancelled()?;

        let history = self
            .with_timeout(
                "load history",
                self.store.list_recent_daily_aggregates(date, self.config.history_records()),
            )
            .await??;

        let (entries, insufficient_history) = self.baselines.build_for_date(date, history);

        if !entries.is_empty() {
            self.with_timeout("persist baselines", self.store.upsert_baselines(&entries))
                .await??;
        }

        log::info!(
            "📐 {} baselines for {} ({} tickers with insufficient history)",
            entries.len(),
            date,
            insufficient_history
        );

        Ok(BaselineOutcome {
            entries,
            insufficient_history,
        })
    }

    /// Stage 3: score the date's aggregates against its baselines
    pub async fn detect_anomalies(&self, date: NaiveDate) -> Result<DetectionOutcome> {
        self.ensure_not_cancelled()?;

        let aggregates = self
            .with_timeout("load aggregates", self.store.list_daily_aggregates_for_date(date))
            .await??;
        let baselines: HashMap<String, BaselineEntry> = self
            .with_timeout("load baselines", self.store.list_baselines_for_date(date))
            .await??
            .into_iter()
            .map(|b| (b.ticker.clone(), b))
            .collect();

        let anomalies = self.scorer.score(date, &aggregates, &baselines);

        if !anomalies.is_empty() {
            self.with_timeout("persist anomalies", self.store.upsert_anomalies(&anomalies))
                .await??;
        }

        let mut pruned = 0;
        if self.config.prune_stale_anomalies {
            let keep: Vec<String> = anomalies.iter().map(|a| a.ticker.clone()).collect();
            pruned = self
                .with_timeout("prune anomalies", self.store.delete_anomalies_except(date, &keep))
                .await??;
            if pruned > 0 {
                log::info!("🧹 Pruned {} stale anomalies for {}", pruned, date);
            }
        }

        log::info!(
            "🚨 {} anomalies for {} (z > {:.1}, {} scored)",
            anomalies.len(),
            date,
            self.scorer.threshold(),
            baselines.len()
        );

        Ok(DetectionOutcome { anomalies, pruned })
    }

    /// Run all three stages for one date
    ///
    /// Never returns an error: a failure is folded into the report.
    pub async fn run_date(&self, date: NaiveDate) -> DateReport {
        match self.try_run_date(date).await {
            Ok(report) => report,
            Err(e) => {
                log::error!("❌ {} failed: {} (retryable: {})", date, e, e.is_retryable());
                DateReport::failed(date, &e)
            }
        }
    }

    pub async fn try_run_date(&self, date: NaiveDate) -> Result<DateReport> {
        log::info!("📅 Processing {}", date);
        let output = self.aggregate(date).await?;
        self.finish_date(date, &output.stats, output.aggregates.len()).await
    }

    /// Baselines and detection for a date whose aggregation already ran
    pub(crate) async fn finish_date(
        &self,
        date: NaiveDate,
        stats: &AggregateStats,
        aggregates: usize,
    ) -> Result<DateReport> {
        let mut report = DateReport::new(date);
        report.rows_read = stats.rows_read;
        report.rows_malformed = stats.rows_malformed;
        report.aggregates = aggregates;

        if aggregates == 0 {
            log::info!("📭 No aggregates for {}, skipping baselines and detection", date);
            return Ok(report);
        }

        let baselines = self.build_baselines(date).await?;
        report.baselines = baselines.entries.len();
        report.insufficient_history = baselines.insufficient_history;

        let detection = self.detect_anomalies(date).await?;
        report.anomalies = detection.anomalies.len();
        report.pruned = detection.pruned;

        log::info!(
            "✅ {} done: {} aggregates, {} baselines, {} anomalies",
            date,
            report.aggregates,
            report.baselines,
            report.anomalies
        );
        Ok(report)
    }

    pub async fn list_anomalies(&self, date: NaiveDate, min_z: f64) -> Result<Vec<AnomalyEntry>> {
        Ok(self.store.list_anomalies(date, min_z).await?)
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    async fn with_timeout<F: Future>(&self, stage: &'static str, fut: F) -> Result<F::Output> {
        let secs = self.config.stage_timeout_secs;
        tokio::time::timeout(std::time::Duration::from_secs(secs), fut)
            .await
            .map_err(|_| PipelineError::Timeout { stage, secs })
    }
}
