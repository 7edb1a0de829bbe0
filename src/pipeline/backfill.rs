//! Date-range backfill
//!
//! Aggregation is the expensive, date-independent stage, so it runs for
//! several dates at once behind a semaphore. Baselines for a date read the
//! aggregates of earlier dates, so baselines and detection run afterwards,
//! strictly in date order.

use super::engine::{DateReport, PipelineEngine};
use crate::aggregator_core::AggregateOutput;
use crate::error::{PipelineError, Result};
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Monday through Friday; exchange holidays are not modelled
pub fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Weekdays in `[start, end]`, oldest first
pub fn weekdays_between(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    let mut current = start;
    while current <= end {
        if is_weekday(current) {
            dates.push(current);
        }
        current += Duration::days(1);
    }
    dates
}

#[derive(Debug, Clone, Default)]
pub struct BackfillSummary {
    pub reports: Vec<DateReport>,
}

impl BackfillSummary {
    pub fn succeeded(&self) -> usize {
        self.reports.iter().filter(|r| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.reports.len() - self.succeeded()
    }

    pub fn total_anomalies(&self) -> usize {
        self.reports.iter().map(|r| r.anomalies).sum()
    }
}

/// Process every weekday in `[start, end]`
///
/// A failed date is recorded in its report and does not stop the range.
pub async fn backfill(engine: Arc<PipelineEngine>, start: NaiveDate, end: NaiveDate) -> BackfillSummary {
    let dates = weekdays_between(start, end);
    if dates.is_empty() {
        log::warn!("⚠️  No weekdays between {} and {}", start, end);
        return BackfillSummary::default();
    }

    let concurrency = engine.config().backfill_concurrency.max(1);
    log::info!(
        "🚀 Backfilling {} dates ({} → {}), {} concurrent aggregations",
        dates.len(),
        start,
        end,
        concurrency
    );

    let semaphore = Arc::new(Semaphore::new(concurrency));
    let handles: Vec<(NaiveDate, JoinHandle<Result<AggregateOutput>>)> = dates
        .iter()
        .map(|&date| {
            let engine = Arc::clone(&engine);
            let semaphore = Arc::clone(&semaphore);
            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| PipelineError::Worker(e.to_string()))?;
                engine.aggregate(date).await
            });
            (date, handle)
        })
        .collect();

    let mut summary = BackfillSummary::default();
    for (date, handle) in handles {
        let aggregated = match handle.await {
            Ok(result) => result,
            Err(e) => Err(PipelineError::Worker(e.to_string())),
        };

        let report = match aggregated {
            Ok(output) => {
                let finished = engine
                    .finish_date(date, &output.stats, output.aggregates.len())
                    .await;
                finished.unwrap_or_else(|e| failed(date, e))
            }
            Err(e) => failed(date, e),
        };
        summary.reports.push(report);
    }

    log::info!(
        "🏁 Backfill complete: {} ok, {} failed, {} anomalies",
        summary.succeeded(),
        summary.failed(),
        summary.total_anomalies()
    );
    summary
}

fn failed(date: NaiveDate, err: PipelineError) -> DateReport {
    log::error!("❌ {} failed: {} (retryable: {})", date, err, err.is_retryable());
    DateReport::failed(date, &err)
}
