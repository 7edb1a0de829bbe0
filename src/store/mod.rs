//! Persistence boundary for aggregates, baselines and anomalies
//!
//! Tables (see `sql/schema.sql`):
//! - `daily_aggregates` - UPSERT on (ticker, date)
//! - `baselines` - UPSERT on (ticker, date)
//! - `anomalies` - UPSERT on (ticker, date)
//!
//! Batch upserts are atomic: either every row lands or none do.

pub mod memory;
pub mod sqlite;

use crate::types::{AnomalyEntry, BaselineEntry, DailyAggregate};
use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

pub use memory::MemoryRecordStore;
pub use sqlite::SqliteRecordStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store lock poisoned: {0}")]
    Lock(String),

    /// A stored value does not fit the record type (e.g. a negative count)
    #[error("conversion error: {0}")]
    Conversion(String),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_daily_aggregate(&self, ticker: &str, date: NaiveDate) -> StoreResult<Option<DailyAggregate>>;

    async fn upsert_daily_aggregate(&self, aggregate: DailyAggregate) -> StoreResult<()>;

    /// Upsert every aggregate in one transaction
    async fn upsert_daily_aggregates(&self, aggregates: &[DailyAggregate]) -> StoreResult<()>;

    /// One ticker's aggregates in `[from, to]`, oldest first
    async fn list_daily_aggregates(
        &self,
        ticker: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<Vec<DailyAggregate>>;

    async fn list_daily_aggregates_for_date(&self, date: NaiveDate) -> StoreResult<Vec<DailyAggregate>>;

    /// Every aggregate in `[from, to]`, ordered by ticker then date
    async fn list_daily_aggregates_between(&self, from: NaiveDate, to: NaiveDate) -> StoreResult<Vec<DailyAggregate>>;

    /// For each ticker with an aggregate on `date`, its latest `per_ticker`
    /// aggregates on or before `date`, ordered by ticker then date
    ///
    /// Counts records rather than calendar days, so a ticker that trades
    /// once a week still gets its full history.
    async fn list_recent_daily_aggregates(&self, date: NaiveDate, per_ticker: usize) -> StoreResult<Vec<DailyAggregate>>;

    async fn get_baseline(&self, ticker: &str, date: NaiveDate) -> StoreResult<Option<BaselineEntry>>;

    async fn upsert_baseline(&self, baseline: BaselineEntry) -> StoreResult<()>;

    async fn upsert_baselines(&self, baselines: &[BaselineEntry]) -> StoreResult<()>;

    async fn list_baselines_for_date(&self, date: NaiveDate) -> StoreResult<Vec<BaselineEntry>>;

    async fn upsert_anomaly(&self, anomaly: AnomalyEntry) -> StoreResult<()>;

    async fn upsert_anomalies(&self, anomalies: &[AnomalyEntry]) -> StoreResult<()>;

    /// Anomalies on `date` with `z_score >= min_z`, highest z first
    async fn list_anomalies(&self, date: NaiveDate, min_z: f64) -> StoreResult<Vec<AnomalyEntry>>;

    /// Remove anomalies on `date` whose ticker is not in `keep_tickers`
    ///
    /// Returns the number of rows removed.
    async fn delete_anomalies_except(&self, date: NaiveDate, keep_tickers: &[String]) -> StoreResult<usize>;

    /// Distinct dates holding at least one anomaly with `z_score >= min_z`, newest first
    async fn list_anomaly_dates(&self, min_z: f64, limit: usize) -> StoreResult<Vec<NaiveDate>>;
}
