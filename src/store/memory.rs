//! In-memory RecordStore for tests and dry runs

use super::{RecordStore, StoreError, StoreResult};
use crate::detector::sort_by_z_desc;
use crate::types::{AnomalyEntry, BaselineEntry, DailyAggregate};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

type Key = (String, NaiveDate);

#[derive(Default)]
struct Tables {
    aggregates: BTreeMap<Key, DailyAggregate>,
    baselines: BTreeMap<Key, BaselineEntry>,
    anomalies: BTreeMap<Key, AnomalyEntry>,
}

/// BTreeMaps keyed by (ticker, date) behind a single mutex
///
/// Batch upserts hold the lock for the whole batch, which gives the same
/// all-or-nothing visibility as a SQLite transaction.
#[derive(Default)]
pub struct MemoryRecordStore {
    tables: Mutex<Tables>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|e| StoreError::Lock(e.to_string()))
    }

    pub fn aggregate_count(&self) -> usize {
        self.lock().map(|t| t.aggregates.len()).unwrap_or(0)
    }

    pub fn baseline_count(&self) -> usize {
        self.lock().map(|t| t.baselines.len()).unwrap_or(0)
    }

    pub fn anomaly_count(&self) -> usize {
        self.lock().map(|t| t.anomalies.len()).unwrap_or(0)
    }
}

fn key(ticker: &str, date: NaiveDate) -> Key {
    (ticker.to_string(), date)
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get_daily_aggregate(&self, ticker: &str, date: NaiveDate) -> StoreResult<Option<DailyAggregate>> {
        Ok(self.lock()?.aggregates.get(&key(ticker, date)).cloned())
    }

    async fn upsert_daily_aggregate(&self, aggregate: DailyAggregate) -> StoreResult<()> {
        let mut tables = self.lock()?;
        tables.aggregates.insert(key(&aggregate.ticker, aggregate.date), aggregate);
        Ok(())
    }

    async fn upsert_daily_aggregates(&self, aggregates: &[DailyAggregate]) -> StoreResult<()> {
        let mut tables = self.lock()?;
        for agg in aggregates {
            tables.aggregates.insert(key(&agg.ticker, agg.date), agg.clone());
        }
        Ok(())
    }

    async fn list_daily_aggregates(
        &self,
        ticker: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<Vec<DailyAggregate>> {
        if from > to {
            return Ok(Vec::new());
        }
        let tables = self.lock()?;
        Ok(tables
            .aggregates
            .range(key(ticker, from)..=key(ticker, to))
            .map(|(_, agg)| agg.clone())
            .collect())
    }

    async fn list_daily_aggregates_for_date(&self, date: NaiveDate) -> StoreResult<Vec<DailyAggregate>> {
        let tables = self.lock()?;
        Ok(tables
            .aggregates
            .values()
            .filter(|agg| agg.date == date)
            .cloned()
            .collect())
    }

    async fn list_daily_aggregates_between(&self, from: NaiveDate, to: NaiveDate) -> StoreResult<Vec<DailyAggregate>> {
        let tables = self.lock()?;
        Ok(tables
            .aggregates
            .values()
            .filter(|agg| agg.date >= from && agg.date <= to)
            .cloned()
            .collect())
    }

    async fn list_recent_daily_aggregates(&self, date: NaiveDate, per_ticker: usize) -> StoreResult<Vec<DailyAggregate>> {
        let tables = self.lock()?;
        let tickers: Vec<&String> = tables
            .aggregates
            .keys()
            .filter(|(_, d)| *d == date)
            .map(|(ticker, _)| ticker)
            .collect();

        let mut rows = Vec::new();
        for ticker in tickers {
            let start = rows.len();
            rows.extend(
                tables
                    .aggregates
                    .range(key(ticker, NaiveDate::MIN)..=key(ticker, date))
                    .rev()
                    .take(per_ticker)
                    .map(|(_, agg)| agg.clone()),
            );
            rows[start..].reverse();
        }
        Ok(rows)
    }

    async fn get_baseline(&self, ticker: &str, date: NaiveDate) -> StoreResult<Option<BaselineEntry>> {
        Ok(self.lock()?.baselines.get(&key(ticker, date)).cloned())
    }

    async fn upsert_baseline(&self, baseline: BaselineEntry) -> StoreResult<()> {
        let mut tables = self.lock()?;
        tables.baselines.insert(key(&baseline.ticker, baseline.date), baseline);
        Ok(())
    }

    async fn upsert_baselines(&self, baselines: &[BaselineEntry]) -> StoreResult<()> {
        let mut tables = self.lock()?;
        for b in baselines {
            tables.baselines.insert(key(&b.ticker, b.date), b.clone());
        }
        Ok(())
    }

    async fn list_baselines_for_date(&self, date: NaiveDate) -> StoreResult<Vec<BaselineEntry>> {
        let tables = self.lock()?;
        Ok(tables.baselines.values().filter(|b| b.date == date).cloned().collect())
    }

    async fn upsert_anomaly(&self, anomaly: AnomalyEntry) -> StoreResult<()> {
        let mut tables = self.lock()?;
        tables.anomalies.insert(key(&anomaly.ticker, anomaly.date), anomaly);
        Ok(())
    }

    async fn upsert_anomalies(&self, anomalies: &[AnomalyEntry]) -> StoreResult<()> {
        let mut tables = self.lock()?;
        for a in anomalies {
            tables.anomalies.insert(key(&a.ticker, a.date), a.clone());
        }
        Ok(())
    }

    async fn list_anomalies(&self, date: NaiveDate, min_z: f64) -> StoreResult<Vec<AnomalyEntry>> {
        let mut found: Vec<AnomalyEntry> = {
            let tables = self.lock()?;
            tables
                .anomalies
                .values()
                .filter(|a| a.date == date && a.z_score >= min_z)
                .cloned()
                .collect()
        };
        sort_by_z_desc(&mut found);
        Ok(found)
    }

    async fn delete_anomalies_except(&self, date: NaiveDate, keep_tickers: &[String]) -> StoreResult<usize> {
        let keep: BTreeSet<&str> = keep_tickers.iter().map(String::as_str).collect();
        let mut tables = self.lock()?;
        let before = tables.anomalies.len();
        tables
            .anomalies
            .retain(|(ticker, d), _| *d != date || keep.contains(ticker.as_str()));
        Ok(before - tables.anomalies.len())
    }

    async fn list_anomaly_dates(&self, min_z: f64, limit: usize) -> StoreResult<Vec<NaiveDate>> {
        let tables = self.lock()?;
        let dates: BTreeSet<NaiveDate> = tables
            .anomalies
            .values()
            .filter(|a| a.z_score >= min_z)
            .map(|a| a.date)
            .collect();
        Ok(dates.into_iter().rev().take(limit).collect())
    }
}
