//! SQLite RecordStore over rusqlite
//!
//! Schema comes from `sql/schema.sql`, embedded at compile time and applied
//! on every open (all statements use `IF NOT EXISTS`). Dates are stored as
//! `YYYY-MM-DD` text so lexical order is chronological order.

use super::{RecordStore, StoreError, StoreResult};
use crate::types::{AnomalyEntry, BaselineEntry, DailyAggregate};
use async_trait::async_trait;
use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");

const UPSERT_AGGREGATE_SQL: &str = r#"
    INSERT INTO daily_aggregates (
        ticker, date, open, high, low, close, volume, transactions
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
    ON CONFLICT(ticker, date) DO UPDATE SET
        open = excluded.open,
        high = excluded.high,
        low = excluded.low,
        close = excluded.close,
        volume = excluded.volume,
        transactions = excluded.transactions
"#;

const UPSERT_BASELINE_SQL: &str = r#"
    INSERT INTO baselines (
        ticker, date, avg_trades, std_trades, prev_close, price_diff_pct
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
    ON CONFLICT(ticker, date) DO UPDATE SET
        avg_trades = excluded.avg_trades,
        std_trades = excluded.std_trades,
        prev_close = excluded.prev_close,
        price_diff_pct = excluded.price_diff_pct
"#;

const UPSERT_ANOMALY_SQL: &str = r#"
    INSERT INTO anomalies (
        ticker, date, trades, avg_trades, std_trades, z_score,
        close_price, price_diff_pct, volume
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
    ON CONFLICT(ticker, date) DO UPDATE SET
        trades = excluded.trades,
        avg_trades = excluded.avg_trades,
        std_trades = excluded.std_trades,
        z_score = excluded.z_score,
        close_price = excluded.close_price,
        price_diff_pct = excluded.price_diff_pct,
        volume = excluded.volume
"#;

const AGGREGATE_COLUMNS: &str = "ticker, date, open, high, low, close, volume, transactions";
const BASELINE_COLUMNS: &str = "ticker, date, avg_trades, std_trades, prev_close, price_diff_pct";
const ANOMALY_COLUMNS: &str =
    "ticker, date, trades, avg_trades, std_trades, z_score, close_price, price_diff_pct, volume";

pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    /// Open (or create) the database file and apply the schema
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        log::info!("📊 Opened SQLite store at {} (WAL)", path.display());

        Self::with_connection(conn)
    }

    /// Private in-memory database, mainly for tests
    pub fn in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        log::debug!("✅ Schema applied");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| StoreError::Lock(e.to_string()))
    }

    fn write_aggregate(tx: &Transaction<'_>, agg: &DailyAggregate) -> StoreResult<()> {
        tx.prepare_cached(UPSERT_AGGREGATE_SQL)?.execute(params![
            agg.ticker,
            agg.date,
            agg.open,
            agg.high,
            agg.low,
            agg.close,
            to_i64(agg.volume, "volume")?,
            to_i64(agg.transactions, "transactions")?,
        ])?;
        Ok(())
    }

    fn write_baseline(tx: &Transaction<'_>, b: &BaselineEntry) -> StoreResult<()> {
        tx.prepare_cached(UPSERT_BASELINE_SQL)?.execute(params![
            b.ticker,
            b.date,
            b.avg_trades,
            b.std_trades,
            b.prev_close,
            b.price_diff_pct,
        ])?;
        Ok(())
    }

    fn write_anomaly(tx: &Transaction<'_>, a: &AnomalyEntry) -> StoreResult<()> {
        tx.prepare_cached(UPSERT_ANOMALY_SQL)?.execute(params![
            a.ticker,
            a.date,
            to_i64(a.trades, "trades")?,
            a.avg_trades,
            a.std_trades,
            a.z_score,
            a.close_price,
            a.price_diff_pct,
            to_i64(a.volume, "volume")?,
        ])?;
        Ok(())
    }

    /// Run `write` for every item inside one transaction
    fn write_batch<T>(
        &self,
        items: &[T],
        write: fn(&Transaction<'_>, &T) -> StoreResult<()>,
    ) -> StoreResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for item in items {
            write(&tx, item)?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn to_i64(value: u64, field: &str) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::Conversion(format!("{} {} exceeds i64", field, value)))
}

fn get_u64(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(idx)?;
    u64::try_from(raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

fn aggregate_from_row(row: &Row<'_>) -> rusqlite::Result<DailyAggregate> {
    Ok(DailyAggregate {
        ticker: row.get(0)?,
        date: row.get(1)?,
        open: row.get(2)?,
        high: row.get(3)?,
        low: row.get(4)?,
        close: row.get(5)?,
        volume: get_u64(row, 6)?,
        transactions: get_u64(row, 7)?,
    })
}

fn baseline_from_row(row: &Row<'_>) -> rusqlite::Result<BaselineEntry> {
    Ok(BaselineEntry {
        ticker: row.get(0)?,
        date: row.get(1)?,
        avg_trades: row.get(2)?,
        std_trades: row.get(3)?,
        prev_close: row.get(4)?,
        price_diff_pct: row.get(5)?,
    })
}

fn anomaly_from_row(row: &Row<'_>) -> rusqlite::Result<AnomalyEntry> {
    Ok(AnomalyEntry {
        ticker: row.get(0)?,
        date: row.get(1)?,
        trades: get_u64(row, 2)?,
        avg_trades: row.get(3)?,
        std_trades: row.get(4)?,
        z_score: row.get(5)?,
        close_price: row.get(6)?,
        price_diff_pct: row.get(7)?,
        volume: get_u64(row, 8)?,
    })
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn get_daily_aggregate(&self, ticker: &str, date: NaiveDate) -> StoreResult<Option<DailyAggregate>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM daily_aggregates WHERE ticker = ?1 AND date = ?2",
            AGGREGATE_COLUMNS
        );
        let found = conn
            .query_row(&sql, params![ticker, date], aggregate_from_row)
            .optional()?;
        Ok(found)
    }

    async fn upsert_daily_aggregate(&self, aggregate: DailyAggregate) -> StoreResult<()> {
        self.write_batch(std::slice::from_ref(&aggregate), Self::write_aggregate)
    }

    async fn upsert_daily_aggregates(&self, aggregates: &[DailyAggregate]) -> StoreResult<()> {
        self.write_batch(aggregates, Self::write_aggregate)
    }

    async fn list_daily_aggregates(
        &self,
        ticker: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<Vec<DailyAggregate>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM daily_aggregates
             WHERE ticker = ?1 AND date >= ?2 AND date <= ?3
             ORDER BY date",
            AGGREGATE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![ticker, from, to], aggregate_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn list_daily_aggregates_for_date(&self, date: NaiveDate) -> StoreResult<Vec<DailyAggregate>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM daily_aggregates WHERE date = ?1 ORDER BY ticker",
            AGGREGATE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![date], aggregate_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn list_daily_aggregates_between(&self, from: NaiveDate, to: NaiveDate) -> StoreResult<Vec<DailyAggregate>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM daily_aggregates
             WHERE date >= ?1 AND date <= ?2
             ORDER BY ticker, date",
            AGGREGATE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![from, to], aggregate_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn list_recent_daily_aggregates(&self, date: NaiveDate, per_ticker: usize) -> StoreResult<Vec<DailyAggregate>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {cols} FROM (
                 SELECT {cols}, ROW_NUMBER() OVER (PARTITION BY ticker ORDER BY date DESC) AS rn
                 FROM daily_aggregates
                 WHERE date <= ?1
                   AND ticker IN (SELECT ticker FROM daily_aggregates WHERE date = ?1)
             )
             WHERE rn <= ?2
             ORDER BY ticker, date",
            cols = AGGREGATE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![date, to_i64(per_ticker as u64, "per_ticker")?], aggregate_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn get_baseline(&self, ticker: &str, date: NaiveDate) -> StoreResult<Option<BaselineEntry>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM baselines WHERE ticker = ?1 AND date = ?2",
            BASELINE_COLUMNS
        );
        let found = conn
            .query_row(&sql, params![ticker, date], baseline_from_row)
            .optional()?;
        Ok(found)
    }

    async fn upsert_baseline(&self, baseline: BaselineEntry) -> StoreResult<()> {
        self.write_batch(std::slice::from_ref(&baseline), Self::write_baseline)
    }

    async fn upsert_baselines(&self, baselines: &[BaselineEntry]) -> StoreResult<()> {
        self.write_batch(baselines, Self::write_baseline)
    }

    async fn list_baselines_for_date(&self, date: NaiveDate) -> StoreResult<Vec<BaselineEntry>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM baselines WHERE date = ?1 ORDER BY ticker",
            BASELINE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![date], baseline_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn upsert_anomaly(&self, anomaly: AnomalyEntry) -> StoreResult<()> {
        self.write_batch(std::slice::from_ref(&anomaly), Self::write_anomaly)
    }

    async fn upsert_anomalies(&self, anomalies: &[AnomalyEntry]) -> StoreResult<()> {
        self.write_batch(anomalies, Self::write_anomaly)
    }

    async fn list_anomalies(&self, date: NaiveDate, min_z: f64) -> StoreResult<Vec<AnomalyEntry>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM anomalies
             WHERE date = ?1 AND z_score >= ?2
             ORDER BY z_score DESC, ticker ASC",
            ANOMALY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![date, min_z], anomaly_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn delete_anomalies_except(&self, date: NaiveDate, keep_tickers: &[String]) -> StoreResult<usize> {
        let keep: HashSet<&str> = keep_tickers.iter().map(String::as_str).collect();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let existing: Vec<String> = {
            let mut stmt = tx.prepare("SELECT ticker FROM anomalies WHERE date = ?1")?;
            let tickers = stmt
                .query_map(params![date], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            tickers
        };

        let mut removed = 0usize;
        for ticker in existing.iter().filter(|t| !keep.contains(t.as_str())) {
            removed += tx.execute(
                "DELETE FROM anomalies WHERE ticker = ?1 AND date = ?2",
                params![ticker, date],
            )?;
        }

        tx.commit()?;
        Ok(removed)
    }

    async fn list_anomaly_dates(&self, min_z: f64, limit: usize) -> StoreResult<Vec<NaiveDate>> {
        let conn = self.lock()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(
            "SELECT DISTINCT date FROM anomalies
             WHERE z_score >= ?1
             ORDER BY date DESC
             LIMIT ?2",
        )?;
        let dates = stmt
            .query_map(params![min_z, limit], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<NaiveDate>>>()?;
        Ok(dates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn aggregate(ticker: &str, d: u32, transactions: u64) -> DailyAggregate {
        DailyAggregate {
            ticker: ticker.to_string(),
            date: date(d),
            open: 10.0,
            high: 12.5,
            low: 9.75,
            close: 11.0,
            volume: transactions * 100,
            transactions,
        }
    }

    fn anomaly(ticker: &str, d: u32, z: f64) -> AnomalyEntry {
        AnomalyEntry {
            ticker: ticker.to_string(),
            date: date(d),
            trades: 500,
            avg_trades: 100.0,
            std_trades: 7.905694150420948,
            z_score: z,
            close_price: 11.0,
            price_diff_pct: -2.5,
            volume: 80_000,
        }
    }

    fn create_test_store() -> (NamedTempFile, SqliteRecordStore) {
        let temp_file = NamedTempFile::new().unwrap();
        let store = SqliteRecordStore::open(temp_file.path()).unwrap();
        (temp_file, store)
    }

    #[tokio::test]
    async fn test_aggregate_roundtrip_and_overwrite() {
        let (_tmp, store) = create_test_store();

        store.upsert_daily_aggregate(aggregate("AAPL", 4, 10)).await.unwrap();
        store.upsert_daily_aggregate(aggregate("AAPL", 4, 25)).await.unwrap();

        let got = store.get_daily_aggregate("AAPL", date(4)).await.unwrap().unwrap();
        assert_eq!(got, aggregate("AAPL", 4, 25));
        assert_eq!(store.list_daily_aggregates_for_date(date(4)).await.unwrap().len(), 1);
        assert!(store.get_daily_aggregate("AAPL", date(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_between_ordering() {
        let (_tmp, store) = create_test_store();
        store
            .upsert_daily_aggregates(&[
                aggregate("MSFT", 6, 1),
                aggregate("AAPL", 7, 2),
                aggregate("AAPL", 5, 3),
                aggregate("MSFT", 4, 4),
            ])
            .await
            .unwrap();

        let rows = store.list_daily_aggregates_between(date(5), date(7)).await.unwrap();
        let keys: Vec<(&str, NaiveDate)> = rows.iter().map(|r| (r.ticker.as_str(), r.date)).collect();
        assert_eq!(keys, vec![("AAPL", date(5)), ("AAPL", date(7)), ("MSFT", date(6))]);

        let aapl = store.list_daily_aggregates("AAPL", date(1), date(31)).await.unwrap();
        assert_eq!(aapl.len(), 2);
        assert!(aapl[0].date < aapl[1].date);
    }

    #[tokio::test]
    async fn test_recent_aggregates_count_records_not_days() {
        let (_tmp, store) = create_test_store();
        store
            .upsert_daily_aggregates(&[
                aggregate("SPARSE", 1, 1),
                aggregate("SPARSE", 8, 2),
                aggregate("SPARSE", 15, 3),
                aggregate("SPARSE", 22, 4),
                aggregate("SPARSE", 29, 5),
                aggregate("DAILY", 20, 6),
                aggregate("DAILY", 21, 7),
                aggregate("DAILY", 22, 8),
                aggregate("GONE", 21, 9),
            ])
            .await
            .unwrap();

        let rows = store.list_recent_daily_aggregates(date(22), 3).await.unwrap();
        let keys: Vec<(&str, NaiveDate)> = rows.iter().map(|r| (r.ticker.as_str(), r.date)).collect();
        assert_eq!(
            keys,
            vec![
                ("DAILY", date(20)),
                ("DAILY", date(21)),
                ("DAILY", date(22)),
                ("SPARSE", date(8)),
                ("SPARSE", date(15)),
                ("SPARSE", date(22)),
            ]
        );
        assert!(store.list_recent_daily_aggregates(date(23), 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_baseline_with_missing_prev_close() {
        let (_tmp, store) = create_test_store();
        let entry = BaselineEntry {
            ticker: "TSLA".to_string(),
            date: date(8),
            avg_trades: 100.0,
            std_trades: 0.0,
            prev_close: None,
            price_diff_pct: 0.0,
        };

        store.upsert_baselines(&[entry.clone()]).await.unwrap();
        assert_eq!(store.get_baseline("TSLA", date(8)).await.unwrap(), Some(entry));
        assert_eq!(store.list_baselines_for_date(date(8)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_anomalies_filters_and_orders() {
        let (_tmp, store) = create_test_store();
        store
            .upsert_anomalies(&[
                anomaly("A", 4, 3.2),
                anomaly("B", 4, 12.0),
                anomaly("C", 4, 4.0),
                anomaly("D", 5, 50.6),
            ])
            .await
            .unwrap();

        let listed = store.list_anomalies(date(4), 4.0).await.unwrap();
        let tickers: Vec<&str> = listed.iter().map(|a| a.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["B", "C"]);

        assert_eq!(store.list_anomaly_dates(3.0, 10).await.unwrap(), vec![date(5), date(4)]);
        assert_eq!(store.list_anomaly_dates(3.0, 1).await.unwrap(), vec![date(5)]);
    }

    #[tokio::test]
    async fn test_delete_anomalies_except() {
        let (_tmp, store) = create_test_store();
        store
            .upsert_anomalies(&[anomaly("A", 4, 5.0), anomaly("B", 4, 6.0), anomaly("A", 5, 7.0)])
            .await
            .unwrap();

        let removed = store.delete_anomalies_except(date(4), &["B".to_string()]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.list_anomalies(date(4), 0.0).await.unwrap().len(), 1);
        assert_eq!(store.list_anomalies(date(5), 0.0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_keeps_rows() {
        let temp_file = NamedTempFile::new().unwrap();
        {
            let store = SqliteRecordStore::open(temp_file.path()).unwrap();
            store.upsert_daily_aggregate(aggregate("SPY", 4, 9)).await.unwrap();
        }

        let store = SqliteRecordStore::open(temp_file.path()).unwrap();
        assert!(store.get_daily_aggregate("SPY", date(4)).await.unwrap().is_some());
    }

    #[test]
    fn test_count_overflow_rejected() {
        assert!(matches!(to_i64(u64::MAX, "volume"), Err(StoreError::Conversion(_))));
        assert_eq!(to_i64(42, "volume").unwrap(), 42);
    }
}
