//! Value records shared by every pipeline stage
//!
//! All three persisted records are keyed by `(ticker, date)`. They are never
//! mutated in place; a re-run produces a fresh value which the store upserts.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One ticker's OHLC, volume and transaction count for a trading day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub ticker: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,

    /// Total shares traded
    pub volume: u64,

    /// Number of trades (the activity metric the baseline tracks)
    pub transactions: u64,
}

/// Rolling statistics for one ticker as of one date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineEntry {
    pub ticker: String,
    pub date: NaiveDate,

    /// Mean transaction count over the lookback window
    pub avg_trades: f64,

    /// Sample standard deviation (N-1) of transaction count over the window
    pub std_trades: f64,

    /// Close of the previous record in the ticker's history, if any
    pub prev_close: Option<f64>,

    /// Percent change of close vs `prev_close` (0 when undefined)
    pub price_diff_pct: f64,
}

/// A ticker/date whose transaction count scored above the threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEntry {
    pub ticker: String,
    pub date: NaiveDate,
    pub trades: u64,
    pub avg_trades: f64,
    pub std_trades: f64,
    pub z_score: f64,
    pub close_price: f64,
    pub price_diff_pct: f64,
    pub volume: u64,
}

/// Which flat file family a date is ingested from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// Tick-level trades (`ticker,exchange,trf_id,size,price,...`)
    Trades,
    /// Pre-aggregated daily bars (`ticker,volume,open,close,high,low,transactions`)
    DayAggs,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Trades => "trades",
            FileKind::DayAggs => "day_aggs",
        }
    }

    /// Provider dataset directory for this kind
    pub fn dataset(&self) -> &'static str {
        match self {
            FileKind::Trades => "trades_v1",
            FileKind::DayAggs => "day_aggs_v1",
        }
    }

    /// Object key relative to the flat file root, e.g.
    /// `us_stocks_sip/trades_v1/2024/03/2024-03-15.csv.gz`
    pub fn object_key(&self, date: NaiveDate) -> String {
        format!(
            "us_stocks_sip/{}/{}/{}.csv.gz",
            self.dataset(),
            date.format("%Y/%m"),
            date.format("%Y-%m-%d")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_layout() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert_eq!(
            FileKind::Trades.object_key(date),
            "us_stocks_sip/trades_v1/2024/03/2024-03-05.csv.gz"
        );
        assert_eq!(
            FileKind::DayAggs.object_key(date),
            "us_stocks_sip/day_aggs_v1/2024/03/2024-03-05.csv.gz"
        );
    }
}
