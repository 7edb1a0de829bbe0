//! Rolling transaction-count baselines per ticker

use super::window::RollingWindow;
use crate::types::{BaselineEntry, DailyAggregate};
use chrono::NaiveDate;
use std::collections::BTreeMap;

/// Where the lookback window sits relative to the day it describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselineWindow {
    /// Window `[i - lookback + 1, i]`, including the day itself
    Trailing,
    /// Window `[i - lookback, i - 1]`, strictly before the day
    Prior,
}

impl BaselineWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            BaselineWindow::Trailing => "trailing",
            BaselineWindow::Prior => "prior",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "trailing" => Some(BaselineWindow::Trailing),
            "prior" => Some(BaselineWindow::Prior),
            _ => None,
        }
    }
}

pub struct BaselineBuilder {
    lookback_days: usize,
    window: BaselineWindow,
}

impl BaselineBuilder {
    pub fn new(lookback_days: usize, window: BaselineWindow) -> Self {
        Self {
            lookback_days: lookback_days.max(1),
            window,
        }
    }

    pub fn lookback_days(&self) -> usize {
        self.lookback_days
    }

    /// Build every computable entry for one ticker's date-ordered history
    ///
    /// Days without a full window are omitted. Gaps in the calendar do not
    /// matter: the window counts records, not days.
    pub fn build(&self, ticker: &str, history: &[DailyAggregate]) -> Vec<BaselineEntry> {
        debug_assert!(history.windows(2).all(|w| w[0].date < w[1].date));

        let mut window = RollingWindow::new(self.lookback_days);
        let mut entries = Vec::new();

        for (i, day) in history.iter().enumerate() {
            if self.window == BaselineWindow::Trailing {
                window.push(day.transactions);
            }

            if window.is_full() {
                let prev_close = if i > 0 { Some(history[i - 1].close) } else { None };
                entries.push(BaselineEntry {
                    ticker: ticker.to_string(),
                    date: day.date,
                    avg_trades: window.mean().unwrap_or(0.0),
                    std_trades: window.sample_std(),
                    prev_close,
                    price_diff_pct: price_diff_pct(day.close, prev_close),
                });
            }

            if self.window == BaselineWindow::Prior {
                window.push(day.transactions);
            }
        }

        entries
    }

    /// Baselines for `date` across every ticker present in `rows`
    ///
    /// `rows` may hold any mix of tickers; they are grouped and ordered here.
    /// Tickers without enough history are skipped and counted.
    pub fn build_for_date(&self, date: NaiveDate, rows: Vec<DailyAggregate>) -> (Vec<BaselineEntry>, usize) {
        let mut by_ticker: BTreeMap<String, Vec<DailyAggregate>> = BTreeMap::new();
        for row in rows.into_iter().filter(|r| r.date <= date) {
            by_ticker.entry(row.ticker.clone()).or_default().push(row);
        }

        let mut entries = Vec::new();
        let mut insufficient = 0usize;

        for (ticker, mut history) in by_ticker {
            history.sort_by_key(|r| r.date);
            history.dedup_by_key(|r| r.date);

            // only tickers that traded on the target date get a baseline row
            if history.last().map(|r| r.date) != Some(date) {
                continue;
            }

            match self.build(&ticker, &history).into_iter().find(|e| e.date == date) {
                Some(entry) => entries.push(entry),
                None => insufficient += 1,
            }
        }

        (entries, insufficient)
    }
}

/// Build trailing-window baselines, the default placement
pub fn build_baseline(ticker: &str, history: &[DailyAggregate], lookback_days: usize) -> Vec<BaselineEntry> {
    BaselineBuilder::new(lookback_days, BaselineWindow::Trailing).build(ticker, history)
}

fn price_diff_pct(close: f64, prev_close: Option<f64>) -> f64 {
    match prev_close {
        Some(prev) if prev != 0.0 => (close - prev) / prev * 100.0,
        _ => 0.0,
    }
}
