//! Per-ticker OHLC accumulation for one trading day

use crate::types::DailyAggregate;
use chrono::NaiveDate;
use std::collections::HashMap;

/// Running bar for one ticker, fed in file order
#[derive(Debug, Clone, PartialEq)]
pub struct BarAccumulator {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub transactions: u64,
}

impl BarAccumulator {
    /// Start a bar from its first qualifying trade
    pub fn new(size: u64, price: f64) -> Self {
        Self {
            open: price,
            high: price,
            low: price,
            close: price,
            volume: size,
            transactions: 1,
        }
    }

    pub fn add_trade(&mut self, size: u64, price: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume = self.volume.saturating_add(size);
        self.transactions += 1;
    }

    /// Fold in a bar built from rows that come *after* this one in the file
    pub fn merge_later(&mut self, later: &BarAccumulator) {
        self.high = self.high.max(later.high);
        self.low = self.low.min(later.low);
        self.close = later.close;
        self.volume = self.volume.saturating_add(later.volume);
        self.transactions += later.transactions;
    }

    pub fn into_aggregate(self, ticker: String, date: NaiveDate) -> DailyAggregate {
        DailyAggregate {
            ticker,
            date,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            transactions: self.transactions,
        }
    }
}

/// Merge a later batch's partial bars into the running map
pub fn merge_partials(bars: &mut HashMap<String, BarAccumulator>, later: HashMap<String, BarAccumulator>) {
    for (ticker, partial) in later {
        match bars.get_mut(&ticker) {
            Some(existing) => existing.merge_later(&partial),
            None => {
                bars.insert(ticker, partial);
            }
        }
    }
}
