//! Row normalization from flat file CSV records
//!
//! Columns are resolved by header name so provider files with extra columns
//! (sequence numbers, timestamps, conditions) decode without configuration.
//! Parsing is defensive: a row that cannot be normalized yields `None` and the
//! caller counts it as malformed.

use crate::types::DailyAggregate;
use chrono::NaiveDate;
use csv::ByteRecord;

/// Exchange code the provider assigns to FINRA Trade Reporting Facilities
pub const TRF_EXCHANGE_ID: i32 = 4;

/// One tick-level trade, alive only while its batch is folded
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRecord {
    pub ticker: String,
    pub exchange: i32,
    pub trf_id: String,
    pub size: u64,
    pub price: f64,
}

impl TradeRecord {
    /// Dark pool trade: reported on exchange 4 through a TRF
    pub fn is_dark_pool(&self) -> bool {
        is_dark_pool(self.exchange, &self.trf_id)
    }

    /// Normalize a CSV row, or `None` if any required field is unusable
    pub fn from_row(row: &ByteRecord, columns: &TradeColumns) -> Option<Self> {
        let ticker = text_field(row, columns.ticker)?;
        if ticker.is_empty() {
            return None;
        }

        let exchange = text_field(row, columns.exchange)?.parse::<i32>().ok()?;
        let size = text_field(row, columns.size)?.parse::<u64>().ok()?;
        let price = text_field(row, columns.price)?.parse::<f64>().ok()?;
        if !price.is_finite() {
            return None;
        }

        let trf_id = match columns.trf_id {
            Some(idx) => text_field(row, idx).unwrap_or_default(),
            None => "",
        };

        Some(Self {
            ticker: ticker.to_string(),
            exchange,
            trf_id: trf_id.to_string(),
            size,
            price,
        })
    }
}

pub fn is_dark_pool(exchange: i32, trf_id: &str) -> bool {
    exchange == TRF_EXCHANGE_ID && !trf_id.trim().is_empty()
}

/// Column positions for a tick-level trades file
#[derive(Debug, Clone, Copy)]
pub struct TradeColumns {
    pub ticker: usize,
    pub exchange: usize,
    pub trf_id: Option<usize>,
    pub size: usize,
    pub price: usize,
}

impl TradeColumns {
    /// Resolve positions from the header row; `Err` names the missing column
    pub fn from_headers(headers: &ByteRecord) -> Result<Self, &'static str> {
        Ok(Self {
            ticker: require(headers, "ticker")?,
            exchange: require(headers, "exchange")?,
            trf_id: column_index(headers, "trf_id"),
            size: require(headers, "size")?,
            price: require(headers, "price")?,
        })
    }
}

/// Column positions for a pre-aggregated daily bar file
#[derive(Debug, Clone, Copy)]
pub struct BarColumns {
    pub ticker: usize,
    pub volume: usize,
    pub open: usize,
    pub close: usize,
    pub high: usize,
    pub low: usize,
    pub transactions: usize,
}

impl BarColumns {
    pub fn from_headers(headers: &ByteRecord) -> Result<Self, &'static str> {
        Ok(Self {
            ticker: require(headers, "ticker")?,
            volume: require(headers, "volume")?,
            open: require(headers, "open")?,
            close: require(headers, "close")?,
            high: require(headers, "high")?,
            low: require(headers, "low")?,
            transactions: require(headers, "transactions")?,
        })
    }
}

/// Pass a provider bar through 1:1. Empty numeric cells read as 0, the way
/// sparse provider bars are stored; unparsable cells reject the row.
pub fn bar_from_row(row: &ByteRecord, columns: &BarColumns, date: NaiveDate) -> Option<DailyAggregate> {
    let ticker = text_field(row, columns.ticker)?;
    if ticker.is_empty() {
        return None;
    }

    Some(DailyAggregate {
        ticker: ticker.to_string(),
        date,
        open: price_or_zero(row, columns.open)?,
        high: price_or_zero(row, columns.high)?,
        low: price_or_zero(row, columns.low)?,
        close: price_or_zero(row, columns.close)?,
        volume: count_or_zero(row, columns.volume)?,
        transactions: count_or_zero(row, columns.transactions)?,
    })
}

/// True for the empty header a zero-row file decodes to
pub fn is_blank_header(headers: &ByteRecord) -> bool {
    headers.iter().all(|field| field.iter().all(u8::is_ascii_whitespace))
}

fn column_index(headers: &ByteRecord, name: &str) -> Option<usize> {
    headers.iter().position(|field| {
        std::str::from_utf8(field)
            .map(|h| h.trim().trim_start_matches('\u{feff}').eq_ignore_ascii_case(name))
            .unwrap_or(false)
    })
}

fn require(headers: &ByteRecord, name: &'static str) -> Result<usize, &'static str> {
    column_index(headers, name).ok_or(name)
}

fn text_field(row: &ByteRecord, idx: usize) -> Option<&str> {
    std::str::from_utf8(row.get(idx)?).ok().map(str::trim)
}

fn price_or_zero(row: &ByteRecord, idx: usize) -> Option<f64> {
    let raw = text_field(row, idx)?;
    if raw.is_empty() {
        return Some(0.0);
    }
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Volumes in bar files are sometimes written as `12345.0`
fn count_or_zero(row: &ByteRecord, idx: usize) -> Option<u64> {
    let raw = text_field(row, idx)?;
    if raw.is_empty() {
        return Some(0);
    }
    if let Ok(v) = raw.parse::<u64>() {
        return Some(v);
    }
    let v = raw.parse::<f64>().ok()?;
    if v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= u64::MAX as f64 {
        Some(v as u64)
    } else {
        None
    }
}
