//! Daily trade aggregation from compressed flat files
//!
//! Decompression and CSV splitting are sequential (gzip members decode in
//! order, and a file may hold several concatenated members),
//! so rows are cut into batches on the calling thread and each wave of
//! batches is parsed, filtered and folded in parallel. Partial bars are merged
//! back in batch order, which keeps open/close tied to file order.

use super::accumulator::{merge_partials, BarAccumulator};
use super::normalizer::{bar_from_row, is_blank_header, BarColumns, TradeColumns, TradeRecord};
use crate::cancel::CancelFlag;
use crate::config::TradeFilter;
use crate::error::{PipelineError, Result};
use crate::types::{DailyAggregate, FileKind};
use chrono::NaiveDate;
use csv::{ByteRecord, ReaderBuilder};
use flate2::read::MultiGzDecoder;
use rayon::prelude::*;
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read};

/// Row accounting for one aggregation run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateStats {
    pub rows_read: u64,
    pub rows_malformed: u64,
    pub rows_not_dark_pool: u64,
    pub rows_below_min_size: u64,
    pub tickers: usize,
}

impl AggregateStats {
    fn merge(&mut self, other: &AggregateStats) {
        self.rows_read += other.rows_read;
        self.rows_malformed += other.rows_malformed;
        self.rows_not_dark_pool += other.rows_not_dark_pool;
        self.rows_below_min_size += other.rows_below_min_size;
    }
}

/// Result of aggregating one file
#[derive(Debug, Clone, Default)]
pub struct AggregateOutput {
    pub aggregates: HashMap<String, DailyAggregate>,
    pub stats: AggregateStats,
}

impl AggregateOutput {
    pub fn is_empty(&self) -> bool {
        self.aggregates.is_empty()
    }

    /// Aggregates sorted by ticker, ready for a batch upsert
    pub fn into_sorted(self) -> Vec<DailyAggregate> {
        let mut rows: Vec<DailyAggregate> = self.aggregates.into_values().collect();
        rows.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        rows
    }
}

impl TradeFilter {
    /// Apply the dark pool and size rules, recording why a trade was dropped
    fn admits(&self, trade: &TradeRecord, stats: &mut AggregateStats) -> bool {
        if self.dark_pool_only && !trade.is_dark_pool() {
            stats.rows_not_dark_pool += 1;
            return false;
        }
        if trade.size < self.min_trade_size {
            stats.rows_below_min_size += 1;
            return false;
        }
        true
    }
}

struct BatchPartial {
    bars: HashMap<String, BarAccumulator>,
    stats: AggregateStats,
}

pub struct TradeAggregator {
    workers: usize,
    batch_rows: usize,
}

impl TradeAggregator {
    pub fn new(workers: usize, batch_rows: usize) -> Self {
        Self {
            workers: workers.max(1),
            batch_rows: batch_rows.max(1),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(4, 50_000)
    }

    /// Aggregate one gzip-compressed flat file into daily bars per ticker
    ///
    /// A zero-byte input or a file with no rows yields an empty output. The
    /// cancel flag is polled between batches; a cancelled run returns
    /// `Cancelled` and nothing it computed escapes.
    pub fn aggregate<R: Read>(
        &self,
        date: NaiveDate,
        kind: FileKind,
        source: R,
        filter: &TradeFilter,
        cancel: &CancelFlag,
    ) -> Result<AggregateOutput> {
        let mut buffered = BufReader::new(source);
        let has_bytes = !buffered
            .fill_buf()
            .map_err(|e| PipelineError::SourceUnavailable {
                date,
                reason: e.to_string(),
            })?
            .is_empty();

        if !has_bytes {
            log::info!("📭 Empty {} file for {}", kind.as_str(), date);
            return Ok(AggregateOutput::default());
        }

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(MultiGzDecoder::new(buffered));

        let headers = reader
            .byte_headers()
            .map_err(|e| read_error(date, e))?
            .clone();

        if is_blank_header(&headers) {
            log::info!("📭 No rows in {} file for {}", kind.as_str(), date);
            return Ok(AggregateOutput::default());
        }

        let output = match kind {
            FileKind::Trades => {
                let columns = TradeColumns::from_headers(&headers)
                    .map_err(|missing| corrupt(date, format!("missing column '{}'", missing)))?;
                if dark_pool_unclassifiable(filter, &columns) {
                    log::warn!(
                        "⚠️  Trades file for {} has no trf_id column; with dark_pool_only every trade is treated as lit",
                        date
                    );
                }
                self.aggregate_trades(date, &mut reader, &columns, filter, cancel)?
            }
            FileKind::DayAggs => {
                if !filter.is_noop() {
                    log::warn!(
                        "⚠️  Day aggregate files carry no per-trade data; ignoring dark_pool_only={} min_trade_size={} for {}",
                        filter.dark_pool_only,
                        filter.min_trade_size,
                        date
                    );
                }
                let columns = BarColumns::from_headers(&headers)
                    .map_err(|missing| corrupt(date, format!("missing column '{}'", missing)))?;
                self.collect_bars(date, &mut reader, &columns, cancel)?
            }
        };

        log::info!(
            "📊 {} {}: {} tickers from {} rows ({} malformed, {} lit, {} undersized)",
            date,
            kind.as_str(),
            output.stats.tickers,
            output.stats.rows_read,
            output.stats.rows_malformed,
            output.stats.rows_not_dark_pool,
            output.stats.rows_below_min_size
        );

        Ok(output)
    }

    fn aggregate_trades<R: Read>(
        &self,
        date: NaiveDate,
        reader: &mut csv::Reader<R>,
        columns: &TradeColumns,
        filter: &TradeFilter,
        cancel: &CancelFlag,
    ) -> Result<AggregateOutput> {
        let mut bars: HashMap<String, BarAccumulator> = HashMap::new();
        let mut stats = AggregateStats::default();
        let mut wave: Vec<Vec<ByteRecord>> = Vec::with_capacity(self.workers);
        let mut batch: Vec<ByteRecord> = Vec::with_capacity(self.batch_rows);
        let mut record = ByteRecord::new();

        while reader.read_byte_record(&mut record).map_err(|e| read_error(date, e))? {
            batch.push(std::mem::replace(&mut record, ByteRecord::new()));

            if batch.len() >= self.batch_rows {
                wave.push(std::mem::replace(&mut batch, Vec::with_capacity(self.batch_rows)));

                if wave.len() >= self.workers {
                    check_cancelled(cancel)?;
                    fold_wave(&mut wave, columns, filter, &mut bars, &mut stats);
                }
            }
        }

        if !batch.is_empty() {
            wave.push(batch);
        }
        check_cancelled(cancel)?;
        fold_wave(&mut wave, columns, filter, &mut bars, &mut stats);

        let aggregates: HashMap<String, DailyAggregate> = bars
            .into_iter()
            .map(|(ticker, bar)| (ticker.clone(), bar.into_aggregate(ticker, date)))
            .collect();
        stats.tickers = aggregates.len();

        Ok(AggregateOutput { aggregates, stats })
    }

    fn collect_bars<R: Read>(
        &self,
        date: NaiveDate,
        reader: &mut csv::Reader<R>,
        columns: &BarColumns,
        cancel: &CancelFlag,
    ) -> Result<AggregateOutput> {
        let mut aggregates = HashMap::new();
        let mut stats = AggregateStats::default();
        let mut record = ByteRecord::new();

        while reader.read_byte_record(&mut record).map_err(|e| read_error(date, e))? {
            stats.rows_read += 1;
            if stats.rows_read % self.batch_rows as u64 == 0 {
                check_cancelled(cancel)?;
            }

            match bar_from_row(&record, columns, date) {
                Some(bar) => {
                    if let Some(previous) = aggregates.insert(bar.ticker.clone(), bar) {
                        log::debug!("Duplicate bar for {} on {}, keeping the later row", previous.ticker, date);
                    }
                }
                None => {
                    stats.rows_malformed += 1;
                    log::trace!("Skipping malformed bar row {:?}", record);
                }
            }
        }

        check_cancelled(cancel)?;
        stats.tickers = aggregates.len();
        Ok(AggregateOutput { aggregates, stats })
    }
}

fn fold_wave(
    wave: &mut Vec<Vec<ByteRecord>>,
    columns: &TradeColumns,
    filter: &TradeFilter,
    bars: &mut HashMap<String, BarAccumulator>,
    stats: &mut AggregateStats,
) {
    if wave.is_empty() {
        return;
    }

    // collect() on an indexed parallel iterator keeps batch order
    let partials: Vec<BatchPartial> = wave
        .par_iter()
        .map(|rows| fold_batch(rows, columns, filter))
        .collect();
    wave.clear();

    for partial in partials {
        stats.merge(&partial.stats);
        merge_partials(bars, partial.bars);
    }
}

fn fold_batch(rows: &[ByteRecord], columns: &TradeColumns, filter: &TradeFilter) -> BatchPartial {
    let mut bars: HashMap<String, BarAccumulator> = HashMap::new();
    let mut stats = AggregateStats::default();

    for row in rows {
        stats.rows_read += 1;

        let trade = match TradeRecord::from_row(row, columns) {
            Some(trade) => trade,
            None => {
                stats.rows_malformed += 1;
                log::trace!("Skipping malformed trade row {:?}", row);
                continue;
            }
        };

        if !filter.admits(&trade, &mut stats) {
            continue;
        }

        match bars.get_mut(&trade.ticker) {
            Some(bar) => bar.add_trade(trade.size, trade.price),
            None => {
                bars.insert(trade.ticker, BarAccumulator::new(trade.size, trade.price));
            }
        }
    }

    BatchPartial { bars, stats }
}

fn check_cancelled(cancel: &CancelFlag) -> Result<()> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}

/// Dark pool prints are identified by `trf_id`; without the column none can match
fn dark_pool_unclassifiable(filter: &TradeFilter, columns: &TradeColumns) -> bool {
    filter.dark_pool_only && columns.trf_id.is_none()
}

/// Failures of the underlying reader are retryable; bad gzip or CSV is not.
/// flate2 reports damaged streams as `InvalidInput`/`InvalidData`, and a
/// truncated member as `UnexpectedEof`.
fn read_error(date: NaiveDate, err: csv::Error) -> PipelineError {
    let transport = match err.kind() {
        csv::ErrorKind::Io(io_err) => !matches!(
            io_err.kind(),
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof
        ),
        _ => false,
    };

    if transport {
        PipelineError::SourceUnavailable {
            date,
            reason: err.to_string(),
        }
    } else {
        corrupt(date, err)
    }
}

fn corrupt(date: NaiveDate, reason: impl std::fmt::Display) -> PipelineError {
    PipelineError::CorruptSource {
        date,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::{Cursor, Write};

    fn gzip(text: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    const SAMPLE_TRADES: &str = "ticker,exchange,trf_id,size,price\n\
        A,4,201,1000,150.0\n\
        A,11,,500,151.0\n\
        A,4,202,800,152.0\n";

    fn run(text: &str, kind: FileKind, filter: TradeFilter, aggregator: &TradeAggregator) -> AggregateOutput {
        aggregator
            .aggregate(date(), kind, Cursor::new(gzip(text)), &filter, &CancelFlag::new())
            .unwrap()
    }

    #[test]
    fn test_dark_pool_only_aggregate() {
        let filter = TradeFilter {
            dark_pool_only: true,
            min_trade_size: 1,
        };
        let output = run(SAMPLE_TRADES, FileKind::Trades, filter, &TradeAggregator::with_defaults());

        let a = &output.aggregates["A"];
        assert_eq!(a.volume, 1800);
        assert_eq!(a.transactions, 2);
        assert_eq!(a.open, 150.0);
        assert_eq!(a.close, 152.0);
        assert_eq!(a.high, 152.0);
        assert_eq!(a.low, 150.0);
        assert_eq!(output.stats.rows_not_dark_pool, 1);
    }

    #[test]
    fn test_min_trade_size_filter() {
        let filter = TradeFilter {
            dark_pool_only: true,
            min_trade_size: 900,
        };
        let output = run(SAMPLE_TRADES, FileKind::Trades, filter, &TradeAggregator::with_defaults());

        let a = &output.aggregates["A"];
        assert_eq!(a.volume, 1000);
        assert_eq!(a.transactions, 1);
        assert_eq!(output.stats.rows_below_min_size, 1);
    }

    #[test]
    fn test_unfiltered_keeps_every_trade() {
        let output = run(SAMPLE_TRADES, FileKind::Trades, TradeFilter::default(), &TradeAggregator::with_defaults());

        let a = &output.aggregates["A"];
        assert_eq!(a.volume, 2300);
        assert_eq!(a.transactions, 3);
        assert_eq!(a.open, 150.0);
        assert_eq!(a.close, 152.0);
    }

    #[test]
    fn test_filtered_out_ticker_produces_no_aggregate() {
        let text = "ticker,exchange,trf_id,size,price\nLIT,11,,100,5.0\nDARK,4,201,100,6.0\n";
        let filter = TradeFilter {
            dark_pool_only: true,
            min_trade_size: 1,
        };
        let output = run(text, FileKind::Trades, filter, &TradeAggregator::with_defaults());

        assert!(!output.aggregates.contains_key("LIT"));
        assert!(output.aggregates.contains_key("DARK"));
        assert_eq!(output.stats.tickers, 1);
    }

    #[test]
    fn test_malformed_rows_skipped_and_counted() {
        let text = "ticker,exchange,trf_id,size,price\n\
            A,4,201,100,10.0\n\
            A,four,201,100,11.0\n\
            A,4,201,lots,12.0\n\
            A,4,201,100,\n\
            A,4,201,100,13.0\n";
        let output = run(text, FileKind::Trades, TradeFilter::default(), &TradeAggregator::with_defaults());

        assert_eq!(output.stats.rows_read, 5);
        assert_eq!(output.stats.rows_malformed, 3);
        assert_eq!(output.aggregates["A"].transactions, 2);
        assert_eq!(output.aggregates["A"].close, 13.0);
    }

    #[test]
    fn test_small_batches_match_single_batch() {
        let mut text = String::from("ticker,exchange,trf_id,size,price\n");
        for i in 0..257u32 {
            let ticker = ["AAA", "BBB", "CCC"][(i % 3) as usize];
            let price = 100.0 + ((i * 7) % 13) as f64;
            text.push_str(&format!("{},{},{},{},{}\n", ticker, 4 + (i % 2), "201", 10 + i, price));
        }

        let single = run(&text, FileKind::Trades, TradeFilter::default(), &TradeAggregator::new(1, 10_000));
        let batched = run(&text, FileKind::Trades, TradeFilter::default(), &TradeAggregator::new(3, 7));

        assert_eq!(single.aggregates, batched.aggregates);
        assert_eq!(single.stats, batched.stats);
    }

    #[test]
    fn test_high_low_bracket_open_close() {
        let text = "ticker,exchange,trf_id,size,price\nZ,1,,5,20.0\nZ,1,,5,18.0\nZ,1,,5,25.0\nZ,1,,5,21.0\n";
        let output = run(text, FileKind::Trades, TradeFilter::default(), &TradeAggregator::new(2, 1));
        let z = &output.aggregates["Z"];

        assert!(z.high >= z.open.max(z.close));
        assert!(z.low <= z.open.min(z.close));
        assert_eq!(z.open, 20.0);
        assert_eq!(z.close, 21.0);
        assert_eq!(z.high, 25.0);
        assert_eq!(z.low, 18.0);
    }

    #[test]
    fn test_empty_inputs_are_not_errors() {
        let aggregator = TradeAggregator::with_defaults();
        let cancel = CancelFlag::new();
        let filter = TradeFilter::default();

        let zero_bytes = aggregator
            .aggregate(date(), FileKind::Trades, Cursor::new(Vec::new()), &filter, &cancel)
            .unwrap();
        assert!(zero_bytes.is_empty());

        let empty_gzip = aggregator
            .aggregate(date(), FileKind::Trades, Cursor::new(gzip("")), &filter, &cancel)
            .unwrap();
        assert!(empty_gzip.is_empty());

        let header_only = aggregator
            .aggregate(
                date(),
                FileKind::Trades,
                Cursor::new(gzip("ticker,exchange,trf_id,size,price\n")),
                &filter,
                &cancel,
            )
            .unwrap();
        assert!(header_only.is_empty());
    }

    #[test]
    fn test_concatenated_gzip_members_are_all_read() {
        let mut bytes = gzip("ticker,exchange,trf_id,size,price\nA,4,201,100,10.0\n");
        bytes.extend(gzip("A,4,201,100,11.0\nB,4,201,50,3.0\n"));

        let output = TradeAggregator::with_defaults()
            .aggregate(date(), FileKind::Trades, Cursor::new(bytes), &TradeFilter::default(), &CancelFlag::new())
            .unwrap();

        assert_eq!(output.stats.rows_read, 3);
        assert_eq!(output.stats.tickers, 2);
        assert_eq!(output.aggregates["A"].transactions, 2);
        assert_eq!(output.aggregates["A"].close, 11.0);
        assert_eq!(output.aggregates["B"].volume, 50);
    }

    #[test]
    fn test_missing_trf_id_makes_every_trade_lit() {
        let text = "ticker,exchange,size,price\nA,4,100,10.0\nA,4,200,11.0\n";
        let filter = TradeFilter {
            dark_pool_only: true,
            min_trade_size: 1,
        };
        let headers = ByteRecord::from(vec!["ticker", "exchange", "size", "price"]);
        let columns = TradeColumns::from_headers(&headers).unwrap();
        assert!(dark_pool_unclassifiable(&filter, &columns));
        assert!(!dark_pool_unclassifiable(&TradeFilter::default(), &columns));

        let output = run(text, FileKind::Trades, filter, &TradeAggregator::with_defaults());

        assert!(output.is_empty());
        assert_eq!(output.stats.rows_read, 2);
        assert_eq!(output.stats.rows_not_dark_pool, 2);
    }

    /// Hands out the first `good` bytes, then fails like a dropped connection
    struct BrokenPipeReader {
        data: Vec<u8>,
        good: usize,
        pos: usize,
    }

    impl Read for BrokenPipeReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.good {
                return Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset"));
            }
            let n = buf.len().min(self.good - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_reader_failure_is_unavailable_not_corrupt() {
        let mut text = String::from("ticker,exchange,trf_id,size,price\n");
        for i in 0..200u32 {
            text.push_str(&format!("T{},4,201,{},{}.5\n", i % 17, 100 + i, 10 + i % 9));
        }
        let data = gzip(&text);
        let good = data.len() / 2;
        let source = BrokenPipeReader { data, good, pos: 0 };

        let err = TradeAggregator::with_defaults()
            .aggregate(date(), FileKind::Trades, source, &TradeFilter::default(), &CancelFlag::new())
            .unwrap_err();

        match &err {
            PipelineError::SourceUnavailable { reason, .. } => assert!(reason.contains("connection reset")),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.is_retryable());
    }

    #[test]
    fn test_not_gzip_is_corrupt() {
        let err = TradeAggregator::with_defaults()
            .aggregate(
                date(),
                FileKind::Trades,
                Cursor::new(b"ticker,exchange\nA,4\n".to_vec()),
                &TradeFilter::default(),
                &CancelFlag::new(),
            )
            .unwrap_err();

        assert!(matches!(err, PipelineError::CorruptSource { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_missing_column_is_corrupt() {
        let err = TradeAggregator::with_defaults()
            .aggregate(
                date(),
                FileKind::Trades,
                Cursor::new(gzip("ticker,exchange,size\nA,4,100\n")),
                &TradeFilter::default(),
                &CancelFlag::new(),
            )
            .unwrap_err();

        match err {
            PipelineError::CorruptSource { reason, .. } => assert!(reason.contains("price")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_cancelled_run_returns_nothing() {
        let cancel = CancelFlag::new();
        cancel.cancel();

        let err = TradeAggregator::with_defaults()
            .aggregate(
                date(),
                FileKind::Trades,
                Cursor::new(gzip(SAMPLE_TRADES)),
                &TradeFilter::default(),
                &cancel,
            )
            .unwrap_err();

        assert!(matches!(err, PipelineError::Cancelled));
    }

    #[test]
    fn test_day_aggs_pass_through_and_ignore_filters() {
        let text = "ticker,volume,open,close,high,low,window_start,transactions\n\
            AAPL,5000000,189.0,190.5,191.0,188.2,1710475200000000000,61000\n\
            MSFT,2000000,410.0,409.0,412.5,407.1,1710475200000000000,30000\n\
            BROKEN,x,1,1,1,1,0,1\n";
        let filter = TradeFilter {
            dark_pool_only: true,
            min_trade_size: 1000,
        };
        let output = run(text, FileKind::DayAggs, filter, &TradeAggregator::with_defaults());

        assert_eq!(output.aggregates.len(), 2);
        assert_eq!(output.stats.rows_malformed, 1);
        let aapl = &output.aggregates["AAPL"];
        assert_eq!(aapl.volume, 5_000_000);
        assert_eq!(aapl.transactions, 61_000);
        assert_eq!(aapl.close, 190.5);
    }

    #[test]
    fn test_into_sorted_orders_by_ticker() {
        let text = "ticker,exchange,trf_id,size,price\nC,1,,1,1.0\nA,1,,1,1.0\nB,1,,1,1.0\n";
        let rows = run(text, FileKind::Trades, TradeFilter::default(), &TradeAggregator::with_defaults()).into_sorted();

        let tickers: Vec<&str> = rows.iter().map(|r| r.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["A", "B", "C"]);
    }
}
