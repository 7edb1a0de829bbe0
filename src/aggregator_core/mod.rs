//! Aggregator Core - flat file to daily bar reduction
//!
//! # Architecture
//!
//! ```text
//! FlatFileSource (local mirror | HTTP | S3)
//!     ↓ gzip byte stream
//! TradeAggregator (MultiGzDecoder → csv::Reader → row batches)
//!     ↓ parallel fold per wave (normalizer + TradeFilter)
//! BarAccumulator merge in file order
//!     ↓
//! HashMap<ticker, DailyAggregate>
//! ```

pub mod accumulator;
pub mod aggregator;
pub mod normalizer;
pub mod s3;
pub mod source;

pub use accumulator::BarAccumulator;
pub use aggregator::{AggregateOutput, AggregateStats, TradeAggregator};
pub use normalizer::{is_dark_pool, TradeRecord, TRF_EXCHANGE_ID};
pub use s3::S3FlatFiles;
pub use source::{FlatFileSource, HttpFlatFiles, LocalFlatFiles, SourceStream};
