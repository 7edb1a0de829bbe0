//! End-of-day pipeline driver
//!
//! `PipelineEngine` runs aggregate → baselines → detection for one date;
//! `backfill` runs it across a range of weekdays.

pub mod backfill;
pub mod engine;

pub use backfill::{backfill, is_weekday, weekdays_between, BackfillSummary};
pub use engine::{BaselineOutcome, DateReport, DetectionOutcome, PipelineEngine};
