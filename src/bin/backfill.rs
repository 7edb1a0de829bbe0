//! Backfill - run the end-of-day pipeline across a date range
//!
//! Usage:
//!   backfill --start 2024-03-01 --end 2024-03-29
//!   backfill --days 30                 # the 30 calendar days up to yesterday
//!
//! Weekends are skipped. Aggregation runs `BACKFILL_CONCURRENCY` dates at a
//! time; baselines and detection follow in date order.

use chrono::{Duration, Local, NaiveDate};
use clap::Parser;
use darkflow::pipeline::backfill;
use darkflow::report::to_json;
use darkflow::{PipelineConfig, PipelineEngine};
use dotenv::dotenv;
use log::{info, warn};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "backfill", about = "Run the pipeline for every weekday in a range")]
struct Args {
    /// First date (YYYY-MM-DD); defaults to `--days` before `--end`
    #[arg(long)]
    start: Option<NaiveDate>,

    /// Last date (YYYY-MM-DD); defaults to yesterday
    #[arg(long)]
    end: Option<NaiveDate>,

    /// Calendar days to cover when `--start` is omitted
    #[arg(long, default_value_t = 30)]
    days: i64,

    /// Print per-date reports as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let end = args
        .end
        .unwrap_or_else(|| Local::now().date_naive() - Duration::days(1));
    let start = args
        .start
        .unwrap_or_else(|| end - Duration::days(args.days.max(1) - 1));

    if start > end {
        return Err(format!("start {} is after end {}", start, end).into());
    }

    let config = PipelineConfig::from_env()?;
    info!("🚀 Darkflow backfill {} → {}", start, end);
    info!("   ├─ Database: {}", config.db_path);
    info!("   └─ Concurrency: {}", config.backfill_concurrency);

    let engine = Arc::new(PipelineEngine::from_config(config)?);

    let cancel = engine.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupt received, cancelling remaining dates");
            cancel.cancel();
        }
    });

    let summary = backfill(Arc::clone(&engine), start, end).await;

    if args.json {
        println!("{}", to_json(&summary.reports));
    } else {
        println!("{:<12} {:>8} {:>9} {:>9}  STATUS", "DATE", "TICKERS", "BASELINES", "ANOMALIES");
        for r in &summary.reports {
            let date = r.date.map(|d| d.to_string()).unwrap_or_default();
            let status = r.error.as_deref().unwrap_or("ok");
            println!(
                "{:<12} {:>8} {:>9} {:>9}  {}",
                date, r.aggregates, r.baselines, r.anomalies, status
            );
        }
    }

    if summary.failed() > 0 {
        warn!("⚠️  {} of {} dates failed", summary.failed(), summary.reports.len());
    }
    Ok(())
}
