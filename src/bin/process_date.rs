//! Process Date - run the end-of-day pipeline for a single date
//!
//! Usage:
//!   process_date                      # yesterday, skipped on weekends
//!   process_date --date 2024-03-15
//!   process_date --date 2024-03-15 --json
//!
//! Configuration comes from the environment (see `PipelineConfig::from_env`).

use chrono::{Duration, Local, NaiveDate};
use clap::Parser;
use darkflow::pipeline::is_weekday;
use darkflow::report::{format_top_anomalies, to_json};
use darkflow::{PipelineConfig, PipelineEngine};
use dotenv::dotenv;
use log::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "process_date", about = "Aggregate, baseline and score one trading date")]
struct Args {
    /// Date to process (YYYY-MM-DD); defaults to yesterday
    #[arg(long)]
    date: Option<NaiveDate>,

    /// Run even if the date falls on a weekend
    #[arg(long)]
    force: bool,

    /// Rows in the anomaly table
    #[arg(long, default_value_t = 10)]
    top: usize,

    /// Print the report and anomalies as JSON instead of a table
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let date = args
        .date
        .unwrap_or_else(|| Local::now().date_naive() - Duration::days(1));

    if !is_weekday(date) && !args.force {
        info!("📆 {} is a weekend, nothing to do (use --force to run anyway)", date);
        return Ok(());
    }

    let config = PipelineConfig::from_env()?;
    info!("🚀 Darkflow EOD run for {}", date);
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Lookback: {} days ({} window)", config.lookback_days, config.baseline_window.as_str());
    info!("   ├─ Threshold: z > {}", config.z_score_threshold);
    info!(
        "   └─ Input: {} (dark_pool_only={}, min_trade_size={})",
        if config.use_trades_files { "trades" } else { "day aggs" },
        config.filter.dark_pool_only,
        config.filter.min_trade_size
    );

    let engine = PipelineEngine::from_config(config)?;

    let cancel = engine.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupt received, cancelling");
            cancel.cancel();
        }
    });

    let report = engine.run_date(date).await;
    if let Some(err) = &report.error {
        return Err(format!("{} failed: {}", date, err).into());
    }

    let threshold = engine.config().z_score_threshold;
    let anomalies = engine.list_anomalies(date, threshold).await?;

    if args.json {
        println!(
            "{}",
            to_json(&serde_json::json!({ "report": report, "anomalies": anomalies }))
        );
    } else {
        info!("🏆 Top {} anomalies for {}", args.top.min(anomalies.len()), date);
        print!("{}", format_top_anomalies(&anomalies, args.top));
    }

    Ok(())
}
