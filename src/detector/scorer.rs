//! Z-score anomaly scoring

use crate::types::{AnomalyEntry, BaselineEntry, DailyAggregate};
use chrono::NaiveDate;
use std::cmp::Ordering;
use std::collections::HashMap;

pub struct AnomalyScorer {
    threshold: f64,
}

impl AnomalyScorer {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn with_defaults() -> Self {
        Self::new(3.0)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Score every aggregate on `date` against its baseline
    ///
    /// Tickers with no baseline, or a baseline with zero spread, are skipped.
    /// Only `z > threshold` (strict) is reported. Output is ordered by z-score
    /// descending, ticker ascending on ties.
    pub fn score(
        &self,
        date: NaiveDate,
        aggregates: &[DailyAggregate],
        baselines: &HashMap<String, BaselineEntry>,
    ) -> Vec<AnomalyEntry> {
        let mut anomalies: Vec<AnomalyEntry> = aggregates
            .iter()
            .filter(|agg| agg.date == date)
            .filter_map(|agg| {
                let baseline = baselines.get(&agg.ticker).filter(|b| b.date == date)?;
                let z = z_score(agg.transactions, baseline)?;

                if z > self.threshold {
                    Some(AnomalyEntry {
                        ticker: agg.ticker.clone(),
                        date,
                        trades: agg.transactions,
                        avg_trades: baseline.avg_trades,
                        std_trades: baseline.std_trades,
                        z_score: z,
                        close_price: agg.close,
                        price_diff_pct: baseline.price_diff_pct,
                        volume: agg.volume,
                    })
                } else {
                    None
                }
            })
            .collect();

        sort_by_z_desc(&mut anomalies);
        anomalies
    }
}

/// `(observed - mean) / std`, or `None` when the spread is not positive
pub fn z_score(observed: u64, baseline: &BaselineEntry) -> Option<f64> {
    if !(baseline.std_trades > 0.0) {
        return None;
    }
    Some((observed as f64 - baseline.avg_trades) / baseline.std_trades)
}

pub fn detect_anomalies(
    date: NaiveDate,
    aggregates: &[DailyAggregate],
    baselines: &HashMap<String, BaselineEntry>,
    threshold: f64,
) -> Vec<AnomalyEntry> {
    AnomalyScorer::new(threshold).score(date, aggregates, baselines)
}

pub fn sort_by_z_desc(anomalies: &mut [AnomalyEntry]) {
    anomalies.sort_by(|a, b| match b.z_score.total_cmp(&a.z_score) {
        Ordering::Equal => a.ticker.cmp(&b.ticker),
        other => other,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    fn aggregate(ticker: &str, transactions: u64) -> DailyAggregate {
        DailyAggregate {
            ticker: ticker.to_string(),
            date: date(),
            open: 10.0,
            high: 12.0,
            low: 9.5,
            close: 11.0,
            volume: transactions * 150,
            transactions,
        }
    }

    fn baseline(ticker: &str, avg: f64, std: f64) -> BaselineEntry {
        BaselineEntry {
            ticker: ticker.to_string(),
            date: date(),
            avg_trades: avg,
            std_trades: std,
            prev_close: Some(10.0),
            price_diff_pct: 10.0,
        }
    }

    fn baselines(entries: Vec<BaselineEntry>) -> HashMap<String, BaselineEntry> {
        entries.into_iter().map(|b| (b.ticker.clone(), b)).collect()
    }

    #[test]
    fn test_spike_flagged() {
        let std = 62.5f64.sqrt();
        let result = detect_anomalies(
            date(),
            &[aggregate("A", 500)],
            &baselines(vec![baseline("A", 100.0, std)]),
            3.0,
        );

        assert_eq!(result.len(), 1);
        let a = &result[0];
        assert!((a.z_score - 50.596).abs() < 1e-3);
        assert_eq!(a.trades, 500);
        assert_eq!(a.avg_trades, 100.0);
        assert_eq!(a.close_price, 11.0);
        assert_eq!(a.price_diff_pct, 10.0);
        assert_eq!(a.volume, 75_000);
    }

    #[test]
    fn test_zero_std_never_flagged() {
        let result = detect_anomalies(
            date(),
            &[aggregate("A", 1_000_000)],
            &baselines(vec![baseline("A", 10.0, 0.0)]),
            3.0,
        );
        assert!(result.is_empty());
    }

    #[test]
    fn test_missing_baseline_skipped() {
        let result = detect_anomalies(date(), &[aggregate("A", 500)], &HashMap::new(), 3.0);
        assert!(result.is_empty());
    }

    #[test]
    fn test_threshold_is_exclusive() {
        // z = (130 - 100) / 10 = 3.0 exactly
        let result = detect_anomalies(
            date(),
            &[aggregate("A", 130)],
            &baselines(vec![baseline("A", 100.0, 10.0)]),
            3.0,
        );
        assert!(result.is_empty());

        let result = detect_anomalies(
            date(),
            &[aggregate("A", 131)],
            &baselines(vec![baseline("A", 100.0, 10.0)]),
            3.0,
        );
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_baseline_for_other_date_ignored() {
        let mut stale = baseline("A", 100.0, 10.0);
        stale.date = date().pred_opt().unwrap();

        let result = detect_anomalies(date(), &[aggregate("A", 500)], &baselines(vec![stale]), 3.0);
        assert!(result.is_empty());
    }

    #[test]
    fn test_output_sorted_and_order_independent() {
        let aggs = vec![aggregate("LOW", 140), aggregate("HIGH", 300), aggregate("MID", 200), aggregate("TIE", 200)];
        let base = baselines(vec![
            baseline("LOW", 100.0, 10.0),
            baseline("HIGH", 100.0, 10.0),
            baseline("MID", 100.0, 10.0),
            baseline("TIE", 100.0, 10.0),
        ]);

        let forward = detect_anomalies(date(), &aggs, &base, 3.0);
        let mut reversed_input = aggs.clone();
        reversed_input.reverse();
        let backward = detect_anomalies(date(), &reversed_input, &base, 3.0);

        let tickers: Vec<&str> = forward.iter().map(|a| a.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["HIGH", "MID", "TIE", "LOW"]);
        assert_eq!(forward, backward);
    }
}
