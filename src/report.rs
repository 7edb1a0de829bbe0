//! Plain-text and JSON renderings of detected anomalies

use crate::types::AnomalyEntry;
use serde::Serialize;

/// Fixed-width table of the `n` highest-scoring anomalies
///
/// Entries are re-sorted by z-score, so callers may pass them in any order.
pub fn format_top_anomalies(entries: &[AnomalyEntry], n: usize) -> String {
    let mut sorted: Vec<&AnomalyEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| b.z_score.total_cmp(&a.z_score).then_with(|| a.ticker.cmp(&b.ticker)));

    let mut out = format!(
        "{:<8} {:>10} {:>10} {:>8} {:>9} {:>10}\n",
        "TICKER", "TRADES", "AVG", "Z", "CHG%", "CLOSE"
    );
    out.push_str(&"-".repeat(60));
    out.push('\n');

    for a in sorted.into_iter().take(n) {
        out.push_str(&format!(
            "{:<8} {:>10} {:>10.0} {:>8.2} {:>+9.2} {:>10.2}\n",
            a.ticker, a.trades, a.avg_trades, a.z_score, a.price_diff_pct, a.close_price
        ));
    }
    out
}

/// Pretty JSON for `entries`, or `[]` if serialization fails
pub fn to_json<T: Serialize>(entries: &T) -> String {
    serde_json::to_string_pretty(entries).unwrap_or_else(|e| {
        log::warn!("⚠️  Failed to serialize report: {}", e);
        "[]".to_string()
    })
}
