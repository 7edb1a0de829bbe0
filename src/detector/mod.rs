//! Baseline statistics and anomaly scoring
//!
//! ```text
//! DailyAggregate history ─→ BaselineBuilder (RollingWindow) ─→ BaselineEntry
//!                                                                  ↓
//! DailyAggregate (date) ───────────────→ AnomalyScorer (z > threshold) ─→ AnomalyEntry
//! ```
//!
//! Both stages are pure; persistence happens in the pipeline engine.

pub mod baseline;
pub mod scorer;
pub mod window;

pub use baseline::{build_baseline, BaselineBuilder, BaselineWindow};
pub use scorer::{detect_anomalies, sort_by_z_desc, z_score, AnomalyScorer};
pub use window::RollingWindow;
