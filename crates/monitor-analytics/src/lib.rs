//! Aggregation and statistics for chat-monitor.
//!
//! Turns raw session and message records into time-bucketed summaries,
//! latency percentiles, histograms, cost estimates and the dashboard payload.

pub mod aggregations;
pub mod buckets;
pub mod dashboard;
pub mod pricing;
pub mod snapshot;
pub mod stats;

pub use aggregations::{AggregationInput, Aggregator};
pub use dashboard::DashboardPayload;
pub use pricing::{CostBreakdown, PricingTable};
pub use snapshot::{MetricsSnapshot, PeriodSummary};
pub use stats::SampleStats;
