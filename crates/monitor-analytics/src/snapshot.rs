//! The immutable aggregation result published on every refresh.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use monitor_core::{CollectionStats, Granularity, Role, TokenCounts};
use serde::{Deserialize, Serialize};

use crate::pricing::CostBreakdown;
use crate::stats::SampleStats;

/// All roles' activity within one time bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodSummary {
    /// Bucket label, e.g. `2024-01-01` for a day.
    pub date: String,
    pub messages: BTreeMap<Role, u64>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// Average assistant processing time in the bucket; 0 if none.
    pub avg_processing_time: f64,
}

impl PeriodSummary {
    pub fn new(date: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            ..Self::default()
        }
    }

    pub fn message_count(&self, role: Role) -> u64 {
        self.messages.get(&role).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagesPerSession {
    pub avg: f64,
    pub min: u64,
    pub max: u64,
}

/// Session and message volume plus every granularity's period series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub completed_sessions: u64,
    pub active_ratio: f64,
    pub messages_per_session: MessagesPerSession,
    pub user_messages: u64,
    pub assistant_messages: u64,
    /// user / assistant messages, 0 when there are no assistant messages.
    pub message_ratio: f64,
    pub minute: Vec<PeriodSummary>,
    pub hourly: Vec<PeriodSummary>,
    pub daily: Vec<PeriodSummary>,
    pub weekly: Vec<PeriodSummary>,
    pub monthly: Vec<PeriodSummary>,
}

impl UsageMetrics {
    /// The period series for one granularity.
    pub fn series(&self, granularity: Granularity) -> &[PeriodSummary] {
        match granularity {
            Granularity::Minute => &self.minute,
            Granularity::Hour => &self.hourly,
            Granularity::Day => &self.daily,
            Granularity::Week => &self.weekly,
            Granularity::Month => &self.monthly,
        }
    }
}

/// Token usage for one day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsagePoint {
    pub date: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub processing_time: SampleStats,
    pub token_usage: Vec<TokenUsagePoint>,
    /// completion / prompt tokens, 0 when no prompt tokens were used.
    pub token_efficiency: f64,
}

/// Usage, tokens, latency and cost for one model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    pub usage: u64,
    pub tokens: TokenCounts,
    pub avg_processing_time: f64,
    pub cost: CostBreakdown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub models: BTreeMap<String, ModelStats>,
}

impl ModelMetrics {
    pub fn total_cost(&self) -> f64 {
        self.models.values().map(|m| m.cost.total_cost).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserMetrics {
    pub unique_users: u64,
    pub geo_distribution: BTreeMap<String, u64>,
    pub browser_distribution: BTreeMap<String, u64>,
    pub os_distribution: BTreeMap<String, u64>,
    /// Session lengths in seconds.
    pub session_duration: SampleStats,
    /// Sessions started per UTC hour; always holds keys 0 through 23.
    pub hour_distribution: BTreeMap<u32, u64>,
}

/// One complete, immutable aggregation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub usage: UsageMetrics,
    pub performance: PerformanceMetrics,
    pub model: ModelMetrics,
    pub user: UserMetrics,
    /// Granularity selected for the live series when this snapshot was built.
    pub scale: Granularity,
    pub collection: CollectionStats,
    pub generated_at: DateTime<Utc>,
}
