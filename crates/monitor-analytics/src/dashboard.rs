//! Chart-ready view of a [`MetricsSnapshot`].
//!
//! This is the body of every live update pushed to dashboard clients: the
//! snapshot flattened into parallel arrays, with the time series taken from
//! the snapshot's active scale.

use chrono::{DateTime, Utc};
use monitor_core::{Granularity, Role};
use serde::{Deserialize, Serialize};

use crate::snapshot::{MetricsSnapshot, ModelMetrics, PerformanceMetrics, PeriodSummary, UserMetrics};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardSummary {
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub user_messages: u64,
    pub assistant_messages: u64,
    pub avg_processing_time: f64,
    pub token_efficiency: f64,
    pub unique_users: u64,
    pub total_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub dates: Vec<String>,
    pub user_messages: Vec<u64>,
    pub assistant_messages: Vec<u64>,
    pub total_tokens: Vec<u64>,
    pub processing_times: Vec<f64>,
    pub scale: Granularity,
}

impl TimeSeries {
    pub fn from_periods(periods: &[PeriodSummary], scale: Granularity) -> Self {
        Self {
            dates: periods.iter().map(|p| p.date.clone()).collect(),
            user_messages: periods.iter().map(|p| p.message_count(Role::User)).collect(),
            assistant_messages: periods
                .iter()
                .map(|p| p.message_count(Role::Assistant))
                .collect(),
            total_tokens: periods.iter().map(|p| p.total_tokens).collect(),
            processing_times: periods.iter().map(|p| p.avg_processing_time).collect(),
            scale,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTokenRow {
    pub model: String,
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCostRow {
    pub model: String,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelData {
    pub models: Vec<String>,
    pub usage_counts: Vec<u64>,
    pub processing_times: Vec<f64>,
    pub token_data: Vec<ModelTokenRow>,
    pub cost_data: Vec<ModelCostRow>,
}

impl From<&ModelMetrics> for ModelData {
    fn from(metrics: &ModelMetrics) -> Self {
        let mut data = ModelData {
            models: Vec::new(),
            usage_counts: Vec::new(),
            processing_times: Vec::new(),
            token_data: Vec::new(),
            cost_data: Vec::new(),
        };
        for (name, stats) in &metrics.models {
            data.models.push(name.clone());
            data.usage_counts.push(stats.usage);
            data.processing_times.push(stats.avg_processing_time);
            data.token_data.push(ModelTokenRow {
                model: name.clone(),
                prompt: stats.tokens.prompt,
                completion: stats.tokens.completion,
                total: stats.tokens.total,
            });
            data.cost_data.push(ModelCostRow {
                model: name.clone(),
                input_cost: stats.cost.input_cost,
                output_cost: stats.cost.output_cost,
                total_cost: stats.cost.total_cost,
            });
        }
        data
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserData {
    pub browsers: Vec<String>,
    pub browser_counts: Vec<u64>,
    pub os_names: Vec<String>,
    pub os_counts: Vec<u64>,
    pub hours: Vec<String>,
    pub hour_counts: Vec<u64>,
    pub avg_session_duration: f64,
    pub median_session_duration: f64,
    pub duration_distribution: Vec<u64>,
}

impl From<&UserMetrics> for UserData {
    fn from(user: &UserMetrics) -> Self {
        Self {
            browsers: user.browser_distribution.keys().cloned().collect(),
            browser_counts: user.browser_distribution.values().copied().collect(),
            os_names: user.os_distribution.keys().cloned().collect(),
            os_counts: user.os_distribution.values().copied().collect(),
            hours: (0..24u32).map(|h| h.to_string()).collect(),
            hour_counts: (0..24u32)
                .map(|h| user.hour_distribution.get(&h).copied().unwrap_or(0))
                .collect(),
            avg_session_duration: user.session_duration.avg,
            median_session_duration: user.session_duration.median,
            duration_distribution: user.session_duration.distribution.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceData {
    pub avg_processing_time: f64,
    pub median_processing_time: f64,
    pub p90_processing_time: f64,
    pub p95_processing_time: f64,
    pub p99_processing_time: f64,
    pub processing_time_distribution: Vec<u64>,
    pub token_efficiency: f64,
    pub dates: Vec<String>,
    pub prompt_tokens: Vec<u64>,
    pub completion_tokens: Vec<u64>,
    pub total_tokens: Vec<u64>,
}

impl From<&PerformanceMetrics> for PerformanceData {
    fn from(perf: &PerformanceMetrics) -> Self {
        let pt = &perf.processing_time;
        Self {
            avg_processing_time: pt.avg,
            median_processing_time: pt.median,
            p90_processing_time: pt.p90,
            p95_processing_time: pt.p95,
            p99_processing_time: pt.p99,
            processing_time_distribution: pt.distribution.clone(),
            token_efficiency: perf.token_efficiency,
            dates: perf.token_usage.iter().map(|t| t.date.clone()).collect(),
            prompt_tokens: perf.token_usage.iter().map(|t| t.prompt_tokens).collect(),
            completion_tokens: perf.token_usage.iter().map(|t| t.completion_tokens).collect(),
            total_tokens: perf.token_usage.iter().map(|t| t.total_tokens).collect(),
        }
    }
}

/// The full live-update payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardPayload {
    pub summary: DashboardSummary,
    pub time_series: TimeSeries,
    pub model: ModelData,
    pub user: UserData,
    pub performance: PerformanceData,
    pub timestamp: DateTime<Utc>,
    pub time_scale: Granularity,
}

impl DashboardPayload {
    pub fn from_snapshot(snapshot: &MetricsSnapshot) -> Self {
        let usage = &snapshot.usage;
        let scale = snapshot.scale;

        Self {
            summary: DashboardSummary {
                total_sessions: usage.total_sessions,
                active_sessions: usage.active_sessions,
                user_messages: usage.user_messages,
                assistant_messages: usage.assistant_messages,
                avg_processing_time: snapshot.performance.processing_time.avg,
                token_efficiency: snapshot.performance.token_efficiency,
                unique_users: snapshot.user.unique_users,
                total_cost: snapshot.model.total_cost(),
            },
            time_series: TimeSeries::from_periods(usage.series(scale), scale),
            model: ModelData::from(&snapshot.model),
            user: UserData::from(&snapshot.user),
            performance: PerformanceData::from(&snapshot.performance),
            timestamp: snapshot.generated_at,
            time_scale: scale,
        }
    }
}
