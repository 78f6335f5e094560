//! Turning raw records into a [`MetricsSnapshot`].
//!
//! The [`Aggregator`] is a pure function of its input: the same
//! [`AggregationInput`], scale and timestamp always produce the same snapshot.
//! Missing fields degrade to defaults (0, empty, `"unknown"`) instead of
//! failing the pass.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Timelike, Utc};
use monitor_core::source::group_records;
use monitor_core::{
    AggregatedRow, CollectionStats, Granularity, InteractionRecord, SessionRecord, TokenCounts,
};
use tracing::debug;

use crate::buckets::{role_totals, summarize_periods};
use crate::pricing::PricingTable;
use crate::snapshot::{
    MessagesPerSession, MetricsSnapshot, ModelMetrics, ModelStats, PerformanceMetrics,
    PeriodSummary, TokenUsagePoint, UsageMetrics, UserMetrics,
};
use crate::stats::{ratio, SampleStats};

/// Label used when a model, browser, OS or address is missing.
pub const UNKNOWN: &str = "unknown";

/// Default number of histogram bins.
pub const DEFAULT_BINS: usize = 10;

/// Everything one aggregation pass consumes.
#[derive(Debug, Clone, Default)]
pub struct AggregationInput {
    pub sessions: Vec<SessionRecord>,
    /// Number of messages found for each entry of `sessions`.
    pub session_message_counts: Vec<usize>,
    /// Pre-grouped `(label, role)` rows per granularity.
    pub grouped: BTreeMap<Granularity, Vec<AggregatedRow>>,
    /// Raw messages in the query window (latency samples and model usage).
    pub messages: Vec<InteractionRecord>,
    pub collection: CollectionStats,
}

impl AggregationInput {
    /// Build an input from raw records, grouping them for every granularity.
    pub fn from_records(sessions: Vec<SessionRecord>, messages: Vec<InteractionRecord>) -> Self {
        let mut per_session: HashMap<&str, usize> = HashMap::new();
        for message in &messages {
            *per_session.entry(message.session_id.as_str()).or_insert(0) += 1;
        }
        let session_message_counts = sessions
            .iter()
            .map(|s| per_session.get(s.id.as_str()).copied().unwrap_or(0))
            .collect();

        let grouped = Granularity::ALL
            .iter()
            .map(|g| (*g, group_records(&messages, *g)))
            .collect();

        let collection = CollectionStats {
            items_processed: messages.len() as u64,
            items_collected: messages.len() as u64,
            malformed: 0,
        };

        Self {
            sessions,
            session_message_counts,
            grouped,
            messages,
            collection,
        }
    }

    fn rows(&self, granularity: Granularity) -> &[AggregatedRow] {
        self.grouped
            .get(&granularity)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Computes usage, performance, model and user metrics.
#[derive(Debug, Clone)]
pub struct Aggregator {
    pricing: PricingTable,
    bins: usize,
}

impl Aggregator {
    pub fn new(pricing: PricingTable, bins: usize) -> Self {
        Self { pricing, bins }
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    /// Run every calculation and assemble a snapshot for `scale`.
    pub fn aggregate(
        &self,
        input: &AggregationInput,
        scale: Granularity,
        now: DateTime<Utc>,
    ) -> MetricsSnapshot {
        let usage = self.calculate_usage(input);
        let performance = self.calculate_performance(input, &usage.daily);
        let model = self.calculate_model(&input.messages);
        let user = self.calculate_user(&input.sessions);

        debug!(
            sessions = usage.total_sessions,
            messages = input.messages.len(),
            models = model.models.len(),
            scale = %scale,
            "Aggregated metrics"
        );

        MetricsSnapshot {
            usage,
            performance,
            model,
            user,
            scale,
            collection: input.collection,
            generated_at: now,
        }
    }

    /// Session counts, message volume and the period series for every granularity.
    pub fn calculate_usage(&self, input: &AggregationInput) -> UsageMetrics {
        let total_sessions = input.sessions.len() as u64;
        let active_sessions = input.sessions.iter().filter(|s| s.active).count() as u64;

        let counts = &input.session_message_counts;
        let messages_per_session = if counts.is_empty() {
            MessagesPerSession::default()
        } else {
            MessagesPerSession {
                avg: counts.iter().sum::<usize>() as f64 / counts.len() as f64,
                min: counts.iter().copied().min().unwrap_or(0) as u64,
                max: counts.iter().copied().max().unwrap_or(0) as u64,
            }
        };

        let daily = summarize_periods(input.rows(Granularity::Day));
        let totals = role_totals(&daily);
        let user_messages = totals.get(&monitor_core::Role::User).copied().unwrap_or(0);
        let assistant_messages = totals
            .get(&monitor_core::Role::Assistant)
            .copied()
            .unwrap_or(0);

        UsageMetrics {
            total_sessions,
            active_sessions,
            completed_sessions: total_sessions - active_sessions,
            active_ratio: ratio(active_sessions as f64, total_sessions as f64),
            messages_per_session,
            user_messages,
            assistant_messages,
            message_ratio: ratio(user_messages as f64, assistant_messages as f64),
            minute: summarize_periods(input.rows(Granularity::Minute)),
            hourly: summarize_periods(input.rows(Granularity::Hour)),
            daily,
            weekly: summarize_periods(input.rows(Granularity::Week)),
            monthly: summarize_periods(input.rows(Granularity::Month)),
        }
    }

    /// Processing-time statistics, daily token usage and token efficiency.
    pub fn calculate_performance(
        &self,
        input: &AggregationInput,
        daily: &[PeriodSummary],
    ) -> PerformanceMetrics {
        let samples: Vec<f64> = input
            .messages
            .iter()
            .filter_map(InteractionRecord::processing_sample)
            .collect();

        let token_usage: Vec<TokenUsagePoint> = daily
            .iter()
            .map(|p| TokenUsagePoint {
                date: p.date.clone(),
                prompt_tokens: p.prompt_tokens,
                completion_tokens: p.completion_tokens,
                total_tokens: p.total_tokens,
            })
            .collect();

        PerformanceMetrics {
            processing_time: SampleStats::from_samples(&samples, self.bins),
            token_efficiency: token_efficiency(daily),
            token_usage,
        }
    }

    /// Usage, tokens, latency and estimated cost per model.
    pub fn calculate_model(&self, messages: &[InteractionRecord]) -> ModelMetrics {
        let mut usage: BTreeMap<String, (u64, TokenCounts, Vec<f64>)> = BTreeMap::new();

        for message in messages {
            let name = message.model_name().unwrap_or(UNKNOWN);
            let (count, tokens, samples) = usage.entry(name.to_string()).or_default();
            *count += 1;
            tokens.add(&message.tokens);
            if let Some(t) = message.processing_time.filter(|t| t.is_finite()) {
                samples.push(t);
            }
        }

        let models = usage
            .into_iter()
            .map(|(name, (count, tokens, samples))| {
                let stats = ModelStats {
                    usage: count,
                    tokens,
                    avg_processing_time: crate::stats::mean(&samples),
                    cost: self.pricing.estimate(&name, &tokens),
                };
                (name, stats)
            })
            .collect();

        ModelMetrics { models }
    }

    /// Unique users, client distributions, session durations and start hours.
    pub fn calculate_user(&self, sessions: &[SessionRecord]) -> UserMetrics {
        let mut users: HashSet<&str> = HashSet::new();
        let mut geo = BTreeMap::new();
        let mut browsers = BTreeMap::new();
        let mut systems = BTreeMap::new();
        let mut hours: BTreeMap<u32, u64> = (0..24).map(|h| (h, 0)).collect();
        let mut durations = Vec::new();

        for session in sessions {
            if let Some(user) = session.user_id.as_deref().filter(|u| !u.is_empty()) {
                users.insert(user);
            }

            let meta = &session.metadata;
            bump(&mut geo, meta.ip_address.as_deref());
            bump(&mut browsers, meta.browser.as_deref());
            bump(&mut systems, meta.os.as_deref());

            if let Some(start) = session.start_time {
                *hours.entry(start.hour()).or_insert(0) += 1;
            }
            if let Some(d) = session.duration_secs() {
                if d < 0.0 {
                    debug!(session = %session.id, duration = d, "Session ends before it starts");
                }
                durations.push(d);
            }
        }

        UserMetrics {
            unique_users: users.len() as u64,
            geo_distribution: geo,
            browser_distribution: browsers,
            os_distribution: systems,
            session_duration: SampleStats::from_samples(&durations, self.bins),
            hour_distribution: hours,
        }
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(PricingTable::default(), DEFAULT_BINS)
    }
}

/// Completion tokens per prompt token across all periods; 0 without prompt tokens.
pub fn token_efficiency(periods: &[PeriodSummary]) -> f64 {
    let prompt = periods
        .iter()
        .fold(0u64, |acc, p| acc.saturating_add(p.prompt_tokens));
    let completion = periods
        .iter()
        .fold(0u64, |acc, p| acc.saturating_add(p.completion_tokens));
    ratio(completion as f64, prompt as f64)
}

fn bump(counts: &mut BTreeMap<String, u64>, key: Option<&str>) {
    let key = key.map(str::trim).filter(|k| !k.is_empty()).unwrap_or(UNKNOWN);
    *counts.entry(key.to_string()).or_insert(0) += 1;
}
