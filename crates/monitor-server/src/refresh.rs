//! The background task that keeps the metrics store current.
//!
//! Each pass walks `Idle → Collecting → Aggregating → Publishing → Idle`.
//! Passes run on a fixed interval and additionally whenever a client changes
//! the time scale. A failed pass is logged and skipped; the previous snapshot
//! stays live and the next tick tries again.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use monitor_analytics::{AggregationInput, Aggregator, PricingTable};
use monitor_core::config::SourceConfig;
use monitor_core::{
    CollectionStats, ConnectionState, Granularity, MonitorError, MonitorEvent, RecordSource,
    Result,
};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::fanout::ServerMessage;
use crate::state::ServiceContext;
use crate::store::Published;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshState {
    Idle,
    Collecting,
    Aggregating,
    Publishing,
    Stopped,
}

pub use monitor_core::RefreshTrigger;

/// Read one window of records from `source`.
///
/// Reconnects first if the source is not ready. The window is pinned once so
/// every query of the pass sees the same rows, and messages are read in pages
/// of `batch_size`. If the source drops out while reading, the partial result
/// is discarded and the pass fails with `SourceUnavailable`.
pub async fn collect(source: &dyn RecordSource, config: &SourceConfig) -> Result<AggregationInput> {
    if source.state() != ConnectionState::Ready {
        debug!(source = source.name(), "Source not ready, reconnecting");
        source.connect().await?;
    }
    source.pin_window(Utc::now());

    let sessions = source.get_sessions(config.session_limit, false).await;

    let mut session_message_counts = Vec::with_capacity(sessions.len());
    for session in &sessions {
        let messages = source
            .get_messages_for_session(&session.id, config.messages_per_session_limit)
            .await;
        session_message_counts.push(messages.len());
    }

    let mut grouped = BTreeMap::new();
    for granularity in Granularity::ALL {
        grouped.insert(granularity, source.get_aggregated(granularity).await);
    }

    let batch = config.batch_size.max(1);
    let mut messages = Vec::new();
    loop {
        let page = source.get_messages(messages.len(), batch).await;
        let n = page.len();
        messages.extend(page);
        if n < batch {
            break;
        }
    }

    if source.state() != ConnectionState::Ready {
        return Err(MonitorError::SourceUnavailable(format!(
            "{} went away during collection",
            source.name()
        )));
    }

    let malformed = source.malformed_count();
    let collected = (sessions.len() + messages.len()) as u64;
    let collection = CollectionStats {
        items_processed: collected + malformed,
        items_collected: collected,
        malformed,
    };
    debug!(
        sessions = sessions.len(),
        messages = messages.len(),
        malformed,
        status = ?collection.status(),
        "Collected records"
    );

    Ok(AggregationInput {
        sessions,
        session_message_counts,
        grouped,
        messages,
        collection,
    })
}

/// Periodic collect/aggregate/publish task.
pub struct RefreshLoop {
    ctx: ServiceContext,
    source: Arc<dyn RecordSource>,
    aggregator: Aggregator,
    interval: Duration,
}

impl RefreshLoop {
    pub fn new(ctx: ServiceContext, source: Arc<dyn RecordSource>) -> Self {
        let refresh = &ctx.config.refresh;
        let aggregator = Aggregator::new(
            PricingTable::from_config(&ctx.config.pricing),
            refresh.histogram_bins,
        );
        let interval = Duration::from_secs(refresh.interval_secs.max(1));
        Self {
            ctx,
            source,
            aggregator,
            interval,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    fn transition(&self, state: RefreshState) {
        debug!(state = ?state, "Refresh state");
        self.ctx.set_refresh_state(state);
    }

    /// Run one pass and publish the result.
    pub async fn refresh_once(&self, trigger: RefreshTrigger) -> Result<Arc<Published>> {
        self.ctx.events.emit(MonitorEvent::RefreshStarted { trigger });

        self.transition(RefreshState::Collecting);
        let input = collect(self.source.as_ref(), &self.ctx.config.source).await?;

        self.transition(RefreshState::Aggregating);
        let scale = self.ctx.store.granularity();
        let aggregator = self.aggregator.clone();
        let snapshot =
            tokio::task::spawn_blocking(move || aggregator.aggregate(&input, scale, Utc::now()))
                .await
                .map_err(|e| MonitorError::Aggregation(e.to_string()))?;

        self.transition(RefreshState::Publishing);
        let published = self.ctx.store.publish(snapshot);
        let report = self.ctx.fanout.broadcast(&ServerMessage::update(&published));
        self.ctx.events.emit(MonitorEvent::SnapshotPublished {
            sequence: published.sequence,
            trigger,
            scale,
            delivered: report.delivered,
            lagged: report.lagged,
            dropped: report.dropped,
        });
        debug!(
            sequence = published.sequence,
            scale = %scale,
            clients = report.delivered,
            "Refresh complete"
        );

        self.transition(RefreshState::Idle);
        Ok(published)
    }

    async fn tick(&self, trigger: RefreshTrigger) {
        if let Err(e) = self.refresh_once(trigger).await {
            warn!(error = %e, trigger = ?trigger, "Refresh skipped, keeping previous snapshot");
            self.ctx.events.emit(MonitorEvent::RefreshSkipped {
                trigger,
                error: e.to_string(),
            });
            self.transition(RefreshState::Idle);
        }
    }

    /// Run until the context's shutdown token fires, then release the source.
    pub async fn run(self) {
        let shutdown = self.ctx.shutdown.clone();
        info!(
            source = self.source.name(),
            interval_secs = self.interval.as_secs(),
            scale = %self.ctx.store.granularity(),
            "Refresh loop started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let trigger = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.ctx.store.refresh_requested() => RefreshTrigger::GranularityChange,
                _ = ticker.tick() => RefreshTrigger::Interval,
            };

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.tick(trigger) => {}
            }

            if trigger == RefreshTrigger::GranularityChange {
                ticker.reset();
            }
        }

        self.transition(RefreshState::Stopped);
        self.source.close().await;
        info!("Refresh loop stopped");
    }
}
