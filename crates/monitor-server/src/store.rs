//! The process-wide cache of the latest snapshot.
//!
//! Readers load an `Arc` to the current snapshot without taking a lock; the
//! single writer builds a complete snapshot first and swaps the pointer, so a
//! reader sees either the old snapshot or the new one and never a mix.

use std::sync::{Arc, Mutex, RwLock};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use monitor_analytics::MetricsSnapshot;
use monitor_core::{Granularity, MonitorError, Result};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info};

/// A snapshot as it was published.
#[derive(Debug, Clone, Serialize)]
pub struct Published {
    /// Monotonic publish counter, starting at 1.
    pub sequence: u64,
    pub published_at: DateTime<Utc>,
    pub snapshot: MetricsSnapshot,
}

/// Latest snapshot plus the active live granularity.
pub struct MetricsStore {
    current: ArcSwapOption<Published>,
    /// Serializes publishers; holds the last sequence handed out.
    writer: Mutex<u64>,
    granularity: RwLock<Granularity>,
    refresh: Notify,
}

impl MetricsStore {
    pub fn new(granularity: Granularity) -> Self {
        Self {
            current: ArcSwapOption::empty(),
            writer: Mutex::new(0),
            granularity: RwLock::new(granularity),
            refresh: Notify::new(),
        }
    }

    /// Replace the current snapshot.
    pub fn publish(&self, snapshot: MetricsSnapshot) -> Arc<Published> {
        let mut sequence = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        *sequence += 1;
        let published = Arc::new(Published {
            sequence: *sequence,
            published_at: Utc::now(),
            snapshot,
        });
        self.current.store(Some(published.clone()));
        debug!(sequence = *sequence, "Snapshot published");
        published
    }

    /// The latest published snapshot, if any.
    pub fn current(&self) -> Option<Arc<Published>> {
        self.current.load_full()
    }

    /// Sequence of the latest publish (0 before the first).
    pub fn sequence(&self) -> u64 {
        self.current().map(|p| p.sequence).unwrap_or(0)
    }

    pub fn granularity(&self) -> Granularity {
        *self.granularity.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Select the live granularity and ask the refresh loop to recompute now.
    ///
    /// Weekly and monthly series are not switchable; those requests are
    /// rejected and the selection stays as it was. Returns the previous value.
    pub fn set_granularity(&self, granularity: Granularity) -> Result<Granularity> {
        if !granularity.is_live_switchable() {
            return Err(MonitorError::InvalidGranularity(format!(
                "'{}' is not a live time scale (expected minute, hour or day)",
                granularity
            )));
        }

        let previous = {
            let mut current = self.granularity.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *current, granularity)
        };
        info!(from = %previous, to = %granularity, "Time scale changed");
        self.request_refresh();
        Ok(previous)
    }

    /// Ask for an out-of-band recompute. Requests made before the refresh
    /// loop gets to them collapse into one.
    pub fn request_refresh(&self) {
        self.refresh.notify_one();
    }

    /// Resolves when a recompute has been requested.
    pub async fn refresh_requested(&self) {
        self.refresh.notified().await;
    }
}
