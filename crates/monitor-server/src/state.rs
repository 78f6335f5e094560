use std::sync::Arc;

use monitor_core::{AppConfig, EventBus, Granularity, MonitorEvent, Result};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::fanout::{ClientId, Fanout};
use crate::refresh::RefreshState;
use crate::store::MetricsStore;

/// Shared service state, handed to the refresh loop and every request handler.
#[derive(Clone)]
pub struct ServiceContext {
    pub config: Arc<AppConfig>,
    pub store: Arc<MetricsStore>,
    pub fanout: Arc<Fanout>,
    pub events: EventBus,
    pub shutdown: CancellationToken,
    refresh_state: Arc<watch::Sender<RefreshState>>,
}

impl ServiceContext {
    pub fn new(config: AppConfig) -> Self {
        let events = EventBus::new();
        let store = MetricsStore::new(config.refresh.default_scale);
        let fanout = Fanout::new(config.server.client_buffer, events.clone());
        let (refresh_state, _) = watch::channel(RefreshState::Idle);

        Self {
            config: Arc::new(config),
            store: Arc::new(store),
            fanout: Arc::new(fanout),
            events,
            shutdown: CancellationToken::new(),
            refresh_state: Arc::new(refresh_state),
        }
    }

    pub fn refresh_state(&self) -> RefreshState {
        *self.refresh_state.borrow()
    }

    /// Watch refresh state transitions.
    pub fn watch_refresh_state(&self) -> watch::Receiver<RefreshState> {
        self.refresh_state.subscribe()
    }

    pub(crate) fn set_refresh_state(&self, state: RefreshState) {
        self.refresh_state.send_replace(state);
    }

    /// Handle a time-scale request from a client (or the HTTP API when
    /// `client` is None).
    ///
    /// On success the selection is updated for every client and a recompute
    /// is queued; on failure nothing changes and the error goes back to the
    /// caller only.
    pub fn change_granularity(&self, client: Option<ClientId>, scale: &str) -> Result<Granularity> {
        let granularity = Granularity::parse_live(scale)?;
        let previous = self.store.set_granularity(granularity)?;
        self.events.emit(MonitorEvent::GranularityChanged {
            from: previous,
            to: granularity,
            client,
        });
        Ok(granularity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use monitor_core::{MonitorError, MonitorEventType};

    #[tokio::test]
    async fn test_change_granularity_updates_store_and_emits() {
        let ctx = ServiceContext::new(AppConfig::default());
        let mut events = ctx
            .events
            .subscribe_filtered(vec![MonitorEventType::GranularityChanged]);

        assert_eq!(ctx.change_granularity(None, "hour").unwrap(), Granularity::Hour);
        assert_eq!(ctx.store.granularity(), Granularity::Hour);

        assert_eq!(
            events.recv().await.unwrap(),
            MonitorEvent::GranularityChanged {
                from: Granularity::Day,
                to: Granularity::Hour,
                client: None,
            }
        );
    }

    #[test]
    fn test_invalid_granularity_leaves_selection() {
        let ctx = ServiceContext::new(AppConfig::default());
        for bad in ["week", "month", "fortnight", ""] {
            let err = ctx.change_granularity(None, bad).unwrap_err();
            assert!(matches!(err, MonitorError::InvalidGranularity(_)));
        }
        assert_eq!(ctx.store.granularity(), Granularity::Day);
    }

    #[test]
    fn test_refresh_state_starts_idle() {
        let ctx = ServiceContext::new(AppConfig::default());
        assert_eq!(ctx.refresh_state(), RefreshState::Idle);
        ctx.set_refresh_state(RefreshState::Collecting);
        assert_eq!(*ctx.watch_refresh_state().borrow(), RefreshState::Collecting);
    }
}
