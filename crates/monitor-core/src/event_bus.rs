//! Lifecycle events of the refresh loop and the subscriber fan-out.
//!
//! Events ride a `tokio::broadcast` channel. Emitting never blocks and never
//! fails; with nobody listening the event is simply dropped.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::Granularity;

const CAPACITY: usize = 1024;

/// Why a refresh pass ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTrigger {
    Interval,
    GranularityChange,
    Manual,
}

/// Why a client left the fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The client's connection closed.
    Disconnected,
    /// An update could not be queued because the receiver was gone.
    SendFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorEventType {
    RefreshStarted,
    SnapshotPublished,
    RefreshSkipped,
    GranularityChanged,
    ClientConnected,
    ClientDropped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    RefreshStarted {
        trigger: RefreshTrigger,
    },
    SnapshotPublished {
        sequence: u64,
        trigger: RefreshTrigger,
        scale: Granularity,
        /// Clients the update was queued for.
        delivered: usize,
        /// Clients whose queue was full; they skip this update.
        lagged: usize,
        dropped: usize,
    },
    RefreshSkipped {
        trigger: RefreshTrigger,
        error: String,
    },
    GranularityChanged {
        from: Granularity,
        to: Granularity,
        /// None when the change came through the HTTP API.
        client: Option<Uuid>,
    },
    ClientConnected {
        client: Uuid,
        clients: usize,
    },
    ClientDropped {
        client: Uuid,
        reason: DropReason,
    },
}

impl MonitorEvent {
    pub fn event_type(&self) -> MonitorEventType {
        match self {
            MonitorEvent::RefreshStarted { .. } => MonitorEventType::RefreshStarted,
            MonitorEvent::SnapshotPublished { .. } => MonitorEventType::SnapshotPublished,
            MonitorEvent::RefreshSkipped { .. } => MonitorEventType::RefreshSkipped,
            MonitorEvent::GranularityChanged { .. } => MonitorEventType::GranularityChanged,
            MonitorEvent::ClientConnected { .. } => MonitorEventType::ClientConnected,
            MonitorEvent::ClientDropped { .. } => MonitorEventType::ClientDropped,
        }
    }
}

/// Broadcast channel shared by the refresh loop, the fan-out and observers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CAPACITY);
        Self { sender }
    }

    /// Send `event` to every subscriber; returns how many received it.
    pub fn emit(&self, event: MonitorEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to the given event types only.
    pub fn subscribe_filtered(&self, types: Vec<MonitorEventType>) -> FilteredSubscriber {
        FilteredSubscriber {
            receiver: self.sender.subscribe(),
            filter: types.into_iter().collect(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FilteredSubscriber {
    receiver: broadcast::Receiver<MonitorEvent>,
    filter: HashSet<MonitorEventType>,
}

impl FilteredSubscriber {
    /// Next event matching the filter; others are skipped.
    pub async fn recv(&mut self) -> Result<MonitorEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.contains(&event.event_type()) {
                return Ok(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(
            bus.emit(MonitorEvent::RefreshStarted {
                trigger: RefreshTrigger::Manual
            }),
            0
        );
    }

    #[tokio::test]
    async fn test_filtered_subscriber_skips_other_types() {
        let bus = EventBus::new();
        let mut dropped = bus.subscribe_filtered(vec![MonitorEventType::ClientDropped]);
        let client = Uuid::new_v4();

        bus.emit(MonitorEvent::ClientConnected { client, clients: 1 });
        assert_eq!(
            bus.emit(MonitorEvent::ClientDropped {
                client,
                reason: DropReason::SendFailed,
            }),
            1
        );

        assert_eq!(
            dropped.recv().await.unwrap(),
            MonitorEvent::ClientDropped {
                client,
                reason: DropReason::SendFailed,
            }
        );
    }

    #[test]
    fn test_event_wire_shape() {
        let event = MonitorEvent::GranularityChanged {
            from: Granularity::Day,
            to: Granularity::Hour,
            client: None,
        };
        assert_eq!(event.event_type(), MonitorEventType::GranularityChanged);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "granularity_changed");
        assert_eq!(json["from"], "day");
        assert_eq!(json["to"], "hour");
        assert!(json["client"].is_null());
    }
}
