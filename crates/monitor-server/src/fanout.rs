//! Broadcasting snapshots to connected dashboard clients.
//!
//! Each client owns a bounded queue. A broadcast serializes the message once
//! and offers it to every queue without waiting: a client whose queue is full
//! misses this update, and a client whose receiving side is gone is removed.
//! Neither affects delivery to anyone else.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use monitor_analytics::DashboardPayload;
use monitor_core::{DropReason, EventBus, MonitorEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::Published;

pub type ClientId = Uuid;

/// Messages pushed to dashboard clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    MetricsUpdate {
        sequence: u64,
        data: DashboardPayload,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn update(published: &Published) -> Self {
        ServerMessage::MetricsUpdate {
            sequence: published.sequence,
            data: DashboardPayload::from_snapshot(&published.snapshot),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

/// Messages sent by dashboard clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Switch the live series to `minute`, `hour` or `day`.
    SetTimeScale { scale: String },
}

/// What happened to one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Clients whose queue was full; they skip this update.
    pub lagged: usize,
    /// Disconnected clients removed from the set.
    pub dropped: usize,
}

/// A serialized message waiting in a client's queue.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Publish sequence for snapshot updates.
    pub sequence: Option<u64>,
    pub text: Arc<str>,
}

impl Outbound {
    fn encode(message: &ServerMessage) -> serde_json::Result<Self> {
        let sequence = match message {
            ServerMessage::MetricsUpdate { sequence, .. } => Some(*sequence),
            ServerMessage::Error { .. } => None,
        };
        Ok(Self {
            sequence,
            text: Arc::from(serde_json::to_string(message)?),
        })
    }
}

/// A registered client's end of the fan-out.
pub struct ClientConnection {
    pub id: ClientId,
    pub updates: mpsc::Receiver<Outbound>,
}

/// The set of connected clients.
pub struct Fanout {
    clients: Mutex<HashMap<ClientId, mpsc::Sender<Outbound>>>,
    buffer: usize,
    events: EventBus,
}

impl Fanout {
    pub fn new(buffer: usize, events: EventBus) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
            events,
        }
    }

    /// Add a client and hand back its update queue.
    pub fn register(&self) -> ClientConnection {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.buffer);
        let count = {
            let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            clients.insert(id, tx);
            clients.len()
        };
        info!(client = %id, clients = count, "Dashboard client connected");
        self.events.emit(MonitorEvent::ClientConnected {
            client: id,
            clients: count,
        });
        ClientConnection { id, updates: rx }
    }

    /// Remove a client. Returns false if it was already gone.
    pub fn unregister(&self, id: ClientId) -> bool {
        let removed = self
            .clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some();
        if removed {
            debug!(client = %id, "Dashboard client disconnected");
            self.events.emit(MonitorEvent::ClientDropped {
                client: id,
                reason: DropReason::Disconnected,
            });
        }
        removed
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Offer `message` to every connected client.
    pub fn broadcast(&self, message: &ServerMessage) -> BroadcastReport {
        let outbound = match Outbound::encode(message) {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, "Failed to serialize broadcast message");
                return BroadcastReport::default();
            }
        };

        let mut report = BroadcastReport::default();
        let mut gone = Vec::new();
        {
            let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            for (id, tx) in clients.iter() {
                match tx.try_send(outbound.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(client = %id, "Client backlogged, skipping update");
                        report.lagged += 1;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => gone.push(*id),
                }
            }
            for id in &gone {
                clients.remove(id);
            }
        }

        report.dropped = gone.len();
        for id in gone {
            debug!(client = %id, "Dropping disconnected client");
            self.events.emit(MonitorEvent::ClientDropped {
                client: id,
                reason: DropReason::SendFailed,
            });
        }
        report
    }

    /// Send a message to one client only. Returns false if it could not be queued.
    pub fn send_to(&self, id: ClientId, message: &ServerMessage) -> bool {
        let Ok(outbound) = Outbound::encode(message) else {
            return false;
        };
        let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients
            .get(&id)
            .map(|tx| tx.try_send(outbound).is_ok())
            .unwrap_or(false)
    }

    /// Disconnect everyone. Client handlers see their queue close and hang up.
    pub fn close_all(&self) {
        let closed = {
            let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            let n = clients.len();
            clients.clear();
            n
        };
        if closed > 0 {
            info!(clients = closed, "Closed all dashboard clients");
        }
    }
}
