//! Core types, record sources, configuration, and events for chat-monitor.

pub mod config;
pub mod error;
pub mod event_bus;
pub mod source;
pub mod types;

pub use config::AppConfig;
pub use error::{MonitorError, Result};
pub use event_bus::{DropReason, EventBus, MonitorEvent, MonitorEventType, RefreshTrigger};
pub use source::{
    AggregatedRow, CollectionStats, CollectionStatus, ConnectionState, FileSource, MemorySource,
    RecordSource,
};
pub use types::{Granularity, InteractionRecord, RecordMetadata, Role, SessionRecord, TokenCounts};
