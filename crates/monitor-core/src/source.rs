//! Record sources: the query interface the monitor reads raw records through.
//!
//! Every query checks the connection state first and returns an empty
//! collection when the source is not ready or a read fails. Transport errors
//! never cross this boundary; only `connect` reports failure.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SourceConfig;
use crate::error::{MonitorError, Result};
use crate::types::{
    Granularity, InteractionRecord, RawMessage, RawSession, Role, SessionRecord, TokenCounts,
};

/// Connection lifecycle of a record source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
}

/// One `(time_group, role)` row of a grouped aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedRow {
    pub time_group: String,
    pub role: Role,
    pub count: u64,
    /// Mean of the processing times present in the group, if any.
    pub avg_processing_time: Option<f64>,
    pub tokens: TokenCounts,
}

/// Outcome of one collection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionStatus {
    Success,
    Partial,
    Failure,
}

/// Record counts for one collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub items_processed: u64,
    pub items_collected: u64,
    pub malformed: u64,
}

impl CollectionStats {
    pub fn status(&self) -> CollectionStatus {
        if self.items_processed == 0 || self.items_collected == self.items_processed {
            CollectionStatus::Success
        } else if self.items_collected == 0 {
            CollectionStatus::Failure
        } else {
            CollectionStatus::Partial
        }
    }
}

/// Query interface over stored sessions and messages.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    fn state(&self) -> ConnectionState;

    /// Open the source. Failing here at startup is fatal to the service.
    async fn connect(&self) -> Result<()>;

    /// Release the source; later queries return empty results.
    async fn close(&self);

    async fn get_sessions(&self, limit: usize, active_only: bool) -> Vec<SessionRecord>;

    async fn get_messages_for_session(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Vec<InteractionRecord>;

    /// One page of messages inside the source's time window, oldest first.
    async fn get_messages(&self, offset: usize, limit: usize) -> Vec<InteractionRecord>;

    /// Messages inside the time window grouped by `(label, role)`, sorted by label.
    async fn get_aggregated(&self, group_by: Granularity) -> Vec<AggregatedRow>;

    /// Fix the end of the time window at `now` for the queries that follow,
    /// so the pages of one pass see the same window. Until pinned, the
    /// window ends at the time of each query.
    fn pin_window(&self, _now: DateTime<Utc>) {}

    /// Raw rows rejected as malformed in the data the source currently holds.
    fn malformed_count(&self) -> u64 {
        0
    }
}

/// Group records by time label and role.
///
/// Output is sorted by `(time_group, role)`.
pub fn group_records<'a, I>(records: I, group_by: Granularity) -> Vec<AggregatedRow>
where
    I: IntoIterator<Item = &'a InteractionRecord>,
{
    #[derive(Default)]
    struct Acc {
        count: u64,
        tokens: TokenCounts,
        latency_sum: f64,
        latency_n: u64,
    }

    let mut groups: BTreeMap<(String, Role), Acc> = BTreeMap::new();
    for record in records {
        let acc = groups
            .entry((group_by.label(&record.timestamp), record.role))
            .or_default();
        acc.count += 1;
        acc.tokens.add(&record.tokens);
        if let Some(t) = record.processing_time.filter(|t| t.is_finite()) {
            acc.latency_sum += t;
            acc.latency_n += 1;
        }
    }

    groups
        .into_iter()
        .map(|((time_group, role), acc)| AggregatedRow {
            time_group,
            role,
            count: acc.count,
            avg_processing_time: (acc.latency_n > 0).then(|| acc.latency_sum / acc.latency_n as f64),
            tokens: acc.tokens,
        })
        .collect()
}

/// A trailing time window whose end can be pinned.
struct Window {
    length: Option<Duration>,
    pinned: RwLock<Option<DateTime<Utc>>>,
}

impl Window {
    fn new(length: Option<Duration>) -> Self {
        Self {
            length,
            pinned: RwLock::new(None),
        }
    }

    fn pin(&self, now: DateTime<Utc>) {
        if let Ok(mut pinned) = self.pinned.write() {
            *pinned = Some(now);
        }
    }

    fn bounds(&self) -> (Option<DateTime<Utc>>, DateTime<Utc>) {
        let end = self
            .pinned
            .read()
            .ok()
            .and_then(|p| *p)
            .unwrap_or_else(Utc::now);
        (self.length.map(|w| end - w), end)
    }

    /// The sub-slice of timestamp-sorted `messages` inside the window.
    fn slice<'a>(&self, messages: &'a [InteractionRecord]) -> &'a [InteractionRecord] {
        let (start, end) = self.bounds();
        let lo = start.map_or(0, |s| messages.partition_point(|m| m.timestamp < s));
        let hi = messages.partition_point(|m| m.timestamp <= end).max(lo);
        &messages[lo..hi]
    }
}

// ── In-memory source ───────────────────────────────────────────────────

#[derive(Default)]
struct MemoryData {
    sessions: Vec<SessionRecord>,
    messages: Vec<InteractionRecord>,
}

/// Record source backed by vectors in memory.
///
/// Used by tests. `set_available(false)` simulates an outage.
pub struct MemorySource {
    data: RwLock<MemoryData>,
    state: RwLock<ConnectionState>,
    reachable: AtomicBool,
    window: Window,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(MemoryData::default()),
            state: RwLock::new(ConnectionState::Disconnected),
            reachable: AtomicBool::new(true),
            window: Window::new(None),
        }
    }

    pub fn with_records(sessions: Vec<SessionRecord>, messages: Vec<InteractionRecord>) -> Self {
        let source = Self::new();
        if let Ok(mut data) = source.data.write() {
            data.sessions = sessions;
            data.messages = messages;
        }
        source
    }

    /// Restrict message queries to the last `window` before now.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = Window::new(Some(window));
        self
    }

    pub fn push_session(&self, session: SessionRecord) {
        if let Ok(mut data) = self.data.write() {
            data.sessions.push(session);
        }
    }

    pub fn push_message(&self, message: InteractionRecord) {
        if let Ok(mut data) = self.data.write() {
            data.messages.push(message);
        }
    }

    /// Simulate the backend going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.reachable.store(available, Ordering::SeqCst);
        self.set_state(if available {
            ConnectionState::Ready
        } else {
            ConnectionState::Disconnected
        });
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut s) = self.state.write() {
            *s = state;
        }
    }

    fn ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    fn windowed_messages(&self) -> Vec<InteractionRecord> {
        let Ok(data) = self.data.read() else {
            return Vec::new();
        };
        let mut messages = data.messages.clone();
        messages.sort_by_key(|m| m.timestamp);
        self.window.slice(&messages).to_vec()
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    fn state(&self) -> ConnectionState {
        self.state
            .read()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Disconnected)
    }

    async fn connect(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            self.set_state(ConnectionState::Ready);
            Ok(())
        } else {
            self.set_state(ConnectionState::Disconnected);
            Err(MonitorError::SourceUnavailable("memory source marked unavailable".into()))
        }
    }

    async fn close(&self) {
        self.set_state(ConnectionState::Disconnected);
    }

    async fn get_sessions(&self, limit: usize, active_only: bool) -> Vec<SessionRecord> {
        if !self.ready() {
            return Vec::new();
        }
        let Ok(data) = self.data.read() else {
            return Vec::new();
        };
        data.sessions
            .iter()
            .filter(|s| !active_only || s.active)
            .take(limit)
            .cloned()
            .collect()
    }

    async fn get_messages_for_session(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Vec<InteractionRecord> {
        if !self.ready() {
            return Vec::new();
        }
        let Ok(data) = self.data.read() else {
            return Vec::new();
        };
        data.messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .take(limit)
            .cloned()
            .collect()
    }

    async fn get_messages(&self, offset: usize, limit: usize) -> Vec<InteractionRecord> {
        if !self.ready() {
            return Vec::new();
        }
        self.windowed_messages()
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect()
    }

    async fn get_aggregated(&self, group_by: Granularity) -> Vec<AggregatedRow> {
        if !self.ready() {
            return Vec::new();
        }
        group_records(&self.windowed_messages(), group_by)
    }

    fn pin_window(&self, now: DateTime<Utc>) {
        self.window.pin(now);
    }
}

// ── JSON-lines file source ─────────────────────────────────────────────

/// Size and modification time; a change means the file must be parsed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

/// One parse of a record file.
struct Parsed<T> {
    stamp: FileStamp,
    records: Vec<T>,
    malformed: u64,
}

/// Parsed messages, sorted by timestamp, with positions per session.
struct MessageSet {
    parsed: Parsed<InteractionRecord>,
    by_session: HashMap<String, Vec<usize>>,
}

impl MessageSet {
    fn new(mut parsed: Parsed<InteractionRecord>) -> Self {
        parsed.records.sort_by_key(|m| m.timestamp);
        let mut by_session: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, message) in parsed.records.iter().enumerate() {
            by_session.entry(message.session_id.clone()).or_default().push(i);
        }
        Self { parsed, by_session }
    }
}

type Cache<T> = RwLock<Option<Arc<T>>>;

fn cached<T>(cache: &Cache<T>) -> Option<Arc<T>> {
    cache.read().ok().and_then(|c| c.clone())
}

fn store<T>(cache: &Cache<T>, value: Option<Arc<T>>) {
    if let Ok(mut c) = cache.write() {
        *c = value;
    }
}

/// Record source reading the chat backend's JSON-lines exports.
///
/// A file is parsed again only when its size or modification time changes,
/// so records appended between refreshes show up on the next tick while the
/// queries of one pass share a single parse. Lines that fail to parse or lack
/// required fields are skipped and counted.
pub struct FileSource {
    dir: PathBuf,
    sessions_file: String,
    messages_file: String,
    window: Window,
    state: RwLock<ConnectionState>,
    sessions: Cache<Parsed<SessionRecord>>,
    messages: Cache<MessageSet>,
}

impl FileSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::from_config(&SourceConfig {
            data_dir: Some(dir.into()),
            ..SourceConfig::default()
        })
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            dir: config.resolved_data_dir(),
            sessions_file: config.sessions_file.clone(),
            messages_file: config.messages_file.clone(),
            window: Window::new(Some(Duration::hours(config.time_range_hours as i64))),
            state: RwLock::new(ConnectionState::Disconnected),
            sessions: RwLock::new(None),
            messages: RwLock::new(None),
        }
    }

    /// Replace the time window (None reads the whole history).
    pub fn with_window(mut self, window: Option<Duration>) -> Self {
        self.window = Window::new(window);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut s) = self.state.write() {
            *s = state;
        }
    }

    fn ready(&self) -> bool {
        let ready = self.state() == ConnectionState::Ready;
        if !ready {
            debug!(source = %self.dir.display(), "Query on file source that is not ready");
        }
        ready
    }

    async fn stamp(path: &Path) -> Option<FileStamp> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Some(FileStamp {
                len: meta.len(),
                modified: meta.modified().ok(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to stat record file");
                None
            }
        }
    }

    async fn parse<R, T>(path: &Path, stamp: FileStamp) -> Option<Parsed<T>>
    where
        R: serde::de::DeserializeOwned,
        T: TryFrom<R, Error = MonitorError>,
    {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read record file");
                return None;
            }
        };

        let mut records = Vec::new();
        let mut malformed = 0;
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed = serde_json::from_str::<R>(line)
                .map_err(MonitorError::from)
                .and_then(T::try_from);
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => {
                    malformed += 1;
                    debug!(path = %path.display(), line = lineno + 1, error = %e, "Skipping malformed record");
                }
            }
        }
        debug!(path = %path.display(), records = records.len(), malformed, "Parsed record file");
        Some(Parsed {
            stamp,
            records,
            malformed,
        })
    }

    async fn load_sessions(&self) -> Option<Arc<Parsed<SessionRecord>>> {
        let path = self.dir.join(&self.sessions_file);
        let Some(stamp) = Self::stamp(&path).await else {
            store(&self.sessions, None);
            return None;
        };
        if let Some(hit) = cached(&self.sessions).filter(|c| c.stamp == stamp) {
            return Some(hit);
        }
        let parsed = Self::parse::<RawSession, SessionRecord>(&path, stamp)
            .await
            .map(Arc::new);
        store(&self.sessions, parsed.clone());
        parsed
    }

    async fn load_messages(&self) -> Option<Arc<MessageSet>> {
        let path = self.dir.join(&self.messages_file);
        let Some(stamp) = Self::stamp(&path).await else {
            store(&self.messages, None);
            return None;
        };
        if let Some(hit) = cached(&self.messages).filter(|c| c.parsed.stamp == stamp) {
            return Some(hit);
        }
        let set = Self::parse::<RawMessage, InteractionRecord>(&path, stamp)
            .await
            .map(|parsed| Arc::new(MessageSet::new(parsed)));
        store(&self.messages, set.clone());
        set
    }
}

#[async_trait]
impl RecordSource for FileSource {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn state(&self) -> ConnectionState {
        self.state
            .read()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Disconnected)
    }

    async fn connect(&self) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        match tokio::fs::metadata(&self.dir).await {
            Ok(meta) if meta.is_dir() => {
                self.set_state(ConnectionState::Ready);
                info!(dir = %self.dir.display(), "Connected to record directory");
                Ok(())
            }
            Ok(_) => {
                self.set_state(ConnectionState::Disconnected);
                Err(MonitorError::SourceUnavailable(format!(
                    "{} is not a directory",
                    self.dir.display()
                )))
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(MonitorError::SourceUnavailable(format!(
                    "{}: {}",
                    self.dir.display(),
                    e
                )))
            }
        }
    }

    async fn close(&self) {
        self.set_state(ConnectionState::Disconnected);
        store(&self.sessions, None);
        store(&self.messages, None);
        debug!(dir = %self.dir.display(), "Record directory released");
    }

    async fn get_sessions(&self, limit: usize, active_only: bool) -> Vec<SessionRecord> {
        if !self.ready() {
            return Vec::new();
        }
        let Some(sessions) = self.load_sessions().await else {
            return Vec::new();
        };
        sessions
            .records
            .iter()
            .filter(|s| !active_only || s.active)
            .take(limit)
            .cloned()
            .collect()
    }

    async fn get_messages_for_session(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Vec<InteractionRecord> {
        if !self.ready() {
            return Vec::new();
        }
        let Some(set) = self.load_messages().await else {
            return Vec::new();
        };
        set.by_session
            .get(session_id)
            .map(|positions| {
                positions
                    .iter()
                    .take(limit)
                    .map(|&i| set.parsed.records[i].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn get_messages(&self, offset: usize, limit: usize) -> Vec<InteractionRecord> {
        if !self.ready() {
            return Vec::new();
        }
        let Some(set) = self.load_messages().await else {
            return Vec::new();
        };
        self.window
            .slice(&set.parsed.records)
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    async fn get_aggregated(&self, group_by: Granularity) -> Vec<AggregatedRow> {
        if !self.ready() {
            return Vec::new();
        }
        let Some(set) = self.load_messages().await else {
            return Vec::new();
        };
        group_records(self.window.slice(&set.parsed.records), group_by)
    }

    fn pin_window(&self, now: DateTime<Utc>) {
        self.window.pin(now);
    }

    fn malformed_count(&self) -> u64 {
        let sessions = cached(&self.sessions).map_or(0, |p| p.malformed);
        let messages = cached(&self.messages).map_or(0, |m| m.parsed.malformed);
        sessions + messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    fn msg(session: &str, role: Role, ts: DateTime<Utc>) -> InteractionRecord {
        InteractionRecord::new(session, role, ts)
    }

    #[test]
    fn test_group_records_by_day_and_role() {
        let d1 = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let d1_late = Utc.with_ymd_and_hms(2024, 1, 1, 23, 59, 0).unwrap();
        let d2 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 1, 0).unwrap();
        let records = vec![
            msg("s", Role::User, d1).with_tokens(10, 0),
            msg("s", Role::Assistant, d1_late)
                .with_tokens(10, 20)
                .with_processing_time(100.0),
            msg("s", Role::Assistant, d1_late)
                .with_tokens(0, 10)
                .with_processing_time(200.0),
            msg("s", Role::User, d2),
        ];

        let rows = group_records(&records, Granularity::Day);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].time_group, "2024-01-01");
        assert_eq!(rows[0].role, Role::User);
        assert_eq!(rows[0].avg_processing_time, None);
        assert_eq!(rows[1].role, Role::Assistant);
        assert_eq!(rows[1].count, 2);
        assert_eq!(rows[1].avg_processing_time, Some(150.0));
        assert_eq!(rows[1].tokens.completion, 30);
        assert_eq!(rows[1].tokens.total, 40);
        assert_eq!(rows[2].time_group, "2024-01-02");
    }

    #[test]
    fn test_collection_status() {
        let mut stats = CollectionStats::default();
        assert_eq!(stats.status(), CollectionStatus::Success);
        stats.items_processed = 4;
        stats.items_collected = 3;
        assert_eq!(stats.status(), CollectionStatus::Partial);
        stats.items_collected = 0;
        assert_eq!(stats.status(), CollectionStatus::Failure);
    }

    #[tokio::test]
    async fn test_memory_source_not_ready_returns_empty() {
        let source = MemorySource::with_records(
            vec![SessionRecord::new("s1", true)],
            vec![msg("s1", Role::User, Utc::now())],
        );
        assert_eq!(source.state(), ConnectionState::Disconnected);
        assert!(source.get_sessions(10, false).await.is_empty());

        source.connect().await.unwrap();
        assert_eq!(source.get_sessions(10, false).await.len(), 1);
        assert_eq!(source.get_messages_for_session("s1", 10).await.len(), 1);

        source.set_available(false);
        assert!(source.get_messages(0, 10).await.is_empty());
        assert!(source.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_memory_source_filters_active_and_pages() {
        let mut sessions = vec![SessionRecord::new("a", true), SessionRecord::new("b", false)];
        sessions.push(SessionRecord::new("c", true));
        let now = Utc::now();
        let messages = (0..5)
            .map(|i| msg("a", Role::User, now - Duration::seconds(10 - i)))
            .collect();
        let source = MemorySource::with_records(sessions, messages);
        source.connect().await.unwrap();

        assert_eq!(source.get_sessions(10, true).await.len(), 2);
        assert_eq!(source.get_sessions(1, false).await.len(), 1);
        assert_eq!(source.get_messages(0, 3).await.len(), 3);
        assert_eq!(source.get_messages(3, 3).await.len(), 2);
    }

    #[tokio::test]
    async fn test_file_source_skips_malformed_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let now = Utc::now().to_rfc3339();

        let mut messages = std::fs::File::create(dir.path().join("messages.jsonl")).unwrap();
        writeln!(
            messages,
            r#"{{"sessionId":"s1","role":"user","timestamp":"{now}","tokensUsed":{{"prompt":3}}}}"#
        )
        .unwrap();
        writeln!(messages, "not json at all").unwrap();
        writeln!(messages, r#"{{"role":"assistant","timestamp":"{now}"}}"#).unwrap();
        writeln!(
            messages,
            r#"{{"sessionId":"s1","role":"assistant","timestamp":"{now}","processingTime":80}}"#
        )
        .unwrap();

        let mut sessions = std::fs::File::create(dir.path().join("sessions.jsonl")).unwrap();
        writeln!(sessions, r#"{{"_id":"s1","active":true,"startTime":"{now}"}}"#).unwrap();
        writeln!(sessions, r#"{{"active":false}}"#).unwrap();

        let source = FileSource::new(dir.path());
        source.connect().await.unwrap();

        let msgs = source.get_messages(0, 100).await;
        assert_eq!(msgs.len(), 2);
        assert_eq!(source.malformed_count(), 2);

        let sessions = source.get_sessions(100, false).await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(source.malformed_count(), 3);

        let rows = source.get_aggregated(Granularity::Hour).await;
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_file_source_keeps_rows_with_bad_optional_fields() {
        let dir = tempfile::TempDir::new().unwrap();
        let now = Utc::now().to_rfc3339();
        let mut sessions = std::fs::File::create(dir.path().join("sessions.jsonl")).unwrap();
        writeln!(
            sessions,
            r#"{{"_id":"s1","active":null,"startTime":"{now}","metadata":null}}"#
        )
        .unwrap();
        let mut messages = std::fs::File::create(dir.path().join("messages.jsonl")).unwrap();
        writeln!(
            messages,
            r#"{{"sessionId":"s1","role":"assistant","timestamp":"{now}","tokensUsed":{{"prompt":12.0}},"processingTime":"120"}}"#
        )
        .unwrap();

        let source = FileSource::new(dir.path());
        source.connect().await.unwrap();

        let sessions = source.get_sessions(10, false).await;
        assert_eq!(sessions.len(), 1);
        assert!(!sessions[0].active);
        let messages = source.get_messages(0, 10).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].tokens.prompt, 12);
        assert_eq!(messages[0].processing_sample(), Some(120.0));
        assert_eq!(source.malformed_count(), 0);
    }

    #[tokio::test]
    async fn test_file_source_parses_once_until_file_changes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("messages.jsonl");
        let now = Utc::now().to_rfc3339();
        let line = |session: &str| {
            format!(r#"{{"sessionId":"{session}","role":"user","timestamp":"{now}"}}"#)
        };
        std::fs::write(&path, format!("{}\nbroken\n", line("s1"))).unwrap();

        let source = FileSource::new(dir.path());
        source.connect().await.unwrap();
        for _ in 0..3 {
            assert_eq!(source.get_messages_for_session("s1", 10).await.len(), 1);
            assert_eq!(source.get_aggregated(Granularity::Day).await.len(), 1);
        }
        // Rejects are counted per parse, not per query.
        assert_eq!(source.malformed_count(), 1);

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{}", line("s2")).unwrap();
        drop(file);

        assert_eq!(source.get_messages_for_session("s2", 10).await.len(), 1);
        assert_eq!(source.get_messages(0, 10).await.len(), 2);
        assert_eq!(source.malformed_count(), 1);

        source.close().await;
        assert_eq!(source.malformed_count(), 0);
    }

    #[tokio::test]
    async fn test_pinned_window_pages_consistently() {
        let end = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let messages = vec![
            msg("s", Role::User, end - Duration::minutes(90)),
            msg("s", Role::User, end - Duration::minutes(59)),
            msg("s", Role::Assistant, end - Duration::minutes(30)),
            msg("s", Role::User, end),
            msg("s", Role::User, end + Duration::minutes(1)),
        ];
        let source = MemorySource::with_records(Vec::new(), messages).with_window(Duration::hours(1));
        source.connect().await.unwrap();
        source.pin_window(end);

        let mut paged = Vec::new();
        for offset in 0..4 {
            paged.extend(source.get_messages(offset, 1).await);
        }
        assert_eq!(paged.len(), 3);
        assert_eq!(paged[0].timestamp, end - Duration::minutes(59));
        assert_eq!(paged[2].timestamp, end);
        assert_eq!(source.get_aggregated(Granularity::Day).await.len(), 2);
    }

    #[tokio::test]
    async fn test_file_source_missing_dir_fails_connect() {
        let source = FileSource::new("/definitely/not/here/chat-monitor");
        let err = source.connect().await.unwrap_err();
        assert!(matches!(err, MonitorError::SourceUnavailable(_)));
        assert_eq!(source.state(), ConnectionState::Disconnected);
        assert!(source.get_sessions(10, false).await.is_empty());
    }

    #[tokio::test]
    async fn test_file_source_missing_files_are_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = FileSource::new(dir.path());
        source.connect().await.unwrap();
        assert!(source.get_messages(0, 10).await.is_empty());
        assert!(source.get_aggregated(Granularity::Day).await.is_empty());
        source.close().await;
        assert_eq!(source.state(), ConnectionState::Disconnected);
    }
}
