use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MonitorError;

/// Author of a logged chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl FromStr for Role {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(MonitorError::MalformedRecord(format!("unknown role '{}'", other))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time bucket size used as an aggregation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl Granularity {
    pub const ALL: [Granularity; 5] = [
        Granularity::Minute,
        Granularity::Hour,
        Granularity::Day,
        Granularity::Week,
        Granularity::Month,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        }
    }

    /// Whether the live time-series view may be switched to this scale at runtime.
    pub fn is_live_switchable(&self) -> bool {
        matches!(self, Granularity::Minute | Granularity::Hour | Granularity::Day)
    }

    /// Parse a scale requested by a dashboard client.
    ///
    /// Only `minute`, `hour` and `day` are accepted; weekly and monthly series
    /// are always computed but cannot be selected for the live view.
    pub fn parse_live(s: &str) -> Result<Self, MonitorError> {
        let g: Granularity = s.parse()?;
        if g.is_live_switchable() {
            Ok(g)
        } else {
            Err(MonitorError::InvalidGranularity(format!(
                "'{}' is not a live time scale (expected minute, hour or day)",
                s
            )))
        }
    }

    /// Canonical bucket label for a timestamp.
    ///
    /// Labels are zero-padded so that lexicographic order equals time order
    /// within a single granularity.
    pub fn label(&self, ts: &DateTime<Utc>) -> String {
        let format = match self {
            Granularity::Minute => "%Y-%m-%d %H:%M",
            Granularity::Hour => "%Y-%m-%d %H:00",
            Granularity::Day => "%Y-%m-%d",
            Granularity::Week => "%Y-%U",
            Granularity::Month => "%Y-%m",
        };
        ts.format(format).to_string()
    }
}

impl FromStr for Granularity {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minute" => Ok(Granularity::Minute),
            "hour" => Ok(Granularity::Hour),
            "day" => Ok(Granularity::Day),
            "week" => Ok(Granularity::Week),
            "month" => Ok(Granularity::Month),
            other => Err(MonitorError::InvalidGranularity(format!(
                "unknown time scale '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token usage attached to a single message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenCounts {
    /// Build counts, deriving `total` from the parts unless the source supplied one.
    pub fn new(prompt: u64, completion: u64, total: Option<u64>) -> Self {
        Self {
            prompt,
            completion,
            total: total.unwrap_or(prompt.saturating_add(completion)),
        }
    }

    /// Accumulate another message's counts. Sums saturate at `u64::MAX`.
    pub fn add(&mut self, other: &TokenCounts) {
        self.prompt = self.prompt.saturating_add(other.prompt);
        self.completion = self.completion.saturating_add(other.completion);
        self.total = self.total.saturating_add(other.total);
    }
}

/// Client metadata captured alongside sessions and messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    #[serde(
        default,
        deserialize_with = "lenient::text",
        skip_serializing_if = "Option::is_none"
    )]
    pub browser: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::text",
        skip_serializing_if = "Option::is_none"
    )]
    pub os: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::text",
        skip_serializing_if = "Option::is_none"
    )]
    pub ip_address: Option<String>,
}

/// One logged chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub id: Option<String>,
    pub session_id: String,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
    pub tokens: TokenCounts,
    /// Processing latency in milliseconds. Only assistant messages carry one.
    pub processing_time: Option<f64>,
    pub model: Option<String>,
    pub metadata: RecordMetadata,
}

impl InteractionRecord {
    pub fn new(session_id: impl Into<String>, role: Role, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: None,
            session_id: session_id.into(),
            role,
            timestamp,
            tokens: TokenCounts::default(),
            processing_time: None,
            model: None,
            metadata: RecordMetadata::default(),
        }
    }

    pub fn with_tokens(mut self, prompt: u64, completion: u64) -> Self {
        self.tokens = TokenCounts::new(prompt, completion, None);
        self
    }

    pub fn with_processing_time(mut self, millis: f64) -> Self {
        self.processing_time = Some(millis);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Model identifier if present and non-blank.
    pub fn model_name(&self) -> Option<&str> {
        self.model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
    }

    /// Processing time as a statistical sample (assistant messages only).
    pub fn processing_sample(&self) -> Option<f64> {
        match self.role {
            Role::Assistant => self.processing_time.filter(|t| t.is_finite()),
            _ => None,
        }
    }
}

/// One conversation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub active: bool,
    pub start_time: Option<DateTime<Utc>>,
    /// Unset while the session is still active.
    pub end_time: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub metadata: RecordMetadata,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>, active: bool) -> Self {
        Self {
            id: id.into(),
            active,
            start_time: None,
            end_time: None,
            user_id: None,
            metadata: RecordMetadata::default(),
        }
    }

    /// Session length in seconds, when both endpoints are known.
    pub fn duration_secs(&self) -> Option<f64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// Token block as stored by the chat backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawTokens {
    #[serde(deserialize_with = "lenient::count")]
    pub prompt: Option<u64>,
    #[serde(deserialize_with = "lenient::count")]
    pub completion: Option<u64>,
    #[serde(deserialize_with = "lenient::count")]
    pub total: Option<u64>,
}

/// A message document as written by the chat backend.
///
/// Every field is optional and wrong-typed values read as absent, so only the
/// checks in the `TryFrom` conversion can reject a document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawMessage {
    #[serde(rename = "_id", deserialize_with = "lenient::text")]
    pub id: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub session_id: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub role: Option<String>,
    #[serde(deserialize_with = "lenient::timestamp")]
    pub timestamp: Option<String>,
    #[serde(deserialize_with = "lenient::or_default")]
    pub tokens_used: RawTokens,
    #[serde(deserialize_with = "lenient::number")]
    pub processing_time: Option<f64>,
    #[serde(deserialize_with = "lenient::text")]
    pub model: Option<String>,
    #[serde(deserialize_with = "lenient::or_default")]
    pub metadata: RecordMetadata,
}

impl TryFrom<RawMessage> for InteractionRecord {
    type Error = MonitorError;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        let session_id = raw
            .session_id
            .filter(|s| !s.is_empty())
            .ok_or_else(|| MonitorError::MalformedRecord("message without sessionId".into()))?;
        let role: Role = raw
            .role
            .as_deref()
            .ok_or_else(|| MonitorError::MalformedRecord("message without role".into()))?
            .parse()?;
        let timestamp = raw
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .ok_or_else(|| MonitorError::MalformedRecord("message without valid timestamp".into()))?;
        let tokens = raw.tokens_used;

        Ok(Self {
            id: raw.id,
            session_id,
            role,
            timestamp,
            tokens: TokenCounts::new(
                tokens.prompt.unwrap_or(0),
                tokens.completion.unwrap_or(0),
                tokens.total,
            ),
            processing_time: if role == Role::Assistant {
                raw.processing_time
            } else {
                None
            },
            model: raw.model,
            metadata: raw.metadata,
        })
    }
}

/// A session document as written by the chat backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawSession {
    #[serde(rename = "_id", deserialize_with = "lenient::text")]
    pub id: Option<String>,
    #[serde(deserialize_with = "lenient::flag")]
    pub active: bool,
    #[serde(deserialize_with = "lenient::timestamp")]
    pub start_time: Option<String>,
    #[serde(deserialize_with = "lenient::timestamp")]
    pub end_time: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub user_identifier: Option<String>,
    #[serde(deserialize_with = "lenient::or_default")]
    pub metadata: RecordMetadata,
}

impl TryFrom<RawSession> for SessionRecord {
    type Error = MonitorError;

    fn try_from(raw: RawSession) -> Result<Self, Self::Error> {
        let id = raw
            .id
            .filter(|s| !s.is_empty())
            .ok_or_else(|| MonitorError::MalformedRecord("session without _id".into()))?;

        Ok(Self {
            id,
            active: raw.active,
            // Unparseable endpoints degrade to "unknown" rather than rejecting the session.
            start_time: raw.start_time.as_deref().and_then(parse_timestamp),
            end_time: raw.end_time.as_deref().and_then(parse_timestamp),
            user_id: raw.user_identifier.filter(|u| !u.is_empty()),
            metadata: raw.metadata,
        })
    }
}

/// Parse an RFC 3339 timestamp, or a naive ISO timestamp interpreted as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Field readers for backend documents: null or wrong-typed values become
/// the field's default instead of failing the whole document.
mod lenient {
    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    /// Strings as-is, numbers in their decimal form.
    pub fn text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    /// A timestamp string, or an extended-JSON `{"$date": "..."}` wrapper.
    pub fn timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::String(s) => Some(s),
            Value::Object(mut map) => match map.remove("$date") {
                Some(Value::String(s)) => Some(s),
                _ => None,
            },
            _ => None,
        })
    }

    /// A finite number, also accepted as a numeric string.
    pub fn number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        let n = match Value::deserialize(d)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        Ok(n.filter(|x: &f64| x.is_finite()))
    }

    /// A non-negative count. Fractional values are truncated.
    pub fn count<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        let value = Value::deserialize(d)?;
        if let Some(n) = value.as_u64() {
            return Ok(Some(n));
        }
        let n = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        // `as` saturates at the u64 bounds.
        Ok(n.filter(|x: &f64| x.is_finite() && *x >= 0.0).map(|x| x as u64))
    }

    /// Only a JSON `true` is true.
    pub fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        Ok(matches!(Value::deserialize(d)?, Value::Bool(true)))
    }

    /// A nested document, or its default when it does not fit the expected shape.
    pub fn or_default<'de, D, T>(d: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned + Default,
    {
        Ok(serde_json::from_value(Value::deserialize(d)?).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_day_label_groups_same_date() {
        let morning = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let night = Utc.with_ymd_and_hms(2024, 1, 1, 23, 59, 0).unwrap();
        assert_eq!(Granularity::Day.label(&morning), "2024-01-01");
        assert_eq!(Granularity::Day.label(&night), "2024-01-01");
    }

    #[test]
    fn test_labels_per_granularity() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 5, 7, 9, 30).unwrap();
        assert_eq!(Granularity::Minute.label(&ts), "2024-03-05 07:09");
        assert_eq!(Granularity::Hour.label(&ts), "2024-03-05 07:00");
        assert_eq!(Granularity::Week.label(&ts), "2024-09");
        assert_eq!(Granularity::Month.label(&ts), "2024-03");
    }

    #[test]
    fn test_parse_live_rejects_week_and_garbage() {
        assert_eq!(Granularity::parse_live("hour").unwrap(), Granularity::Hour);
        assert!(matches!(
            Granularity::parse_live("week"),
            Err(MonitorError::InvalidGranularity(_))
        ));
        assert!(matches!(
            Granularity::parse_live("fortnight"),
            Err(MonitorError::InvalidGranularity(_))
        ));
    }

    #[test]
    fn test_raw_message_derives_total() {
        let raw: RawMessage = serde_json::from_str(
            r#"{"sessionId":"s1","role":"assistant","timestamp":"2024-01-01T10:00:00Z",
                "tokensUsed":{"prompt":10,"completion":5},"processingTime":120.0,"model":"gpt-4"}"#,
        )
        .unwrap();
        let record = InteractionRecord::try_from(raw).unwrap();
        assert_eq!(record.tokens.total, 15);
        assert_eq!(record.processing_sample(), Some(120.0));
        assert_eq!(record.model_name(), Some("gpt-4"));
    }

    #[test]
    fn test_raw_message_explicit_total_wins() {
        let raw: RawMessage = serde_json::from_str(
            r#"{"sessionId":"s1","role":"user","timestamp":"2024-01-01T10:00:00Z",
                "tokensUsed":{"prompt":10,"completion":5,"total":40},"processingTime":9.0}"#,
        )
        .unwrap();
        let record = InteractionRecord::try_from(raw).unwrap();
        assert_eq!(record.tokens.total, 40);
        // User messages never carry processing time.
        assert_eq!(record.processing_time, None);
    }

    #[test]
    fn test_raw_message_missing_fields_is_malformed() {
        let raw: RawMessage =
            serde_json::from_str(r#"{"role":"user","timestamp":"2024-01-01T10:00:00Z"}"#).unwrap();
        assert!(matches!(
            InteractionRecord::try_from(raw),
            Err(MonitorError::MalformedRecord(_))
        ));

        let raw: RawMessage =
            serde_json::from_str(r#"{"sessionId":"s","role":"user","timestamp":"yesterday"}"#)
                .unwrap();
        assert!(InteractionRecord::try_from(raw).is_err());
    }

    #[test]
    fn test_raw_session_conversion() {
        let raw: RawSession = serde_json::from_str(
            r#"{"_id":"s1","active":false,"startTime":"2024-01-01T10:00:00Z",
                "endTime":"2024-01-01T10:02:30Z","userIdentifier":"",
                "metadata":{"browser":"Firefox","ipAddress":"10.0.0.1"}}"#,
        )
        .unwrap();
        let session = SessionRecord::try_from(raw).unwrap();
        assert_eq!(session.duration_secs(), Some(150.0));
        assert_eq!(session.user_id, None);
        assert_eq!(session.metadata.browser.as_deref(), Some("Firefox"));
        assert_eq!(session.metadata.os, None);
    }

    #[test]
    fn test_bad_optional_session_fields_keep_the_session() {
        let raw: RawSession = serde_json::from_str(
            r#"{"_id":"s1","active":null,"startTime":"2024-01-01T10:00:00Z","metadata":null}"#,
        )
        .unwrap();
        let session = SessionRecord::try_from(raw).unwrap();
        assert!(!session.active);
        assert_eq!(session.metadata, RecordMetadata::default());

        let raw: RawSession = serde_json::from_str(
            r#"{"_id":"s2","active":"yes","startTime":42,"userIdentifier":7,
                "metadata":{"browser":["Firefox"],"os":"Linux"}}"#,
        )
        .unwrap();
        let session = SessionRecord::try_from(raw).unwrap();
        assert!(!session.active);
        assert_eq!(session.start_time, None);
        assert_eq!(session.user_id.as_deref(), Some("7"));
        assert_eq!(session.metadata.browser, None);
        assert_eq!(session.metadata.os.as_deref(), Some("Linux"));
    }

    #[test]
    fn test_bad_optional_message_fields_degrade_to_defaults() {
        let raw: RawMessage = serde_json::from_str(
            r#"{"sessionId":"s1","role":"assistant","timestamp":"2024-01-01T10:00:00Z",
                "tokensUsed":{"prompt":12.0,"completion":"5","total":null},
                "processingTime":"120","model":null,"metadata":"n/a"}"#,
        )
        .unwrap();
        let record = InteractionRecord::try_from(raw).unwrap();
        assert_eq!(record.tokens, TokenCounts::new(12, 5, None));
        assert_eq!(record.processing_sample(), Some(120.0));
        assert_eq!(record.model_name(), None);

        let raw: RawMessage = serde_json::from_str(
            r#"{"sessionId":"s1","role":"user","timestamp":{"$date":"2024-01-01T10:00:00Z"},
                "tokensUsed":"lots","processingTime":{"ms":3}}"#,
        )
        .unwrap();
        let record = InteractionRecord::try_from(raw).unwrap();
        assert_eq!(record.tokens, TokenCounts::default());
        assert_eq!(record.timestamp, Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap());
    }

    #[test]
    fn test_wrong_typed_required_field_is_malformed() {
        let raw: RawMessage = serde_json::from_str(
            r#"{"sessionId":null,"role":"user","timestamp":"2024-01-01T10:00:00Z"}"#,
        )
        .unwrap();
        assert!(matches!(
            InteractionRecord::try_from(raw),
            Err(MonitorError::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_token_sums_saturate() {
        let raw: RawMessage = serde_json::from_str(
            r#"{"sessionId":"s1","role":"user","timestamp":"2024-01-01T10:00:00Z",
                "tokensUsed":{"prompt":18446744073709551615,"completion":1}}"#,
        )
        .unwrap();
        let record = InteractionRecord::try_from(raw).unwrap();
        assert_eq!(record.tokens.total, u64::MAX);

        let mut sum = record.tokens;
        sum.add(&TokenCounts::new(1, 1, None));
        assert_eq!(sum.prompt, u64::MAX);
        assert_eq!(sum.completion, 2);
        assert_eq!(sum.total, u64::MAX);
    }

    #[test]
    fn test_parse_naive_timestamp_as_utc() {
        let ts = parse_timestamp("2024-01-01T23:59:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 1, 1, 23, 59, 0).unwrap());
        assert!(parse_timestamp("").is_none());
    }
}
