//! Append-only audit log and its derived views.
//!
//! Every runtime event (request lifecycle, tool calls and results, policy
//! blocks) becomes one [`AuditEntry`] on disk, one JSON object per line.
//! Entries are never mutated after write. `alerts` and `metrics` are
//! read-only views recomputed on demand.

pub mod alerts;
pub mod log;
pub mod metrics;

pub use log::{AuditLog, QueryFilter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditEvent {
    #[serde(rename = "request.start")]
    RequestStart,
    #[serde(rename = "request.end")]
    RequestEnd,
    #[serde(rename = "tool.call")]
    ToolCall,
    #[serde(rename = "tool.result")]
    ToolResult,
    #[serde(rename = "policy.block")]
    PolicyBlock,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestStart => "request.start",
            Self::RequestEnd => "request.end",
            Self::ToolCall => "tool.call",
            Self::ToolResult => "tool.result",
            Self::PolicyBlock => "policy.block",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "request.start" => Some(Self::RequestStart),
            "request.end" => Some(Self::RequestEnd),
            "tool.call" => Some(Self::ToolCall),
            "tool.result" => Some(Self::ToolResult),
            "policy.block" => Some(Self::PolicyBlock),
            _ => None,
        }
    }
}

/// One append-only record, keyed by the request that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(with = "ts_rfc3339_micros")]
    pub ts: DateTime<Utc>,
    pub request_id: Uuid,
    pub event: AuditEvent,
    pub app: String,
    pub model: String,
    pub policy_mode: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub detail: Map<String, Value>,
}

impl AuditEntry {
    pub fn new(
        request_id: Uuid,
        event: AuditEvent,
        app: impl Into<String>,
        model: impl Into<String>,
        policy_mode: impl Into<String>,
    ) -> Self {
        Self {
            ts: Utc::now(),
            request_id,
            event,
            app: app.into(),
            model: model.into(),
            policy_mode: policy_mode.into(),
            detail: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.detail.insert(key.into(), value.into());
        self
    }
}

/// RFC-3339 with microsecond precision and a trailing `Z`.
mod ts_rfc3339_micros {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn entry_round_trips_through_json() {
        let mut entry = AuditEntry::new(
            Uuid::new_v4(),
            AuditEvent::ToolCall,
            "demo",
            "llama3.1:8b",
            "local_only",
        )
        .with_detail("tool", "sql_query");
        // Truncate to microseconds: that is the on-disk precision.
        entry.ts = Utc
            .timestamp_micros(entry.ts.timestamp_micros())
            .single()
            .unwrap();

        let line = serde_json::to_string(&entry).unwrap();
        let parsed: AuditEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn timestamps_end_in_z() {
        let entry = AuditEntry::new(
            Uuid::new_v4(),
            AuditEvent::RequestStart,
            "demo",
            "m",
            "local_only",
        );
        let line = serde_json::to_string(&entry).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        let ts = value["ts"].as_str().unwrap();
        assert!(ts.ends_with('Z'), "expected UTC suffix, got {}", ts);
        // 2026-08-01T12:34:56.123456Z
        assert_eq!(ts.len(), 27);
    }

    #[test]
    fn event_names_are_dotted() {
        let json = serde_json::to_value(AuditEvent::PolicyBlock).unwrap();
        assert_eq!(json, serde_json::json!("policy.block"));
        assert_eq!(AuditEvent::parse("tool.result"), Some(AuditEvent::ToolResult));
        assert_eq!(AuditEvent::parse("nope"), None);
    }
}
