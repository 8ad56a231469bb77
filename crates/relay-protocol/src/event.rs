//! Progress events emitted while a job runs.
//!
//! An event is a kind, a free-form JSON payload, and a nanosecond timestamp.
//! On the wire the payload fields sit flat next to `"type"` and
//! `"timestamp"`, one JSON object per event:
//!
//! ```json
//! {"type":"tool_call","tool":"query","server":"arangodb","args":{},"agent":"kg","timestamp":1700000000000000000}
//! ```
//!
//! Payloads are deliberately loose: consumers read fields through the
//! accessors below and fall back to defaults instead of rejecting an event.
//! Unknown `"type"` names survive as [`EventKind::Other`].

use crate::ids::JobId;
use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;

/// Sentinel agent name used when work happens before any agent is named.
pub const COORDINATOR_AGENT: &str = "coordinator";

/// SSE default event name, used for payloads that arrive without a kind.
const GENERIC_EVENT_NAME: &str = "message";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    AgentSwitch,
    ToolCall,
    ToolResult,
    /// Raw structured-query execution; a `ToolCall` specialization.
    AqlQuery,
    MetricFound,
    Status,
    StepStart,
    Complete,
    Error,
    Other(String),
}

impl EventKind {
    pub fn parse(name: &str) -> Self {
        match name {
            "connected" => Self::Connected,
            "agent_switch" => Self::AgentSwitch,
            "tool_call" => Self::ToolCall,
            "tool_result" => Self::ToolResult,
            "aql_query" => Self::AqlQuery,
            "metric_found" => Self::MetricFound,
            "status" => Self::Status,
            "step_start" => Self::StepStart,
            "complete" => Self::Complete,
            "error" => Self::Error,
            other => Self::Other(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Connected => "connected",
            Self::AgentSwitch => "agent_switch",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::AqlQuery => "aql_query",
            Self::MetricFound => "metric_found",
            Self::Status => "status",
            Self::StepStart => "step_start",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Other(name) => name,
        }
    }

    /// `complete` and `error` end a job's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for EventKind {
    fn from(name: &str) -> Self {
        Self::parse(name)
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::parse(&name))
    }
}

/// One immutable progress record.
///
/// Fields are private: an event is built once through the constructors
/// (optionally decorated with `with_field` before it is emitted) and only read
/// afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    kind: EventKind,
    payload: Map<String, Value>,
    /// Nanoseconds since UNIX epoch.
    timestamp: u64,
}

impl Event {
    pub fn new(kind: EventKind, payload: Map<String, Value>) -> Self {
        Self::with_timestamp(kind, payload, Self::now_nanos())
    }

    pub fn with_timestamp(kind: EventKind, mut payload: Map<String, Value>, timestamp: u64) -> Self {
        payload.remove("type");
        payload.remove("timestamp");
        Self {
            kind,
            payload,
            timestamp,
        }
    }

    /// Build from a flat wire object. Never fails: a missing `"type"` makes a
    /// generic event, a missing timestamp reads as zero.
    pub fn from_map(mut map: Map<String, Value>) -> Self {
        let kind = map
            .remove("type")
            .and_then(|value| value.as_str().map(EventKind::parse))
            .unwrap_or_else(|| EventKind::Other(GENERIC_EVENT_NAME.to_owned()));
        let timestamp = map
            .remove("timestamp")
            .and_then(|value| value.as_u64().or_else(|| value.as_f64().map(|f| f as u64)))
            .unwrap_or(0);
        Self {
            kind,
            payload: map,
            timestamp,
        }
    }

    /// Parse one pushed item. `event_name` is the transport-level name (the
    /// SSE `event:` line) and is used when the data carries no `"type"`.
    /// Data that is not a JSON object is kept as a message-only payload.
    pub fn from_wire(event_name: Option<&str>, data: &str) -> Self {
        match serde_json::from_str::<Value>(data.trim()) {
            Ok(Value::Object(mut map)) => {
                if !map.contains_key("type")
                    && let Some(name) = event_name
                {
                    map.insert("type".to_owned(), Value::String(name.to_owned()));
                }
                Self::from_map(map)
            }
            _ => {
                let kind = event_name
                    .map(EventKind::parse)
                    .unwrap_or_else(|| EventKind::Other(GENERIC_EVENT_NAME.to_owned()));
                Self::new(kind, payload([("message", Value::String(data.to_owned()))]))
            }
        }
    }

    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|error| {
            json!({ "type": self.kind.as_str(), "message": error.to_string() }).to_string()
        })
    }

    pub fn now_nanos() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64
    }

    // ── constructors ──

    pub fn connected(job_id: &JobId) -> Self {
        Self::new(
            EventKind::Connected,
            payload([("job_id", Value::String(job_id.to_string()))]),
        )
    }

    pub fn status(message: impl Into<String>) -> Self {
        Self::new(
            EventKind::Status,
            payload([("message", Value::String(message.into()))]),
        )
    }

    pub fn step_start() -> Self {
        Self::new(EventKind::StepStart, Map::new())
    }

    pub fn agent_switch(agent: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(
            EventKind::AgentSwitch,
            payload([
                ("agent", Value::String(agent.into())),
                ("reason", Value::String(reason.into())),
            ]),
        )
    }

    pub fn tool_call(tool: impl Into<String>, server: impl Into<String>, args: Value) -> Self {
        Self::new(
            EventKind::ToolCall,
            payload([
                ("tool", Value::String(tool.into())),
                ("server", Value::String(server.into())),
                ("args", args),
            ]),
        )
    }

    pub fn tool_result(tool: impl Into<String>, result: Value, duration_ms: u64) -> Self {
        Self::new(
            EventKind::ToolResult,
            payload([
                ("tool", Value::String(tool.into())),
                ("result", result),
                ("duration_ms", Value::from(duration_ms)),
            ]),
        )
    }

    pub fn aql_query(query: impl Into<String>, bind_vars: Value) -> Self {
        Self::new(
            EventKind::AqlQuery,
            payload([
                ("query", Value::String(query.into())),
                ("bind_vars", bind_vars),
            ]),
        )
    }

    pub fn metric_found(metric: Value) -> Self {
        Self::new(EventKind::MetricFound, payload([("metric", metric)]))
    }

    pub fn complete(result: Value) -> Self {
        Self::new(EventKind::Complete, payload([("result", result)]))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(
            EventKind::Error,
            payload([("message", Value::String(message.into()))]),
        )
    }

    /// Attach a payload field before the event is emitted.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        if key != "type" && key != "timestamp" {
            self.payload.insert(key, value);
        }
        self
    }

    pub fn for_agent(self, agent: impl Into<String>) -> Self {
        self.with_field("agent", Value::String(agent.into()))
    }

    pub fn with_call_id(self, call_id: impl Into<String>) -> Self {
        self.with_field("call_id", Value::String(call_id.into()))
    }

    // ── accessors ──

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Non-empty string field.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(|value| {
            value
                .as_u64()
                .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
        })
    }

    pub fn agent(&self) -> Option<&str> {
        self.str_field("agent")
    }

    pub fn call_id(&self) -> Option<&str> {
        self.str_field("call_id")
    }

    pub fn message(&self) -> Option<&str> {
        self.str_field("message")
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.payload.len() + 2))?;
        map.serialize_entry("type", self.kind.as_str())?;
        for (key, value) in &self.payload {
            map.serialize_entry(key, value)?;
        }
        map.serialize_entry("timestamp", &self.timestamp)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = Map::<String, Value>::deserialize(deserializer)?;
        Ok(Self::from_map(map))
    }
}

fn payload<const N: usize>(fields: [(&str, Value); N]) -> Map<String, Value> {
    fields
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_is_flat() {
        let event = Event::with_timestamp(
            EventKind::AgentSwitch,
            payload([
                ("agent", json!("kg")),
                ("reason", json!("lookup")),
            ]),
            42,
        );
        let value: Value = serde_json::from_str(&event.to_wire()).unwrap();
        assert_eq!(
            value,
            json!({"type": "agent_switch", "agent": "kg", "reason": "lookup", "timestamp": 42})
        );
    }

    #[test]
    fn wire_roundtrip_preserves_payload_and_timestamp() {
        let event = Event::tool_call("query", "arangodb", json!({"q": "FOR c IN companies"}))
            .for_agent("kg")
            .with_call_id("c-1");
        let back: Event = serde_json::from_str(&event.to_wire()).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.agent(), Some("kg"));
        assert_eq!(back.call_id(), Some("c-1"));
    }

    #[test]
    fn unknown_kind_is_preserved() {
        let event = Event::from_wire(None, r#"{"type":"future_feature","x":1}"#);
        assert_eq!(event.kind(), &EventKind::Other("future_feature".into()));
        assert_eq!(event.field("x"), Some(&json!(1)));
        assert!(event.to_wire().contains("\"type\":\"future_feature\""));
    }

    #[test]
    fn malformed_wire_data_becomes_message_event() {
        let event = Event::from_wire(Some("tool_call"), "{not json");
        assert_eq!(event.kind(), &EventKind::ToolCall);
        assert_eq!(event.message(), Some("{not json"));
        assert!(event.str_field("tool").is_none());

        let generic = Event::from_wire(None, "plain text output");
        assert_eq!(generic.kind().as_str(), "message");
        assert_eq!(generic.message(), Some("plain text output"));
    }

    #[test]
    fn wire_name_fills_missing_type() {
        let event = Event::from_wire(Some("status"), r#"{"message":"Processing query..."}"#);
        assert_eq!(event.kind(), &EventKind::Status);
        assert_eq!(event.timestamp(), 0);
    }

    #[test]
    fn reserved_keys_cannot_enter_payload() {
        let event = Event::status("hi")
            .with_field("type", json!("complete"))
            .with_field("timestamp", json!(1));
        assert_eq!(event.kind(), &EventKind::Status);
        assert!(event.field("type").is_none());
        assert!(event.timestamp() > 1);
    }

    #[test]
    fn terminal_kinds() {
        assert!(Event::complete(json!({"response": "done"})).is_terminal());
        assert!(Event::error("boom").is_terminal());
        assert!(!Event::status("working").is_terminal());
        assert!(!EventKind::parse("metric_found").is_terminal());
    }

    #[test]
    fn numeric_fields_accept_floats() {
        let event = Event::from_wire(None, r#"{"type":"tool_result","tool":"q","duration_ms":120.4}"#);
        assert_eq!(event.u64_field("duration_ms"), Some(120));
    }

    #[test]
    fn blank_strings_read_as_missing() {
        let event = Event::agent_switch("  ", "");
        assert!(event.agent().is_none());
        assert!(event.str_field("reason").is_none());
    }
}
