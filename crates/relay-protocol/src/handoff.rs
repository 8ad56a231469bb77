//! Agent replies and the handoff/callback contract.
//!
//! An agent answers the coordinator with either a normal result or a handoff
//! object. The top-level `handoff` key is the only discriminator:
//!
//! ```json
//! {"handoff": {"to": "kg", "reason": "needs filings", "request": {...},
//!              "callback": {"agent": "metrics", "context": {...}}}}
//! ```

use crate::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const HANDOFF_KEY: &str = "handoff";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffCallback {
    pub agent: String,
    #[serde(default)]
    pub context: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handoff {
    pub to: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub request: Value,
    pub callback: HandoffCallback,
}

impl Handoff {
    fn validate(&self) -> RelayResult<()> {
        if self.to.trim().is_empty() {
            return Err(RelayError::MalformedHandoff(
                "handoff target `to` is empty".to_owned(),
            ));
        }
        if self.callback.agent.trim().is_empty() {
            return Err(RelayError::MissingContext(
                "handoff callback names no agent".to_owned(),
            ));
        }
        if self.to == self.callback.agent {
            return Err(RelayError::MalformedHandoff(format!(
                "agent {} cannot hand off to itself",
                self.to
            )));
        }
        if !matches!(self.callback.context, Value::Object(_) | Value::Null) {
            return Err(RelayError::MalformedHandoff(
                "callback context must be an object".to_owned(),
            ));
        }
        Ok(())
    }

    /// Task input for the callback agent: its saved context plus the
    /// target's result under `handoff_result` and the target's name under
    /// `handoff_from`.
    pub fn merge_result(&self, result: Value) -> Value {
        let mut merged = match &self.callback.context {
            Value::Object(context) => context.clone(),
            _ => Map::new(),
        };
        merged.insert("handoff_from".to_owned(), Value::String(self.to.clone()));
        merged.insert("handoff_result".to_owned(), result);
        Value::Object(merged)
    }
}

/// What an agent handed back to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentResponse {
    NormalResult(Value),
    HandoffRequest(Handoff),
}

impl AgentResponse {
    /// Classify a raw reply. Agents driven by a text-producing reasoning
    /// process may return the handoff object as a JSON string; that is
    /// accepted too.
    pub fn from_value(value: Value) -> RelayResult<Self> {
        match value {
            Value::Object(mut map) => match map.remove(HANDOFF_KEY) {
                Some(raw) => {
                    let handoff: Handoff = serde_json::from_value(raw)
                        .map_err(|error| RelayError::MalformedHandoff(error.to_string()))?;
                    handoff.validate()?;
                    Ok(Self::HandoffRequest(handoff))
                }
                None => Ok(Self::NormalResult(Value::Object(map))),
            },
            Value::String(text) => match embedded_handoff(&text) {
                Some(object) => Self::from_value(object),
                None => Ok(Self::NormalResult(Value::String(text))),
            },
            other => Ok(Self::NormalResult(other)),
        }
    }

    pub fn is_handoff(&self) -> bool {
        matches!(self, Self::HandoffRequest(_))
    }
}

fn embedded_handoff(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value @ Value::Object(_)) if value.get(HANDOFF_KEY).is_some() => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handoff_json() -> Value {
        json!({
            "handoff": {
                "to": "kg",
                "reason": "needs filing data",
                "request": {"company": "ACME"},
                "callback": {"agent": "metrics", "context": {"metric": "revenue"}}
            }
        })
    }

    #[test]
    fn plain_object_is_normal_result() {
        let response = AgentResponse::from_value(json!({"response": "ok"})).unwrap();
        assert_eq!(response, AgentResponse::NormalResult(json!({"response": "ok"})));
    }

    #[test]
    fn handoff_key_is_the_discriminator() {
        let response = AgentResponse::from_value(handoff_json()).unwrap();
        let AgentResponse::HandoffRequest(handoff) = response else {
            panic!("expected handoff");
        };
        assert_eq!(handoff.to, "kg");
        assert_eq!(handoff.callback.agent, "metrics");
        assert_eq!(handoff.request, json!({"company": "ACME"}));
    }

    #[test]
    fn handoff_embedded_in_text_is_detected() {
        let text = handoff_json().to_string();
        let response = AgentResponse::from_value(Value::String(text)).unwrap();
        assert!(response.is_handoff());

        let prose = AgentResponse::from_value(json!("{ not a handoff")).unwrap();
        assert!(!prose.is_handoff());
    }

    #[test]
    fn handoff_without_callback_is_malformed() {
        let error = AgentResponse::from_value(json!({"handoff": {"to": "kg"}})).unwrap_err();
        assert!(matches!(error, RelayError::MalformedHandoff(_)));
    }

    #[test]
    fn handoff_with_empty_callback_agent_is_missing_context() {
        let error = AgentResponse::from_value(json!({
            "handoff": {"to": "kg", "callback": {"agent": ""}}
        }))
        .unwrap_err();
        assert!(matches!(error, RelayError::MissingContext(_)));
    }

    #[test]
    fn self_handoff_is_rejected() {
        let error = AgentResponse::from_value(json!({
            "handoff": {"to": "kg", "callback": {"agent": "kg"}}
        }))
        .unwrap_err();
        assert!(matches!(error, RelayError::MalformedHandoff(_)));
    }

    #[test]
    fn non_object_context_is_rejected() {
        let error = AgentResponse::from_value(json!({
            "handoff": {"to": "kg", "callback": {"agent": "metrics", "context": [1, 2]}}
        }))
        .unwrap_err();
        assert!(matches!(error, RelayError::MalformedHandoff(_)));
    }

    #[test]
    fn merge_result_keeps_context_and_adds_result() {
        let AgentResponse::HandoffRequest(handoff) =
            AgentResponse::from_value(handoff_json()).unwrap()
        else {
            panic!("expected handoff");
        };
        let merged = handoff.merge_result(json!({"rows": 3}));
        assert_eq!(
            merged,
            json!({
                "metric": "revenue",
                "handoff_from": "kg",
                "handoff_result": {"rows": 3}
            })
        );
    }
}
