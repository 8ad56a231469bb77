//! Persisting and replaying a job's activity.
//!
//! A finished job is reduced into [`ReplayMetadata`]. Replay expands the
//! metadata back into events and runs the same [`reconstruct`] the live view
//! uses, so both paths group activity identically:
//!
//! - [`Encoding::EventLog`] keeps the full event history; replaying it gives
//!   exactly the live view.
//! - [`Encoding::Legacy`] keeps only `agents_used` and `tools_called`, the
//!   form older records carry. Replay recovers the same agents, tools,
//!   arguments and result presence, with result bodies possibly summarized.

use crate::reconstruct::{AgentSection, reconstruct};
use relay_protocol::{COORDINATOR_AGENT, Event, EventKind, ReplayMetadata, ToolCallInfo};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

const RESULT_SUMMARY_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    EventLog,
    Legacy,
}

/// Reduce a finished job's events into replay metadata.
pub fn reduce(events: &[Event], encoding: Encoding) -> ReplayMetadata {
    let sections = reconstruct(events);
    let agents_used = sections.iter().map(|s| s.agent.clone()).collect();
    let tools_called = sections
        .iter()
        .flat_map(|section| {
            section.tools.iter().map(move |call| ToolCallInfo {
                call_id: Some(call.id.clone()),
                tool: call.tool.clone(),
                server: call.server.clone(),
                args: call.args.clone(),
                agent: Some(section.agent.clone()),
                duration_ms: call.duration_ms,
                result: call.result.as_ref().map(summarize),
            })
        })
        .collect();

    let mut metadata = ReplayMetadata {
        agents_used,
        tools_called,
        ..ReplayMetadata::default()
    };
    if encoding == Encoding::EventLog {
        metadata.history_digest = Some(history_digest(events));
        metadata.event_history = Some(events.to_vec());
    }
    metadata
}

/// Expand replay metadata into an event sequence for [`reconstruct`].
///
/// A non-empty `event_history` is returned as is. Otherwise events are
/// synthesized: one `agent_switch` per used agent, then each tool call with
/// its result when one was recorded. A tool call without an agent belongs to
/// the agent of the previous tool call, else the first used agent, else the
/// coordinator.
pub fn expand(metadata: &ReplayMetadata) -> Vec<Event> {
    if let Some(history) = metadata.event_history.as_ref().filter(|h| !h.is_empty()) {
        return history.clone();
    }

    let mut events: Vec<Event> = metadata
        .agents_used
        .iter()
        .filter(|agent| !agent.trim().is_empty())
        .map(|agent| Event::agent_switch(agent.as_str(), ""))
        .collect();

    let mut previous: Option<&str> = None;
    let mut positions: HashMap<&str, usize> = HashMap::new();
    for info in &metadata.tools_called {
        let agent = info
            .agent
            .as_deref()
            .filter(|agent| !agent.trim().is_empty())
            .or(previous)
            .or(metadata.agents_used.first().map(String::as_str))
            .unwrap_or(COORDINATOR_AGENT);
        let position = positions.entry(agent).or_insert(0);
        let call_id = info
            .call_id
            .clone()
            .unwrap_or_else(|| format!("{agent}:{position}:{}", info.tool));
        *position += 1;

        let args = match &info.args {
            Value::Object(args) => Value::Object(args.clone()),
            _ => Value::Object(Map::new()),
        };
        events.push(
            Event::tool_call(info.tool.as_str(), info.server.as_str(), args)
                .for_agent(agent)
                .with_call_id(call_id.as_str()),
        );
        if let Some(result) = &info.result {
            let mut payload = Map::new();
            payload.insert("tool".to_owned(), Value::String(info.tool.clone()));
            payload.insert("result".to_owned(), result.clone());
            if let Some(duration) = info.duration_ms {
                payload.insert("duration_ms".to_owned(), Value::from(duration));
            }
            events.push(
                Event::new(EventKind::ToolResult, payload)
                    .for_agent(agent)
                    .with_call_id(call_id),
            );
        }
        previous = Some(agent);
    }
    events
}

/// Replay a stored record into agent sections.
pub fn replay_sections(metadata: &ReplayMetadata) -> Vec<AgentSection> {
    reconstruct(&expand(metadata))
}

/// SHA-256 (hex) of the serialized event history.
pub fn history_digest(events: &[Event]) -> String {
    let bytes = serde_json::to_vec(events).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Whether the stored history still matches its digest. Records without a
/// digest or without a history have nothing to check.
pub fn history_intact(metadata: &ReplayMetadata) -> bool {
    match (&metadata.event_history, &metadata.history_digest) {
        (Some(history), Some(digest)) => history_digest(history) == *digest,
        _ => true,
    }
}

/// Same agents in the same order, each with the same tools, servers,
/// arguments and result presence. Result bodies and ids are not compared.
pub fn same_activity(left: &[AgentSection], right: &[AgentSection]) -> bool {
    left.len() == right.len()
        && left.iter().zip(right).all(|(a, b)| {
            a.agent == b.agent
                && a.tools.len() == b.tools.len()
                && a.tools.iter().zip(&b.tools).all(|(x, y)| {
                    x.tool == y.tool
                        && x.server == y.server
                        && x.args == y.args
                        && x.is_resolved() == y.is_resolved()
                })
        })
}

/// Long string results are cut to a prefix. A null result is stored as an
/// empty object so its presence survives a round trip through JSON.
fn summarize(result: &Value) -> Value {
    match result {
        Value::Null => Value::Object(Map::new()),
        Value::String(text) if text.chars().count() > RESULT_SUMMARY_CHARS => {
            Value::String(text.chars().take(RESULT_SUMMARY_CHARS).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scenario() -> Vec<Event> {
        vec![
            Event::status("Processing query..."),
            Event::agent_switch("router", "classify"),
            Event::tool_call("search", "mcp", json!({"q": "acme"})),
            Event::agent_switch("kg", "fetch filings"),
            Event::aql_query("FOR f IN filings RETURN f", json!({})),
            Event::tool_call("query", "arangodb", json!({"company": "ACME"})),
            Event::tool_call("query", "arangodb", json!({"company": "INIT"})),
            Event::tool_result("query", json!({"rows": 3}), 120),
            Event::tool_result("aql_query", json!("x".repeat(800)), 7),
            Event::complete(json!({"response": "done"})),
        ]
    }

    #[test]
    fn event_log_replay_equals_live_view() {
        let events = scenario();
        let metadata = reduce(&events, Encoding::EventLog);
        assert!(history_intact(&metadata));
        assert_eq!(replay_sections(&metadata), reconstruct(&events));
    }

    #[test]
    fn legacy_replay_matches_up_to_grouping() {
        let events = scenario();
        let live = reconstruct(&events);
        let metadata = reduce(&events, Encoding::Legacy);
        assert!(metadata.event_history.is_none());
        assert!(metadata.history_digest.is_none());

        let replayed = replay_sections(&metadata);
        assert!(same_activity(&live, &replayed));
        assert_eq!(replayed[1].tools[1].duration_ms, Some(120));
        assert!(!replayed[1].tools[2].is_resolved());
        let summary = replayed[1].tools[0].result.as_ref().unwrap();
        assert_eq!(summary.as_str().unwrap().len(), RESULT_SUMMARY_CHARS);
    }

    #[test]
    fn legacy_replay_survives_json_round_trip() {
        let events = vec![
            Event::agent_switch("kg", ""),
            Event::tool_call("ping", "mcp", json!({})),
            Event::tool_result("ping", Value::Null, 1),
        ];
        let metadata = reduce(&events, Encoding::Legacy);
        let stored = serde_json::to_string(&metadata).unwrap();
        let loaded: ReplayMetadata = serde_json::from_str(&stored).unwrap();
        assert!(same_activity(&reconstruct(&events), &replay_sections(&loaded)));
    }

    #[test]
    fn untagged_legacy_tools_follow_previous_agent() {
        let metadata: ReplayMetadata = serde_json::from_value(json!({
            "agents_used": ["router", "kg"],
            "tools_called": [
                {"tool": "search", "server": "mcp"},
                {"tool": "query", "server": "arangodb", "agent": "kg", "result": {"rows": 1}},
                {"tool": "rank", "server": "mcp"}
            ]
        }))
        .unwrap();
        let sections = replay_sections(&metadata);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].tools[0].tool, "search");
        let kg_tools: Vec<_> = sections[1].tools.iter().map(|t| t.tool.as_str()).collect();
        assert_eq!(kg_tools, vec!["query", "rank"]);
        assert!(sections[1].tools[0].is_resolved());
        assert_eq!(sections[1].tools[0].duration_ms, None);
    }

    #[test]
    fn legacy_without_agents_lands_on_coordinator() {
        let metadata = ReplayMetadata {
            tools_called: vec![ToolCallInfo {
                call_id: None,
                tool: "search".into(),
                server: "mcp".into(),
                args: Value::Null,
                agent: None,
                duration_ms: None,
                result: None,
            }],
            ..ReplayMetadata::default()
        };
        let sections = replay_sections(&metadata);
        assert_eq!(sections[0].agent, COORDINATOR_AGENT);
        assert_eq!(sections[0].tools[0].args, json!({}));
    }

    #[test]
    fn empty_history_falls_back_to_reduced_form() {
        let mut metadata = reduce(&scenario(), Encoding::Legacy);
        metadata.event_history = Some(Vec::new());
        let expanded = expand(&metadata);
        assert_eq!(expanded[0].kind(), &EventKind::AgentSwitch);
    }

    #[test]
    fn tampered_history_fails_digest_check() {
        let mut metadata = reduce(&scenario(), Encoding::EventLog);
        if let Some(history) = metadata.event_history.as_mut() {
            history.pop();
        }
        assert!(!history_intact(&metadata));
    }

    #[test]
    fn empty_metadata_replays_to_nothing() {
        assert!(replay_sections(&ReplayMetadata::default()).is_empty());
    }
}
