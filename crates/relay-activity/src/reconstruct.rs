//! Grouping of tool activity under the agent that performed it.

use indexmap::IndexMap;
use relay_protocol::{COORDINATOR_AGENT, Event, EventKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tool name recorded for `aql_query` events.
pub const AQL_TOOL: &str = "aql_query";
/// Server recorded for `aql_query` events.
pub const AQL_SERVER: &str = "arangodb";

const UNKNOWN: &str = "unknown";

/// One tool invocation as shown to a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool: String,
    pub server: String,
    pub args: Value,
    /// `None` until a matching `tool_result` arrives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ToolCall {
    pub fn is_resolved(&self) -> bool {
        self.result.is_some()
    }
}

/// All tool activity of one agent within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSection {
    pub agent: String,
    /// Reason given the first time the agent was switched to.
    pub reason: String,
    pub tools: Vec<ToolCall>,
}

impl AgentSection {
    fn new(agent: &str, reason: &str) -> Self {
        Self {
            agent: agent.to_owned(),
            reason: reason.to_owned(),
            tools: Vec::new(),
        }
    }
}

/// Incremental fold over an event stream.
///
/// Feeding events one at a time yields after every step exactly what
/// [`reconstruct`] returns for the same prefix. Sections keep the order in
/// which their agent first appeared; each agent has at most one section.
#[derive(Debug, Clone, Default)]
pub struct ActivityReconstructor {
    sections: IndexMap<String, AgentSection>,
    current: Option<String>,
}

impl ActivityReconstructor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event in.
    ///
    /// Before any `agent_switch`, untagged tool activity lands in a single
    /// coordinator section; a `tool_call` tagged with an agent always goes
    /// to that agent's section, so differently tagged calls open several
    /// sections even without a switch.
    pub fn apply(&mut self, event: &Event) {
        match event.kind() {
            EventKind::AgentSwitch => {
                let Some(agent) = event.agent() else {
                    return;
                };
                self.section_mut(agent, event.str_field("reason").unwrap_or_default());
                self.current = Some(agent.to_owned());
            }
            EventKind::ToolCall => {
                let agent = self.owner(event.agent());
                let args = match event.field("args") {
                    Some(Value::Object(args)) => Value::Object(args.clone()),
                    _ => Value::Object(Map::new()),
                };
                self.push_call(
                    &agent,
                    event.call_id(),
                    event.str_field("tool").unwrap_or(UNKNOWN),
                    event.str_field("server").unwrap_or(UNKNOWN),
                    args,
                );
            }
            EventKind::AqlQuery => {
                // Always attributed to the current agent, never to a payload tag.
                let agent = self.owner(None);
                let mut args = Map::new();
                args.insert(
                    "query".to_owned(),
                    Value::String(event.str_field("query").unwrap_or_default().to_owned()),
                );
                args.insert(
                    "bind_vars".to_owned(),
                    event
                        .field("bind_vars")
                        .filter(|value| !value.is_null())
                        .cloned()
                        .unwrap_or_else(|| Value::Object(Map::new())),
                );
                self.push_call(&agent, event.call_id(), AQL_TOOL, AQL_SERVER, Value::Object(args));
            }
            EventKind::ToolResult => self.resolve(event),
            _ => {}
        }
    }

    /// Sections so far, in first-appearance order.
    pub fn sections(&self) -> impl Iterator<Item = &AgentSection> {
        self.sections.values()
    }

    pub fn snapshot(&self) -> Vec<AgentSection> {
        self.sections.values().cloned().collect()
    }

    pub fn into_sections(self) -> Vec<AgentSection> {
        self.sections.into_values().collect()
    }

    pub fn section(&self, agent: &str) -> Option<&AgentSection> {
        self.sections.get(agent)
    }

    pub fn current_agent(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    fn owner(&self, tagged: Option<&str>) -> String {
        tagged
            .or(self.current.as_deref())
            .unwrap_or(COORDINATOR_AGENT)
            .to_owned()
    }

    fn section_mut(&mut self, agent: &str, reason: &str) -> &mut AgentSection {
        self.sections
            .entry(agent.to_owned())
            .or_insert_with(|| AgentSection::new(agent, reason))
    }

    fn push_call(&mut self, agent: &str, call_id: Option<&str>, tool: &str, server: &str, args: Value) {
        let section = self.section_mut(agent, "");
        let id = match call_id {
            Some(id) => id.to_owned(),
            None => format!("{agent}:{}:{tool}", section.tools.len()),
        };
        section.tools.push(ToolCall {
            id,
            tool: tool.to_owned(),
            server: server.to_owned(),
            args,
            result: None,
            duration_ms: None,
        });
    }

    /// Attach a result to the call it belongs to. A result carrying a call
    /// id matches only that call; one without an id goes to the oldest
    /// unresolved call of the same tool. A result nobody is waiting for is
    /// dropped, duplicates included.
    fn resolve(&mut self, event: &Event) {
        let agent = self.owner(event.agent());
        let Some(section) = self.sections.get_mut(&agent) else {
            return;
        };
        let pending = match event.call_id() {
            Some(id) => section
                .tools
                .iter()
                .position(|call| call.id == id && call.result.is_none()),
            None => {
                let tool = event.str_field("tool").unwrap_or(UNKNOWN);
                section
                    .tools
                    .iter()
                    .position(|call| call.tool == tool && call.result.is_none())
            }
        };
        let Some(index) = pending else {
            return;
        };
        let call = &mut section.tools[index];
        call.result = Some(event.field("result").cloned().unwrap_or(Value::Null));
        call.duration_ms = event.u64_field("duration_ms");
    }
}

/// Group an ordered event sequence into agent sections.
pub fn reconstruct<'a>(events: impl IntoIterator<Item = &'a Event>) -> Vec<AgentSection> {
    let mut reconstructor = ActivityReconstructor::new();
    for event in events {
        reconstructor.apply(event);
    }
    reconstructor.into_sections()
}
