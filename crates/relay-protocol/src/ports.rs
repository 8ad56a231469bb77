//! Ports between the coordinator and its collaborators.
//!
//! Agents and routers are external: their reasoning lives elsewhere. The
//! coordinator only sees these traits. An agent gets an [`AgentContext`]
//! that can report its own tool activity but holds no handle to any other
//! agent, so delegation always goes back through the coordinator.
//!
//! Traits use `async-trait` for async dyn-dispatch.

use crate::error::RelayResult;
use crate::event::Event;
use crate::ids::{ConversationId, JobId};
use crate::session::ChatMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// A request as handed to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: JobId,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    /// Sources (paths, URLs) of documents the request is about.
    #[serde(default)]
    pub documents: Vec<String>,
    /// Recent conversation messages, oldest first.
    #[serde(default)]
    pub history: Vec<ChatMessage>,
}

impl JobRequest {
    pub fn new(job_id: JobId, query: impl Into<String>) -> Self {
        Self {
            job_id,
            query: query.into(),
            conversation_id: None,
            documents: Vec::new(),
            history: Vec::new(),
        }
    }
}

/// Work handed to one agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub job_id: JobId,
    pub instruction: String,
    #[serde(default)]
    pub input: Value,
    /// Job-wide context (document keys, conversation) passed unchanged to
    /// every invocation of the job.
    #[serde(default)]
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum Route {
    Delegate { agent: String, reason: String },
    Finish,
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event) -> RelayResult<()>;
}

/// Handle an agent uses to report progress under its own name.
#[derive(Clone)]
pub struct AgentContext {
    job_id: JobId,
    agent: String,
    sink: Arc<dyn EventSink>,
}

impl AgentContext {
    pub fn new(job_id: JobId, agent: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            job_id,
            agent: agent.into(),
            sink,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub async fn tool_call(
        &self,
        tool: impl Into<String> + Send,
        server: impl Into<String> + Send,
        args: Value,
    ) -> RelayResult<()> {
        self.sink
            .emit(Event::tool_call(tool, server, args).for_agent(&self.agent))
            .await
    }

    pub async fn tool_result(
        &self,
        tool: impl Into<String> + Send,
        result: Value,
        duration_ms: u64,
    ) -> RelayResult<()> {
        self.sink
            .emit(Event::tool_result(tool, result, duration_ms).for_agent(&self.agent))
            .await
    }

    pub async fn aql_query(&self, query: impl Into<String> + Send, bind_vars: Value) -> RelayResult<()> {
        self.sink.emit(Event::aql_query(query, bind_vars)).await
    }

    pub async fn metric_found(&self, metric: Value) -> RelayResult<()> {
        self.sink.emit(Event::metric_found(metric)).await
    }

    pub async fn status(&self, message: impl Into<String> + Send) -> RelayResult<()> {
        self.sink.emit(Event::status(message)).await
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    /// Returns a normal result or a `{"handoff": ...}` object.
    async fn invoke(&self, task: AgentTask, context: AgentContext) -> RelayResult<Value>;

    /// Drop any state kept for `job_id`. Called once the job has ended,
    /// however it ended.
    fn release(&self, _job_id: &JobId) {}
}

#[async_trait]
pub trait Router: Send + Sync {
    /// Decide the next agent. `last_result` is `None` while classifying the
    /// fresh request and carries the latest normal result afterwards.
    async fn route(
        &self,
        request: &JobRequest,
        last_result: Option<&Value>,
        agents: &[String],
    ) -> RelayResult<Route>;

    /// Drop any state kept for `job_id`. Called once the job has ended,
    /// however it ended.
    fn release(&self, _job_id: &JobId) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<Event>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn emit(&self, event: Event) -> RelayResult<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn context_tags_tool_events_with_agent_name() {
        let sink = Arc::new(RecordingSink::default());
        let context = AgentContext::new(JobId::from_string("j1"), "kg", sink.clone());

        context
            .tool_call("query", "arangodb", serde_json::json!({"q": "x"}))
            .await
            .unwrap();
        context
            .tool_result("query", serde_json::json!({"rows": 3}), 120)
            .await
            .unwrap();
        context.status("looking up filings").await.unwrap();

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind(), &EventKind::ToolCall);
        assert_eq!(events[0].agent(), Some("kg"));
        assert_eq!(events[1].agent(), Some("kg"));
        assert_eq!(events[1].u64_field("duration_ms"), Some(120));
        assert_eq!(events[2].agent(), None);
    }

    #[test]
    fn route_serializes_with_tag() {
        let route = Route::Delegate {
            agent: "kg".into(),
            reason: "lookup".into(),
        };
        let json = serde_json::to_value(&route).unwrap();
        assert_eq!(json["route"], "delegate");
        assert_eq!(json["agent"], "kg");
    }
}
