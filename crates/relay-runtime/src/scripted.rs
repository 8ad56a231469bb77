//! Agents that replay a fixed script. Used by the demo daemon and tests in
//! place of agents backed by a reasoning service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_protocol::{Agent, AgentContext, AgentTask, JobId, RelayError, RelayResult};
use serde_json::{Value, json};

use crate::router::StaticRouter;

#[derive(Debug, Clone)]
pub struct ScriptedTool {
    pub tool: String,
    pub server: String,
    pub args: Value,
    /// Reported as a `tool_result` when present.
    pub result: Option<Value>,
    pub duration_ms: u64,
}

impl ScriptedTool {
    pub fn new(tool: impl Into<String>, server: impl Into<String>, args: Value) -> Self {
        Self {
            tool: tool.into(),
            server: server.into(),
            args,
            result: None,
            duration_ms: 0,
        }
    }

    pub fn with_result(mut self, result: Value, duration_ms: u64) -> Self {
        self.result = Some(result);
        self.duration_ms = duration_ms;
        self
    }
}

/// What one invocation does.
#[derive(Debug, Clone, Default)]
pub struct ScriptedStep {
    pub status: Option<String>,
    pub tools: Vec<ScriptedTool>,
    pub delay: Option<Duration>,
    pub reply: Value,
    pub failure: Option<String>,
}

impl ScriptedStep {
    pub fn reply(reply: Value) -> Self {
        Self {
            reply,
            ..Self::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::default()
        }
    }

    /// Reply with a handoff to `to`, asking to be called back as `callback`.
    pub fn handoff(
        to: impl Into<String>,
        reason: impl Into<String>,
        request: Value,
        callback: impl Into<String>,
        context: Value,
    ) -> Self {
        Self::reply(json!({
            "handoff": {
                "to": to.into(),
                "reason": reason.into(),
                "request": request,
                "callback": {"agent": callback.into(), "context": context}
            }
        }))
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_tool(mut self, tool: ScriptedTool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Plays its steps in order, from the start for every job; the last step
/// repeats once the script runs out. Every task it receives is kept for
/// inspection.
#[derive(Debug)]
pub struct ScriptedAgent {
    name: String,
    script: Vec<ScriptedStep>,
    positions: Mutex<HashMap<JobId, usize>>,
    received: Mutex<Vec<AgentTask>>,
}

impl ScriptedAgent {
    pub fn new(name: impl Into<String>, steps: Vec<ScriptedStep>) -> Self {
        Self {
            name: name.into(),
            script: steps,
            positions: Mutex::new(HashMap::new()),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn received(&self) -> Vec<AgentTask> {
        self.received.lock().clone()
    }

    fn next_step(&self, job_id: &JobId) -> Option<ScriptedStep> {
        let last = self.script.len().checked_sub(1)?;
        let mut positions = self.positions.lock();
        let position = positions.entry(job_id.clone()).or_insert(0);
        let step = self.script[(*position).min(last)].clone();
        *position += 1;
        Some(step)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, task: AgentTask, context: AgentContext) -> RelayResult<Value> {
        let step = self.next_step(&task.job_id);
        self.received.lock().push(task);
        let step = step
            .ok_or_else(|| RelayError::agent_failed(&self.name, "script is empty"))?;

        if let Some(status) = &step.status {
            context.status(status.as_str()).await?;
        }
        for tool in &step.tools {
            context
                .tool_call(tool.tool.as_str(), tool.server.as_str(), tool.args.clone())
                .await?;
            if let Some(result) = &tool.result {
                context
                    .tool_result(tool.tool.as_str(), result.clone(), tool.duration_ms)
                    .await?;
            }
        }
        if let Some(delay) = step.delay {
            tokio::time::sleep(delay).await;
        }
        match step.failure {
            Some(message) => Err(RelayError::agent_failed(&self.name, message)),
            None => Ok(step.reply),
        }
    }

    fn release(&self, job_id: &JobId) {
        self.positions.lock().remove(job_id);
    }
}

/// Agents and router for the demo binaries: `router` hands the request to
/// `kg` for a graph lookup, then to `metrics`, and answers from both.
pub fn demo_team() -> (Vec<Arc<dyn Agent>>, StaticRouter) {
    let router = ScriptedAgent::new(
        "router",
        vec![
            ScriptedStep::handoff(
                "kg",
                "needs company facts",
                json!({"lookup": "company"}),
                "router",
                json!({"stage": "facts"}),
            )
            .with_status("Routing query"),
            ScriptedStep::handoff(
                "metrics",
                "needs the reported metric",
                json!({"metric": "revenue"}),
                "router",
                json!({"stage": "metrics"}),
            ),
            ScriptedStep::reply(json!({
                "response": "ACME reported revenue of 4.2B in FY2024."
            })),
        ],
    );
    let kg = ScriptedAgent::new(
        "kg",
        vec![
            ScriptedStep::reply(json!({"company": "ACME", "filings": 3}))
                .with_status("Searching the knowledge graph")
                .with_tool(
                    ScriptedTool::new(
                        "query",
                        "arangodb",
                        json!({"query": "FOR c IN companies FILTER c.name == @name RETURN c"}),
                    )
                    .with_result(json!({"rows": 3}), 120),
                )
                .with_delay(Duration::from_millis(200)),
        ],
    );
    let metrics = ScriptedAgent::new(
        "metrics",
        vec![
            ScriptedStep::reply(json!({"metric": "revenue", "value": "4.2B"}))
                .with_tool(
                    ScriptedTool::new("find_metric", "mcp", json!({"name": "revenue"}))
                        .with_result(json!({"value": "4.2B", "period": "FY2024"}), 45),
                )
                .with_delay(Duration::from_millis(200)),
        ],
    );
    let agents: Vec<Arc<dyn Agent>> = vec![Arc::new(router), Arc::new(kg), Arc::new(metrics)];
    (agents, StaticRouter::new("router", "classify request"))
}
