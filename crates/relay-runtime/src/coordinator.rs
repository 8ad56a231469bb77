use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use relay_protocol::{
    AgentContext, AgentResponse, AgentTask, COORDINATOR_AGENT, Event, EventSink, Handoff,
    JobRequest, RelayError, RelayResult, Route, Router,
};
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::config::CoordinatorConfig;
use crate::control::JobControl;
use crate::document::DocumentKey;
use crate::emitter::JobEmitter;
use crate::registry::AgentRegistry;
use crate::tool_trace::extract_tool_trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorState {
    Classifying,
    Delegating(String),
    AwaitingResult(String),
    HandingOff { from: String, to: String },
    Done,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Classifying => f.write_str("classifying"),
            Self::Delegating(agent) => write!(f, "delegating({agent})"),
            Self::AwaitingResult(agent) => write!(f, "awaiting_result({agent})"),
            Self::HandingOff { from, to } => write!(f, "handing_off({from}->{to})"),
            Self::Done => f.write_str("done"),
        }
    }
}

/// Next agent call of a delegation chain.
struct Invocation {
    agent: String,
    reason: String,
    input: Value,
}

/// Counters and bookkeeping of one job.
#[derive(Default)]
struct JobState {
    delegations: u32,
    handoffs: u32,
    bounces: HashMap<(String, String), u32>,
    traces: HashSet<String>,
}

/// Runs jobs against a registry of agents.
///
/// Agents never call each other. A handoff goes back to the coordinator,
/// which invokes the target, merges the target's result into the callback
/// context and resumes the callback agent. Pending callbacks live on an
/// explicit stack, so nesting depth is bounded by the handoff limit and not
/// by the call stack.
#[derive(Clone)]
pub struct Coordinator {
    registry: Arc<AgentRegistry>,
    router: Arc<dyn Router>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(registry: AgentRegistry, router: Arc<dyn Router>, config: CoordinatorConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            router,
            config,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Run one job to its terminal event.
    ///
    /// Emits `complete` with the final result, or `error` with the failure
    /// message, exactly once. When `complete` cannot be stored the job fails
    /// instead. Cancelling `control` drops the in-flight agent call and ends
    /// the job with [`RelayError::Cancelled`]. Router and agents release
    /// their per-job state on every path.
    #[instrument(skip(self, request, emitter, control), fields(job_id = %request.job_id))]
    pub async fn execute(
        &self,
        request: &JobRequest,
        emitter: Arc<JobEmitter>,
        control: &JobControl,
    ) -> RelayResult<Value> {
        let outcome = tokio::select! {
            outcome = self.drive(request, &emitter) => outcome,
            () = control.cancelled() => Err(RelayError::Cancelled),
        };
        self.release(request);

        let outcome = match outcome {
            Ok(result) => match emitter.emit(Event::complete(result.clone())).await {
                Ok(()) => {
                    info!("job completed");
                    return Ok(result);
                }
                Err(error) => {
                    warn!(%error, "complete event not stored");
                    error
                }
            },
            Err(error) => error,
        };
        warn!(error = %outcome, "job failed");
        emitter.emit(Event::error(outcome.to_string())).await?;
        Err(outcome)
    }

    fn release(&self, request: &JobRequest) {
        self.router.release(&request.job_id);
        for agent in self.registry.agents() {
            agent.release(&request.job_id);
        }
    }

    async fn drive(&self, request: &JobRequest, emitter: &Arc<JobEmitter>) -> RelayResult<Value> {
        let context = job_context(request);
        let agents = self.registry.names();
        let mut state = JobState::default();
        let mut last: Option<Value> = None;

        loop {
            self.transition(request, CoordinatorState::Classifying);
            let route = self.router.route(request, last.as_ref(), &agents).await?;
            let (agent, reason) = match route {
                Route::Finish => {
                    self.transition(request, CoordinatorState::Done);
                    return last.ok_or_else(|| {
                        RelayError::agent_failed(
                            COORDINATOR_AGENT,
                            "router finished before any agent produced a result",
                        )
                    });
                }
                Route::Delegate { agent, reason } => (agent, reason),
            };

            state.delegations += 1;
            if state.delegations > self.config.max_delegations {
                return Err(RelayError::DelegationLimitExceeded(self.config.max_delegations));
            }
            self.transition(request, CoordinatorState::Delegating(agent.clone()));

            let mut input = json!({ "query": request.query });
            if let Some(previous) = last.take() {
                input["previous_result"] = previous;
            }
            let invocation = Invocation {
                agent,
                reason,
                input,
            };
            last = Some(
                self.run_chain(request, &context, invocation, emitter, &mut state)
                    .await?,
            );
        }
    }

    /// Trampoline over one delegation and every handoff it triggers.
    async fn run_chain(
        &self,
        request: &JobRequest,
        context: &Map<String, Value>,
        first: Invocation,
        emitter: &Arc<JobEmitter>,
        state: &mut JobState,
    ) -> RelayResult<Value> {
        let mut pending: Vec<Handoff> = Vec::new();
        let mut next = first;

        loop {
            let agent = self.registry.get(&next.agent)?;
            emitter
                .emit(Event::agent_switch(next.agent.as_str(), next.reason.as_str()))
                .await?;
            emitter.emit(Event::step_start()).await?;
            self.transition(request, CoordinatorState::AwaitingResult(next.agent.clone()));

            let task = AgentTask {
                job_id: request.job_id.clone(),
                instruction: request.query.clone(),
                input: next.input,
                context: context.clone(),
            };
            let sink: Arc<dyn EventSink> = emitter.clone();
            let agent_context = AgentContext::new(request.job_id.clone(), next.agent.as_str(), sink);
            let raw = agent
                .invoke(task, agent_context)
                .await
                .map_err(|error| match error {
                    RelayError::AgentFailed { .. }
                    | RelayError::Cancelled
                    | RelayError::TerminalAlreadyEmitted(_) => error,
                    other => RelayError::agent_failed(&next.agent, other),
                })?;

            match AgentResponse::from_value(raw)? {
                AgentResponse::NormalResult(result) => {
                    self.publish_tool_trace(&next.agent, &result, emitter, state)
                        .await?;
                    match pending.pop() {
                        None => return Ok(result),
                        Some(handoff) => {
                            debug!(
                                job_id = %request.job_id,
                                from = %handoff.to,
                                callback = %handoff.callback.agent,
                                "resuming callback"
                            );
                            next = Invocation {
                                agent: handoff.callback.agent.clone(),
                                reason: format!("callback from {}", handoff.to),
                                input: handoff.merge_result(result),
                            };
                        }
                    }
                }
                AgentResponse::HandoffRequest(handoff) => {
                    self.transition(
                        request,
                        CoordinatorState::HandingOff {
                            from: next.agent.clone(),
                            to: handoff.to.clone(),
                        },
                    );
                    self.admit_handoff(&next.agent, &handoff, state)?;
                    emitter
                        .emit(Event::status(format!(
                            "{} handed off to {}",
                            next.agent, handoff.to
                        )))
                        .await?;
                    let reason = if handoff.reason.trim().is_empty() {
                        format!("handoff from {}", next.agent)
                    } else {
                        handoff.reason.clone()
                    };
                    next = Invocation {
                        agent: handoff.to.clone(),
                        reason,
                        input: handoff.request.clone(),
                    };
                    pending.push(handoff);
                }
            }
        }
    }

    fn admit_handoff(&self, from: &str, handoff: &Handoff, state: &mut JobState) -> RelayResult<()> {
        if !self.registry.contains(&handoff.to) {
            return Err(RelayError::AgentNotFound(handoff.to.clone()));
        }
        if !self.registry.contains(&handoff.callback.agent) {
            return Err(RelayError::MissingContext(format!(
                "callback agent {} is not registered",
                handoff.callback.agent
            )));
        }

        state.handoffs += 1;
        if state.handoffs > self.config.max_handoffs {
            return Err(RelayError::HandoffLimitExceeded(self.config.max_handoffs));
        }

        let pair = if from <= handoff.to.as_str() {
            (from.to_owned(), handoff.to.clone())
        } else {
            (handoff.to.clone(), from.to_owned())
        };
        let bounces = state.bounces.entry(pair.clone()).or_insert(0);
        *bounces += 1;
        if *bounces > self.config.max_bounces_per_pair {
            return Err(RelayError::BounceLimitExceeded {
                first: pair.0,
                second: pair.1,
                limit: self.config.max_bounces_per_pair,
            });
        }
        Ok(())
    }

    /// Report the tools listed in a `<tool_trace>` block of the result text.
    /// A block already seen in this job is skipped.
    async fn publish_tool_trace(
        &self,
        agent: &str,
        result: &Value,
        emitter: &Arc<JobEmitter>,
        state: &mut JobState,
    ) -> RelayResult<()> {
        let Some(text) = result_text(result) else {
            return Ok(());
        };
        let Some((raw, tools)) = extract_tool_trace(text) else {
            return Ok(());
        };
        if !state.traces.insert(raw) {
            return Ok(());
        }
        debug!(agent, count = tools.len(), "publishing tool trace");
        for tool in tools {
            emitter
                .emit(
                    Event::tool_call(tool.tool.as_str(), tool.server.as_str(), Value::Object(tool.args.clone()))
                        .for_agent(agent),
                )
                .await?;
            if let Some(query) = tool.query() {
                let bind_vars = tool
                    .args
                    .get("bind_vars")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Map::new()));
                emitter.emit(Event::aql_query(query, bind_vars)).await?;
            }
            if let Some(traced) = tool.result {
                emitter
                    .emit(Event::tool_result(tool.tool.as_str(), traced, 0).for_agent(agent))
                    .await?;
            }
        }
        Ok(())
    }

    fn transition(&self, request: &JobRequest, state: CoordinatorState) {
        debug!(job_id = %request.job_id, state = %state, "coordinator state");
    }
}

/// Context shared by every task of the job.
fn job_context(request: &JobRequest) -> Map<String, Value> {
    let mut context = Map::new();
    context.insert("query".to_owned(), Value::String(request.query.clone()));
    let documents: Vec<Value> = request
        .documents
        .iter()
        .map(|source| {
            json!({
                "key": DocumentKey::for_source(source),
                "source": source.trim(),
            })
        })
        .collect();
    context.insert("documents".to_owned(), Value::Array(documents));
    if let Some(conversation_id) = &request.conversation_id {
        context.insert(
            "conversation_id".to_owned(),
            Value::String(conversation_id.to_string()),
        );
    }
    if !request.history.is_empty() {
        let history = request
            .history
            .iter()
            .map(|message| json!({"role": message.role, "content": message.content}))
            .collect();
        context.insert("conversation".to_owned(), Value::Array(history));
    }
    context
}

fn result_text(result: &Value) -> Option<&str> {
    match result {
        Value::String(text) => Some(text),
        Value::Object(map) => map
            .get("response")
            .or_else(|| map.get("text"))
            .and_then(Value::as_str),
        _ => None,
    }
}
