use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_protocol::{JobId, JobRequest, RelayResult, Route, Router};
use serde_json::Value;

/// Sends every request to one agent and finishes on its first result.
#[derive(Debug, Clone)]
pub struct StaticRouter {
    agent: String,
    reason: String,
}

impl StaticRouter {
    pub fn new(agent: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Router for StaticRouter {
    async fn route(
        &self,
        _request: &JobRequest,
        last_result: Option<&Value>,
        _agents: &[String],
    ) -> RelayResult<Route> {
        Ok(match last_result {
            None => Route::Delegate {
                agent: self.agent.clone(),
                reason: self.reason.clone(),
            },
            Some(_) => Route::Finish,
        })
    }
}

/// Fixed pipeline: each result moves the job to the next agent, the last
/// result finishes it.
#[derive(Debug, Default)]
pub struct SequenceRouter {
    steps: Vec<(String, String)>,
    positions: Mutex<HashMap<JobId, usize>>,
}

impl SequenceRouter {
    pub fn new<A, R>(steps: impl IntoIterator<Item = (A, R)>) -> Self
    where
        A: Into<String>,
        R: Into<String>,
    {
        Self {
            steps: steps
                .into_iter()
                .map(|(agent, reason)| (agent.into(), reason.into()))
                .collect(),
            positions: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Router for SequenceRouter {
    async fn route(
        &self,
        request: &JobRequest,
        last_result: Option<&Value>,
        _agents: &[String],
    ) -> RelayResult<Route> {
        let mut positions = self.positions.lock();
        let position = match last_result {
            None => 0,
            Some(_) => positions.get(&request.job_id).map_or(1, |p| p + 1),
        };
        match self.steps.get(position) {
            Some((agent, reason)) => {
                positions.insert(request.job_id.clone(), position);
                Ok(Route::Delegate {
                    agent: agent.clone(),
                    reason: reason.clone(),
                })
            }
            None => {
                positions.remove(&request.job_id);
                Ok(Route::Finish)
            }
        }
    }

    fn release(&self, job_id: &JobId) {
        self.positions.lock().remove(job_id);
    }
}
