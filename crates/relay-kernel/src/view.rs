use relay_activity::{AgentSection, JobOutcome, LiveView, history_intact, replay};
use relay_protocol::{JobId, JobStatus, SessionRecord};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewSource {
    /// Built from events as they streamed in.
    Live,
    /// Rebuilt from the stored session record.
    Record,
}

/// Activity view of one job, live or replayed.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job_id: JobId,
    pub source: ViewSource,
    pub sections: Vec<AgentSection>,
    pub outcome: JobOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<Value>,
}

impl JobView {
    pub fn from_live(job_id: JobId, view: &LiveView) -> Self {
        Self {
            job_id,
            source: ViewSource::Live,
            sections: view.sections(),
            outcome: view.outcome().clone(),
            status: view.status().map(str::to_owned),
            metrics: view.metrics().to_vec(),
        }
    }

    /// Replay a record through the same reconstruction the live view uses.
    pub fn from_record(record: &SessionRecord) -> Self {
        if !history_intact(&record.replay) {
            warn!(job_id = %record.job_id, "stored event history does not match its digest");
        }
        let events = replay::expand(&record.replay);
        let view = LiveView::from_events(&events);
        let outcome = if view.is_finished() {
            view.outcome().clone()
        } else {
            outcome_of(record)
        };
        Self {
            job_id: record.job_id.clone(),
            source: ViewSource::Record,
            sections: view.sections(),
            outcome,
            status: view.status().map(str::to_owned),
            metrics: view.metrics().to_vec(),
        }
    }
}

/// Outcome of a record whose replay data holds no terminal event.
fn outcome_of(record: &SessionRecord) -> JobOutcome {
    match record.status {
        JobStatus::Completed => JobOutcome::Completed {
            text: record.answer.clone().unwrap_or_default(),
            result: record.result.clone().unwrap_or(Value::Null),
        },
        JobStatus::Failed => JobOutcome::Failed {
            message: record
                .error
                .clone()
                .unwrap_or_else(|| "Unknown error".to_owned()),
        },
        JobStatus::Queued | JobStatus::Processing => JobOutcome::Running,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relay_protocol::{ReplayMetadata, ToolCallInfo};
    use serde_json::json;

    #[test]
    fn legacy_record_takes_outcome_from_status() {
        let record = SessionRecord {
            job_id: JobId::from_string("old"),
            conversation_id: None,
            query: "q".into(),
            status: JobStatus::Completed,
            answer: Some("42".into()),
            error: None,
            result: Some(json!({"response": "42"})),
            replay: ReplayMetadata {
                agents_used: vec!["kg".into()],
                tools_called: vec![ToolCallInfo {
                    call_id: None,
                    tool: "query".into(),
                    server: "arangodb".into(),
                    args: json!({"q": 1}),
                    agent: None,
                    duration_ms: None,
                    result: None,
                }],
                ..ReplayMetadata::default()
            },
            finished_at: Utc::now(),
        };
        let view = JobView::from_record(&record);
        assert_eq!(view.source, ViewSource::Record);
        assert_eq!(view.sections.len(), 1);
        assert_eq!(view.sections[0].tools[0].tool, "query");
        assert!(matches!(view.outcome, JobOutcome::Completed { ref text, .. } if text == "42"));
    }
}
