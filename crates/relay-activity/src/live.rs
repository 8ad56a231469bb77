use crate::reconstruct::{ActivityReconstructor, AgentSection};
use relay_protocol::{Event, EventKind};
use serde::Serialize;
use serde_json::Value;

const UNKNOWN_ERROR: &str = "Unknown error";

/// How a job ended, as far as the events seen so far tell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobOutcome {
    Running,
    Completed { text: String, result: Value },
    Failed { message: String },
}

impl JobOutcome {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Live rendering state of one job: activity sections plus the latest
/// status line, discovered metrics and the outcome.
///
/// The first terminal event decides the outcome; anything after it is
/// ignored.
#[derive(Debug, Clone)]
pub struct LiveView {
    activity: ActivityReconstructor,
    status: Option<String>,
    metrics: Vec<Value>,
    outcome: JobOutcome,
    events_seen: usize,
}

impl Default for LiveView {
    fn default() -> Self {
        Self {
            activity: ActivityReconstructor::new(),
            status: None,
            metrics: Vec::new(),
            outcome: JobOutcome::Running,
            events_seen: 0,
        }
    }
}

impl LiveView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut view = Self::new();
        for event in events {
            view.apply(event);
        }
        view
    }

    /// Fold one event in. Returns `true` once the job has finished.
    pub fn apply(&mut self, event: &Event) -> bool {
        if self.outcome.is_finished() {
            return true;
        }
        self.events_seen += 1;
        self.activity.apply(event);
        match event.kind() {
            EventKind::Connected => self.status = Some("Connected".to_owned()),
            EventKind::Status => {
                if let Some(message) = event.message() {
                    self.status = Some(message.to_owned());
                }
            }
            EventKind::StepStart => self.status = Some("Working...".to_owned()),
            EventKind::AgentSwitch => {
                if let Some(agent) = event.agent() {
                    self.status = Some(format!("Switched to {agent}"));
                }
            }
            EventKind::MetricFound => {
                if let Some(metric) = event.field("metric") {
                    self.metrics.push(metric.clone());
                }
            }
            EventKind::Complete => {
                let result = event.field("result").cloned().unwrap_or(Value::Null);
                self.outcome = JobOutcome::Completed {
                    text: final_text(&result),
                    result,
                };
            }
            EventKind::Error => {
                self.outcome = JobOutcome::Failed {
                    message: event.message().unwrap_or(UNKNOWN_ERROR).to_owned(),
                };
            }
            _ => {}
        }
        self.outcome.is_finished()
    }

    pub fn sections(&self) -> Vec<AgentSection> {
        self.activity.snapshot()
    }

    pub fn activity(&self) -> &ActivityReconstructor {
        &self.activity
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn metrics(&self) -> &[Value] {
        &self.metrics
    }

    pub fn outcome(&self) -> &JobOutcome {
        &self.outcome
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_finished()
    }

    pub fn events_seen(&self) -> usize {
        self.events_seen
    }
}

/// User-facing answer text of a `complete` result: its `response`, else its
/// `text`, else the result serialized as JSON.
pub fn final_text(result: &Value) -> String {
    match result {
        Value::String(text) => text.clone(),
        Value::Object(map) => map
            .get("response")
            .or_else(|| map.get("text"))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| result.to_string()),
        other => other.to_string(),
    }
}

/// Outcome decided by the first terminal event of a sequence.
pub fn terminal_outcome<'a>(events: impl IntoIterator<Item = &'a Event>) -> JobOutcome {
    LiveView::from_events(events).outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn final_text_prefers_response_then_text() {
        assert_eq!(final_text(&json!({"response": "done", "text": "no"})), "done");
        assert_eq!(final_text(&json!({"text": "plain"})), "plain");
        assert_eq!(final_text(&json!({"rows": 3})), r#"{"rows":3}"#);
        assert_eq!(final_text(&json!("raw")), "raw");
    }

    #[test]
    fn error_before_complete_means_failed() {
        let events = vec![
            Event::status("working"),
            Event::error("agent kg failed"),
            Event::complete(json!({"response": "too late"})),
        ];
        assert_eq!(
            terminal_outcome(&events),
            JobOutcome::Failed {
                message: "agent kg failed".into()
            }
        );
    }

    #[test]
    fn events_after_terminal_are_ignored() {
        let mut view = LiveView::new();
        assert!(!view.apply(&Event::agent_switch("kg", "lookup")));
        assert!(view.apply(&Event::complete(json!({"response": "done"}))));
        assert!(view.apply(&Event::tool_call("late", "mcp", json!({}))));
        assert_eq!(view.events_seen(), 2);
        assert!(view.sections()[0].tools.is_empty());
        assert!(matches!(view.outcome(), JobOutcome::Completed { text, .. } if text == "done"));
    }

    #[test]
    fn tracks_status_and_metrics() {
        let view = LiveView::from_events(&[
            Event::status("Job queued, waiting for worker..."),
            Event::metric_found(json!({"name": "revenue", "value": 10})),
            Event::status("Processing query..."),
        ]);
        assert_eq!(view.status(), Some("Processing query..."));
        assert_eq!(view.metrics().len(), 1);
        assert!(!view.is_finished());
    }

    #[test]
    fn error_without_message_gets_placeholder() {
        let view = LiveView::from_events(&[Event::new(EventKind::Error, Default::default())]);
        assert_eq!(
            view.outcome(),
            &JobOutcome::Failed {
                message: UNKNOWN_ERROR.into()
            }
        );
    }
}
