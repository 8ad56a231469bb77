//! Job, conversation and session record types.

use crate::event::Event;
use crate::ids::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Status record of one submitted request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub status: JobStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn queued(job_id: JobId, query: impl Into<String>, conversation_id: Option<ConversationId>) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            query: query.into(),
            conversation_id,
            status: JobStatus::Queued,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One tool invocation in the reduced replay form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub tool: String,
    pub server: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// What a session record keeps to rebuild the activity view.
///
/// `event_history` is the lossless form. `agents_used` + `tools_called` is
/// the reduced form older records carry on their own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayMetadata {
    #[serde(default)]
    pub agents_used: Vec<String>,
    #[serde(default)]
    pub tools_called: Vec<ToolCallInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_history: Option<Vec<Event>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// SHA-256 (hex) of the serialized `event_history`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_digest: Option<String>,
}

impl ReplayMetadata {
    pub fn has_event_history(&self) -> bool {
        self.event_history
            .as_ref()
            .is_some_and(|history| !history.is_empty())
    }
}

/// Durable snapshot of a finished job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub query: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub replay: ReplayMetadata,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ReplayMetadata>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::default(),
            role: MessageRole::User,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    pub fn system(job_id: &JobId, content: impl Into<String>, metadata: ReplayMetadata) -> Self {
        Self {
            id: MessageId::for_job(job_id),
            role: MessageRole::System,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: Some(metadata),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: ConversationId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            conversation_id: ConversationId::default(),
            title: title.into(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.updated_at = Utc::now();
        self.messages.push(message);
    }

    /// Agents named by any system message, first appearance order.
    pub fn agents_used(&self) -> Vec<String> {
        let mut agents: Vec<String> = Vec::new();
        for metadata in self.messages.iter().filter_map(|m| m.metadata.as_ref()) {
            for agent in &metadata.agents_used {
                if !agents.contains(agent) {
                    agents.push(agent.clone());
                }
            }
        }
        agents
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            chat_id: self.conversation_id.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            message_count: self.messages.len(),
            last_message_preview: self
                .messages
                .last()
                .map(|message| message.content.chars().take(PREVIEW_CHARS).collect()),
            agents_used: self.agents_used(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub chat_id: ConversationId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    pub last_message_preview: Option<String>,
    pub agents_used: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn legacy_metadata_without_history_parses() {
        let raw = json!({
            "agents_used": ["router", "kg"],
            "tools_called": [
                {"tool": "query", "server": "arangodb", "args": {"q": "x"}, "agent": "kg"},
                {"tool": "delegate", "server": "internal"}
            ]
        });
        let metadata: ReplayMetadata = serde_json::from_value(raw).unwrap();
        assert!(!metadata.has_event_history());
        assert_eq!(metadata.tools_called.len(), 2);
        assert_eq!(metadata.tools_called[1].agent, None);
        assert_eq!(metadata.tools_called[1].args, Value::Null);
    }

    #[test]
    fn empty_history_counts_as_missing() {
        let metadata = ReplayMetadata {
            event_history: Some(Vec::new()),
            ..ReplayMetadata::default()
        };
        assert!(!metadata.has_event_history());
    }

    #[test]
    fn conversation_summary_tracks_agents_and_preview() {
        let mut conversation = Conversation::new("Revenue questions");
        conversation.push(ChatMessage::user("What was ACME revenue?"));
        let job = JobId::from_string("j1");
        conversation.push(ChatMessage::system(
            &job,
            "x".repeat(300),
            ReplayMetadata {
                agents_used: vec!["router".into(), "kg".into()],
                ..ReplayMetadata::default()
            },
        ));
        conversation.push(ChatMessage::system(
            &job,
            "second",
            ReplayMetadata {
                agents_used: vec!["kg".into(), "metrics".into()],
                ..ReplayMetadata::default()
            },
        ));

        let summary = conversation.summary();
        assert_eq!(summary.message_count, 3);
        assert_eq!(summary.last_message_preview.as_deref(), Some("second"));
        assert_eq!(summary.agents_used, vec!["router", "kg", "metrics"]);
    }

    #[test]
    fn job_status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
        assert!(JobStatus::Failed.is_finished());
        assert!(!JobStatus::Queued.is_finished());
    }
}
