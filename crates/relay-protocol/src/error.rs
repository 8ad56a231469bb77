//! Error types for the relay protocol.

use thiserror::Error;

/// Errors raised while orchestrating agents or moving events around.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),
    #[error("agent {agent} failed: {message}")]
    AgentFailed { agent: String, message: String },
    #[error("malformed handoff: {0}")]
    MalformedHandoff(String),
    #[error("missing handoff context: {0}")]
    MissingContext(String),
    #[error("handoff bounce limit exceeded between {first} and {second} ({limit} bounces)")]
    BounceLimitExceeded {
        first: String,
        second: String,
        limit: u32,
    },
    #[error("handoff limit exceeded: {0}")]
    HandoffLimitExceeded(u32),
    #[error("delegation limit exceeded: {0}")]
    DelegationLimitExceeded(u32),
    #[error("job cancelled")]
    Cancelled,
    #[error("terminal event already emitted for job {0}")]
    TerminalAlreadyEmitted(String),
    #[error("event stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl RelayError {
    pub fn agent_failed(agent: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::AgentFailed {
            agent: agent.into(),
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Convenience result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounce_limit_message_names_both_agents() {
        let error = RelayError::BounceLimitExceeded {
            first: "kg".into(),
            second: "metrics".into(),
            limit: 3,
        };
        let rendered = error.to_string();
        assert!(rendered.contains("kg"));
        assert!(rendered.contains("metrics"));
        assert!(rendered.contains("3 bounces"));
    }

    #[test]
    fn agent_failed_helper_formats_message() {
        let error = RelayError::agent_failed("citation", "render failed");
        assert_eq!(error.to_string(), "agent citation failed: render failed");
    }
}
