//! # relay-protocol: shared contract for the relay workspace
//!
//! Defines the progress event taxonomy, the coordinator/agent handoff
//! contract, persisted session record shapes, and the ports agents and
//! routers implement. Runtime-free (no tokio, no axum) so every other crate
//! can depend on it.
//!
//! ## Module Overview
//!
//! - [`ids`]: Typed ID wrappers (JobId, ConversationId, MessageId)
//! - [`event`]: `Event` + `EventKind`, wire parsing, payload accessors
//! - [`handoff`]: `AgentResponse`, `Handoff`, `HandoffCallback`
//! - [`session`]: job records, conversations, replay metadata, session records
//! - [`ports`]: `Agent`, `Router`, `EventSink`, `AgentContext`
//! - [`error`]: RelayError, RelayResult

pub mod error;
pub mod event;
pub mod handoff;
pub mod ids;
pub mod ports;
pub mod session;

pub use error::{RelayError, RelayResult};
pub use event::{COORDINATOR_AGENT, Event, EventKind};
pub use handoff::{AgentResponse, Handoff, HandoffCallback};
pub use ids::{ConversationId, JobId, MessageId};
pub use ports::{Agent, AgentContext, AgentTask, EventSink, JobRequest, Route, Router};
pub use session::{
    ChatMessage, Conversation, ConversationSummary, JobRecord, JobStatus, MessageRole,
    ReplayMetadata, SessionRecord, ToolCallInfo,
};
