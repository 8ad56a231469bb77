//! Coordinator runtime.
//!
//! A [`Coordinator`] runs one job: it asks a [`Router`](relay_protocol::Router)
//! which agent goes next, invokes agents from the [`AgentRegistry`], follows
//! handoffs through a trampoline and reports everything through a
//! [`JobEmitter`].

mod config;
mod control;
mod coordinator;
mod document;
mod emitter;
mod registry;
mod router;
mod scripted;
mod tool_trace;

pub use config::CoordinatorConfig;
pub use control::JobControl;
pub use coordinator::{Coordinator, CoordinatorState};
pub use document::DocumentKey;
pub use emitter::JobEmitter;
pub use registry::AgentRegistry;
pub use router::{SequenceRouter, StaticRouter};
pub use scripted::{ScriptedAgent, ScriptedStep, ScriptedTool, demo_team};
pub use tool_trace::{TracedTool, extract_tool_trace};
