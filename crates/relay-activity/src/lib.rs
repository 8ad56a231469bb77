//! Turns a flat, ordered event stream into "who did what, with what result".
//!
//! [`reconstruct`] is the only grouping routine. The live view folds events
//! into it one at a time; replay runs the same fold over a stored history.

mod live;
mod reconstruct;
pub mod replay;

pub use live::{JobOutcome, LiveView, final_text, terminal_outcome};
pub use reconstruct::{
    AQL_SERVER, AQL_TOOL, ActivityReconstructor, AgentSection, ToolCall, reconstruct,
};
pub use replay::{
    Encoding, expand, history_digest, history_intact, reduce, replay_sections, same_activity,
};
