//! Typed identifiers.
//!
//! IDs are opaque String wrappers (serde-transparent). New IDs are UUID v4,
//! but anything stored by an older deployment parses back unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Create a new ID using UUID v4 (random).
            pub fn new_uuid() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new_uuid()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Identifier of one submitted request and its coordinator execution.
    JobId
);
typed_id!(
    /// Identifier of a conversation (chat) grouping several jobs.
    ConversationId
);
typed_id!(
    /// Identifier of a message inside a conversation.
    MessageId
);

impl MessageId {
    /// Message id of the system answer produced by a job.
    pub fn for_job(job_id: &JobId) -> Self {
        Self(format!("msg_{job_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_new_is_unique() {
        let a = JobId::new_uuid();
        let b = JobId::new_uuid();
        assert_ne!(a, b);
    }

    #[test]
    fn conversation_id_from_string() {
        let id = ConversationId::from_string("chat-1");
        assert_eq!(id.as_str(), "chat-1");
        assert_eq!(id.to_string(), "chat-1");
    }

    #[test]
    fn typed_id_serde_is_transparent() {
        let id = JobId::from_string("JOB001");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"JOB001\"");
        let back: JobId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn message_id_for_job_uses_msg_prefix() {
        let job = JobId::from_string("abc");
        assert_eq!(MessageId::for_job(&job).as_str(), "msg_abc");
    }
}
