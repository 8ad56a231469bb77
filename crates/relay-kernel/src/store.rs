use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use relay_protocol::{Conversation, ConversationId, JobId, SessionRecord};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tracing::{debug, warn};

/// Durable session records and conversations.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save_record(&self, record: &SessionRecord) -> Result<()>;
    async fn load_record(&self, job_id: &JobId) -> Result<Option<SessionRecord>>;

    async fn save_conversation(&self, conversation: &Conversation) -> Result<()>;
    async fn load_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>>;
    /// All conversations, most recently updated first.
    async fn list_conversations(&self) -> Result<Vec<Conversation>>;
    /// Returns whether anything was deleted.
    async fn delete_conversation(&self, id: &ConversationId) -> Result<bool>;
}

/// Pretty JSON files: `<root>/sessions/<job_id>.json` and
/// `<root>/conversations/<conversation_id>.json`.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    root: PathBuf,
}

impl FileSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn record_path(&self, job_id: &JobId) -> PathBuf {
        self.root
            .join("sessions")
            .join(format!("{}.json", job_id.as_str()))
    }

    fn conversations_dir(&self) -> PathBuf {
        self.root.join("conversations")
    }

    fn conversation_path(&self, id: &ConversationId) -> PathBuf {
        self.conversations_dir().join(format!("{}.json", id.as_str()))
    }

    async fn write_pretty_json<T: Serialize + Sync>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create dir {parent:?}"))?;
        }
        let payload = serde_json::to_string_pretty(value)?;
        fs::write(path, payload)
            .await
            .with_context(|| format!("failed writing {path:?}"))?;
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed reading {path:?}"))?;
        let value =
            serde_json::from_str(&raw).with_context(|| format!("failed parsing {path:?}"))?;
        Ok(Some(value))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save_record(&self, record: &SessionRecord) -> Result<()> {
        Self::write_pretty_json(&self.record_path(&record.job_id), record).await?;
        debug!(job_id = %record.job_id, "session record saved");
        Ok(())
    }

    async fn load_record(&self, job_id: &JobId) -> Result<Option<SessionRecord>> {
        Self::read_json(&self.record_path(job_id)).await
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        Self::write_pretty_json(
            &self.conversation_path(&conversation.conversation_id),
            conversation,
        )
        .await
    }

    async fn load_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        Self::read_json(&self.conversation_path(id)).await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let dir = self.conversations_dir();
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed listing {dir:?}"))?;
        let mut conversations = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match Self::read_json::<Conversation>(&path).await {
                Ok(Some(conversation)) => conversations.push(conversation),
                Ok(None) => {}
                Err(error) => warn!(?path, error = %format!("{error:#}"), "skipping unreadable conversation"),
            }
        }
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<bool> {
        let path = self.conversation_path(id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(false);
        }
        fs::remove_file(&path)
            .await
            .with_context(|| format!("failed deleting {path:?}"))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relay_protocol::{ChatMessage, JobStatus, ReplayMetadata};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    #[tokio::test]
    async fn conversations_round_trip_and_list_newest_first() -> Result<()> {
        let root = unique_test_root("relay-store-conversations");
        let store = FileSessionStore::new(&root);

        let older = Conversation::new("older");
        let mut newer = Conversation::new("newer");
        newer.push(ChatMessage::user("hello"));
        store.save_conversation(&older).await?;
        store.save_conversation(&newer).await?;

        let listed = store.list_conversations().await?;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].title, "newer");

        let loaded = store
            .load_conversation(&newer.conversation_id)
            .await?
            .expect("saved conversation");
        assert_eq!(loaded.messages.len(), 1);

        assert!(store.delete_conversation(&older.conversation_id).await?);
        assert!(!store.delete_conversation(&older.conversation_id).await?);
        assert_eq!(store.list_conversations().await?.len(), 1);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn session_record_round_trip() -> Result<()> {
        let root = unique_test_root("relay-store-records");
        let store = FileSessionStore::new(&root);
        let job_id = JobId::new_uuid();
        assert!(store.load_record(&job_id).await?.is_none());

        let record = SessionRecord {
            job_id: job_id.clone(),
            conversation_id: None,
            query: "q".into(),
            status: JobStatus::Completed,
            answer: Some("done".into()),
            error: None,
            result: None,
            replay: ReplayMetadata {
                agents_used: vec!["kg".into()],
                ..ReplayMetadata::default()
            },
            finished_at: Utc::now(),
        };
        store.save_record(&record).await?;
        let loaded = store.load_record(&job_id).await?.expect("saved record");
        assert_eq!(loaded.answer.as_deref(), Some("done"));
        assert_eq!(loaded.replay, record.replay);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }
}
