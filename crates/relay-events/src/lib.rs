//! Durable event journal and live per-job transport.
//!
//! Every event a job emits is appended to a JSON-lines file and then handed
//! to the job's live subscriber, if one is attached. The file is the record
//! of truth; the live channel is best effort and never replays.

mod hub;

pub use hub::{Frame, JobEventHub, JobSubscription};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use relay_protocol::{Event, JobId};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, instrument, warn};

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, job_id: &JobId, event: &Event) -> Result<()>;
    async fn read_from(&self, job_id: &JobId, offset: usize, limit: usize) -> Result<Vec<Event>>;
    async fn count(&self, job_id: &JobId) -> Result<usize>;

    async fn read_all(&self, job_id: &JobId) -> Result<Vec<Event>> {
        self.read_from(job_id, 0, usize::MAX).await
    }

    /// Drop in-memory bookkeeping for a job that takes no more appends.
    /// Stored events stay.
    fn forget(&self, _job_id: &JobId) {}
}

/// One `<root>/events/<job_id>.jsonl` file per job.
#[derive(Debug)]
pub struct FileEventStore {
    root: PathBuf,
    write_locks: Mutex<HashMap<JobId, Arc<tokio::sync::Mutex<()>>>>,
    count_cache: Mutex<HashMap<JobId, usize>>,
}

impl FileEventStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: Mutex::new(HashMap::new()),
            count_cache: Mutex::new(HashMap::new()),
        }
    }

    fn file_path(&self, job_id: &JobId) -> PathBuf {
        self.root
            .join("events")
            .join(format!("{}.jsonl", job_id.as_str()))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create events dir {parent:?}"))?;
        }
        Ok(())
    }

    fn lock_for(&self, job_id: &JobId) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.write_locks.lock();
        guard
            .entry(job_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn scan(path: &Path, offset: usize, limit: usize) -> Result<(Vec<Event>, usize)> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok((Vec::new(), 0));
        }

        let file = OpenOptions::new().read(true).open(path).await?;
        let mut reader = BufReader::new(file).lines();
        let mut out = Vec::new();
        let mut index = 0_usize;

        while let Some(line) = reader.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            if index >= offset && out.len() < limit {
                match serde_json::from_str::<Event>(&line) {
                    Ok(event) => out.push(event),
                    Err(error) => {
                        warn!(%error, ?path, line = index, "skipping unreadable event line");
                    }
                }
            }
            index += 1;
        }
        Ok((out, index))
    }
}

#[async_trait]
impl EventStore for FileEventStore {
    #[instrument(skip(self, event), fields(job_id = %job_id, kind = %event.kind()))]
    async fn append(&self, job_id: &JobId, event: &Event) -> Result<()> {
        let path = self.file_path(job_id);
        Self::ensure_parent(&path).await?;

        let lock = self.lock_for(job_id);
        let _guard = lock.lock().await;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed opening event log {path:?}"))?;

        let line = serde_json::to_string(event).context("failed serializing event")?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        if let Some(count) = self.count_cache.lock().get_mut(job_id) {
            *count += 1;
        }
        debug!("event appended to store");
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id, offset, limit))]
    async fn read_from(&self, job_id: &JobId, offset: usize, limit: usize) -> Result<Vec<Event>> {
        let path = self.file_path(job_id);
        let (events, _) = Self::scan(&path, offset, limit).await?;
        debug!(count = events.len(), "events loaded from store");
        Ok(events)
    }

    async fn count(&self, job_id: &JobId) -> Result<usize> {
        if let Some(count) = self.count_cache.lock().get(job_id).copied() {
            return Ok(count);
        }
        let lock = self.lock_for(job_id);
        let _guard = lock.lock().await;
        let (_, count) = Self::scan(&self.file_path(job_id), 0, 0).await?;
        self.count_cache.lock().insert(job_id.clone(), count);
        Ok(count)
    }

    fn forget(&self, job_id: &JobId) {
        self.write_locks.lock().remove(job_id);
        self.count_cache.lock().remove(job_id);
    }
}

/// Append-then-publish: an event reaches a live subscriber only after it is
/// on disk.
#[derive(Clone)]
pub struct EventJournal {
    store: Arc<dyn EventStore>,
    hub: JobEventHub,
}

impl EventJournal {
    pub fn new(store: Arc<dyn EventStore>, hub: JobEventHub) -> Self {
        Self { store, hub }
    }

    #[instrument(skip(self, event), fields(job_id = %job_id, kind = %event.kind()))]
    pub async fn append_and_publish(&self, job_id: &JobId, event: Event) -> Result<()> {
        self.store.append(job_id, &event).await?;
        self.hub.publish(job_id, event);
        debug!("event published to stream");
        Ok(())
    }

    pub async fn read_all(&self, job_id: &JobId) -> Result<Vec<Event>> {
        self.store.read_all(job_id).await
    }

    pub async fn count(&self, job_id: &JobId) -> Result<usize> {
        self.store.count(job_id).await
    }

    pub fn subscribe(&self, job_id: &JobId) -> JobSubscription {
        self.hub.subscribe(job_id)
    }

    /// Release the job's store and transport bookkeeping once it has
    /// settled.
    pub fn forget(&self, job_id: &JobId) {
        self.store.forget(job_id);
        self.hub.forget(job_id);
    }

    pub fn hub(&self) -> &JobEventHub {
        &self.hub
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use relay_protocol::{Event, EventKind, JobId};
    use serde_json::json;
    use tokio::fs;

    use crate::{EventJournal, EventStore, FileEventStore, JobEventHub};

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    #[tokio::test]
    async fn file_event_store_appends_and_reads_in_order() -> Result<()> {
        let root = unique_test_root("relay-events");
        let store = FileEventStore::new(&root);
        let job = JobId::new_uuid();

        store.append(&job, &Event::status("one")).await?;
        store.append(&job, &Event::agent_switch("kg", "lookup")).await?;
        store.append(&job, &Event::complete(json!({"response": "ok"}))).await?;

        let all = store.read_all(&job).await?;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].message(), Some("one"));
        assert_eq!(all[2].kind(), &EventKind::Complete);

        let tail = store.read_from(&job, 1, 1).await?;
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].agent(), Some("kg"));
        assert_eq!(store.count(&job).await?, 3);

        store.append(&job, &Event::status("late")).await?;
        assert_eq!(store.count(&job).await?, 4);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn forgetting_a_job_keeps_its_events_on_disk() -> Result<()> {
        let root = unique_test_root("relay-events-forget");
        let store = FileEventStore::new(&root);
        let job = JobId::new_uuid();
        store.append(&job, &Event::status("one")).await?;
        assert_eq!(store.count(&job).await?, 1);
        assert_eq!(store.write_locks.lock().len(), 1);
        assert_eq!(store.count_cache.lock().len(), 1);

        store.forget(&job);
        assert!(store.write_locks.lock().is_empty());
        assert!(store.count_cache.lock().is_empty());
        assert_eq!(store.read_all(&job).await?.len(), 1);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn missing_job_reads_empty() -> Result<()> {
        let root = unique_test_root("relay-events-missing");
        let store = FileEventStore::new(&root);
        let job = JobId::new_uuid();
        assert!(store.read_all(&job).await?.is_empty());
        assert_eq!(store.count(&job).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_lines_are_skipped() -> Result<()> {
        let root = unique_test_root("relay-events-corrupt");
        let store = FileEventStore::new(&root);
        let job = JobId::from_string("corrupt");
        store.append(&job, &Event::status("ok")).await?;
        let path = root.join("events").join("corrupt.jsonl");
        let mut raw = fs::read_to_string(&path).await?;
        raw.push_str("not json\n");
        fs::write(&path, raw).await?;
        store.append(&job, &Event::status("after")).await?;

        let all = store.read_all(&job).await?;
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].message(), Some("after"));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn journal_persists_before_publishing() -> Result<()> {
        let root = unique_test_root("relay-events-journal");
        let journal = EventJournal::new(Arc::new(FileEventStore::new(&root)), JobEventHub::new());
        let job = JobId::new_uuid();
        let mut subscription = journal.subscribe(&job);

        journal
            .append_and_publish(&job, Event::status("Processing query..."))
            .await?;
        journal
            .append_and_publish(&job, Event::complete(json!({"response": "done"})))
            .await?;

        let first = subscription.next_event(Duration::from_secs(1)).await?;
        assert_eq!(first.and_then(|e| e.message().map(str::to_owned)).as_deref(), Some("Processing query..."));
        let second = subscription.next_event(Duration::from_secs(1)).await?;
        assert!(second.is_some_and(|e| e.is_terminal()));
        assert!(subscription.next_event(Duration::from_secs(1)).await?.is_none());
        assert_eq!(journal.read_all(&job).await?.len(), 2);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }
}
