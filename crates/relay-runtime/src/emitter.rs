use async_trait::async_trait;
use parking_lot::Mutex;
use relay_events::EventJournal;
use relay_protocol::{Event, EventKind, EventSink, JobId, RelayError, RelayResult};
use tracing::warn;

/// Event sink of one job. Writes through the journal and refuses anything
/// once a terminal event went out, so a job never reports both `complete`
/// and `error`.
pub struct JobEmitter {
    job_id: JobId,
    journal: EventJournal,
    terminal: Mutex<Option<EventKind>>,
}

impl JobEmitter {
    pub fn new(job_id: JobId, journal: EventJournal) -> Self {
        Self {
            job_id,
            journal,
            terminal: Mutex::new(None),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Kind of the terminal event already emitted, if any.
    pub fn terminal(&self) -> Option<EventKind> {
        self.terminal.lock().clone()
    }
}

#[async_trait]
impl EventSink for JobEmitter {
    async fn emit(&self, event: Event) -> RelayResult<()> {
        {
            let mut terminal = self.terminal.lock();
            if let Some(kind) = terminal.as_ref() {
                warn!(
                    job_id = %self.job_id,
                    terminal = %kind,
                    rejected = %event.kind(),
                    "event after terminal rejected"
                );
                return Err(RelayError::TerminalAlreadyEmitted(self.job_id.to_string()));
            }
            if event.is_terminal() {
                *terminal = Some(event.kind().clone());
            }
        }
        let terminal = event.is_terminal();
        let appended = self
            .journal
            .append_and_publish(&self.job_id, event)
            .await
            .map_err(|error| RelayError::Io(format!("{error:#}")));
        if terminal && appended.is_err() {
            // Not delivered, so another terminal event may still go out.
            *self.terminal.lock() = None;
        }
        appended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_events::{FileEventStore, JobEventHub};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[tokio::test]
    async fn nothing_is_emitted_after_error() -> anyhow::Result<()> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let root = std::env::temp_dir().join(format!("relay-emitter-{nanos}"));
        let journal = EventJournal::new(Arc::new(FileEventStore::new(&root)), JobEventHub::new());
        let job = JobId::new_uuid();
        let emitter = JobEmitter::new(job.clone(), journal.clone());

        emitter.emit(Event::status("working")).await?;
        emitter.emit(Event::error("boom")).await?;
        let rejected = emitter.emit(Event::complete(json!({"response": "x"}))).await;
        assert!(matches!(rejected, Err(RelayError::TerminalAlreadyEmitted(_))));
        assert_eq!(emitter.terminal(), Some(EventKind::Error));

        let stored = journal.read_all(&job).await?;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].kind(), &EventKind::Error);

        let _ = tokio::fs::remove_dir_all(root).await;
        Ok(())
    }
}
