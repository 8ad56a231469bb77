//! Relay kernel: the facade binaries talk to.
//!
//! Owns the job table, runs each job's coordinator on its own task, persists
//! the session record when a job ends and keeps conversations.

mod store;
mod view;

pub use store::{FileSessionStore, SessionStore};
pub use view::{JobView, ViewSource};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use relay_activity::{Encoding, LiveView, final_text, reduce};
use relay_events::{EventJournal, FileEventStore, JobEventHub, JobSubscription};
use relay_protocol::{
    Agent, ChatMessage, Conversation, ConversationId, ConversationSummary, Event, JobId,
    JobRecord, JobRequest, JobStatus, RelayError, Router, SessionRecord,
};
use relay_runtime::{
    AgentRegistry, Coordinator, CoordinatorConfig, JobControl, JobEmitter, SequenceRouter,
};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

pub const QUEUED_STATUS: &str = "Job queued, waiting for worker...";
pub const PROCESSING_STATUS: &str = "Processing query...";
pub const MIN_KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub root: PathBuf,
    /// Longest silence a watcher tolerates before the stream counts as
    /// interrupted.
    pub idle_timeout: Duration,
    pub keep_alive_interval: Duration,
    /// Conversation messages passed to agents as context.
    pub history_context_messages: usize,
    /// Per-message character cap of that context.
    pub history_context_chars: usize,
    pub encoding: Encoding,
    pub coordinator: CoordinatorConfig,
}

impl KernelConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            idle_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(5),
            history_context_messages: 10,
            history_context_chars: 500,
            encoding: Encoding::EventLog,
            coordinator: CoordinatorConfig::default(),
        }
    }
}

pub struct KernelBuilder {
    config: KernelConfig,
    agents: Vec<Arc<dyn Agent>>,
    router: Option<Arc<dyn Router>>,
}

impl KernelBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            config: KernelConfig::new(root),
            agents: Vec::new(),
            router: None,
        }
    }

    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.config.idle_timeout = idle_timeout;
        self
    }

    /// Clamped to [`MIN_KEEP_ALIVE_INTERVAL`].
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = interval.max(MIN_KEEP_ALIVE_INTERVAL);
        self
    }

    pub fn history_context(mut self, messages: usize, chars: usize) -> Self {
        self.config.history_context_messages = messages;
        self.config.history_context_chars = chars;
        self
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.config.encoding = encoding;
        self
    }

    pub fn coordinator_config(mut self, config: CoordinatorConfig) -> Self {
        self.config.coordinator = config;
        self
    }

    pub fn agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.agents.push(agent);
        self
    }

    /// Without a router, jobs run every agent once in registration order.
    pub fn router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn build(self) -> RelayKernel {
        let journal = EventJournal::new(
            Arc::new(FileEventStore::new(self.config.root.clone())),
            JobEventHub::new(),
        );
        let sessions = Arc::new(FileSessionStore::new(self.config.root.clone()));

        let router = self.router.unwrap_or_else(|| {
            let steps: Vec<(String, String)> = self
                .agents
                .iter()
                .map(|agent| (agent.name().to_owned(), "pipeline step".to_owned()))
                .collect();
            Arc::new(SequenceRouter::new(steps))
        });
        let mut registry = AgentRegistry::new();
        for agent in self.agents {
            registry.register(agent);
        }
        let coordinator = Coordinator::new(registry, router, self.config.coordinator.clone());

        RelayKernel {
            inner: Arc::new(KernelInner {
                config: self.config,
                coordinator,
                journal,
                sessions,
                jobs: Mutex::new(HashMap::new()),
                conversation_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

struct JobEntry {
    record: JobRecord,
    control: JobControl,
    settled: Arc<watch::Sender<bool>>,
}

struct KernelInner {
    config: KernelConfig,
    coordinator: Coordinator,
    journal: EventJournal,
    sessions: Arc<dyn SessionStore>,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    conversation_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct RelayKernel {
    inner: Arc<KernelInner>,
}

impl RelayKernel {
    pub fn config(&self) -> &KernelConfig {
        &self.inner.config
    }

    pub fn agent_names(&self) -> Vec<String> {
        self.inner.coordinator.registry().names()
    }

    // ── jobs ──

    pub async fn submit(&self, query: impl Into<String>) -> Result<JobRecord> {
        self.submit_request(JobRequest::new(JobId::default(), query))
            .await
    }

    /// Queue a request and start it on its own task.
    #[instrument(skip(self, request), fields(job_id = %request.job_id))]
    pub async fn submit_request(&self, request: JobRequest) -> Result<JobRecord> {
        let (record, _) = self.enqueue(request, false).await?;
        Ok(record)
    }

    /// Like [`submit_request`](Self::submit_request), but subscribes before
    /// the first event is published so the caller sees the whole stream.
    #[instrument(skip(self, request), fields(job_id = %request.job_id))]
    pub async fn submit_watched(&self, request: JobRequest) -> Result<(JobRecord, JobSubscription)> {
        let (record, subscription) = self.enqueue(request, true).await?;
        let subscription = subscription.context("subscription missing for watched job")?;
        Ok((record, subscription))
    }

    async fn enqueue(
        &self,
        request: JobRequest,
        watched: bool,
    ) -> Result<(JobRecord, Option<JobSubscription>)> {
        let record = JobRecord::queued(
            request.job_id.clone(),
            request.query.clone(),
            request.conversation_id.clone(),
        );
        let control = JobControl::new();
        let (settled, _) = watch::channel(false);
        {
            let mut jobs = self.inner.jobs.lock();
            if jobs.contains_key(&request.job_id) {
                anyhow::bail!("job {} already exists", request.job_id);
            }
            jobs.insert(
                request.job_id.clone(),
                JobEntry {
                    record: record.clone(),
                    control: control.clone(),
                    settled: Arc::new(settled),
                },
            );
        }
        let subscription = watched.then(|| self.inner.journal.subscribe(&request.job_id));
        self.inner
            .journal
            .append_and_publish(&request.job_id, Event::status(QUEUED_STATUS))
            .await?;
        info!(query_len = request.query.len(), "job queued");

        let kernel = self.clone();
        tokio::spawn(async move { kernel.run_job(request, control).await });
        Ok((record, subscription))
    }

    /// Submit a query bound to a conversation. The user message is stored
    /// first; the most recent earlier messages go to agents as context.
    #[instrument(skip(self, query), fields(conversation_id = %conversation_id))]
    pub async fn submit_in_conversation(
        &self,
        conversation_id: &ConversationId,
        query: impl Into<String>,
    ) -> Result<JobRecord> {
        let query = query.into();
        let history = {
            let _guard = self.inner.conversation_lock.lock().await;
            let mut conversation = self.require_conversation(conversation_id).await?;
            let history = self.history_context(&conversation);
            conversation.push(ChatMessage::user(query.clone()));
            self.inner.sessions.save_conversation(&conversation).await?;
            history
        };
        let mut request = JobRequest::new(JobId::default(), query);
        request.conversation_id = Some(conversation_id.clone());
        request.history = history;
        self.submit_request(request).await
    }

    fn history_context(&self, conversation: &Conversation) -> Vec<ChatMessage> {
        let limit = self.inner.config.history_context_messages;
        let chars = self.inner.config.history_context_chars;
        let skip = conversation.messages.len().saturating_sub(limit);
        conversation.messages[skip..]
            .iter()
            .map(|message| {
                let mut message = message.clone();
                message.content = message.content.chars().take(chars).collect();
                message.metadata = None;
                message
            })
            .collect()
    }

    /// Run a job, then settle it. Once its session record is stored the job
    /// leaves the in-memory table and is served from the record; if storing
    /// failed the entry stays so its status remains visible.
    async fn run_job(&self, request: JobRequest, control: JobControl) {
        let job_id = request.job_id.clone();
        let stored = match self.process(request, control).await {
            Ok(()) => true,
            Err(error) => {
                warn!(job_id = %job_id, error = %format!("{error:#}"), "job bookkeeping failed");
                self.update_record(&job_id, |record| {
                    if !record.status.is_finished() {
                        record.status = JobStatus::Failed;
                        record.error = Some(format!("{error:#}"));
                    }
                });
                false
            }
        };
        self.inner.journal.hub().finish(&job_id);

        let settled = self
            .inner
            .jobs
            .lock()
            .get(&job_id)
            .map(|entry| entry.settled.clone());
        self.inner.journal.forget(&job_id);
        if stored {
            self.inner.jobs.lock().remove(&job_id);
        }
        if let Some(settled) = settled {
            settled.send_replace(true);
        }
    }

    #[instrument(skip(self, request, control), fields(job_id = %request.job_id))]
    async fn process(&self, request: JobRequest, control: JobControl) -> Result<()> {
        let job_id = request.job_id.clone();
        self.update_record(&job_id, |record| record.status = JobStatus::Processing);
        self.inner
            .journal
            .append_and_publish(&job_id, Event::status(PROCESSING_STATUS))
            .await?;

        let keep_alive = {
            let hub = self.inner.journal.hub().clone();
            let job_id = job_id.clone();
            let period = self
                .inner
                .config
                .keep_alive_interval
                .max(MIN_KEEP_ALIVE_INTERVAL);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    hub.keep_alive(&job_id);
                }
            })
        };

        let emitter = Arc::new(JobEmitter::new(job_id.clone(), self.inner.journal.clone()));
        let outcome = self
            .inner
            .coordinator
            .execute(&request, emitter, &control)
            .await;
        keep_alive.abort();

        let (status, answer, error, result) = match outcome {
            Ok(result) => (JobStatus::Completed, Some(final_text(&result)), None, Some(result)),
            Err(error) => (JobStatus::Failed, None, Some(error.to_string()), None),
        };
        self.update_record(&job_id, |record| {
            record.status = status;
            record.result = result.clone();
            record.error = error.clone();
        });

        let events = self
            .inner
            .journal
            .read_all(&job_id)
            .await
            .context("failed reading job events")?;
        let mut replay = reduce(&events, self.inner.config.encoding);
        replay.job_id = Some(job_id.clone());

        let session = SessionRecord {
            job_id: job_id.clone(),
            conversation_id: request.conversation_id.clone(),
            query: request.query.clone(),
            status,
            answer: answer.clone(),
            error: error.clone(),
            result,
            replay: replay.clone(),
            finished_at: Utc::now(),
        };
        self.inner.sessions.save_record(&session).await?;

        if let Some(conversation_id) = &request.conversation_id {
            let content = match (&answer, &error) {
                (Some(answer), _) => answer.clone(),
                (None, Some(error)) => format!("Error: {error}"),
                (None, None) => String::new(),
            };
            let _guard = self.inner.conversation_lock.lock().await;
            match self.inner.sessions.load_conversation(conversation_id).await? {
                Some(mut conversation) => {
                    conversation.push(ChatMessage::system(&job_id, content, replay));
                    self.inner.sessions.save_conversation(&conversation).await?;
                }
                None => warn!(%conversation_id, "conversation deleted while job ran"),
            }
        }
        info!(status = ?status, events = events.len(), "session record stored");
        Ok(())
    }

    fn update_record(&self, job_id: &JobId, update: impl FnOnce(&mut JobRecord)) {
        if let Some(entry) = self.inner.jobs.lock().get_mut(job_id) {
            update(&mut entry.record);
            entry.record.updated_at = Utc::now();
        }
    }

    /// Current record of a job; finished jobs of earlier runs come from
    /// their session record.
    pub async fn job(&self, job_id: &JobId) -> Result<Option<JobRecord>> {
        let live = self
            .inner
            .jobs
            .lock()
            .get(job_id)
            .map(|entry| entry.record.clone());
        if live.is_some() {
            return Ok(live);
        }
        Ok(self
            .inner
            .sessions
            .load_record(job_id)
            .await?
            .map(|session| JobRecord {
                job_id: session.job_id,
                query: session.query,
                conversation_id: session.conversation_id,
                status: session.status,
                result: session.result,
                error: session.error,
                created_at: session.finished_at,
                updated_at: session.finished_at,
            }))
    }

    pub async fn session_record(&self, job_id: &JobId) -> Result<Option<SessionRecord>> {
        self.inner.sessions.load_record(job_id).await
    }

    /// Ask a running job to stop. Returns `false` for unknown or finished
    /// jobs.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub fn cancel_job(&self, job_id: &JobId) -> bool {
        let jobs = self.inner.jobs.lock();
        match jobs.get(job_id) {
            Some(entry) if !entry.record.status.is_finished() => {
                entry.control.cancel();
                info!("job cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Resolves once the job's session record is stored (or storing it
    /// failed). Unknown jobs resolve immediately.
    pub async fn wait_settled(&self, job_id: &JobId) {
        let receiver = self
            .inner
            .jobs
            .lock()
            .get(job_id)
            .map(|entry| entry.settled.subscribe());
        if let Some(mut receiver) = receiver {
            let _ = receiver.wait_for(|settled| *settled).await;
        }
    }

    // ── streaming ──

    /// Attach as the job's live subscriber. Only events published from now
    /// on are delivered; a job that already ended yields a stream that is
    /// over, leaving its session record as the source.
    pub async fn subscribe(&self, job_id: &JobId) -> Result<JobSubscription> {
        let live = {
            let jobs = self.inner.jobs.lock();
            jobs.get(job_id).map(|entry| {
                if entry.record.status.is_finished() {
                    JobSubscription::closed(job_id.clone())
                } else {
                    self.inner.journal.subscribe(job_id)
                }
            })
        };
        if let Some(subscription) = live {
            return Ok(subscription);
        }
        if self.inner.sessions.load_record(job_id).await?.is_none() {
            return Err(RelayError::NotFound(format!("job {job_id}")).into());
        }
        Ok(JobSubscription::closed(job_id.clone()))
    }

    /// Fold a subscription into a live view until the job ends, calling
    /// `on_update` after every event. When the stream stops early (finished
    /// before subscribing, interrupted or replaced) the view comes from the
    /// session record instead.
    #[instrument(skip(self, subscription, on_update), fields(job_id = %subscription.job_id()))]
    pub async fn watch(
        &self,
        mut subscription: JobSubscription,
        mut on_update: impl FnMut(&Event, &LiveView) + Send,
    ) -> Result<JobView> {
        let job_id = subscription.job_id().clone();
        let idle = self.inner.config.idle_timeout;
        let mut view = LiveView::new();
        loop {
            match subscription.next_event(idle).await {
                Ok(Some(event)) => {
                    let finished = view.apply(&event);
                    on_update(&event, &view);
                    if finished {
                        return Ok(JobView::from_live(job_id, &view));
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(%error, "live stream interrupted, falling back to session record");
                    break;
                }
            }
        }

        if tokio::time::timeout(idle, self.wait_settled(&job_id))
            .await
            .is_err()
        {
            debug!("job still running after stream ended");
        }
        match self.inner.sessions.load_record(&job_id).await? {
            Some(record) => Ok(JobView::from_record(&record)),
            None => Err(RelayError::StreamInterrupted(format!(
                "job {job_id} has no live stream and no session record"
            ))
            .into()),
        }
    }

    /// Subscribe and watch in one step.
    pub async fn watch_job(
        &self,
        job_id: &JobId,
        on_update: impl FnMut(&Event, &LiveView) + Send,
    ) -> Result<JobView> {
        let subscription = self.subscribe(job_id).await?;
        self.watch(subscription, on_update).await
    }

    /// Activity view rebuilt from the stored session record.
    pub async fn replay_job(&self, job_id: &JobId) -> Result<Option<JobView>> {
        Ok(self
            .inner
            .sessions
            .load_record(job_id)
            .await?
            .map(|record| JobView::from_record(&record)))
    }

    // ── conversations ──

    pub async fn create_conversation(
        &self,
        title: Option<String>,
        initial_message: Option<String>,
    ) -> Result<Conversation> {
        let mut conversation = Conversation::new(title.unwrap_or_else(|| "New Chat".to_owned()));
        if let Some(message) = initial_message.filter(|m| !m.trim().is_empty()) {
            conversation.push(ChatMessage::user(message));
        }
        self.inner.sessions.save_conversation(&conversation).await?;
        info!(conversation_id = %conversation.conversation_id, "conversation created");
        Ok(conversation)
    }

    /// One page of conversations, newest first, plus the total count.
    pub async fn list_conversations(
        &self,
        skip: usize,
        limit: usize,
    ) -> Result<(Vec<ConversationSummary>, usize)> {
        let conversations = self.inner.sessions.list_conversations().await?;
        let total = conversations.len();
        let page = conversations
            .iter()
            .skip(skip)
            .take(limit)
            .map(Conversation::summary)
            .collect();
        Ok((page, total))
    }

    pub async fn conversation(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        self.inner.sessions.load_conversation(id).await
    }

    pub async fn rename_conversation(
        &self,
        id: &ConversationId,
        title: impl Into<String>,
    ) -> Result<Conversation> {
        let _guard = self.inner.conversation_lock.lock().await;
        let mut conversation = self.require_conversation(id).await?;
        conversation.title = title.into();
        conversation.updated_at = Utc::now();
        self.inner.sessions.save_conversation(&conversation).await?;
        Ok(conversation)
    }

    pub async fn delete_conversation(&self, id: &ConversationId) -> Result<bool> {
        let _guard = self.inner.conversation_lock.lock().await;
        self.inner.sessions.delete_conversation(id).await
    }

    async fn require_conversation(&self, id: &ConversationId) -> Result<Conversation> {
        self.inner
            .sessions
            .load_conversation(id)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("conversation {id}")).into())
    }
}

/// Error kind carried by an `anyhow` chain, for status mapping at the edge.
pub fn relay_error(error: &anyhow::Error) -> Option<&RelayError> {
    error.downcast_ref::<RelayError>()
}
