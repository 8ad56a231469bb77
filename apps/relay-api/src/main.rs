use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_stream::stream;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use futures_util::{Stream, StreamExt};
use relay_events::Frame;
use relay_kernel::{JobView, KernelBuilder, QUEUED_STATUS, RelayKernel, relay_error};
use relay_protocol::{
    Conversation, ConversationId, ConversationSummary, Event, JobId, JobRecord, JobRequest,
    JobStatus, RelayError,
};
use relay_runtime::{CoordinatorConfig, demo_team};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "relay-api")]
#[command(about = "relay job and conversation API")]
struct Cli {
    #[arg(long, default_value = ".relay")]
    root: PathBuf,
    #[arg(long, default_value = "127.0.0.1:8788")]
    listen: SocketAddr,
    /// Silence tolerated on a live stream before it counts as interrupted.
    #[arg(long, default_value_t = 30)]
    idle_timeout_secs: u64,
    #[arg(long, default_value_t = 8)]
    max_handoffs: u32,
}

#[derive(Clone)]
struct AppState {
    kernel: RelayKernel,
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(default)]
    documents: Vec<String>,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    job_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    chat_id: Option<ConversationId>,
    status: JobStatus,
    message: &'static str,
}

impl QueryResponse {
    fn queued(record: &JobRecord) -> Self {
        Self {
            job_id: record.job_id.clone(),
            chat_id: record.conversation_id.clone(),
            status: record.status,
            message: QUEUED_STATUS,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct CreateChatRequest {
    title: Option<String>,
    initial_message: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct UpdateChatRequest {
    title: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ChatListQuery {
    skip: Option<usize>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ChatListResponse {
    chats: Vec<ConversationSummary>,
    total: usize,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    fn internal(error: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: error.to_string(),
        }
    }

    /// Kernel errors: missing jobs and conversations are 404s.
    fn kernel(error: anyhow::Error) -> Self {
        match relay_error(&error) {
            Some(RelayError::NotFound(what)) => Self::not_found(format!("{what} not found")),
            _ => Self::internal(format!("{error:#}")),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let (agents, router) = demo_team();
    let mut builder = KernelBuilder::new(&cli.root)
        .idle_timeout(Duration::from_secs(cli.idle_timeout_secs))
        .coordinator_config(CoordinatorConfig::default().with_max_handoffs(cli.max_handoffs))
        .router(Arc::new(router));
    for agent in agents {
        builder = builder.agent(agent);
    }
    let state = AppState {
        kernel: builder.build(),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/query", post(submit_query))
        .route("/api/jobs/{job_id}", get(job_status))
        .route("/api/jobs/{job_id}/cancel", post(cancel_job))
        .route("/api/jobs/{job_id}/activity", get(job_activity))
        .route("/api/events/{job_id}", get(stream_events))
        .route("/api/chats", post(create_chat).get(list_chats))
        .route(
            "/api/chats/{chat_id}",
            get(get_chat).put(update_chat).delete(delete_chat),
        )
        .route("/api/chats/{chat_id}/query", post(submit_chat_query))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(listen = %cli.listen, root = %cli.root.display(), "relay-api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "relay-api",
        "agents": state.kernel.agent_names(),
    }))
}

async fn submit_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<Json<QueryResponse>> {
    if request.query.trim().is_empty() {
        return Err(ApiError::bad_request("query must not be empty"));
    }
    let mut job = JobRequest::new(JobId::new_uuid(), request.query);
    job.documents = request.documents;
    let record = state
        .kernel
        .submit_request(job)
        .await
        .map_err(ApiError::kernel)?;
    Ok(Json(QueryResponse::queued(&record)))
}

async fn job_status(
    Path(job_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<JobRecord>> {
    let job_id = parse_job_id(&job_id)?;
    state
        .kernel
        .job(&job_id)
        .await
        .map_err(ApiError::kernel)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("job {job_id} not found")))
}

async fn cancel_job(
    Path(job_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let job_id = parse_job_id(&job_id)?;
    let cancelled = state.kernel.cancel_job(&job_id);
    if !cancelled && state.kernel.job(&job_id).await.map_err(ApiError::kernel)?.is_none() {
        return Err(ApiError::not_found(format!("job {job_id} not found")));
    }
    Ok(Json(json!({ "job_id": job_id, "cancelled": cancelled })))
}

async fn job_activity(
    Path(job_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<JobView>> {
    let job_id = parse_job_id(&job_id)?;
    if let Some(view) = state
        .kernel
        .replay_job(&job_id)
        .await
        .map_err(ApiError::kernel)?
    {
        return Ok(Json(view));
    }
    match state.kernel.job(&job_id).await.map_err(ApiError::kernel)? {
        Some(_) => Err(ApiError::conflict(format!(
            "job {job_id} has no session record yet"
        ))),
        None => Err(ApiError::not_found(format!("job {job_id} not found"))),
    }
}

/// Live events of one job. Starts with `connected`, ends after the
/// terminal event. A job that finished before the client attached gets
/// its terminal event rebuilt from the job record.
async fn stream_events(
    Path(job_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    let job_id = parse_job_id(&job_id)?;
    let record = state
        .kernel
        .job(&job_id)
        .await
        .map_err(ApiError::kernel)?
        .ok_or_else(|| ApiError::not_found(format!("job {job_id} not found")))?;

    let subscription = if record.status.is_finished() {
        None
    } else {
        Some(
            state
                .kernel
                .subscribe(&job_id)
                .await
                .map_err(ApiError::kernel)?,
        )
    };

    let kernel = state.kernel.clone();
    let idle = kernel.config().idle_timeout;
    let stream = stream! {
        yield Ok(as_sse_event(&Event::connected(&job_id)));

        let mut terminal_sent = false;
        if let Some(subscription) = subscription {
            let mut frames = subscription.into_stream();
            while let Some(frame) = next_frame(&mut frames, idle, &job_id).await {
                match frame {
                    Frame::Event(event) => {
                        yield Ok(as_sse_event(&event));
                        if event.is_terminal() {
                            terminal_sent = true;
                            break;
                        }
                    }
                    Frame::KeepAlive => yield Ok(SseEvent::default().comment("ping")),
                }
            }
        }

        if !terminal_sent {
            if tokio::time::timeout(idle, kernel.wait_settled(&job_id)).await.is_err() {
                warn!(job_id = %job_id, "event stream ended before the job settled");
            }
            match kernel.job(&job_id).await {
                Ok(Some(record)) => {
                    if let Some(event) = terminal_from_record(&record) {
                        yield Ok(as_sse_event(&event));
                    }
                }
                Ok(None) => {}
                Err(error) => warn!(job_id = %job_id, error = %format!("{error:#}"), "job lookup failed"),
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

async fn create_chat(
    State(state): State<AppState>,
    Json(request): Json<CreateChatRequest>,
) -> ApiResult<Json<Conversation>> {
    let conversation = state
        .kernel
        .create_conversation(request.title, request.initial_message)
        .await
        .map_err(ApiError::kernel)?;
    Ok(Json(conversation))
}

async fn list_chats(
    Query(query): Query<ChatListQuery>,
    State(state): State<AppState>,
) -> ApiResult<Json<ChatListResponse>> {
    let skip = query.skip.unwrap_or(0);
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let (chats, total) = state
        .kernel
        .list_conversations(skip, limit)
        .await
        .map_err(ApiError::kernel)?;
    Ok(Json(ChatListResponse { chats, total }))
}

async fn get_chat(
    Path(chat_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<Conversation>> {
    let chat_id = parse_chat_id(&chat_id)?;
    state
        .kernel
        .conversation(&chat_id)
        .await
        .map_err(ApiError::kernel)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("chat {chat_id} not found")))
}

async fn update_chat(
    Path(chat_id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<UpdateChatRequest>,
) -> ApiResult<Json<Conversation>> {
    let chat_id = parse_chat_id(&chat_id)?;
    let title = request
        .title
        .filter(|title| !title.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("no fields to update"))?;
    let conversation = state
        .kernel
        .rename_conversation(&chat_id, title)
        .await
        .map_err(ApiError::kernel)?;
    Ok(Json(conversation))
}

async fn delete_chat(
    Path(chat_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let chat_id = parse_chat_id(&chat_id)?;
    let deleted = state
        .kernel
        .delete_conversation(&chat_id)
        .await
        .map_err(ApiError::kernel)?;
    if !deleted {
        return Err(ApiError::not_found(format!("chat {chat_id} not found")));
    }
    Ok(Json(json!({ "chat_id": chat_id, "deleted": true })))
}

async fn submit_chat_query(
    Path(chat_id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<Json<QueryResponse>> {
    let chat_id = parse_chat_id(&chat_id)?;
    if request.query.trim().is_empty() {
        return Err(ApiError::bad_request("query must not be empty"));
    }
    let record = state
        .kernel
        .submit_in_conversation(&chat_id, request.query)
        .await
        .map_err(ApiError::kernel)?;
    Ok(Json(QueryResponse::queued(&record)))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}

/// Ids name files on disk, so anything that could leave the data directory
/// is rejected.
fn validate_id(kind: &str, raw: &str) -> ApiResult<()> {
    let raw = raw.trim();
    if raw.is_empty()
        || raw.contains(['/', '\\'])
        || raw.contains("..")
        || raw.chars().any(char::is_control)
    {
        return Err(ApiError::bad_request(format!("invalid {kind} id")));
    }
    Ok(())
}

fn parse_job_id(raw: &str) -> ApiResult<JobId> {
    validate_id("job", raw)?;
    Ok(JobId::from_string(raw.trim()))
}

fn parse_chat_id(raw: &str) -> ApiResult<ConversationId> {
    validate_id("chat", raw)?;
    Ok(ConversationId::from_string(raw.trim()))
}

/// Next frame of a live stream, or `None` once it closes or stays silent
/// for `idle`.
async fn next_frame<S>(frames: &mut S, idle: Duration, job_id: &JobId) -> Option<Frame>
where
    S: Stream<Item = Frame> + Unpin,
{
    match tokio::time::timeout(idle, frames.next()).await {
        Ok(frame) => frame,
        Err(_) => {
            warn!(job_id = %job_id, "no activity on event stream, falling back to the job record");
            None
        }
    }
}

fn as_sse_event(event: &Event) -> SseEvent {
    SseEvent::default()
        .event(event.kind().as_str())
        .data(event.to_wire())
}

fn terminal_from_record(record: &JobRecord) -> Option<Event> {
    match record.status {
        JobStatus::Completed => Some(Event::complete(
            record.result.clone().unwrap_or_else(|| json!({})),
        )),
        JobStatus::Failed => Some(Event::error(
            record
                .error
                .clone()
                .unwrap_or_else(|| "Unknown error".to_owned()),
        )),
        JobStatus::Queued | JobStatus::Processing => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_events::JobEventHub;
    use relay_protocol::EventKind;

    #[test]
    fn ids_that_escape_the_data_dir_are_rejected() {
        assert!(parse_job_id("../etc/passwd").is_err());
        assert!(parse_job_id("a/b").is_err());
        assert!(parse_chat_id("  ").is_err());
        assert_eq!(parse_job_id(" 42 ").unwrap().as_str(), "42");
    }

    #[test]
    fn finished_records_rebuild_their_terminal_event() {
        let mut record = JobRecord::queued(JobId::from_string("j1"), "q", None);
        assert!(terminal_from_record(&record).is_none());

        record.status = JobStatus::Failed;
        let event = terminal_from_record(&record).unwrap();
        assert_eq!(event.kind(), &EventKind::Error);
        assert_eq!(event.message(), Some("Unknown error"));

        record.status = JobStatus::Completed;
        record.result = Some(json!({"response": "done"}));
        let event = terminal_from_record(&record).unwrap();
        assert_eq!(event.kind(), &EventKind::Complete);
        assert_eq!(event.field("result"), Some(&json!({"response": "done"})));
    }

    #[tokio::test]
    async fn silent_streams_give_up_after_the_idle_timeout() -> anyhow::Result<()> {
        let hub = JobEventHub::new();
        let job_id = JobId::from_string("silent");
        let mut frames = hub.subscribe(&job_id).into_stream();

        let started = std::time::Instant::now();
        let frame = next_frame(&mut frames, Duration::from_millis(50), &job_id).await;
        assert!(frame.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));

        hub.publish(&job_id, Event::status("still here"));
        let frame = next_frame(&mut frames, Duration::from_millis(50), &job_id).await;
        assert!(matches!(frame, Some(Frame::Event(event)) if event.message() == Some("still here")));
        Ok(())
    }

    #[test]
    fn not_found_kernel_errors_map_to_404() {
        let error = ApiError::kernel(RelayError::NotFound("job x".into()).into());
        assert_eq!(error.status, StatusCode::NOT_FOUND);
        assert_eq!(error.message, "job x not found");

        let error = ApiError::kernel(anyhow::anyhow!("disk full"));
        assert_eq!(error.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
