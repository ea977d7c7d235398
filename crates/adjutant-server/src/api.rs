//! REST handlers.

use std::{collections::BTreeMap, path::PathBuf};

use adjutant_core::{AgentSession, SessionId, SessionStatus, WorkspaceKind};
use adjutant_session::BridgeError;
use adjutant_store::{
    Event, EventFilter, MarkRead, Message, NewMessage, Page, PageRequest, StoreError,
};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::state::AppState;

const SEARCH_DEFAULT_LIMIT: u32 = 50;
const SEARCH_MAX_LIMIT: u32 = 200;

/// API error, rendered as `{ "error", "code" }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": self.message, "code": self.code })),
        )
            .into_response()
    }
}

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        let (status, code) = match &e {
            BridgeError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            BridgeError::NotFound(_) | BridgeError::Pruned(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            BridgeError::Multiplexer(_) => (StatusCode::SERVICE_UNAVAILABLE, "MULTIPLEXER_UNAVAILABLE"),
            BridgeError::Registry(_) => (StatusCode::INTERNAL_SERVER_ERROR, "REGISTRY_ERROR"),
        };
        if status.is_server_error() {
            tracing::error!(error = %e, "Session request failed");
        }
        Self::new(status, code, e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let (status, code) = match &e {
            StoreError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            StoreError::InvalidCursor(_) => (StatusCode::BAD_REQUEST, "INVALID_CURSOR"),
            StoreError::Persistence(_) | StoreError::Corrupt { .. } | StoreError::Serialization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "PERSISTENCE_ERROR")
            }
        };
        if status.is_server_error() {
            tracing::error!(error = %e, "Store request failed");
        }
        Self::new(status, code, e.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Routes mounted under `/api`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/sessions/{id}/verify", post(verify_session))
        .route("/messages", get(list_messages).post(send_message))
        .route("/messages/unread", get(unread_counts))
        .route("/messages/search", get(search_messages))
        .route("/messages/read-all", post(mark_all_read))
        .route("/messages/{id}/read", post(mark_read))
        .route("/events", get(query_events))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub active_sessions: usize,
    pub protocol_ready: bool,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.uptime_seconds(),
        active_sessions: state.bridge.list_active().await.len(),
        protocol_ready: state.protocol.is_ready(),
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionListQuery {
    #[serde(default)]
    active: bool,
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionListQuery>,
) -> Json<Vec<AgentSession>> {
    Json(if query.active {
        state.bridge.list_active().await
    } else {
        state.bridge.list().await
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    project_path: Option<PathBuf>,
    name: Option<String>,
    #[serde(default)]
    workspace_kind: WorkspaceKind,
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<AgentSession>)> {
    let project = request
        .project_path
        .unwrap_or_else(|| state.project_root.clone());
    let name = request.name.as_deref().map(str::trim).filter(|n| !n.is_empty());
    let session = state
        .bridge
        .create_session(&project, name, request.workspace_kind)
        .await?;
    tracing::info!(session = %session.id, name = %session.name, "Session created via API");
    Ok((StatusCode::CREATED, Json(session)))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> ApiResult<Json<AgentSession>> {
    Ok(Json(state.bridge.get(id).await?))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> ApiResult<StatusCode> {
    state.bridge.teardown(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    session_id: SessionId,
    status: SessionStatus,
}

async fn verify_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> ApiResult<Json<VerifyResponse>> {
    let status = state.bridge.verify_liveness(id).await?;
    Ok(Json(VerifyResponse {
        session_id: id,
        status,
    }))
}

// Query strings carry numbers as text, so pages are spelled out here
// rather than flattened from `PageRequest`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListQuery {
    thread_id: Option<String>,
    session_id: Option<SessionId>,
    agent_id: Option<String>,
    cursor: Option<String>,
    limit: Option<u32>,
}

async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<MessageListQuery>,
) -> ApiResult<Json<Page<Message>>> {
    let page = PageRequest {
        cursor: query.cursor,
        limit: query.limit,
    };
    let messages = if let Some(thread) = &query.thread_id {
        state.messages.list_by_thread(thread, &page).await?
    } else if let Some(session) = query.session_id {
        state.messages.list_by_session(session, &page).await?
    } else if let Some(agent) = &query.agent_id {
        state.messages.list_by_agent(agent, &page).await?
    } else {
        state.messages.list_recent(&page).await?
    };
    Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    /// Sender address; the human user when absent.
    from: Option<String>,
    to: Option<String>,
    body: String,
    thread_id: Option<String>,
    session_id: Option<SessionId>,
    metadata: Option<Value>,
}

async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    if request.body.trim().is_empty() {
        return Err(ApiError::bad_request("Message body must not be empty"));
    }
    let peer = state.chat.peer(request.from.as_deref());
    let message = state
        .chat
        .send(NewMessage {
            session_id: request.session_id,
            sender_id: peer.agent_id,
            recipient_id: request.to,
            role: peer.role,
            body: request.body,
            metadata: request.metadata,
            event_type: None,
            thread_id: request.thread_id,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn unread_counts(State(state): State<AppState>) -> ApiResult<Json<BTreeMap<String, u64>>> {
    Ok(Json(state.messages.unread_counts().await?))
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: String,
    limit: Option<u32>,
}

async fn search_messages(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Vec<Message>>> {
    let limit = query
        .limit
        .unwrap_or(SEARCH_DEFAULT_LIMIT)
        .clamp(1, SEARCH_MAX_LIMIT);
    Ok(Json(state.messages.search(&query.q, limit).await?))
}

async fn mark_read(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Value>> {
    let outcome = state.messages.mark_read(id).await?;
    let already_read = matches!(outcome, MarkRead::AlreadyRead(_));
    if !already_read {
        state.chat.announce_read(id);
    }
    Ok(Json(json!({ "message": outcome.message(), "alreadyRead": already_read })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkAllReadRequest {
    agent_id: String,
}

async fn mark_all_read(
    State(state): State<AppState>,
    Json(request): Json<MarkAllReadRequest>,
) -> ApiResult<Json<Value>> {
    let updated = state.messages.mark_all_read(&request.agent_id).await?;
    Ok(Json(json!({ "updated": updated })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventQuery {
    #[serde(rename = "type")]
    event_type: Option<String>,
    agent_id: Option<String>,
    work_item_id: Option<String>,
    cursor: Option<String>,
    limit: Option<u32>,
}

async fn query_events(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> ApiResult<Json<Page<Event>>> {
    let filter = EventFilter {
        event_type: query.event_type,
        agent_id: query.agent_id,
        work_item_id: query.work_item_id,
    };
    let page = PageRequest {
        cursor: query.cursor,
        limit: query.limit,
    };
    Ok(Json(state.events.query(&filter, &page).await?))
}
