//! Inbound HTTP API (§6 External Interfaces): operator/adapter-facing
//! endpoints for queue status, response polling/acking, and dead-letter
//! maintenance. No dashboard or static assets — those are out of scope.

use crate::conversation::ConversationTracker;
use crate::error::QueueError;
use crate::queue::{EnqueueResponseInput, QueueStore};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

pub struct ApiState {
    pub store: Arc<QueueStore>,
    pub conversations: ConversationTracker,
}

/// Build the `/api` router. The caller mounts it behind whatever bind
/// address and TLS termination its deployment needs.
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/queue/status", get(queue_status))
        .route("/queue/dead", get(list_dead))
        .route("/queue/dead/{id}/retry", post(retry_dead))
        .route("/queue/dead/{id}", delete(delete_dead))
        .route("/responses", get(recent_responses))
        .route("/responses/pending", get(pending_responses))
        .route("/responses", post(create_response))
        .route("/responses/{id}/ack", post(ack_response));

    Router::new().nest("/api", api_routes).layer(cors).with_state(state)
}

/// Serve `router(state)` on `bind`, shutting down gracefully when
/// `shutdown_rx` observes `true`.
pub async fn serve(
    bind: SocketAddr,
    state: Arc<ApiState>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "HTTP API listening");

    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown_rx;
        if let Err(error) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|v| *v).await;
            })
            .await
        {
            tracing::error!(%error, "HTTP API exited with error");
        }
    });

    Ok(handle)
}

#[derive(Serialize)]
struct QueueStatusResponse {
    incoming: i64,
    processing: i64,
    outgoing: i64,
    dead: i64,
    #[serde(rename = "activeConversations")]
    active_conversations: i64,
}

async fn queue_status(State(state): State<Arc<ApiState>>) -> Result<Json<QueueStatusResponse>, ApiError> {
    let status = state.store.status().await?;
    let active_conversations = state.conversations.active_count().await as i64;
    Ok(Json(QueueStatusResponse {
        incoming: status.incoming,
        processing: status.processing,
        outgoing: status.outgoing,
        dead: status.dead,
        active_conversations,
    }))
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

#[derive(Serialize)]
struct ResponsePayload {
    channel: String,
    sender: String,
    #[serde(rename = "senderId")]
    sender_id: String,
    message: String,
    #[serde(rename = "originalMessage")]
    original_message: String,
    timestamp: String,
    #[serde(rename = "messageId")]
    message_id: String,
    agent: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    files: Vec<String>,
}

async fn recent_responses(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<ResponsePayload>>, ApiError> {
    let responses = state.store.recent_responses(query.limit.unwrap_or(50)).await?;
    Ok(Json(responses.into_iter().map(to_payload).collect()))
}

#[derive(Deserialize)]
struct ChannelQuery {
    channel: String,
}

#[derive(Serialize)]
struct PendingResponsePayload {
    id: i64,
    channel: String,
    sender: String,
    #[serde(rename = "senderId")]
    sender_id: String,
    message: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    metadata: HashMap<String, serde_json::Value>,
}

async fn pending_responses(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ChannelQuery>,
) -> Result<Json<Vec<PendingResponsePayload>>, ApiError> {
    let responses = state.store.list_pending_responses(&query.channel).await?;
    Ok(Json(
        responses
            .into_iter()
            .map(|r| PendingResponsePayload {
                id: r.id,
                channel: r.channel,
                sender: r.sender,
                sender_id: r.sender_id,
                message: r.text,
                metadata: r.metadata,
            })
            .collect(),
    ))
}

#[derive(Deserialize)]
struct CreateResponseRequest {
    channel: Option<String>,
    sender: Option<String>,
    #[serde(default)]
    sender_id: Option<String>,
    message: Option<String>,
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    files: Vec<String>,
}

async fn create_response(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<CreateResponseRequest>,
) -> Result<StatusCode, ApiError> {
    let channel = request.channel.ok_or(ApiError::BadRequest("channel is required"))?;
    let sender = request.sender.ok_or(ApiError::BadRequest("sender is required"))?;
    let message = request.message.ok_or(ApiError::BadRequest("message is required"))?;

    state
        .store
        .enqueue_response(EnqueueResponseInput {
            message_id: uuid::Uuid::new_v4().to_string(),
            channel,
            sender: sender.clone(),
            sender_id: request.sender_id.unwrap_or(sender),
            text: message,
            original_text: String::new(),
            agent: request.agent.unwrap_or_else(|| "default".to_string()),
            files: request.files,
            metadata: HashMap::new(),
        })
        .await?;

    Ok(StatusCode::CREATED)
}

async fn ack_response(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.store.ack_response(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct DeadMessagePayload {
    id: i64,
    #[serde(rename = "messageId")]
    message_id: String,
    channel: String,
    text: String,
    #[serde(rename = "retryCount")]
    retry_count: u32,
    #[serde(rename = "lastError")]
    last_error: Option<String>,
}

async fn list_dead(State(state): State<Arc<ApiState>>) -> Result<Json<Vec<DeadMessagePayload>>, ApiError> {
    let dead = state.store.list_dead().await?;
    Ok(Json(
        dead.into_iter()
            .map(|m| DeadMessagePayload {
                id: m.id,
                message_id: m.message_id,
                channel: m.channel,
                text: m.text,
                retry_count: m.retry_count,
                last_error: m.last_error,
            })
            .collect(),
    ))
}

async fn retry_dead(State(state): State<Arc<ApiState>>, Path(id): Path<i64>) -> Result<StatusCode, ApiError> {
    state.store.retry_dead(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_dead(State(state): State<Arc<ApiState>>, Path(id): Path<i64>) -> Result<StatusCode, ApiError> {
    state.store.delete_dead(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn to_payload(response: crate::queue::QueuedResponse) -> ResponsePayload {
    ResponsePayload {
        channel: response.channel,
        sender: response.sender,
        sender_id: response.sender_id,
        message: response.text,
        original_message: response.original_text,
        timestamp: response.created_at.to_rfc3339(),
        message_id: response.message_id,
        agent: response.agent,
        files: response.files,
    }
}

enum ApiError {
    BadRequest(&'static str),
    NotFound,
    Internal(crate::Error),
}

impl From<crate::Error> for ApiError {
    fn from(error: crate::Error) -> Self {
        match &error {
            crate::Error::Queue(QueueError::NotDead(_) | QueueError::ResponseNotFound(_) | QueueError::MessageNotFound(_)) => {
                ApiError::NotFound
            }
            _ => ApiError::Internal(error),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found").into_response(),
            ApiError::Internal(error) => {
                tracing::error!(%error, "API request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}
