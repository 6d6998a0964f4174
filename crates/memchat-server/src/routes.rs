//! ============================================================================
//! Routes - HTTP surface of the chat backend
//! ============================================================================
//! POST   /chat                       stream an answer (text/plain)
//! GET    /conversations              list conversations by recency
//! GET    /history/{conversation_id}  messages of one conversation
//! DELETE /memories/{user_id}         forget everything about a user
//! GET    /health                     memory backend status
//! GET    /docs                       route listing
//! GET    /                           307 → /docs
//! ============================================================================

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use memchat_core::{MemchatError, Role, TurnRequest};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const CONVERSATION_ID_HEADER: &str = "x-conversation-id";

const ROUTES: &[(&str, &str, &str)] = &[
    ("POST", "/chat", "Stream a memory-augmented answer"),
    ("GET", "/conversations", "List conversations, most recent first"),
    ("GET", "/history/{conversation_id}", "Messages of a conversation in order"),
    ("DELETE", "/memories/{user_id}", "Delete every memory of a user"),
    ("GET", "/health", "Memory backend status"),
    ("GET", "/docs", "This listing"),
];

/// Build the router with CORS for `cors_origin`
pub fn router(state: AppState, cors_origin: &str) -> Router {
    let cors = match HeaderValue::from_str(cors_origin) {
        Ok(origin) => CorsLayer::new().allow_origin(origin),
        Err(_) => CorsLayer::new(),
    }
    .allow_methods([Method::GET, Method::POST, Method::DELETE])
    .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(USER_ID_HEADER)])
    .expose_headers([HeaderName::from_static(CONVERSATION_ID_HEADER)]);

    Router::new()
        .route("/", get(redirect_to_docs))
        .route("/docs", get(docs))
        .route("/health", get(health))
        .route("/chat", post(chat))
        .route("/conversations", get(list_conversations))
        .route("/history/{conversation_id}", get(history))
        .route("/memories/{user_id}", delete(purge_memories))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub user_input: String,
    #[serde(default)]
    pub conversation_id: Option<u64>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConversationsQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConversationSummary {
    pub id: u64,
    pub title: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn redirect_to_docs() -> Redirect {
    Redirect::temporary("/docs")
}

async fn docs() -> Json<Value> {
    let routes: Vec<Value> = ROUTES
        .iter()
        .map(|(method, path, summary)| json!({ "method": method, "path": path, "summary": summary }))
        .collect();
    Json(json!({ "service": "memchat", "routes": routes }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let memory = match &state.memory {
        Some(manager) if manager.health_check().await => {
            json!({ "status": "connected", "index": manager.index_name() })
        }
        Some(manager) => json!({ "status": "unreachable", "index": manager.index_name() }),
        None => json!({ "status": "disabled" }),
    };
    Json(json!({ "status": "ok", "memory": memory }))
}

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Response> {
    let user_id = request.user_id.or_else(|| header_user_id(&headers));

    let turn = state
        .chat
        .start_turn(TurnRequest {
            user_input: request.user_input,
            conversation_id: request.conversation_id,
            user_id,
        })
        .await?;

    debug!("Streaming conversation {}", turn.conversation_id);

    let body = Body::from_stream(ReceiverStream::new(turn.tokens).map(Ok::<_, Infallible>));
    Ok((
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            ),
            (
                HeaderName::from_static(CONVERSATION_ID_HEADER),
                HeaderValue::from(turn.conversation_id),
            ),
        ],
        body,
    )
        .into_response())
}

async fn list_conversations(
    State(state): State<AppState>,
    Query(query): Query<ConversationsQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ConversationSummary>>> {
    let user_id = query
        .user_id
        .filter(|u| !u.trim().is_empty())
        .or_else(|| header_user_id(&headers));

    let conversations = state.history.list_conversations(user_id.as_deref())?;
    Ok(Json(
        conversations
            .into_iter()
            .map(|c| ConversationSummary {
                id: c.id,
                title: c.title,
                updated_at: c.updated_at,
            })
            .collect(),
    ))
}

async fn history(
    State(state): State<AppState>,
    Path(conversation_id): Path<u64>,
) -> ApiResult<Json<Vec<HistoryEntry>>> {
    let messages = state.history.get_history(conversation_id)?;
    Ok(Json(
        messages
            .into_iter()
            .map(|m| HistoryEntry {
                role: m.role,
                content: m.content,
                created_at: m.created_at,
            })
            .collect(),
    ))
}

async fn purge_memories(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<StatusCode> {
    let memory = state.memory.as_ref().ok_or_else(|| {
        ApiError(MemchatError::StorageUnavailable(
            "memory backend not initialized".to_string(),
        ))
    })?;
    memory.purge_namespace(&user_id).await?;
    info!("Purged memories of {}", user_id);
    Ok(StatusCode::NO_CONTENT)
}

fn header_user_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
