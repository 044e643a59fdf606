//! Route definitions for Atelier Gateway.
//!
//! Serves the chat page plus a small JSON API for sessions, chat turns,
//! history and the per-turn key rotation log.

use crate::conversation::{ConversationStore, StoredMessage};
use crate::page::PageRenderer;
use crate::provider::{Attachment, Provider};
use crate::rotation::{AttemptLogEntry, KeyRotationClient};
use crate::session::SessionId;
use crate::turn::{ChatService, TurnContext, TurnInput};
use atelier_common::config::Config;
use atelier_common::Error;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Redirect, Response},
    routing::{delete, get, post},
    Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

// ============================================================================
// State
// ============================================================================

/// One session's turn context. The slot stays locked for a whole turn.
pub struct SessionSlot {
    pub ctx: TurnContext,
    /// Set by a reset; holders must look the session up again
    retired: bool,
}

type SharedSlot = Arc<Mutex<SessionSlot>>;

/// Per-session turn contexts, kept in memory only.
///
/// Bounded by an LRU cache, so abandoned sessions (and their personal keys)
/// are dropped once `storage.max_sessions` newer ones have been used.
#[derive(Clone)]
pub struct SessionContexts {
    inner: Arc<Mutex<LruCache<SessionId, SharedSlot>>>,
}

impl SessionContexts {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Lock a session's slot, creating it on first use.
    ///
    /// Turns of one session run one at a time. A waiter that wakes up on a
    /// slot retired by a reset retries against the current entry.
    pub async fn acquire(&self, id: &SessionId) -> OwnedMutexGuard<SessionSlot> {
        loop {
            let slot = {
                let mut cache = self.inner.lock().await;
                match cache.get(id).cloned() {
                    Some(slot) => slot,
                    None => {
                        let slot = Arc::new(Mutex::new(SessionSlot {
                            ctx: TurnContext::new(id.clone()),
                            retired: false,
                        }));
                        Self::push(&mut cache, id.clone(), slot.clone());
                        slot
                    }
                }
            };

            let guard = slot.lock_owned().await;
            if !guard.retired {
                return guard;
            }
        }
    }

    /// Copy of a session's context. Unknown sessions get a fresh one and no entry.
    pub async fn snapshot(&self, id: &SessionId) -> TurnContext {
        let slot = self.inner.lock().await.get(id).cloned();
        match slot {
            Some(slot) => slot.lock().await.ctx.clone(),
            None => TurnContext::new(id.clone()),
        }
    }

    /// Drop a locked slot from the cache and mark it retired.
    pub async fn retire(&self, slot: &mut OwnedMutexGuard<SessionSlot>) {
        slot.retired = true;
        let id = slot.ctx.session_id.clone();

        let mut cache = self.inner.lock().await;
        let current = cache
            .peek(&id)
            .is_some_and(|entry| Arc::ptr_eq(entry, OwnedMutexGuard::mutex(slot)));
        if current {
            cache.pop(&id);
        }
    }

    /// Store the context of a session that has no entry yet.
    pub async fn insert(&self, ctx: TurnContext) {
        let id = ctx.session_id.clone();
        let slot = Arc::new(Mutex::new(SessionSlot { ctx, retired: false }));
        Self::push(&mut *self.inner.lock().await, id, slot);
    }

    fn push(cache: &mut LruCache<SessionId, SharedSlot>, id: SessionId, slot: SharedSlot) {
        if let Some((evicted, _)) = cache.push(id.clone(), slot) {
            if evicted != id {
                tracing::debug!(session = %evicted.short(), "Evicted idle session context");
            }
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatService>,
    pub contexts: SessionContexts,
    pub page: Arc<PageRenderer>,
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub service: String,
}

/// Query string of the chat page.
#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Response carrying a session id.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session_id: String,
}

/// Base64-encoded upload.
#[derive(Debug, Deserialize)]
pub struct AttachmentPayload {
    pub mime_type: String,
    pub data_base64: String,
}

/// Chat turn request body.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub prompt: String,
    /// Empty string clears the stored key
    #[serde(default)]
    pub personal_key: Option<String>,
    #[serde(default)]
    pub attachment: Option<AttachmentPayload>,
}

/// Chat turn response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    pub rotation_log: Vec<AttemptLogEntry>,
    pub needs_personal_key: bool,
}

/// Session history response.
#[derive(Debug, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub session_id: String,
    pub messages: Vec<StoredMessage>,
}

/// Last rotation log of a session.
#[derive(Debug, Serialize, Deserialize)]
pub struct RotationLogResponse {
    pub session_id: String,
    pub rotation_log: Vec<AttemptLogEntry>,
    pub needs_personal_key: bool,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(err: Error) -> ApiError {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        tracing::error!(error = %err, "Request failed");
    } else {
        tracing::debug!(error = %err, "Request rejected");
    }

    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: err.code().into(),
        }),
    )
}

fn parse_session(id: &str) -> Result<SessionId, ApiError> {
    SessionId::parse(id)
        .ok_or_else(|| api_error(Error::InvalidInput(format!("invalid session id '{id}'"))))
}

// ============================================================================
// Router
// ============================================================================

/// Build the router around an explicit provider and store.
pub fn build_routes_with(
    config: &Config,
    provider: Arc<dyn Provider>,
    store: ConversationStore,
) -> anyhow::Result<Router> {
    let chat = ChatService::new(
        store,
        KeyRotationClient::new(provider),
        config.server_keys(),
        &config.llm,
    );

    if chat.server_key_count() == 0 {
        tracing::warn!("No server API keys configured; users must supply a personal key");
    } else {
        tracing::info!(keys = chat.server_key_count(), "Server key pool loaded");
    }

    let state = AppState {
        chat: Arc::new(chat),
        contexts: SessionContexts::new(config.storage.max_sessions),
        page: Arc::new(PageRenderer::new()?),
    };

    let app_routes = Router::new()
        .route("/", get(page_handler))
        .route("/api/v1/sessions", post(create_session_handler))
        .route("/api/v1/sessions/:id/messages", get(messages_handler))
        .route("/api/v1/sessions/:id/chat", post(chat_handler))
        .route("/api/v1/sessions/:id/rotation-log", get(rotation_log_handler))
        .route("/api/v1/sessions/:id/reset", post(reset_handler))
        .route("/api/v1/sessions/:id/personal-key", delete(forget_key_handler))
        .with_state(state);

    Ok(Router::new().merge(app_routes).merge(health_routes()))
}

/// Build health check routes.
pub fn health_routes() -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/health", get(health_handler))
}

// ============================================================================
// Handlers
// ============================================================================

/// Chat page. Redirects to a fresh session when the query has none.
async fn page_handler(State(state): State<AppState>, Query(query): Query<PageQuery>) -> Response {
    let (session_id, created) = SessionId::resolve(query.session_id.as_deref());
    if created {
        tracing::info!(session = %session_id.short(), "New session");
        return Redirect::to(&format!("/?session_id={session_id}")).into_response();
    }

    let ctx = state.contexts.snapshot(&session_id).await;
    let rendered = state
        .chat
        .history(&session_id)
        .and_then(|history| state.page.render(&ctx, &history));

    match rendered {
        Ok(html) => Html(html).into_response(),
        Err(e) => api_error(e).into_response(),
    }
}

/// Hand out a new session id. Its context is created on first use.
async fn create_session_handler() -> (StatusCode, Json<SessionResponse>) {
    let session_id = SessionId::generate().to_string();
    (StatusCode::CREATED, Json(SessionResponse { session_id }))
}

async fn messages_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessagesResponse>, ApiError> {
    let session_id = parse_session(&id)?;
    let messages = state.chat.history(&session_id).map_err(api_error)?;

    Ok(Json(MessagesResponse {
        session_id: session_id.to_string(),
        messages,
    }))
}

/// Run one chat turn.
async fn chat_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let session_id = parse_session(&id)?;
    // Streamed bodies hit the size limit only while being read
    let Json(request) = body.map_err(|e| {
        let message = e.body_text();
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            api_error(Error::PayloadTooLarge(message))
        } else {
            api_error(Error::InvalidInput(message))
        }
    })?;

    let attachment = request
        .attachment
        .map(|payload| {
            let data = base64::engine::general_purpose::STANDARD
                .decode(payload.data_base64.trim())
                .map_err(|e| Error::InvalidInput(format!("attachment is not valid base64: {e}")))?;
            Attachment::new(payload.mime_type, data)
        })
        .transpose()
        .map_err(api_error)?;

    let input = TurnInput {
        prompt: request.prompt,
        personal_key: request.personal_key,
        attachment,
    };

    let mut slot = state.contexts.acquire(&session_id).await;
    let (ctx, reply) = state
        .chat
        .handle_turn(slot.ctx.clone(), input)
        .await
        .map_err(api_error)?;
    slot.ctx = ctx;
    drop(slot);

    Ok(Json(ChatResponse {
        session_id: session_id.to_string(),
        reply: reply.reply,
        rotation_log: reply.rotation_log,
        needs_personal_key: reply.needs_personal_key,
    }))
}

async fn rotation_log_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RotationLogResponse>, ApiError> {
    let session_id = parse_session(&id)?;
    let ctx = state.contexts.snapshot(&session_id).await;

    Ok(Json(RotationLogResponse {
        session_id: session_id.to_string(),
        rotation_log: ctx.rotation_log,
        needs_personal_key: ctx.needs_personal_key,
    }))
}

/// Clear a session's history and hand out a new session id.
async fn reset_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session_id = parse_session(&id)?;
    let mut slot = state.contexts.acquire(&session_id).await;
    let fresh = state.chat.reset(slot.ctx.clone()).map_err(api_error)?;

    let response = SessionResponse {
        session_id: fresh.session_id.to_string(),
    };
    state.contexts.retire(&mut slot).await;
    state.contexts.insert(fresh).await;

    Ok(Json(response))
}

/// Forget the personal key stored for a session.
async fn forget_key_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let session_id = parse_session(&id)?;
    let mut slot = state.contexts.acquire(&session_id).await;
    slot.ctx.set_personal_key("");

    Ok(StatusCode::NO_CONTENT)
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        service: "atelier-gateway".into(),
    })
}
