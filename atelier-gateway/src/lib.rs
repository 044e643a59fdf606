//! Atelier Gateway - chat assistant for traditional handmade products.
//!
//! This crate provides:
//! - A Gemini completion provider
//! - API-key rotation with failure classification and a per-turn attempt log
//! - SQLite conversation history partitioned by session
//! - A server-rendered chat page and a JSON API
//!
//! ## Architecture
//!
//! ```text
//! Page / API → ChatService (history → request → rotation) → Gemini
//!                    ↓                      ↓
//!            ConversationStore      personal key, then server pool
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod conversation;
pub mod credentials;
pub mod page;
pub mod provider;
pub mod rotation;
pub mod routes;
pub mod session;
pub mod turn;

pub use conversation::{ConversationStore, StoredMessage};
pub use credentials::{build_credentials, Credential, CredentialSource};
pub use provider::{
    Attachment, Completion, CompletionRequest, GeminiConfig, GeminiProvider, Provider,
    ProviderError, Role, Turn,
};
pub use rotation::{
    attempt_completion, classify_error, classify_message, AttemptLogEntry, KeyRotationClient,
    Outcome, RotationResult,
};
pub use session::SessionId;
pub use turn::{ChatService, TurnContext, TurnInput, TurnReply};

use anyhow::Context;
use atelier_common::config::Config;
use axum::{extract::DefaultBodyLimit, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

/// Wrap routes with the CORS and body-size layers.
pub fn with_layers(router: Router, config: &Config) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Cors must wrap the routes directly; it needs a `Default` response body.
    router.layer(
        ServiceBuilder::new()
            .layer(RequestBodyLimitLayer::new(config.storage.max_body_bytes))
            .layer(DefaultBodyLimit::disable())
            .layer(cors),
    )
}

/// Build the gateway router backed by Gemini and the configured database.
pub fn build_router(config: &Config) -> anyhow::Result<Router> {
    let provider = Arc::new(GeminiProvider::new(GeminiConfig::from_llm(&config.llm)));

    let db_path = config.storage.resolved_db_path();
    let store = ConversationStore::open(&db_path)
        .with_context(|| format!("Failed to open conversation store at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "Conversation store ready");

    let routes = routes::build_routes_with(config, provider, store)?;
    Ok(with_layers(routes, config))
}

/// Start the gateway server.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .listen_addr()
        .parse()
        .with_context(|| format!("Invalid listen address '{}'", config.listen_addr()))?;

    let router = build_router(config)?;

    tracing::info!(model = %config.llm.model, "Starting Atelier Gateway on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
