//! One chat turn: history, request assembly, rotation, persistence.
//!
//! All per-user state travels in an explicit [`TurnContext`] that is passed
//! in and handed back. Nothing is kept between calls except the stored
//! messages.

use crate::conversation::{ConversationStore, StoredMessage};
use crate::credentials::build_credentials;
use crate::provider::{Attachment, CompletionRequest, Role, Turn};
use crate::rotation::{AttemptLogEntry, KeyRotationClient};
use crate::session::SessionId;
use atelier_common::logging::generate_trace_id;
use atelier_common::util::mask_secret;
use atelier_common::{Error, LlmConfig, Result};
use serde::Serialize;
use std::fmt;
use tracing::Instrument;
use zeroize::Zeroizing;

/// Default persona sent as the system instruction of every request.
///
/// Written in Romanian so replies come back in the artisan's language.
/// `llm.system_prompt` replaces it.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
Ești un expert în artă populară românească, tradiții, folclor și marketing pentru produse handmade.
Rolul tău este să ajuți un artist să creeze produse autentice (mărțișoare, cadouri de Crăciun, Paște).
1. Analizează pozele încărcate din punct de vedere estetic și al materialelor.
2. Sugerează îmbunătățiri cromatice sau materiale naturale (lemn, lână, lut) specifice sezonului.
3. Creează o poveste lungă, emoționantă, cu iz arhaic românesc pentru fiecare produs, pe care artistul să o pună pe etichetă sau pe social media.
Tonul trebuie să fie cald, încurajator și respectuos față de tradiție.";

/// Per-session state carried between turns.
#[derive(Clone)]
pub struct TurnContext {
    pub session_id: SessionId,
    personal_key: Option<Zeroizing<String>>,
    /// Log of the most recent rotation only
    pub rotation_log: Vec<AttemptLogEntry>,
    /// Set when the last turn exhausted every key
    pub needs_personal_key: bool,
}

impl TurnContext {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            personal_key: None,
            rotation_log: Vec::new(),
            needs_personal_key: false,
        }
    }

    pub fn personal_key(&self) -> Option<&str> {
        self.personal_key.as_ref().map(|k| k.as_str())
    }

    pub fn has_personal_key(&self) -> bool {
        self.personal_key.is_some()
    }

    /// Replace the stored key. Blank input clears it.
    pub fn set_personal_key(&mut self, key: &str) {
        let key = key.trim();
        self.personal_key = (!key.is_empty()).then(|| Zeroizing::new(key.to_string()));
    }
}

impl fmt::Debug for TurnContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TurnContext")
            .field("session_id", &self.session_id)
            .field("personal_key", &self.personal_key().map(mask_secret))
            .field("rotation_log", &self.rotation_log)
            .field("needs_personal_key", &self.needs_personal_key)
            .finish()
    }
}

/// What the user submitted for one turn.
#[derive(Debug, Clone, Default)]
pub struct TurnInput {
    pub prompt: String,
    /// `Some("")` clears a previously stored key
    pub personal_key: Option<String>,
    pub attachment: Option<Attachment>,
}

impl TurnInput {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

/// Result of one turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    /// Generated text; absent when every key failed
    pub reply: Option<String>,
    pub rotation_log: Vec<AttemptLogEntry>,
    pub needs_personal_key: bool,
}

/// Runs chat turns against the store and the rotation client.
pub struct ChatService {
    store: ConversationStore,
    rotation: KeyRotationClient,
    server_keys: Vec<String>,
    system_prompt: String,
    history_window: usize,
}

impl ChatService {
    pub fn new(
        store: ConversationStore,
        rotation: KeyRotationClient,
        server_keys: Vec<String>,
        llm: &LlmConfig,
    ) -> Self {
        Self {
            store,
            rotation,
            server_keys,
            system_prompt: llm
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            history_window: llm.history_window,
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// Number of keys in the server pool.
    pub fn server_key_count(&self) -> usize {
        self.server_keys.len()
    }

    /// Stored history for a session.
    pub fn history(&self, session_id: &SessionId) -> Result<Vec<StoredMessage>> {
        self.store
            .list(session_id.as_str())
            .map_err(Error::storage)
    }

    /// Run one chat turn.
    pub async fn handle_turn(
        &self,
        mut ctx: TurnContext,
        input: TurnInput,
    ) -> Result<(TurnContext, TurnReply)> {
        let TurnInput {
            prompt,
            personal_key,
            attachment,
        } = input;

        let prompt = prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(Error::InvalidInput("prompt must not be empty".into()));
        }

        if let Some(key) = personal_key.as_deref() {
            ctx.set_personal_key(key);
        }

        let span = atelier_common::turn_span!(
            generate_trace_id(),
            session = %ctx.session_id.short(),
            has_attachment = attachment.is_some()
        );

        async move {
            let session = ctx.session_id.as_str();

            let history: Vec<Turn> = self
                .history(&ctx.session_id)?
                .iter()
                .map(StoredMessage::to_turn)
                .collect();

            self.store
                .append(session, Role::User, &prompt, attachment.is_some())
                .map_err(Error::storage)?;

            let request = CompletionRequest::build(
                &self.system_prompt,
                &history,
                self.history_window,
                &prompt,
                attachment,
            );

            let credentials = build_credentials(ctx.personal_key(), &self.server_keys);
            tracing::debug!(
                candidates = credentials.len(),
                personal = ctx.has_personal_key(),
                history = history.len(),
                "Starting key rotation"
            );

            let (completion, log) = self
                .rotation
                .attempt_completion(&request, &credentials)
                .await
                .into_parts();

            if let Some(text) = completion.as_deref() {
                self.store
                    .append(session, Role::Assistant, text, false)
                    .map_err(Error::storage)?;
            }

            ctx.needs_personal_key = completion.is_none();
            ctx.rotation_log = log.clone();

            let reply = TurnReply {
                reply: completion,
                rotation_log: log,
                needs_personal_key: ctx.needs_personal_key,
            };
            Ok::<_, Error>((ctx, reply))
        }
        .instrument(span)
        .await
    }

    /// Clear the session's history and start a new session.
    pub fn reset(&self, ctx: TurnContext) -> Result<TurnContext> {
        let removed = self
            .store
            .clear(ctx.session_id.as_str())
            .map_err(Error::storage)?;

        let next = SessionId::generate();
        tracing::info!(
            old_session = %ctx.session_id.short(),
            new_session = %next.short(),
            removed,
            "Session reset"
        );

        let mut fresh = TurnContext::new(next);
        fresh.personal_key = ctx.personal_key;
        Ok(fresh)
    }
}
