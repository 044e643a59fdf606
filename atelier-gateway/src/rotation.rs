//! API-key rotation with failure classification.
//!
//! Each candidate credential is tried once, strictly in priority order. The
//! first non-empty completion wins; every failure is classified and recorded.
//! Nothing is raised to the caller: a missing completion is the only signal
//! that every key was exhausted.

use crate::credentials::Credential;
use crate::provider::{CompletionRequest, Provider, ProviderError};
use atelier_common::util::{sanitize_for_log, truncate_with_ellipsis};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, LazyLock};

/// Maximum characters kept from a raw error in the attempt log.
pub const DETAIL_MAX_CHARS: usize = 200;

/// Source label of the synthetic entry written when there is nothing to try.
pub const NO_CREDENTIALS_SOURCE: &str = "configuration";

static QUOTA_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b429\b|resource(?:[ _]|\s+has\s+been\s+)?exhausted|quota|rate[ _-]?limit|too many requests")
        .unwrap()
});
static ACCESS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b403\b|permission[ _]?denied|forbidden|access[ _]denied").unwrap()
});
static INVALID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b40[01]\b|api[ _]?key[ _]not[ _]valid|api[ _]key[ _]expired|api_key_invalid|invalid[ _]api[ _]key|unauthenticated|unauthorized|invalid[ _]argument",
    )
    .unwrap()
});

/// Result tag of one rotation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Success,
    InvalidCredential,
    QuotaExceeded,
    AccessDenied,
    EmptyResponse,
    UnknownError,
    /// No attempt was made because the candidate list was empty
    NoCredentialsConfigured,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::InvalidCredential => "invalid-credential",
            Self::QuotaExceeded => "quota-exceeded",
            Self::AccessDenied => "access-denied",
            Self::EmptyResponse => "empty-response",
            Self::UnknownError => "unknown-error",
            Self::NoCredentialsConfigured => "no-credentials-configured",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Short explanation shown next to the log entry.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Success => "Reply generated",
            Self::InvalidCredential => "Key rejected as invalid",
            Self::QuotaExceeded => "Quota or rate limit exhausted",
            Self::AccessDenied => "Key lacks permission for this model",
            Self::EmptyResponse => "Empty or blocked reply",
            Self::UnknownError => "Unexpected error",
            Self::NoCredentialsConfigured => "No API keys configured",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the rotation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptLogEntry {
    /// Credential label, e.g. "personal" or "server #2"
    pub source: String,
    pub outcome: Outcome,
    /// Redacted, truncated diagnostic text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AttemptLogEntry {
    pub fn new(source: impl Into<String>, outcome: Outcome, detail: Option<String>) -> Self {
        Self {
            source: source.into(),
            outcome,
            detail,
        }
    }

    fn no_credentials() -> Self {
        Self::new(
            NO_CREDENTIALS_SOURCE,
            Outcome::NoCredentialsConfigured,
            None,
        )
    }
}

/// Terminal result of one rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationResult {
    /// Generated text; `None` when every candidate failed
    pub completion: Option<String>,
    /// Every attempt, in try order
    pub log: Vec<AttemptLogEntry>,
}

impl RotationResult {
    pub fn is_success(&self) -> bool {
        self.completion.is_some()
    }

    /// All candidates failed (or there were none).
    pub fn is_exhausted(&self) -> bool {
        self.completion.is_none()
    }

    pub fn into_parts(self) -> (Option<String>, Vec<AttemptLogEntry>) {
        (self.completion, self.log)
    }
}

/// Classify a provider error. Pure: depends only on its input.
///
/// Explicit HTTP statuses win (400/401 invalid, 403 denied, 429 quota);
/// otherwise the message is inspected.
pub fn classify_error(error: &ProviderError) -> Outcome {
    match error.status_code {
        Some(400 | 401) => Outcome::InvalidCredential,
        Some(403) => Outcome::AccessDenied,
        Some(429) => Outcome::QuotaExceeded,
        _ => classify_message(&error.message),
    }
}

/// Classify a raw error message by substring heuristics.
///
/// Checked in order quota, access, invalid; anything unmatched is
/// [`Outcome::UnknownError`].
pub fn classify_message(raw: &str) -> Outcome {
    if QUOTA_PATTERN.is_match(raw) {
        Outcome::QuotaExceeded
    } else if ACCESS_PATTERN.is_match(raw) {
        Outcome::AccessDenied
    } else if INVALID_PATTERN.is_match(raw) {
        Outcome::InvalidCredential
    } else {
        Outcome::UnknownError
    }
}

fn excerpt(raw: &str) -> String {
    truncate_with_ellipsis(&sanitize_for_log(raw), DETAIL_MAX_CHARS)
}

/// Try each credential in order until one yields non-empty text.
///
/// The returned log has one entry per attempted credential, ending with the
/// success entry when there is one. An empty `credentials` slice produces a
/// single [`Outcome::NoCredentialsConfigured`] entry.
pub async fn attempt_completion(
    provider: &dyn Provider,
    request: &CompletionRequest,
    credentials: &[Credential],
) -> RotationResult {
    if credentials.is_empty() {
        tracing::warn!(provider = provider.name(), "No completion credentials configured");
        return RotationResult {
            completion: None,
            log: vec![AttemptLogEntry::no_credentials()],
        };
    }

    let mut log = Vec::with_capacity(credentials.len());

    for (idx, credential) in credentials.iter().enumerate() {
        let source = credential.label();

        match provider.complete(credential, request).await {
            Ok(completion) if !completion.text.trim().is_empty() => {
                tracing::info!(
                    source = %source,
                    attempt = idx + 1,
                    latency_ms = completion.latency_ms,
                    output_tokens = completion.usage.output_tokens,
                    "Completion succeeded"
                );
                log.push(AttemptLogEntry::new(source, Outcome::Success, None));
                return RotationResult {
                    completion: Some(completion.text),
                    log,
                };
            }
            Ok(completion) => {
                tracing::warn!(
                    source = %source,
                    attempt = idx + 1,
                    finish_reason = ?completion.finish_reason,
                    "Completion returned no text"
                );
                log.push(AttemptLogEntry::new(
                    source,
                    Outcome::EmptyResponse,
                    completion.finish_reason,
                ));
            }
            Err(e) => {
                let outcome = classify_error(&e);
                let detail = (outcome == Outcome::UnknownError).then(|| excerpt(&e.message));
                tracing::warn!(
                    source = %source,
                    attempt = idx + 1,
                    outcome = %outcome,
                    status_code = ?e.status_code,
                    error = %sanitize_for_log(&e.message),
                    "Completion attempt failed"
                );
                log.push(AttemptLogEntry::new(source, outcome, detail));
            }
        }

        if let Some(next) = credentials.get(idx + 1) {
            tracing::debug!(next_source = %next.label(), "Rotating to next credential");
        }
    }

    tracing::warn!(
        provider = provider.name(),
        attempts = log.len(),
        "All credentials exhausted"
    );

    RotationResult {
        completion: None,
        log,
    }
}

/// Rotation bound to a provider, shared across request handlers.
#[derive(Clone)]
pub struct KeyRotationClient {
    provider: Arc<dyn Provider>,
}

impl KeyRotationClient {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// See [`attempt_completion`].
    pub async fn attempt_completion(
        &self,
        request: &CompletionRequest,
        credentials: &[Credential],
    ) -> RotationResult {
        attempt_completion(self.provider.as_ref(), request, credentials).await
    }
}
