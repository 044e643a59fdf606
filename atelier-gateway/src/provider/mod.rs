//! Completion provider abstraction.
//!
//! A provider performs exactly one remote completion call with one credential.
//! Choosing which credential to use, and what to do when it fails, is the job
//! of [`crate::rotation`].

mod gemini;

pub use gemini::{GeminiConfig, GeminiProvider};

use crate::credentials::Credential;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Instruction appended after an attachment so the model ties it to the question.
pub const ATTACHMENT_INSTRUCTION: &str =
    "Analyze this image in the context of the request.";

/// MIME types accepted as attachments.
pub const ACCEPTED_MIME_TYPES: &[&str] = &["image/jpeg", "image/png", "application/pdf"];

// ============================================================================
// Provider Trait
// ============================================================================

/// A remote text-generation endpoint.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Get the provider name.
    fn name(&self) -> &str;

    /// Model requests are sent to.
    fn model(&self) -> &str;

    /// Issue one completion call using `credential`.
    ///
    /// A transport-level success with no usable text is `Ok` with empty
    /// `Completion::text`; callers decide whether that counts as a failure.
    async fn complete(
        &self,
        credential: &Credential,
        request: &CompletionRequest,
    ) -> Result<Completion, ProviderError>;
}

/// Error from a provider call.
#[derive(Debug, Clone, thiserror::Error)]
#[error("[{provider}:{model}] {message}")]
pub struct ProviderError {
    pub provider: String,
    pub model: String,
    pub message: String,
    pub status_code: Option<u16>,
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Parse a stored role. Anything that is not "user" was produced by the model.
    pub fn from_stored(value: &str) -> Self {
        if value == "user" {
            Self::User
        } else {
            Self::Assistant
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One prior message replayed as context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

/// Uploaded file forwarded verbatim to the model.
#[derive(Clone, PartialEq, Eq)]
pub struct Attachment {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    /// Create an attachment, rejecting unsupported or empty uploads.
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> atelier_common::Result<Self> {
        let mime_type = mime_type.into().trim().to_ascii_lowercase();
        let mime_type = if mime_type == "image/jpg" {
            "image/jpeg".to_string()
        } else {
            mime_type
        };

        if !ACCEPTED_MIME_TYPES.contains(&mime_type.as_str()) {
            return Err(atelier_common::Error::InvalidInput(format!(
                "unsupported attachment type '{mime_type}', expected one of: {}",
                ACCEPTED_MIME_TYPES.join(", ")
            )));
        }
        if data.is_empty() {
            return Err(atelier_common::Error::InvalidInput(
                "attachment is empty".into(),
            ));
        }

        Ok(Self { mime_type, data })
    }
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// One element of a completion request, in send order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    /// Persona and task instructions
    System(String),
    /// A prior turn or the current user turn
    Turn(Turn),
    /// Uploaded file attached to the current user turn
    Attachment(Attachment),
    /// Extra user-side text following the attachment
    Text(String),
}

/// Fully assembled request for one chat turn.
///
/// Built once per turn and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    parts: Vec<Part>,
}

impl CompletionRequest {
    /// Assemble a request from the system prompt, the most recent `window`
    /// turns of `history`, the current prompt, and an optional attachment.
    pub fn build(
        system: &str,
        history: &[Turn],
        window: usize,
        prompt: &str,
        attachment: Option<Attachment>,
    ) -> Self {
        let skip = history.len().saturating_sub(window);
        let mut parts = Vec::with_capacity(window.min(history.len()) + 4);

        parts.push(Part::System(system.to_string()));
        parts.extend(history[skip..].iter().cloned().map(Part::Turn));
        parts.push(Part::Turn(Turn {
            role: Role::User,
            text: prompt.to_string(),
        }));

        if let Some(attachment) = attachment {
            parts.push(Part::Attachment(attachment));
            parts.push(Part::Text(ATTACHMENT_INSTRUCTION.to_string()));
        }

        Self { parts }
    }

    /// Parts in send order.
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// The system instruction, if present.
    pub fn system(&self) -> Option<&str> {
        self.parts.iter().find_map(|p| match p {
            Part::System(text) => Some(text.as_str()),
            _ => None,
        })
    }

    /// Whether an attachment is part of the request.
    pub fn has_attachment(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, Part::Attachment(_)))
    }
}

/// Result of a successful provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    /// Generated text; empty when the model returned nothing usable
    pub text: String,
    /// Finish reason reported by the endpoint
    pub finish_reason: Option<String>,
    /// Token usage
    pub usage: TokenUsage,
    /// Response latency in milliseconds
    pub latency_ms: u64,
}

/// Token usage information.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
}
