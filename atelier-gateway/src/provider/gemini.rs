//! Google Gemini provider.
//!
//! Talks to the `generateContent` REST endpoint. The API key travels in the
//! `x-goog-api-key` header so it never appears in URLs or transport errors.

use super::{Completion, CompletionRequest, Part, Provider, ProviderError, Role, TokenUsage};
use crate::credentials::Credential;
use async_trait::async_trait;
use atelier_common::config::LlmConfig;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Connection settings for [`GeminiProvider`].
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    /// Base URL up to and including the API version, e.g. `https://…/v1beta`
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub max_output_tokens: i64,
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self::from_llm(&LlmConfig::default())
    }
}

impl GeminiConfig {
    pub fn from_llm(llm: &LlmConfig) -> Self {
        Self {
            base_url: llm.base_url.clone(),
            model: llm.model.clone(),
            temperature: llm.temperature,
            max_output_tokens: llm.max_output_tokens,
            timeout: Duration::from_secs(llm.timeout_secs),
            connect_timeout: Duration::from_secs(llm.connect_timeout_secs),
        }
    }

    /// Point the provider at a different host (mock servers, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// Gemini completion provider.
pub struct GeminiProvider {
    config: GeminiConfig,
    client: Client,
}

// ══════════════════════════════════════════════════════════════════════════════
// API REQUEST/RESPONSE TYPES
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<ApiPart>,
}

#[derive(Debug, Serialize)]
struct ApiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

impl ApiPart {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }

    fn inline(mime_type: &str, data: &[u8]) -> Self {
        Self {
            text: None,
            inline_data: Some(InlineData {
                mime_type: mime_type.to_string(),
                data: base64::engine::general_purpose::STANDARD.encode(data),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f64,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<PromptFeedback>,
    error: Option<ApiError>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<i64>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<i64>,
    #[serde(rename = "totalTokenCount")]
    total_token_count: Option<i64>,
}

fn gemini_role(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "model",
    }
}

/// Append a part to the conversation, merging into the previous content when
/// the role repeats (e.g. an unanswered user turn followed by a new one).
fn push_part(contents: &mut Vec<Content>, role: &str, part: ApiPart) {
    match contents.last_mut() {
        Some(last) if last.role.as_deref() == Some(role) => last.parts.push(part),
        _ => contents.push(Content {
            role: Some(role.to_string()),
            parts: vec![part],
        }),
    }
}

/// Convert request parts into Gemini's system instruction and contents.
fn to_gemini_contents(request: &CompletionRequest) -> (Option<Content>, Vec<Content>) {
    let mut system_instruction = None;
    let mut contents = Vec::new();

    for part in request.parts() {
        match part {
            Part::System(text) => {
                system_instruction = Some(Content {
                    role: None,
                    parts: vec![ApiPart::text(text.clone())],
                });
            }
            Part::Turn(turn) => {
                push_part(
                    &mut contents,
                    gemini_role(turn.role),
                    ApiPart::text(turn.text.clone()),
                );
            }
            Part::Attachment(attachment) => {
                push_part(
                    &mut contents,
                    "user",
                    ApiPart::inline(&attachment.mime_type, &attachment.data),
                );
            }
            Part::Text(text) => push_part(&mut contents, "user", ApiPart::text(text.clone())),
        }
    }

    (system_instruction, contents)
}

/// Render a non-2xx body as "STATUS: message" when it is a Google error envelope.
fn describe_error_body(body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => match envelope.error.status {
            Some(status) => format!("{}: {}", status, envelope.error.message),
            None => envelope.error.message,
        },
        Err(_) => body.trim().to_string(),
    }
}

impl GeminiProvider {
    /// Create a new Gemini provider.
    pub fn new(config: GeminiConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self { config, client }
    }

    fn endpoint(&self) -> String {
        let model_name = if self.config.model.starts_with("models/") {
            self.config.model.clone()
        } else {
            format!("models/{}", self.config.model)
        };

        format!(
            "{}/{model_name}:generateContent",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn error(&self, message: impl Into<String>, status_code: Option<u16>) -> ProviderError {
        ProviderError {
            provider: "gemini".into(),
            model: self.config.model.clone(),
            message: message.into(),
            status_code,
        }
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn complete(
        &self,
        credential: &Credential,
        request: &CompletionRequest,
    ) -> Result<Completion, ProviderError> {
        let start = Instant::now();
        let (system_instruction, contents) = to_gemini_contents(request);

        let gemini_request = GenerateContentRequest {
            contents,
            system_instruction,
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
                max_output_tokens: self.config.max_output_tokens,
            },
        };

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", credential.secret())
            .json(&gemini_request)
            .send()
            .await
            .map_err(|e| self.error(format!("Request failed: {}", e.without_url()), None))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(self.error(
                format!(
                    "API error ({}): {}",
                    status.as_u16(),
                    describe_error_body(&error_text)
                ),
                Some(status.as_u16()),
            ));
        }

        let result: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| self.error(format!("Failed to parse response: {}", e.without_url()), None))?;

        if let Some(err) = result.error {
            let detail = match err.status {
                Some(status) => format!("{}: {}", status, err.message),
                None => err.message,
            };
            return Err(self.error(format!("API error: {detail}"), None));
        }

        let usage = result.usage_metadata.map_or(TokenUsage::default(), |u| TokenUsage {
            input_tokens: u.prompt_token_count.unwrap_or(0),
            output_tokens: u.candidates_token_count.unwrap_or(0),
            total_tokens: u.total_token_count.unwrap_or(0),
        });

        let candidate = result.candidates.and_then(|c| c.into_iter().next());
        let finish_reason = candidate
            .as_ref()
            .and_then(|c| c.finish_reason.clone())
            .or_else(|| {
                result
                    .prompt_feedback
                    .and_then(|f| f.block_reason)
                    .map(|reason| format!("BLOCKED: {reason}"))
            });

        let text: String = candidate
            .and_then(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            tracing::debug!(
                model = %self.config.model,
                finish_reason = ?finish_reason,
                "Gemini returned no text"
            );
        }

        Ok(Completion {
            text,
            finish_reason,
            usage,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}
