//! Integration tests for Atelier Gateway.
//!
//! Drives the full HTTP surface: page redirects, chat turns with key rotation,
//! history, rotation log, reset, and error responses.

use async_trait::async_trait;
use atelier_common::config::{Config, KeyPool};
use atelier_gateway::{
    routes::{
        build_routes_with, ChatResponse, ErrorResponse, HealthResponse, MessagesResponse,
        RotationLogResponse, SessionResponse,
    },
    with_layers, Completion, CompletionRequest, ConversationStore, Credential, GeminiConfig,
    GeminiProvider, Outcome, Provider, ProviderError, Role,
};
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use base64::Engine;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::ServiceExt;
use wiremock::matchers::{header as header_matcher, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Provider whose behaviour is keyed by the credential secret.
struct KeyedProvider {
    replies: HashMap<String, Result<String, (u16, String)>>,
    calls: Mutex<Vec<String>>,
}

impl KeyedProvider {
    fn new(replies: &[(&str, Result<&str, (u16, &str)>)]) -> Arc<Self> {
        Arc::new(Self {
            replies: replies
                .iter()
                .map(|(key, reply)| {
                    let reply = reply
                        .map(str::to_string)
                        .map_err(|(status, msg)| (status, msg.to_string()));
                    (key.to_string(), reply)
                })
                .collect(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for KeyedProvider {
    fn name(&self) -> &str {
        "keyed"
    }

    fn model(&self) -> &str {
        "test-model"
    }

    async fn complete(
        &self,
        credential: &Credential,
        _request: &CompletionRequest,
    ) -> Result<Completion, ProviderError> {
        self.calls.lock().unwrap().push(credential.secret().to_string());

        match self.replies.get(credential.secret()) {
            Some(Ok(text)) => Ok(Completion {
                text: text.clone(),
                finish_reason: Some("STOP".into()),
                usage: Default::default(),
                latency_ms: 0,
            }),
            Some(Err((status, message))) => Err(ProviderError {
                provider: "keyed".into(),
                model: "test-model".into(),
                message: message.clone(),
                status_code: Some(*status),
            }),
            None => Err(ProviderError {
                provider: "keyed".into(),
                model: "test-model".into(),
                message: "API key not valid".into(),
                status_code: Some(400),
            }),
        }
    }
}

fn test_config(keys: &[&str]) -> Config {
    let mut config = Config::default();
    config.secrets.google_api_keys = KeyPool::List(keys.iter().map(|k| k.to_string()).collect());
    config
}

/// Router over a scripted provider and an isolated database.
fn create_test_app(
    temp_dir: &TempDir,
    config: &Config,
    provider: Arc<dyn Provider>,
) -> axum::Router {
    let store = ConversationStore::open(&temp_dir.path().join("test-history.db")).unwrap();
    let routes = build_routes_with(config, provider, store).unwrap();
    with_layers(routes, config)
}

async fn send(app: &axum::Router, method: Method, uri: &str, body: Option<Value>) -> axum::response::Response {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(b) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_string(&b).unwrap()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    app.clone().oneshot(request).await.unwrap()
}

/// Helper to make a request and get JSON response.
async fn request_json<T: serde::de::DeserializeOwned>(
    app: &axum::Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, T) {
    let response = send(app, method, uri, body).await;
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json: T = serde_json::from_slice(&body).unwrap();

    (status, json)
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Health Check Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_check() {
    let temp_dir = TempDir::new().unwrap();
    let app = create_test_app(&temp_dir, &test_config(&[]), KeyedProvider::new(&[]));

    for uri in ["/health", "/api/v1/health"] {
        let (status, health): (_, HealthResponse) = request_json(&app, Method::GET, uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health.status, "healthy");
        assert_eq!(health.service, "atelier-gateway");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Page Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_page_without_session_redirects() {
    let temp_dir = TempDir::new().unwrap();
    let app = create_test_app(&temp_dir, &test_config(&[]), KeyedProvider::new(&[]));

    for uri in ["/", "/?session_id=", "/?session_id=not%20valid"] {
        let response = send(&app, Method::GET, uri, None).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER, "uri {uri}");

        let location = response.headers()[header::LOCATION].to_str().unwrap();
        let token = location.strip_prefix("/?session_id=").unwrap();
        assert_eq!(token.len(), 36);
    }
}

#[tokio::test]
async fn test_page_renders_history() {
    let temp_dir = TempDir::new().unwrap();
    let provider = KeyedProvider::new(&[("A", Ok("O poveste despre lână."))]);
    let app = create_test_app(&temp_dir, &test_config(&["A"]), provider);

    let (status, _): (_, ChatResponse) = request_json(
        &app,
        Method::POST,
        "/api/v1/sessions/page-test/chat",
        Some(json!({ "prompt": "Un mărțișor <b>roșu</b>" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let response = send(&app, Method::GET, "/?session_id=page-test", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let html = body_text(response).await;

    assert!(html.contains("O poveste despre lână."));
    assert!(html.contains("&lt;b&gt;roșu&lt;/b&gt;"));
    assert!(html.contains("server #1: success"));
    assert!(html.contains("data-session=\"page-test\""));
}

// ─────────────────────────────────────────────────────────────────────────────
// Chat Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_chat_rotates_past_failing_keys() {
    let temp_dir = TempDir::new().unwrap();
    let provider = KeyedProvider::new(&[
        ("A", Err((429, "RESOURCE_EXHAUSTED"))),
        ("B", Err((400, "API key not valid"))),
        ("C", Ok("Story.")),
    ]);
    let app = create_test_app(&temp_dir, &test_config(&["A", "B", "C"]), provider.clone());

    let (status, reply): (_, ChatResponse) = request_json(
        &app,
        Method::POST,
        "/api/v1/sessions/s1/chat",
        Some(json!({ "prompt": "Tell me a story" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply.session_id, "s1");
    assert_eq!(reply.reply.as_deref(), Some("Story."));
    assert!(!reply.needs_personal_key);

    let log: Vec<(String, Outcome)> = reply
        .rotation_log
        .iter()
        .map(|e| (e.source.clone(), e.outcome))
        .collect();
    assert_eq!(
        log,
        vec![
            ("server #1".to_string(), Outcome::QuotaExceeded),
            ("server #2".to_string(), Outcome::InvalidCredential),
            ("server #3".to_string(), Outcome::Success),
        ]
    );
    assert_eq!(provider.calls(), vec!["A", "B", "C"]);

    let (_, history): (_, MessagesResponse) =
        request_json(&app, Method::GET, "/api/v1/sessions/s1/messages", None).await;
    assert_eq!(history.messages.len(), 2);
    assert_eq!(history.messages[0].role, Role::User);
    assert_eq!(history.messages[1].content, "Story.");
}

#[tokio::test]
async fn test_chat_exhaustion_then_personal_key() {
    let temp_dir = TempDir::new().unwrap();
    let provider = KeyedProvider::new(&[
        ("A", Err((403, "PERMISSION_DENIED"))),
        ("mine", Ok("Thanks to your key.")),
    ]);
    let app = create_test_app(&temp_dir, &test_config(&["A"]), provider.clone());

    let (_, first): (_, ChatResponse) = request_json(
        &app,
        Method::POST,
        "/api/v1/sessions/s2/chat",
        Some(json!({ "prompt": "hello" })),
    )
    .await;
    assert!(first.reply.is_none());
    assert!(first.needs_personal_key);
    assert_eq!(first.rotation_log.len(), 1);
    assert_eq!(first.rotation_log[0].outcome, Outcome::AccessDenied);

    let (_, log): (_, RotationLogResponse) =
        request_json(&app, Method::GET, "/api/v1/sessions/s2/rotation-log", None).await;
    assert!(log.needs_personal_key);
    assert_eq!(log.rotation_log, first.rotation_log);

    let (_, second): (_, ChatResponse) = request_json(
        &app,
        Method::POST,
        "/api/v1/sessions/s2/chat",
        Some(json!({ "prompt": "again", "personal_key": "mine" })),
    )
    .await;
    assert_eq!(second.reply.as_deref(), Some("Thanks to your key."));
    assert!(!second.needs_personal_key);
    assert_eq!(second.rotation_log.len(), 1);
    assert_eq!(second.rotation_log[0].source, "personal");

    // The key stays with the session for the next turn
    let (_, third): (_, ChatResponse) = request_json(
        &app,
        Method::POST,
        "/api/v1/sessions/s2/chat",
        Some(json!({ "prompt": "and again" })),
    )
    .await;
    assert_eq!(third.rotation_log[0].source, "personal");
    assert_eq!(provider.calls(), vec!["A", "mine", "mine"]);
}

#[tokio::test]
async fn test_chat_without_any_keys() {
    let temp_dir = TempDir::new().unwrap();
    let provider = KeyedProvider::new(&[]);
    let app = create_test_app(&temp_dir, &test_config(&[]), provider.clone());

    let (status, reply): (_, ChatResponse) = request_json(
        &app,
        Method::POST,
        "/api/v1/sessions/s3/chat",
        Some(json!({ "prompt": "hi", "personal_key": "" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(reply.reply.is_none());
    assert!(reply.needs_personal_key);
    assert_eq!(reply.rotation_log.len(), 1);
    assert_eq!(reply.rotation_log[0].outcome, Outcome::NoCredentialsConfigured);
    assert!(provider.calls().is_empty());
}

#[tokio::test]
async fn test_chat_with_attachment() {
    let temp_dir = TempDir::new().unwrap();
    let provider = KeyedProvider::new(&[("A", Ok("Frumos!"))]);
    let app = create_test_app(&temp_dir, &test_config(&["A"]), provider);

    let data = base64::engine::general_purpose::STANDARD.encode([0xff, 0xd8, 0xff, 0xe0]);
    let (status, _): (_, ChatResponse) = request_json(
        &app,
        Method::POST,
        "/api/v1/sessions/s4/chat",
        Some(json!({
            "prompt": "What do you think?",
            "attachment": { "mime_type": "image/jpeg", "data_base64": data }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, history): (_, MessagesResponse) =
        request_json(&app, Method::GET, "/api/v1/sessions/s4/messages", None).await;
    assert!(history.messages[0].has_image);
    assert!(!history.messages[1].has_image);
}

#[tokio::test]
async fn test_chat_rejects_bad_input() {
    let temp_dir = TempDir::new().unwrap();
    let provider = KeyedProvider::new(&[("A", Ok("unused"))]);
    let app = create_test_app(&temp_dir, &test_config(&["A"]), provider.clone());

    let cases = [
        json!({ "prompt": "   " }),
        json!({}),
        json!({ "prompt": "hi", "attachment": { "mime_type": "image/gif", "data_base64": "AAAA" } }),
        json!({ "prompt": "hi", "attachment": { "mime_type": "image/png", "data_base64": "%%%" } }),
    ];

    for body in cases {
        let (status, error): (_, ErrorResponse) = request_json(
            &app,
            Method::POST,
            "/api/v1/sessions/s5/chat",
            Some(body.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "body {body}");
        assert_eq!(error.code, "INVALID_INPUT");
    }

    assert!(provider.calls().is_empty());
    let (_, history): (_, MessagesResponse) =
        request_json(&app, Method::GET, "/api/v1/sessions/s5/messages", None).await;
    assert!(history.messages.is_empty());
}

#[tokio::test]
async fn test_invalid_session_id_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let app = create_test_app(&temp_dir, &test_config(&[]), KeyedProvider::new(&[]));

    let (status, error): (_, ErrorResponse) = request_json(
        &app,
        Method::GET,
        "/api/v1/sessions/bad%20id/messages",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error.code, "INVALID_INPUT");
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = test_config(&["A"]);
    config.storage.max_body_bytes = 1024;
    let app = create_test_app(&temp_dir, &config, KeyedProvider::new(&[("A", Ok("x"))]));

    let body = serde_json::to_string(&json!({ "prompt": "x".repeat(4096) })).unwrap();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/sessions/big/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_streamed_oversized_body_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = test_config(&["A"]);
    config.storage.max_body_bytes = 1024;
    let provider = KeyedProvider::new(&[("A", Ok("x"))]);
    let app = create_test_app(&temp_dir, &config, provider.clone());

    // No Content-Length: the limit is only hit while the body is read
    let body = serde_json::to_vec(&json!({ "prompt": "x".repeat(4096) })).unwrap();
    let chunks: Vec<Vec<u8>> = body.chunks(512).map(<[u8]>::to_vec).collect();
    let stream = futures_util::stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>));
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/sessions/streamed/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(stream))
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let error: ErrorResponse = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(error.code, "PAYLOAD_TOO_LARGE");
    assert!(provider.calls().is_empty());
}

#[tokio::test]
async fn test_layers_add_cors_headers() {
    let temp_dir = TempDir::new().unwrap();
    let app = create_test_app(&temp_dir, &test_config(&[]), KeyedProvider::new(&[]));

    let request = Request::builder()
        .method(Method::GET)
        .uri("/health")
        .header(header::ORIGIN, "http://localhost:3000")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "*"
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Session Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_create_session() {
    let temp_dir = TempDir::new().unwrap();
    let app = create_test_app(&temp_dir, &test_config(&[]), KeyedProvider::new(&[]));

    let (status, created): (_, SessionResponse) =
        request_json(&app, Method::POST, "/api/v1/sessions", None).await;
    assert_eq!(status, StatusCode::CREATED);

    let response = send(&app, Method::GET, &format!("/?session_id={}", created.session_id), None).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_forget_personal_key() {
    let temp_dir = TempDir::new().unwrap();
    let provider = KeyedProvider::new(&[
        ("A", Err((403, "PERMISSION_DENIED"))),
        ("mine", Ok("With your key.")),
    ]);
    let app = create_test_app(&temp_dir, &test_config(&["A"]), provider.clone());

    let (_, first): (_, ChatResponse) = request_json(
        &app,
        Method::POST,
        "/api/v1/sessions/s6/chat",
        Some(json!({ "prompt": "hi", "personal_key": "mine" })),
    )
    .await;
    assert_eq!(first.reply.as_deref(), Some("With your key."));

    let page = body_text(send(&app, Method::GET, "/?session_id=s6", None).await).await;
    assert!(page.contains("Forget my key"));

    let response = send(&app, Method::DELETE, "/api/v1/sessions/s6/personal-key", None).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let (_, second): (_, ChatResponse) = request_json(
        &app,
        Method::POST,
        "/api/v1/sessions/s6/chat",
        Some(json!({ "prompt": "again" })),
    )
    .await;
    assert!(second.reply.is_none());
    assert!(second.needs_personal_key);
    assert_eq!(second.rotation_log[0].source, "server #1");
    assert_eq!(provider.calls(), vec!["mine", "A"]);

    let page = body_text(send(&app, Method::GET, "/?session_id=s6", None).await).await;
    assert!(!page.contains("Forget my key"));
}

#[tokio::test]
async fn test_reset_clears_history_and_issues_new_session() {
    let temp_dir = TempDir::new().unwrap();
    let provider = KeyedProvider::new(&[("A", Ok("reply"))]);
    let app = create_test_app(&temp_dir, &test_config(&["A"]), provider);

    let _: (_, ChatResponse) = request_json(
        &app,
        Method::POST,
        "/api/v1/sessions/old/chat",
        Some(json!({ "prompt": "hi" })),
    )
    .await;

    let (status, fresh): (_, SessionResponse) =
        request_json(&app, Method::POST, "/api/v1/sessions/old/reset", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(fresh.session_id, "old");

    let (_, old_history): (_, MessagesResponse) =
        request_json(&app, Method::GET, "/api/v1/sessions/old/messages", None).await;
    assert!(old_history.messages.is_empty());

    let (_, log): (_, RotationLogResponse) = request_json(
        &app,
        Method::GET,
        &format!("/api/v1/sessions/{}/rotation-log", fresh.session_id),
        None,
    )
    .await;
    assert!(log.rotation_log.is_empty());
    assert!(!log.needs_personal_key);
}

// ─────────────────────────────────────────────────────────────────────────────
// End-to-end with the Gemini provider
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_gemini_rotation_over_http() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/models/gemini-1.5-flash:generateContent"))
        .and(header_matcher("x-goog-api-key", "exhausted-key"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": { "code": 429, "message": "Resource has been exhausted", "status": "RESOURCE_EXHAUSTED" }
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/models/gemini-1.5-flash:generateContent"))
        .and(header_matcher("x-goog-api-key", "good-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": "A tale of red and white thread." }] },
                "finishReason": "STOP"
            }],
            "usageMetadata": { "promptTokenCount": 12, "candidatesTokenCount": 8, "totalTokenCount": 20 }
        })))
        .mount(&server)
        .await;

    let temp_dir = TempDir::new().unwrap();
    let mut config = test_config(&["exhausted-key", "good-key"]);
    config.llm.base_url = server.uri();
    let provider = Arc::new(GeminiProvider::new(GeminiConfig::from_llm(&config.llm)));
    let app = create_test_app(&temp_dir, &config, provider);

    let (status, reply): (_, ChatResponse) = request_json(
        &app,
        Method::POST,
        "/api/v1/sessions/e2e/chat",
        Some(json!({ "prompt": "A mărțișor story, please" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply.reply.as_deref(), Some("A tale of red and white thread."));
    let outcomes: Vec<Outcome> = reply.rotation_log.iter().map(|e| e.outcome).collect();
    assert_eq!(outcomes, vec![Outcome::QuotaExceeded, Outcome::Success]);
}
