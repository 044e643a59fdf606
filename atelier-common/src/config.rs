//! Configuration management for Atelier services.
//!
//! The gateway reads a single configuration file at `~/.atelier/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (ATELIER_* prefix, GOOGLE_API_KEYS)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `ATELIER_BIND_ADDRESS` → network.bind
//! - `ATELIER_PORT` → network.port
//! - `GOOGLE_API_KEYS` → secrets.google_api_keys (comma-joined)
//! - `ATELIER_MODEL` → llm.model
//! - `ATELIER_LLM_BASE_URL` → llm.base_url
//! - `ATELIER_DB_PATH` → storage.db_path
//! - `ATELIER_LOG_LEVEL` → observability.log_level
//! - `ATELIER_LOG_FORMAT` → observability.log_format

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".atelier"),
        |dirs| dirs.home_dir().join(".atelier"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Network Configuration
// ============================================================================

/// Listener configuration for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Bind address. Default: "127.0.0.1" (local only)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_port(),
        }
    }
}

// ============================================================================
// Secrets Configuration
// ============================================================================

/// Server-side pool of completion API keys.
///
/// Accepts either one comma-joined string or an explicit ordered list:
///
/// ```json
/// { "google_api_keys": "key-a, key-b" }
/// { "google_api_keys": ["key-a", "key-b"] }
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPool {
    Joined(String),
    List(Vec<String>),
}

impl KeyPool {
    /// Ordered keys with surrounding whitespace trimmed and empty entries dropped.
    pub fn keys(&self) -> Vec<String> {
        match self {
            Self::Joined(raw) => split_trimmed(raw.split(',')),
            Self::List(items) => split_trimmed(items.iter().map(String::as_str)),
        }
    }

    /// Whether the pool yields no usable keys.
    pub fn is_empty(&self) -> bool {
        self.keys().is_empty()
    }
}

fn split_trimmed<'a>(items: impl Iterator<Item = &'a str>) -> Vec<String> {
    items
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Default for KeyPool {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPool({} keys)", self.keys().len())
    }
}

/// Credentials configured on the server.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecretsConfig {
    /// Pool of Gemini API keys, tried in order after any personal key
    #[serde(default, alias = "GOOGLE_API_KEYS")]
    pub google_api_keys: KeyPool,
}

// ============================================================================
// LLM Configuration
// ============================================================================

/// Completion endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model name, e.g. "gemini-1.5-flash"
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Base URL of the generative language API
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Maximum output tokens per reply
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: i64,

    /// Number of stored messages replayed as context
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Total request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Override for the built-in assistant persona
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_llm_model(),
            base_url: default_llm_base_url(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            history_window: default_history_window(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            system_prompt: None,
        }
    }
}

// ============================================================================
// Storage Configuration
// ============================================================================

/// Conversation store and request size settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path (`~` is expanded). Defaults to `~/.atelier/chat_history.db`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,

    /// Maximum accepted request body in bytes (attachments are sent inline)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Sessions whose turn context stays in memory; least recently used go first
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            max_body_bytes: default_max_body_bytes(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl StorageConfig {
    /// Resolve the database path, expanding `~`.
    pub fn resolved_db_path(&self) -> PathBuf {
        match self.db_path.as_deref() {
            Some(raw) => PathBuf::from(shellexpand::tilde(raw).into_owned()),
            None => config_dir().join("chat_history.db"),
        }
    }
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Additional module targets quieted to `warn`
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration for the Atelier gateway.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub secrets: SecretsConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides, then validate.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_with(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(bind) = lookup("ATELIER_BIND_ADDRESS") {
            self.network.bind = bind;
        }
        if let Some(port) = lookup("ATELIER_PORT") {
            match port.parse() {
                Ok(p) => self.network.port = p,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid ATELIER_PORT"),
            }
        }

        if let Some(keys) = lookup("GOOGLE_API_KEYS") {
            self.secrets.google_api_keys = KeyPool::Joined(keys);
        }

        if let Some(model) = lookup("ATELIER_MODEL") {
            self.llm.model = model;
        }
        if let Some(url) = lookup("ATELIER_LLM_BASE_URL") {
            self.llm.base_url = url;
        }

        if let Some(path) = lookup("ATELIER_DB_PATH") {
            self.storage.db_path = Some(path);
        }

        if let Some(level) = lookup("ATELIER_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("ATELIER_LOG_FORMAT") {
            self.observability.log_format = format;
        }
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> crate::Result<()> {
        if self.llm.model.trim().is_empty() {
            return Err(crate::Error::Config("llm.model must not be empty".into()));
        }
        if self.llm.history_window == 0 {
            return Err(crate::Error::Config(
                "llm.history_window must be at least 1".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(crate::Error::Config(format!(
                "llm.temperature must be within 0.0..=2.0, got {}",
                self.llm.temperature
            )));
        }
        if self.storage.max_body_bytes == 0 {
            return Err(crate::Error::Config(
                "storage.max_body_bytes must be positive".into(),
            ));
        }
        if self.storage.max_sessions == 0 {
            return Err(crate::Error::Config(
                "storage.max_sessions must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Server key pool in priority order.
    pub fn server_keys(&self) -> Vec<String> {
        self.secrets.google_api_keys.keys()
    }

    /// Listen address as "host:port".
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.network.bind, self.network.port)
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    4470
}
fn default_llm_model() -> String {
    "gemini-1.5-flash".into()
}
fn default_llm_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".into()
}
fn default_temperature() -> f64 {
    0.7
}
fn default_max_output_tokens() -> i64 {
    8192
}
fn default_history_window() -> usize {
    10
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_max_sessions() -> usize {
    1000
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}
