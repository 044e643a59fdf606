//! Atelier Common - Shared configuration, errors, and logging for the Atelier assistant.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Error types and handling utilities
//! - Logging setup
//! - String helpers for log-safe output

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod util;

pub use config::{
    Config, KeyPool, LlmConfig, NetworkConfig, ObservabilityConfig, SecretsConfig, StorageConfig,
};
pub use error::{Error, Result};
