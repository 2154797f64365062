//! Backend trait and request/response types for translation models.
//!
//! A backend performs exactly one model call per `send`. Retries, caching
//! and usage accounting live above it in the translator, so any
//! implementation can be swapped in.

mod anthropic;

pub use anthropic::AnthropicBackend;

use crate::error::TranslationError;
use crate::usage::TokenUsage;
use async_trait::async_trait;
use std::time::Duration;

/// One block of system instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemPart {
    pub text: String,

    /// Ask the provider to cache this block between calls.
    pub cacheable: bool,
}

/// A single model request.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    /// System instructions, in order.
    pub system: Vec<SystemPart>,

    /// The user message.
    pub content: String,

    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// The model's reply.
#[derive(Debug, Clone, Default)]
pub struct BackendResponse {
    /// Concatenated text blocks of the reply.
    pub text: String,

    pub usage: TokenUsage,
}

/// Trait for translation backends.
///
/// Implementations classify throttling as [`TranslationError::RateLimited`]
/// and every other failure as a non-retryable error.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Returns the human-readable name of this backend.
    fn name(&self) -> &'static str;

    /// Sends one request and waits for the complete reply.
    async fn send(&self, request: &BackendRequest) -> Result<BackendResponse, TranslationError>;
}

/// Common HTTP client configuration for backends.
pub fn create_http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(concat!("epubtrans/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(300))
        .build()
}
