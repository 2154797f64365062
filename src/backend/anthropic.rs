//! Anthropic Messages API backend.

use super::{Backend, BackendRequest, BackendResponse, SystemPart, create_http_client};
use crate::config::ApiConfig;
use crate::error::TranslationError;
use crate::usage::TokenUsage;
use crate::utils::check_response_status;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const API_VERSION: &str = "2023-06-01";

/// Request body for the messages API.
#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: Vec<SystemBlock<'a>>,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct SystemBlock<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Debug, Serialize)]
struct CacheControl {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

/// Response from the messages API.
#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl<'a> From<&'a SystemPart> for SystemBlock<'a> {
    fn from(part: &'a SystemPart) -> Self {
        Self {
            kind: "text",
            text: &part.text,
            cache_control: part.cacheable.then_some(CacheControl { kind: "ephemeral" }),
        }
    }
}

/// Backend calling `POST {base_url}/v1/messages`.
pub struct AnthropicBackend {
    client: Client,
    endpoint: String,
    key: String,
}

impl AnthropicBackend {
    /// Creates a backend from the API section of the config.
    pub fn new(config: &ApiConfig) -> Result<Self, TranslationError> {
        if !config.is_configured() {
            return Err(TranslationError::InvalidConfig(
                "missing API key".to_string(),
            ));
        }

        Ok(Self {
            client: create_http_client()?,
            endpoint: format!("{}/v1/messages", config.base_url.trim_end_matches('/')),
            key: config.key.clone(),
        })
    }

    fn build_body<'a>(request: &'a BackendRequest) -> MessagesRequest<'a> {
        MessagesRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: request.system.iter().map(SystemBlock::from).collect(),
            messages: vec![Message {
                role: "user",
                content: &request.content,
            }],
        }
    }

    fn parse_response(body: &str) -> Result<BackendResponse, TranslationError> {
        let response: MessagesResponse = serde_json::from_str(body)
            .map_err(|e| TranslationError::InvalidResponse(e.to_string()))?;

        let text = response
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(BackendResponse {
            text,
            usage: TokenUsage {
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
            },
        })
    }
}

#[async_trait]
impl Backend for AnthropicBackend {
    fn name(&self) -> &'static str {
        "Anthropic"
    }

    async fn send(&self, request: &BackendRequest) -> Result<BackendResponse, TranslationError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.key)
            .header("anthropic-version", API_VERSION)
            .json(&Self::build_body(request))
            .send()
            .await?;

        let response = check_response_status(response).await?;
        let body = response.text().await?;
        Self::parse_response(&body)
    }
}
