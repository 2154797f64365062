//! Translation adapter on top of a [`Backend`].
//!
//! Turns a segment plus its context into a model request, retries while the
//! backend is throttling, honors cancellation, and records usage.

use crate::backend::{Backend, BackendRequest, SystemPart};
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::TranslationError;
use crate::usage::UsageStore;
use crate::utils::sha256_hex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const TECHNICAL_GUIDELINES: &str = include_str!("prompts/technical.txt");
const PSYCHOLOGY_GUIDELINES: &str = include_str!("prompts/psychology.txt");

/// Prefix of every user message.
const USER_PREFIX: &str = "Translate this and not say anything otherwise the translation: ";

/// Built-in guideline templates, chosen by the book's domain.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum GuidelineStyle {
    #[default]
    Technical,
    Psychology,
}

impl GuidelineStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuidelineStyle::Technical => "technical",
            GuidelineStyle::Psychology => "psychology",
        }
    }

    fn template(&self) -> &'static str {
        match self {
            GuidelineStyle::Technical => TECHNICAL_GUIDELINES,
            GuidelineStyle::Psychology => PSYCHOLOGY_GUIDELINES,
        }
    }
}

/// Everything needed to translate one segment.
#[derive(Debug, Clone, Default)]
pub struct TranslationRequest {
    /// Free-form instructions from the user.
    pub instructions: Option<String>,
    /// Source markup to translate.
    pub content: String,
    /// Existing translation to revise.
    pub prior_translation: Option<String>,
    pub source_lang: String,
    pub target_lang: String,
    /// Book title or other context for the guidelines.
    pub book_context: String,
}

impl TranslationRequest {
    /// Instructions as sent to the model, with any prior translation folded in.
    pub fn effective_instructions(&self) -> Option<String> {
        let instructions = self.instructions.as_deref().unwrap_or("").trim();
        match self.prior_translation.as_deref().map(str::trim) {
            Some(prior) if !prior.is_empty() => Some(
                format!("Previous translation:\n\n{}\n\n{}", prior, instructions)
                    .trim_end()
                    .to_string(),
            ),
            _ if !instructions.is_empty() => Some(instructions.to_string()),
            _ => None,
        }
    }
}

/// Model and retry settings for a [`Translator`].
#[derive(Debug, Clone)]
pub struct TranslatorSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Total attempts while rate limited.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub style: GuidelineStyle,
    /// Template replacing the built-in guidelines.
    pub guidelines: Option<String>,
    pub system_prompt: Option<String>,
}

impl TranslatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.api.model.clone(),
            temperature: config.api.temperature,
            max_tokens: config.api.max_tokens,
            max_retries: config.translation.max_retries,
            retry_base_delay: config.translation.retry_base_delay(),
            style: config.translation.style,
            guidelines: config.prompts.guidelines.clone(),
            system_prompt: config.prompts.system_prompt.clone(),
        }
    }
}

impl Default for TranslatorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Translates segments through a backend.
pub struct Translator {
    backend: Arc<dyn Backend>,
    settings: TranslatorSettings,
    usage: Option<Arc<UsageStore>>,
}

impl Translator {
    pub fn new(backend: Arc<dyn Backend>, settings: TranslatorSettings) -> Self {
        Self {
            backend,
            settings,
            usage: None,
        }
    }

    /// Records every successful call into `usage`.
    pub fn with_usage(mut self, usage: Arc<UsageStore>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn settings(&self) -> &TranslatorSettings {
        &self.settings
    }

    /// Guideline text with languages and book filled in.
    fn guidelines(&self, request: &TranslationRequest) -> String {
        let template = self
            .settings
            .guidelines
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| self.settings.style.template());

        template
            .replace("{source}", &request.source_lang)
            .replace("{target}", &request.target_lang)
            .replace("{book}", &request.book_context)
    }

    /// Identity of the guideline template, for cache keys.
    fn guideline_identity(&self) -> String {
        match self.settings.guidelines.as_deref() {
            Some(custom) if !custom.trim().is_empty() => format!("custom:{}", sha256_hex(custom)),
            _ => self.settings.style.as_str().to_string(),
        }
    }

    fn build_request(&self, request: &TranslationRequest) -> BackendRequest {
        let mut system = vec![SystemPart {
            text: self.guidelines(request),
            cacheable: true,
        }];
        if let Some(prompt) = self.settings.system_prompt.as_deref() {
            if !prompt.trim().is_empty() {
                system.push(SystemPart {
                    text: prompt.to_string(),
                    cacheable: false,
                });
            }
        }
        if let Some(instructions) = request.effective_instructions() {
            system.push(SystemPart {
                text: instructions,
                cacheable: false,
            });
        }

        BackendRequest {
            system,
            content: format!("{}{}", USER_PREFIX, request.content),
            model: self.settings.model.clone(),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        }
    }

    /// Content-addressed key for the result of `request`.
    pub fn cache_key(&self, request: &TranslationRequest) -> String {
        let instructions = request.effective_instructions().unwrap_or_default();
        let parts = [
            request.content.as_str(),
            instructions.as_str(),
            request.source_lang.as_str(),
            request.target_lang.as_str(),
            &self.guideline_identity(),
            request.book_context.as_str(),
            self.settings.model.as_str(),
        ];
        sha256_hex(&parts.join("\u{1f}"))
    }

    /// Translates one segment.
    ///
    /// Rate-limited calls are retried with a linear backoff until
    /// `max_retries` attempts are spent. Other errors return immediately.
    pub async fn translate(
        &self,
        request: &TranslationRequest,
        cancel: &CancelToken,
    ) -> Result<String, TranslationError> {
        if request.content.trim().is_empty() {
            return Ok(String::new());
        }

        let backend_request = self.build_request(request);
        let max_attempts = self.settings.max_retries.max(1);
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(TranslationError::Cancelled);
            }
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TranslationError::Cancelled),
                result = self.backend.send(&backend_request) => result,
            };

            let error = match result {
                Ok(response) => {
                    let text = response.text.trim();
                    if text.is_empty() {
                        return Err(TranslationError::ApiError(
                            "no translation received".to_string(),
                        ));
                    }
                    if let Some(usage) = &self.usage {
                        usage
                            .clone()
                            .record_async(
                                self.settings.model.clone(),
                                response.usage,
                                request.content.clone(),
                            )
                            .await;
                    }
                    return Ok(text.to_string());
                }
                Err(e) if e.is_rate_limited() => e,
                Err(e) => return Err(e),
            };

            if attempt >= max_attempts {
                return Err(TranslationError::MaxRetriesExceeded {
                    attempts: attempt,
                    source: Box::new(error),
                });
            }

            let delay = self.settings.retry_base_delay * attempt;
            tracing::warn!(
                backend = self.backend.name(),
                attempt,
                max_attempts,
                ?delay,
                "rate limited, backing off"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TranslationError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::BackendResponse;
    use crate::usage::TokenUsage;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    type Reply = Box<dyn Fn(&BackendRequest, usize) -> Result<String, TranslationError> + Send + Sync>;

    /// Backend double that records requests and answers through a closure.
    pub(crate) struct StubBackend {
        reply: Reply,
        pub(crate) requests: Mutex<Vec<BackendRequest>>,
    }

    impl StubBackend {
        pub(crate) fn new(
            reply: impl Fn(&BackendRequest, usize) -> Result<String, TranslationError>
            + Send
            + Sync
            + 'static,
        ) -> Self {
            Self {
                reply: Box::new(reply),
                requests: Mutex::new(Vec::new()),
            }
        }

        /// Answers with the source text in upper case.
        pub(crate) fn uppercase() -> Self {
            Self::new(|request, _| Ok(source_of(request).to_uppercase()))
        }

        pub(crate) fn calls(&self) -> usize {
            self.requests.lock().len()
        }
    }

    /// The segment text inside a built request.
    pub(crate) fn source_of(request: &BackendRequest) -> &str {
        request
            .content
            .strip_prefix(USER_PREFIX)
            .unwrap_or(&request.content)
    }

    #[async_trait]
    impl Backend for StubBackend {
        fn name(&self) -> &'static str {
            "Stub"
        }

        async fn send(&self, request: &BackendRequest) -> Result<BackendResponse, TranslationError> {
            let call = {
                let mut requests = self.requests.lock();
                requests.push(request.clone());
                requests.len()
            };
            (self.reply)(request, call).map(|text| BackendResponse {
                text,
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
            })
        }
    }

    pub(crate) fn fast_settings() -> TranslatorSettings {
        TranslatorSettings {
            model: "test-model".to_string(),
            retry_base_delay: Duration::from_millis(1),
            ..TranslatorSettings::default()
        }
    }

    fn request(content: &str) -> TranslationRequest {
        TranslationRequest {
            content: content.to_string(),
            source_lang: "english".to_string(),
            target_lang: "vietnamese".to_string(),
            book_context: "The Book".to_string(),
            ..TranslationRequest::default()
        }
    }

    #[tokio::test]
    async fn test_builds_system_and_user_message() {
        let backend = Arc::new(StubBackend::uppercase());
        let settings = TranslatorSettings {
            system_prompt: Some("Keep footnotes.".to_string()),
            ..fast_settings()
        };
        let translator = Translator::new(backend.clone(), settings);
        let mut req = request("Hello");
        req.instructions = Some("Use formal tone.".to_string());

        let result = translator.translate(&req, &CancelToken::new()).await.unwrap();
        assert_eq!(result, "HELLO");

        let sent = backend.requests.lock()[0].clone();
        assert_eq!(
            sent.content,
            "Translate this and not say anything otherwise the translation: Hello"
        );
        assert_eq!(sent.model, "test-model");
        assert_eq!(sent.system.len(), 3);
        assert!(sent.system[0].cacheable);
        assert!(sent.system[0].text.contains("from english to vietnamese"));
        assert!(sent.system[0].text.contains("\"The Book\""));
        assert_eq!(sent.system[1].text, "Keep footnotes.");
        assert_eq!(sent.system[2].text, "Use formal tone.");
    }

    #[tokio::test]
    async fn test_prior_translation_is_prefixed() {
        let backend = Arc::new(StubBackend::uppercase());
        let translator = Translator::new(backend.clone(), fast_settings());
        let mut req = request("Hello");
        req.prior_translation = Some("Xin chao".to_string());
        req.instructions = Some("Fix the accents.".to_string());

        translator.translate(&req, &CancelToken::new()).await.unwrap();

        let sent = backend.requests.lock()[0].clone();
        assert_eq!(
            sent.system.last().unwrap().text,
            "Previous translation:\n\nXin chao\n\nFix the accents."
        );
    }

    #[test]
    fn test_effective_instructions() {
        let mut req = request("x");
        assert_eq!(req.effective_instructions(), None);

        req.instructions = Some("  ".to_string());
        assert_eq!(req.effective_instructions(), None);

        req.prior_translation = Some("old".to_string());
        assert_eq!(
            req.effective_instructions().as_deref(),
            Some("Previous translation:\n\nold")
        );
    }

    #[test]
    fn test_custom_guidelines_override_style() {
        let settings = TranslatorSettings {
            guidelines: Some("Render {source} as {target} for {book}.".to_string()),
            ..fast_settings()
        };
        let translator = Translator::new(Arc::new(StubBackend::uppercase()), settings);
        assert_eq!(
            translator.guidelines(&request("x")),
            "Render english as vietnamese for The Book."
        );
    }

    #[tokio::test]
    async fn test_always_rate_limited_stops_after_max_retries() {
        let backend = Arc::new(StubBackend::new(|_, _| {
            Err(TranslationError::RateLimited("HTTP 429".to_string()))
        }));
        let translator = Translator::new(backend.clone(), fast_settings());

        let err = translator
            .translate(&request("Hello"), &CancelToken::new())
            .await
            .unwrap_err();

        assert_eq!(backend.calls(), 3);
        assert!(matches!(
            err,
            TranslationError::MaxRetriesExceeded { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_recovers_after_rate_limit() {
        let backend = Arc::new(StubBackend::new(|request, call| {
            if call == 1 {
                Err(TranslationError::RateLimited("HTTP 529".to_string()))
            } else {
                Ok(source_of(request).to_uppercase())
            }
        }));
        let translator = Translator::new(backend.clone(), fast_settings());

        let result = translator
            .translate(&request("Hello"), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(result, "HELLO");
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let backend = Arc::new(StubBackend::new(|_, _| {
            Err(TranslationError::ApiError("HTTP 401".to_string()))
        }));
        let translator = Translator::new(backend.clone(), fast_settings());

        let err = translator
            .translate(&request("Hello"), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TranslationError::ApiError(_)));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_reply_is_an_error() {
        let backend = Arc::new(StubBackend::new(|_, _| Ok("  ".to_string())));
        let translator = Translator::new(backend, fast_settings());

        let err = translator
            .translate(&request("Hello"), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no translation received"));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let backend = Arc::new(StubBackend::uppercase());
        let translator = Translator::new(backend.clone(), fast_settings());
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = translator.translate(&request("Hello"), &cancel).await.unwrap_err();
        assert!(matches!(err, TranslationError::Cancelled));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let backend = Arc::new(StubBackend::new(|_, _| {
            Err(TranslationError::RateLimited("HTTP 429".to_string()))
        }));
        let settings = TranslatorSettings {
            retry_base_delay: Duration::from_secs(60),
            ..fast_settings()
        };
        let translator = Translator::new(backend.clone(), settings);
        let cancel = CancelToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            });
        }

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            translator.translate(&request("Hello"), &cancel),
        )
        .await
        .expect("cancel should cut the backoff short")
        .unwrap_err();
        assert!(matches!(err, TranslationError::Cancelled));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_records_usage() {
        let dir = TempDir::new().unwrap();
        let usage = Arc::new(UsageStore::load(dir.path().join("usage.json")));
        let translator =
            Translator::new(Arc::new(StubBackend::uppercase()), fast_settings()).with_usage(usage.clone());

        translator
            .translate(&request("Hello"), &CancelToken::new())
            .await
            .unwrap();

        let snapshot = usage.snapshot();
        assert_eq!(snapshot.total_calls, 1);
        assert_eq!(snapshot.model_usage.get("test-model"), Some(&1));
        assert_eq!(snapshot.total_tokens, 15);
        assert_eq!(snapshot.prompt_examples, vec!["Hello".to_string()]);
        assert!(dir.path().join("usage.json").exists());
    }

    #[test]
    fn test_cache_key_covers_context() {
        let translator = Translator::new(Arc::new(StubBackend::uppercase()), fast_settings());
        let base = request("Hello");
        let key = translator.cache_key(&base);
        assert_eq!(key, translator.cache_key(&base.clone()));

        let mut other_target = base.clone();
        other_target.target_lang = "french".to_string();
        let mut other_book = base.clone();
        other_book.book_context = "Another".to_string();
        let mut revision = base.clone();
        revision.prior_translation = Some("Xin chao".to_string());

        for variant in [other_target, other_book, revision] {
            assert_ne!(translator.cache_key(&variant), key);
        }

        let psychology = Translator::new(
            Arc::new(StubBackend::uppercase()),
            TranslatorSettings {
                style: GuidelineStyle::Psychology,
                ..fast_settings()
            },
        );
        assert_ne!(psychology.cache_key(&base), key);
    }
}
