//! Configuration management for epubtrans.
//!
//! Handles loading, saving, and validating configuration from
//! platform-specific config directories, with a few environment
//! variables taking precedence over the file.

use crate::error::ConfigError;
use crate::translator::GuidelineStyle;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Application name used for config directory.
const APP_NAME: &str = "Epubtrans";

/// Default config filename.
const CONFIG_FILENAME: &str = "config.toml";

/// Placeholder value for unconfigured API keys.
const API_KEY_PLACEHOLDER: &str = "YOUR_API_KEY_HERE";

/// Environment variable holding the API key.
pub const ENV_API_KEY: &str = "ANTHROPIC_KEY";
/// Environment variable overriding the guideline template.
pub const ENV_GUIDELINES: &str = "TRANSLATION_GUIDELINES";
/// Environment variable holding an extra system prompt.
pub const ENV_SYSTEM_PROMPT: &str = "SYSTEM_PROMPT";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Translation backend endpoint and model settings.
    pub api: ApiConfig,

    /// Languages, concurrency and retry behavior.
    pub translation: TranslationConfig,

    /// Result cache settings.
    pub cache: CacheConfig,

    /// Guideline and system prompt overrides.
    pub prompts: PromptsConfig,

    /// File paths.
    pub paths: PathsConfig,
}

/// API configuration for the Anthropic Messages endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// API key (required).
    pub key: String,

    /// Base URL for the API.
    pub base_url: String,

    /// Model identifier.
    pub model: String,

    /// Sampling temperature.
    pub temperature: f32,

    /// Maximum output tokens per call.
    pub max_tokens: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            key: API_KEY_PLACEHOLDER.to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            model: "claude-3-5-sonnet-latest".to_string(),
            temperature: 0.3,
            max_tokens: 8192,
        }
    }
}

impl ApiConfig {
    /// Checks if the API key is configured (not placeholder).
    pub fn is_configured(&self) -> bool {
        !self.key.is_empty() && self.key != API_KEY_PLACEHOLDER
    }
}

/// Translation behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    pub source_language: String,
    pub target_language: String,

    /// Number of segments translated at the same time.
    pub concurrency: usize,

    /// Total attempts per segment when the backend is throttling.
    pub max_retries: u32,

    /// Backoff unit; attempt `n` waits `n` times this long.
    pub retry_base_delay_ms: u64,

    /// Built-in guideline template.
    pub style: GuidelineStyle,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            source_language: "english".to_string(),
            target_language: "vietnamese".to_string(),
            concurrency: 4,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            style: GuidelineStyle::default(),
        }
    }
}

impl TranslationConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Result cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: usize,
    /// Upper bound on the summed size of cached translations, in bytes.
    pub max_cost: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: crate::cache::DEFAULT_TTL.as_secs(),
            max_entries: crate::cache::DEFAULT_MAX_ENTRIES,
            max_cost: crate::cache::DEFAULT_MAX_COST,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Prompt overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptsConfig {
    /// Replaces the built-in guideline template. May use `{source}`,
    /// `{target}` and `{book}`.
    pub guidelines: Option<String>,

    /// Extra system instruction sent with every call.
    pub system_prompt: Option<String>,
}

/// File path configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Where usage counters are kept.
    pub usage_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            usage_file: PathBuf::from(crate::usage::DEFAULT_USAGE_FILE),
        }
    }
}

impl Config {
    /// Returns the platform-specific config directory path.
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|p| p.join(APP_NAME))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Returns the full path to the config file.
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join(CONFIG_FILENAME))
    }

    /// Loads configuration from the default location.
    ///
    /// If the config file doesn't exist, creates a default one.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Config::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        Ok(config)
    }

    /// Saves configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_path()?;
        self.save_to(&path)
    }

    /// Saves configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Applies `ANTHROPIC_KEY`, `TRANSLATION_GUIDELINES` and `SYSTEM_PROMPT`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(key) = lookup(ENV_API_KEY) {
            self.api.key = key;
        }
        if let Some(guidelines) = lookup(ENV_GUIDELINES) {
            self.prompts.guidelines = Some(guidelines);
        }
        if let Some(system_prompt) = lookup(ENV_SYSTEM_PROMPT) {
            self.prompts.system_prompt = Some(system_prompt);
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.api.is_configured() {
            return Err(ConfigError::MissingValue(format!(
                "api.key (set it in the config file or {})",
                ENV_API_KEY
            )));
        }

        match Url::parse(&self.api.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return Err(invalid(
                    "api.base_url",
                    format!("unsupported scheme '{}'", url.scheme()),
                ));
            }
            Err(e) => return Err(invalid("api.base_url", e.to_string())),
        }

        if !(0.0..=1.0).contains(&self.api.temperature) {
            return Err(invalid("api.temperature", "must be between 0.0 and 1.0"));
        }

        if self.api.max_tokens == 0 {
            return Err(invalid("api.max_tokens", "must be greater than 0"));
        }

        if self.translation.concurrency == 0 {
            return Err(invalid("translation.concurrency", "must be greater than 0"));
        }

        if self.translation.max_retries == 0 {
            return Err(invalid("translation.max_retries", "must be greater than 0"));
        }

        Ok(())
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}
