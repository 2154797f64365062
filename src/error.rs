//! Error types for epubtrans.
//!
//! Uses `thiserror` for structured error definitions that provide
//! clear context about what went wrong.

use thiserror::Error;

/// Error type for translation calls against a backend.
#[derive(Error, Debug)]
pub enum TranslationError {
    /// HTTP request to the API failed before a response arrived
    #[error("API request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The backend is throttling requests (HTTP 429/529)
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// API returned an error response
    #[error("API error: {0}")]
    ApiError(String),

    /// Failed to parse API response
    #[error("Failed to parse API response: {0}")]
    InvalidResponse(String),

    /// Retry budget spent on transient failures
    #[error("Max retries reached after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        attempts: u32,
        #[source]
        source: Box<TranslationError>,
    },

    /// The caller cancelled the run
    #[error("Translation cancelled")]
    Cancelled,

    /// Invalid API configuration
    #[error("Invalid API configuration: {0}")]
    InvalidConfig(String),
}

impl TranslationError {
    /// Returns true for failures worth another attempt after a backoff.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, TranslationError::RateLimited(_))
    }

    /// Stable label used in reports.
    pub fn kind(&self) -> FailureKind {
        match self {
            TranslationError::RateLimited(_) => FailureKind::RateLimited,
            TranslationError::MaxRetriesExceeded { .. } => FailureKind::MaxRetriesExceeded,
            TranslationError::Cancelled => FailureKind::Cancelled,
            TranslationError::HttpError(_)
            | TranslationError::ApiError(_)
            | TranslationError::InvalidResponse(_)
            | TranslationError::InvalidConfig(_) => FailureKind::BackendError,
        }
    }
}

/// Coarse classification of a segment failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    RateLimited,
    BackendError,
    MaxRetriesExceeded,
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FailureKind::RateLimited => "RateLimited",
            FailureKind::BackendError => "BackendError",
            FailureKind::MaxRetriesExceeded => "MaxRetriesExceeded",
            FailureKind::Cancelled => "Cancelled",
        };
        f.write_str(label)
    }
}

/// Error type for loading, parsing and saving content documents.
#[derive(Error, Debug)]
pub enum DocumentError {
    /// Failed to read or write the document file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Markup could not be parsed into a tree
    #[error("Failed to parse document: {0}")]
    Parse(String),

    /// Failed to serialize the tree back to markup
    #[error("Failed to serialize document: {0}")]
    Serialize(String),

    /// No segment with the given ID in the document
    #[error("Segment not found: {0}")]
    SegmentNotFound(String),
}

/// Error type for configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse config file
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    /// Missing required configuration value
    #[error("Missing required config value: {0}")]
    MissingValue(String),

    /// Invalid configuration value
    #[error("Invalid config value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Config directory not found
    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Error type for usage metadata persistence.
#[derive(Error, Debug)]
pub enum UsageError {
    /// Failed to read or write the metadata file
    #[error("Failed to access usage metadata: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to encode or decode JSON
    #[error("Invalid usage metadata JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using anyhow for application-level error handling.
pub type Result<T> = anyhow::Result<T>;
