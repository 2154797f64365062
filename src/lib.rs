//! epubtrans - bilingual e-book translation.
//!
//! This library provides functionality for:
//! - Marking translatable segments of XHTML content documents with stable IDs
//! - Translating marked segments through an LLM backend with caching and retries
//! - Writing translations back next to the original text

pub mod backend;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod console;
pub mod document;
pub mod error;
pub mod marker;
pub mod orchestrator;
pub mod report;
pub mod segment;
pub mod translator;
pub mod usage;
pub mod utils;

// Re-export commonly used types
pub use backend::{AnthropicBackend, Backend};
pub use cache::TranslationCache;
pub use cancel::CancelToken;
pub use config::Config;
pub use console::Console;
pub use document::Document;
pub use error::{ConfigError, DocumentError, FailureKind, TranslationError, UsageError};
pub use marker::{MarkStats, mark, mark_file};
pub use orchestrator::{Orchestrator, ProgressInfo, RunOptions, SegmentTranslation};
pub use report::{Report, SegmentOutcome};
pub use segment::{Segment, SegmentStatus, update_translation_file};
pub use translator::{GuidelineStyle, TranslationRequest, Translator, TranslatorSettings};
pub use usage::{UsageMetadata, UsageStore};
