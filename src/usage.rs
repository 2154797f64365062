//! Persistent usage accounting for the translation backend.
//!
//! Counters are loaded once, bumped after every successful call and
//! written back right away. Persistence is best-effort: failures are logged
//! and never reach the translation path.

use crate::error::UsageError;
use crate::utils::{truncate_chars, write_atomic};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default location of the usage file, relative to the working directory.
pub const DEFAULT_USAGE_FILE: &str = "unpackage/translator_metadata.json";

/// Number of example inputs kept.
const MAX_PROMPT_EXAMPLES: usize = 5;
/// Characters kept from each example input.
const PROMPT_EXAMPLE_CHARS: usize = 100;

/// Token counts reported by the backend for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Accumulated usage counters, as stored on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageMetadata {
    pub total_calls: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub model_usage: BTreeMap<String, u64>,
    /// The most recent inputs, oldest first.
    pub prompt_examples: Vec<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl UsageMetadata {
    fn record(&mut self, model: &str, usage: TokenUsage, sample: &str) {
        self.total_calls += 1;
        self.last_used = Some(Utc::now());
        *self.model_usage.entry(model.to_string()).or_insert(0) += 1;

        self.prompt_examples
            .push(truncate_chars(sample, PROMPT_EXAMPLE_CHARS).to_string());
        if self.prompt_examples.len() > MAX_PROMPT_EXAMPLES {
            let excess = self.prompt_examples.len() - MAX_PROMPT_EXAMPLES;
            self.prompt_examples.drain(..excess);
        }

        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.total_tokens += usage.total();
    }
}

/// Shared usage counters backed by a JSON file.
pub struct UsageStore {
    path: PathBuf,
    metadata: Mutex<UsageMetadata>,
}

impl UsageStore {
    /// Loads counters from `path`, starting fresh if the file is missing or unreadable.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let metadata = match Self::read(&path) {
            Ok(Some(metadata)) => metadata,
            Ok(None) => UsageMetadata::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable usage metadata");
                UsageMetadata::default()
            }
        };

        Self {
            path,
            metadata: Mutex::new(metadata),
        }
    }

    fn read(path: &Path) -> Result<Option<UsageMetadata>, UsageError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records one successful call and persists the counters.
    ///
    /// The file is written while the lock is held, so saves land in the
    /// order the counters were bumped.
    pub fn record(&self, model: &str, usage: TokenUsage, sample: &str) {
        let mut metadata = self.metadata.lock();
        metadata.record(model, usage, sample);
        self.persist(&metadata);
    }

    /// Same as [`record`](Self::record), on the blocking pool.
    pub async fn record_async(self: Arc<Self>, model: String, usage: TokenUsage, sample: String) {
        let store = self;
        if let Err(e) =
            tokio::task::spawn_blocking(move || store.record(&model, usage, &sample)).await
        {
            tracing::warn!(error = %e, "usage recording task failed");
        }
    }

    /// Writes the current counters to disk, logging any failure.
    pub fn save(&self) {
        let metadata = self.metadata.lock();
        self.persist(&metadata);
    }

    fn persist(&self, metadata: &UsageMetadata) {
        if let Err(e) = self.try_save(metadata) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to save usage metadata");
        }
    }

    fn try_save(&self, metadata: &UsageMetadata) -> Result<(), UsageError> {
        let json = serde_json::to_string_pretty(metadata)?;
        write_atomic(&self.path, json.as_bytes())?;
        Ok(())
    }

    pub fn snapshot(&self) -> UsageMetadata {
        self.metadata.lock().clone()
    }
}
