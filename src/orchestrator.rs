//! Batch translation of marked documents.
//!
//! A run loads every document, collects the segments still waiting for a
//! translation, and pushes them through a bounded pool of workers. Each
//! worker goes through the cache first and the translator on a miss. A
//! document is written back once all of its segments have finished.

use crate::cache::TranslationCache;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::document::Document;
use crate::error::{DocumentError, TranslationError};
use crate::marker::{self, MarkStats};
use crate::report::{DocumentReport, Report, SegmentOutcome};
use crate::segment::{self, Segment};
use crate::translator::{TranslationRequest, Translator};
use anyhow::Context;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Per-run settings.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub source_lang: String,
    pub target_lang: String,
    /// Maximum number of segments in flight.
    pub concurrency: usize,
    /// Book title passed to the guidelines.
    pub book_context: String,
    /// Extra instructions for every segment.
    pub instructions: Option<String>,
    /// Run the marker on each document before collecting segments.
    pub mark_first: bool,
}

impl RunOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            source_lang: config.translation.source_language.clone(),
            target_lang: config.translation.target_language.clone(),
            concurrency: config.translation.concurrency,
            book_context: String::new(),
            instructions: None,
            mark_first: true,
        }
    }

    fn request_for(&self, segment: &Segment) -> TranslationRequest {
        TranslationRequest {
            instructions: self.instructions.clone(),
            content: segment.source.clone(),
            prior_translation: if segment.retranslate {
                segment.translation.clone()
            } else {
                None
            },
            source_lang: self.source_lang.clone(),
            target_lang: self.target_lang.clone(),
            book_context: self.book_context.clone(),
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Reported after every finished segment.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Segments finished so far, this one included.
    pub completed: usize,
    pub total: usize,
    pub document: PathBuf,
    pub segment_id: String,
    pub outcome: SegmentOutcome,
}

pub type ProgressCallback = Box<dyn Fn(&ProgressInfo) + Send + Sync>;

/// A translation produced for a single segment, not yet saved.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SegmentTranslation {
    pub segment_id: String,
    pub source: String,
    pub prior_translation: Option<String>,
    pub translation: String,
    /// Served from the cache instead of the backend.
    pub cached: bool,
}

struct Job {
    document: usize,
    segment_id: String,
    request: TranslationRequest,
}

struct Resolved {
    text: String,
    cached: bool,
}

/// A document loaded for a run, with the translations waiting to be applied.
struct Pending {
    document: Document,
    changed: bool,
    remaining: usize,
    translations: Vec<(String, String)>,
}

/// Drives translation of many documents.
pub struct Orchestrator {
    translator: Arc<Translator>,
    cache: Option<Arc<TranslationCache>>,
    progress: Option<ProgressCallback>,
}

impl Orchestrator {
    pub fn new(translator: Arc<Translator>, cache: Option<Arc<TranslationCache>>) -> Self {
        Self {
            translator,
            cache,
            progress: None,
        }
    }

    /// Calls `callback` after each finished segment.
    pub fn with_progress(mut self, callback: impl Fn(&ProgressInfo) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    /// Translates every pending segment of `documents`.
    ///
    /// Failures are recorded in the report and never stop the batch.
    /// Successful segments are written even when the run is cancelled.
    pub async fn run(
        &self,
        documents: &[PathBuf],
        options: &RunOptions,
        cancel: &CancelToken,
    ) -> Report {
        let started = Instant::now();
        let mut reports: Vec<DocumentReport> =
            documents.iter().cloned().map(DocumentReport::new).collect();
        let mut loaded: Vec<Option<Pending>> = Vec::with_capacity(documents.len());
        let mut jobs = Vec::new();

        for (index, path) in documents.iter().enumerate() {
            match load(path, options) {
                Ok((document, marking, pending)) => {
                    tracing::info!(
                        path = %path.display(),
                        pending = pending.len(),
                        "loaded document"
                    );
                    let changed = marking.as_ref().is_some_and(MarkStats::changed);
                    reports[index].marking = marking;
                    loaded.push(Some(Pending {
                        document,
                        changed,
                        remaining: pending.len(),
                        translations: Vec::new(),
                    }));
                    jobs.extend(pending.into_iter().map(|segment| Job {
                        document: index,
                        request: options.request_for(&segment),
                        segment_id: segment.id,
                    }));
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping document");
                    reports[index].error = Some(e.to_string());
                    loaded.push(None);
                }
            }
        }

        for (index, slot) in loaded.iter_mut().enumerate() {
            if slot.as_ref().is_some_and(|p| p.remaining == 0) {
                finish_document(&documents[index], slot.take(), &mut reports[index]);
            }
        }

        let total = jobs.len();
        let mut outcomes: Vec<Option<SegmentOutcome>> = vec![None; total];
        let mut completed = 0;

        let mut results = stream::iter(jobs.iter().enumerate())
            .map(|(index, job)| async move { (index, self.resolve(&job.request, cancel).await) })
            .buffer_unordered(options.concurrency.max(1));

        while let Some((index, result)) = results.next().await {
            let job = &jobs[index];
            let outcome = match result {
                Ok(resolved) => {
                    if let Some(pending) = loaded[job.document].as_mut() {
                        pending
                            .translations
                            .push((job.segment_id.clone(), resolved.text));
                    }
                    if resolved.cached {
                        SegmentOutcome::Cached
                    } else {
                        SegmentOutcome::Translated
                    }
                }
                Err(e) => {
                    if !matches!(e, TranslationError::Cancelled) {
                        tracing::warn!(
                            path = %documents[job.document].display(),
                            segment = %job.segment_id,
                            error = %e,
                            "segment failed"
                        );
                    }
                    SegmentOutcome::from(&e)
                }
            };

            completed += 1;
            if let Some(progress) = &self.progress {
                progress(&ProgressInfo {
                    completed,
                    total,
                    document: documents[job.document].clone(),
                    segment_id: job.segment_id.clone(),
                    outcome: outcome.clone(),
                });
            }
            outcomes[index] = Some(outcome);

            let slot = &mut loaded[job.document];
            if let Some(pending) = slot.as_mut() {
                pending.remaining -= 1;
                if pending.remaining == 0 {
                    finish_document(
                        &documents[job.document],
                        slot.take(),
                        &mut reports[job.document],
                    );
                }
            }
        }
        drop(results);

        for (job, outcome) in jobs.into_iter().zip(outcomes) {
            reports[job.document].record(job.segment_id, outcome.unwrap_or(SegmentOutcome::Cancelled));
        }

        let report = Report::from_documents(reports, started.elapsed());
        tracing::info!(
            attempted = report.totals.attempted,
            succeeded = report.totals.succeeded,
            cached = report.totals.cached,
            failed = report.totals.failed,
            cancelled = report.totals.cancelled,
            "run finished"
        );
        report
    }

    /// Translates one segment of a document without saving it.
    ///
    /// The current placeholder content, if any, is sent as the prior
    /// translation. `instructions` replaces the run-wide instructions.
    pub async fn translate_segment(
        &self,
        path: &Path,
        segment_id: &str,
        instructions: Option<&str>,
        options: &RunOptions,
        cancel: &CancelToken,
    ) -> crate::error::Result<SegmentTranslation> {
        let document = Document::read(path)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        let segment = segment::find(&document, segment_id)?;

        let mut request = options.request_for(&segment);
        request.prior_translation = segment.translation.clone();
        if let Some(instructions) = instructions {
            request.instructions = Some(instructions.to_string());
        }

        let resolved = self.resolve(&request, cancel).await?;
        Ok(SegmentTranslation {
            segment_id: segment.id,
            source: segment.source,
            prior_translation: segment.translation,
            translation: resolved.text,
            cached: resolved.cached,
        })
    }

    /// Cache lookup, then a translator call on a miss.
    async fn resolve(
        &self,
        request: &TranslationRequest,
        cancel: &CancelToken,
    ) -> Result<Resolved, TranslationError> {
        if cancel.is_cancelled() {
            return Err(TranslationError::Cancelled);
        }

        let key = self
            .cache
            .as_ref()
            .map(|cache| (cache, self.translator.cache_key(request)));

        if let Some((cache, key)) = &key {
            if let Some(text) = cache.get(key) {
                return Ok(Resolved { text, cached: true });
            }
        }

        let text = self.translator.translate(request, cancel).await?;
        if let Some((cache, key)) = &key {
            cache.set(key, &text);
        }
        Ok(Resolved {
            text,
            cached: false,
        })
    }
}

/// Reads a document, optionally marks it, and lists its pending segments.
fn load(
    path: &Path,
    options: &RunOptions,
) -> Result<(Document, Option<MarkStats>, Vec<Segment>), DocumentError> {
    let mut document = Document::read(path)?;
    let marking = options
        .mark_first
        .then(|| marker::mark(&mut document, &marker::document_identity(path)));
    let pending = segment::pending(&document)?;
    Ok((document, marking, pending))
}

/// Applies collected translations and saves the document if it changed.
fn finish_document(path: &Path, pending: Option<Pending>, report: &mut DocumentReport) {
    let Some(Pending {
        mut document,
        mut changed,
        translations,
        ..
    }) = pending
    else {
        return;
    };

    for (segment_id, text) in translations {
        match segment::write_translation(&mut document, &segment_id, &text) {
            Ok(()) => changed = true,
            Err(e) => {
                tracing::warn!(path = %path.display(), segment = %segment_id, error = %e, "could not apply translation");
                report.error.get_or_insert_with(|| e.to_string());
            }
        }
    }

    if !changed {
        return;
    }

    match document.save(path) {
        Ok(()) => {
            report.written = true;
            tracing::info!(path = %path.display(), "document written");
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "failed to save document");
            report.error = Some(e.to_string());
        }
    }
}
