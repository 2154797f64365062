//! Outcome accounting for a translation run.

use crate::error::{FailureKind, TranslationError};
use crate::marker::MarkStats;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// What happened to one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SegmentOutcome {
    /// Filled from a backend call.
    Translated,
    /// Filled from the cache.
    Cached,
    Failed { kind: FailureKind, message: String },
    /// Skipped because the run was cancelled.
    Cancelled,
}

impl SegmentOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SegmentOutcome::Translated | SegmentOutcome::Cached)
    }
}

impl From<&TranslationError> for SegmentOutcome {
    fn from(error: &TranslationError) -> Self {
        match error.kind() {
            FailureKind::Cancelled => SegmentOutcome::Cancelled,
            kind => SegmentOutcome::Failed {
                kind,
                message: error.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentReport {
    pub segment_id: String,
    #[serde(flatten)]
    pub outcome: SegmentOutcome,
}

/// Segment counters, per document or for the whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    /// Segments that needed a translation.
    pub attempted: usize,
    /// Filled by a backend call.
    pub succeeded: usize,
    pub cached: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl Counts {
    fn add(&mut self, outcome: &SegmentOutcome) {
        self.attempted += 1;
        match outcome {
            SegmentOutcome::Translated => self.succeeded += 1,
            SegmentOutcome::Cached => self.cached += 1,
            SegmentOutcome::Failed { .. } => self.failed += 1,
            SegmentOutcome::Cancelled => self.cancelled += 1,
        }
    }

    fn merge(&mut self, other: &Counts) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.cached += other.cached;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
    }
}

/// Result of processing one document.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DocumentReport {
    pub path: PathBuf,
    /// Marking pass statistics, when marking ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marking: Option<MarkStats>,
    pub segments: Vec<SegmentReport>,
    /// Load, parse or save failure. Set when the document was skipped or
    /// could not be written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether the file was rewritten.
    pub written: bool,
}

impl DocumentReport {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            ..Self::default()
        }
    }

    pub fn record(&mut self, segment_id: impl Into<String>, outcome: SegmentOutcome) {
        self.segments.push(SegmentReport {
            segment_id: segment_id.into(),
            outcome,
        });
    }

    pub fn counts(&self) -> Counts {
        let mut counts = Counts::default();
        for segment in &self.segments {
            counts.add(&segment.outcome);
        }
        counts
    }

    pub fn outcome_of(&self, segment_id: &str) -> Option<&SegmentOutcome> {
        self.segments
            .iter()
            .find(|s| s.segment_id == segment_id)
            .map(|s| &s.outcome)
    }
}

/// Aggregated result of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pub documents: Vec<DocumentReport>,
    pub totals: Counts,
    /// Documents that could not be loaded or saved.
    pub document_errors: usize,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

impl Report {
    /// Builds the totals from per-document reports.
    pub fn from_documents(documents: Vec<DocumentReport>, elapsed: Duration) -> Self {
        let mut totals = Counts::default();
        let mut document_errors = 0;
        for document in &documents {
            totals.merge(&document.counts());
            if document.error.is_some() {
                document_errors += 1;
            }
        }

        Self {
            documents,
            totals,
            document_errors,
            elapsed,
        }
    }

    /// True when nothing failed. Cancelled segments do not count as failures.
    pub fn is_clean(&self) -> bool {
        self.totals.failed == 0 && self.document_errors == 0
    }

    /// Failed segments across all documents.
    pub fn failures(&self) -> impl Iterator<Item = (&DocumentReport, &SegmentReport)> {
        self.documents.iter().flat_map(|document| {
            document
                .segments
                .iter()
                .filter(|s| matches!(s.outcome, SegmentOutcome::Failed { .. }))
                .map(move |s| (document, s))
        })
    }
}

fn serialize_secs<S: serde::Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_secs_f64())
}
