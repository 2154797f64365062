//! Reading and filling marked segments.
//!
//! Works on documents the marker has already tagged. This is also the
//! surface a preview/edit server uses to show a segment and to save a
//! hand-edited translation.

use crate::document::{Document, NodeId, ROOT};
use crate::error::DocumentError;
use crate::marker::{
    CONTENT_HASH_ATTR, CONTENT_ID_ATTR, RETRANSLATE_ATTR, TRANSLATION_ID_ATTR, placeholder_of,
};
use serde::Serialize;
use std::path::Path;

/// A marked segment and the state of its placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    /// Stable ID shared by the source element and its placeholder.
    pub id: String,
    /// Inner markup of the source element.
    pub source: String,
    /// Hash of the normalized source text, as stored by the marker.
    pub content_hash: Option<String>,
    /// Inner markup of the placeholder, `None` while it is blank.
    pub translation: Option<String>,
    /// Whether a placeholder exists at all.
    pub has_placeholder: bool,
    /// The placeholder asks for a fresh translation.
    pub retranslate: bool,
}

impl Segment {
    /// Whether the orchestrator should translate this segment.
    pub fn is_pending(&self) -> bool {
        self.has_placeholder && (self.translation.is_none() || self.retranslate)
    }
}

/// Placeholder counts for one document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SegmentStatus {
    pub total: usize,
    pub translated: usize,
    pub pending: usize,
    pub flagged: usize,
}

/// Marked source elements in document order, with their placeholders.
fn marked_nodes(doc: &Document) -> Vec<(NodeId, String, Option<NodeId>)> {
    let mut nodes = Vec::new();
    let mut stack: Vec<NodeId> = doc.children(ROOT).iter().rev().copied().collect();

    while let Some(node) = stack.pop() {
        if let Some(id) = doc.attr(node, CONTENT_ID_ATTR) {
            let placeholder = placeholder_of(doc, node, &id);
            nodes.push((node, id, placeholder));
            continue;
        }
        if doc.has_attr(node, TRANSLATION_ID_ATTR) {
            continue;
        }
        stack.extend(doc.children(node).iter().rev().copied());
    }

    nodes
}

fn read_segment(
    doc: &Document,
    node: NodeId,
    id: String,
    placeholder: Option<NodeId>,
) -> Result<Segment, DocumentError> {
    let translation = match placeholder {
        Some(p) if !doc.is_blank(p) => Some(doc.inner_markup(p)?),
        _ => None,
    };
    Ok(Segment {
        id,
        source: doc.inner_markup(node)?,
        content_hash: doc.attr(node, CONTENT_HASH_ATTR),
        translation,
        has_placeholder: placeholder.is_some(),
        retranslate: placeholder.is_some_and(|p| doc.has_attr(p, RETRANSLATE_ATTR)),
    })
}

/// All marked segments of a document, in document order.
pub fn segments(doc: &Document) -> Result<Vec<Segment>, DocumentError> {
    marked_nodes(doc)
        .into_iter()
        .map(|(node, id, placeholder)| read_segment(doc, node, id, placeholder))
        .collect()
}

/// Segments still waiting for a translation.
pub fn pending(doc: &Document) -> Result<Vec<Segment>, DocumentError> {
    Ok(segments(doc)?.into_iter().filter(Segment::is_pending).collect())
}

/// Looks up one segment by ID.
pub fn find(doc: &Document, segment_id: &str) -> Result<Segment, DocumentError> {
    marked_nodes(doc)
        .into_iter()
        .find(|(_, id, _)| id == segment_id)
        .map(|(node, id, placeholder)| read_segment(doc, node, id, placeholder))
        .unwrap_or_else(|| Err(DocumentError::SegmentNotFound(segment_id.to_string())))
}

/// Counts translated and pending placeholders.
pub fn status(doc: &Document) -> Result<SegmentStatus, DocumentError> {
    let mut status = SegmentStatus::default();
    for segment in segments(doc)? {
        status.total += 1;
        if segment.retranslate {
            status.flagged += 1;
        }
        if segment.is_pending() || !segment.has_placeholder {
            status.pending += 1;
        } else {
            status.translated += 1;
        }
    }
    Ok(status)
}

/// Fills the placeholder of `segment_id` with a translated markup fragment.
///
/// Clears the re-translation flag. Fragments that are not well-formed are
/// stored as escaped text.
pub fn write_translation(
    doc: &mut Document,
    segment_id: &str,
    markup: &str,
) -> Result<(), DocumentError> {
    let placeholder = marked_nodes(doc)
        .into_iter()
        .find(|(_, id, _)| id == segment_id)
        .and_then(|(_, _, placeholder)| placeholder)
        .ok_or_else(|| DocumentError::SegmentNotFound(segment_id.to_string()))?;

    doc.set_inner_markup(placeholder, markup.trim());
    doc.remove_attr(placeholder, RETRANSLATE_ATTR);
    Ok(())
}

/// Saves a translation for one segment straight to disk.
pub fn update_translation_file(
    path: &Path,
    segment_id: &str,
    markup: &str,
) -> Result<(), DocumentError> {
    let mut doc = Document::read(path)?;
    write_translation(&mut doc, segment_id, markup)?;
    doc.save(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::mark;
    use tempfile::TempDir;

    fn marked(markup: &str) -> Document {
        let mut doc = Document::parse(markup).unwrap();
        mark(&mut doc, "test.xhtml");
        doc
    }

    #[test]
    fn test_segments_in_document_order() {
        let doc = marked("<body><p>One <b>bold</b></p><h2>Two</h2></body>");
        let all = segments(&doc).unwrap();

        assert_eq!(all.len(), 2);
        assert_eq!(all[0].source, "One <b>bold</b>");
        assert_eq!(all[1].source, "Two");
        assert!(all.iter().all(Segment::is_pending));
        assert!(all.iter().all(|s| s.content_hash.is_some()));
    }

    #[test]
    fn test_write_translation_fills_only_its_placeholder() {
        let mut doc = marked("<body><p>One</p><p>Two</p></body>");
        let ids: Vec<String> = segments(&doc).unwrap().into_iter().map(|s| s.id).collect();

        write_translation(&mut doc, &ids[1], "Deux").unwrap();

        let first = find(&doc, &ids[0]).unwrap();
        let second = find(&doc, &ids[1]).unwrap();
        assert_eq!(first.translation, None);
        assert_eq!(second.translation.as_deref(), Some("Deux"));
        assert_eq!(pending(&doc).unwrap().len(), 1);
    }

    #[test]
    fn test_retranslate_flag_makes_segment_pending() {
        let mut doc = marked("<body><p>One</p></body>");
        let id = segments(&doc).unwrap()[0].id.clone();
        write_translation(&mut doc, &id, "Un").unwrap();
        assert!(pending(&doc).unwrap().is_empty());

        let flagged = doc
            .to_markup()
            .unwrap()
            .replace("data-translation-id", "data-retranslate=\"true\" data-translation-id");
        let mut doc = Document::parse(&flagged).unwrap();
        let segment = find(&doc, &id).unwrap();
        assert!(segment.retranslate);
        assert!(segment.is_pending());
        assert_eq!(status(&doc).unwrap().flagged, 1);

        write_translation(&mut doc, &id, "Une").unwrap();
        assert!(!find(&doc, &id).unwrap().retranslate);
    }

    #[test]
    fn test_unknown_segment() {
        let mut doc = marked("<body><p>One</p></body>");
        assert!(matches!(
            find(&doc, "nope"),
            Err(DocumentError::SegmentNotFound(_))
        ));
        assert!(matches!(
            write_translation(&mut doc, "nope", "x"),
            Err(DocumentError::SegmentNotFound(_))
        ));
    }

    #[test]
    fn test_status_counts() {
        let mut doc = marked("<body><p>One</p><p>Two</p><p>Three</p></body>");
        let id = segments(&doc).unwrap()[0].id.clone();
        write_translation(&mut doc, &id, "Un").unwrap();

        let status = status(&doc).unwrap();
        assert_eq!(status.total, 3);
        assert_eq!(status.translated, 1);
        assert_eq!(status.pending, 2);
        assert_eq!(status.flagged, 0);
    }

    #[test]
    fn test_plain_text_ampersand_keeps_file_well_formed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ch.xhtml");
        let doc = marked("<html><body><p>Tom and Jerry</p></body></html>");
        doc.save(&path).unwrap();
        let id = segments(&doc).unwrap()[0].id.clone();

        update_translation_file(&path, &id, "Tom & Jerry").unwrap();

        let saved = std::fs::read_to_string(&path).unwrap();
        assert!(saved.contains(">Tom &amp; Jerry</p>"));
        let reloaded = Document::read(&path).unwrap();
        let placeholder = reloaded.find_by_attr(TRANSLATION_ID_ATTR, &id).unwrap();
        assert_eq!(reloaded.text_content(placeholder), "Tom & Jerry");
    }

    #[test]
    fn test_update_translation_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ch.xhtml");
        let doc = marked("<html><body><p>Hello</p></body></html>");
        doc.save(&path).unwrap();
        let id = segments(&doc).unwrap()[0].id.clone();

        update_translation_file(&path, &id, "Xin chào").unwrap();

        let reloaded = Document::read(&path).unwrap();
        assert_eq!(
            find(&reloaded, &id).unwrap().translation.as_deref(),
            Some("Xin chào")
        );
    }
}
