//! Segment marker.
//!
//! Tags every translatable block of a content document with a stable
//! `data-content-id` and inserts an empty placeholder sibling carrying the
//! matching `data-translation-id`. Marking is idempotent: already-tagged
//! blocks keep their IDs, placeholders are never duplicated, and running the
//! marker on its own output changes nothing.

use crate::document::{Document, NodeId, ROOT, normalize_whitespace};
use crate::error::DocumentError;
use crate::utils::sha256_hex;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, warn};

/// Attribute holding a segment's ID on the source element.
pub const CONTENT_ID_ATTR: &str = "data-content-id";

/// Attribute holding the hash of a segment's normalized source text.
pub const CONTENT_HASH_ATTR: &str = "data-content-hash";

/// Attribute holding a segment's ID on its placeholder.
pub const TRANSLATION_ID_ATTR: &str = "data-translation-id";

/// Placeholder flag requesting a fresh translation on the next run.
pub const RETRANSLATE_ATTR: &str = "data-retranslate";

/// Block containers whose text becomes a segment.
const SEGMENT_TAGS: &[&str] = &[
    "p", "h1", "h2", "h3", "h4", "h5", "h6", "li", "blockquote", "dt", "dd", "figcaption",
    "caption", "td", "th", "div",
];

/// Subtrees never searched for segments.
const EXCLUDED_TAGS: &[&str] = &[
    "head", "script", "style", "pre", "code", "svg", "math", "noscript", "template",
];

/// Source attributes not copied onto placeholders.
const NON_INHERITED_ATTRS: &[&str] = &["id", "xml:id", CONTENT_ID_ATTR, CONTENT_HASH_ATTR];

const ID_LEN: usize = 12;
const HASH_LEN: usize = 16;

/// What a marking pass did to a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct MarkStats {
    /// Segments in the document after the pass.
    pub segments: usize,
    /// Blocks tagged for the first time.
    pub newly_marked: usize,
    /// Marked blocks whose missing placeholder was recreated.
    pub placeholders_restored: usize,
    /// Placeholders moved back next to their source block.
    pub placeholders_moved: usize,
    /// Extra placeholders removed because their ID was already paired.
    pub orphans_removed: usize,
    /// Marked blocks whose text changed since they were tagged.
    pub flagged_stale: usize,
    /// Duplicated IDs that were replaced.
    pub ids_reassigned: usize,
    /// Marked blocks that had no stored content hash yet.
    pub hashes_added: usize,
}

impl MarkStats {
    /// Whether the pass modified the document.
    pub fn changed(&self) -> bool {
        self.newly_marked > 0
            || self.placeholders_restored > 0
            || self.placeholders_moved > 0
            || self.orphans_removed > 0
            || self.flagged_stale > 0
            || self.ids_reassigned > 0
            || self.hashes_added > 0
    }
}

enum Found {
    Marked(NodeId, String),
    Fresh(NodeId, String),
}

/// Marks a parsed document in place.
///
/// `identity` names the document (usually its file name) and seeds the
/// IDs of newly tagged blocks together with their structural position.
pub fn mark(doc: &mut Document, identity: &str) -> MarkStats {
    let found = find_segments(doc);
    let mut stats = MarkStats::default();

    let existing: HashSet<String> = found
        .iter()
        .filter_map(|f| match f {
            Found::Marked(id, _) => doc.attr(*id, CONTENT_ID_ATTR),
            Found::Fresh(..) => None,
        })
        .collect();
    let mut seen: HashSet<String> = HashSet::new();
    let mut fresh = Vec::new();

    for item in found {
        match item {
            Found::Marked(node, path) => {
                let current = doc.attr(node, CONTENT_ID_ATTR).unwrap_or_default();
                let mut placeholder = placeholder_of(doc, node, &current);
                if placeholder.is_none() && !current.is_empty() {
                    if let Some(displaced) = displaced_placeholder(doc, node, &current) {
                        doc.move_after(displaced, node);
                        debug!("Moved placeholder of '{}' in {} back to its source", current, identity);
                        stats.placeholders_moved += 1;
                        placeholder = Some(displaced);
                    }
                }

                let segment_id = if current.is_empty() || !seen.insert(current.clone()) {
                    let replacement = unique_id(identity, &path, &existing, &mut seen);
                    warn!(
                        "Duplicate segment ID '{}' in {}, reassigned to '{}'",
                        current, identity, replacement
                    );
                    doc.set_attr(node, CONTENT_ID_ATTR, &replacement);
                    if let Some(placeholder) = placeholder {
                        doc.set_attr(placeholder, TRANSLATION_ID_ATTR, &replacement);
                    }
                    stats.ids_reassigned += 1;
                    replacement
                } else {
                    current
                };

                let hash = content_hash(doc, node);
                match doc.attr(node, CONTENT_HASH_ATTR) {
                    Some(stored) if stored == hash => {}
                    Some(_) => {
                        doc.set_attr(node, CONTENT_HASH_ATTR, &hash);
                        if let Some(placeholder) = placeholder {
                            doc.set_attr(placeholder, RETRANSLATE_ATTR, "true");
                        }
                        debug!("Segment '{}' in {} changed since marking", segment_id, identity);
                        stats.flagged_stale += 1;
                    }
                    None => {
                        doc.set_attr(node, CONTENT_HASH_ATTR, &hash);
                        stats.hashes_added += 1;
                    }
                }

                if placeholder.is_none() {
                    insert_placeholder(doc, node, &segment_id);
                    stats.placeholders_restored += 1;
                }
                stats.segments += 1;
            }
            Found::Fresh(node, path) => fresh.push((node, path)),
        }
    }

    for (node, path) in fresh {
        let segment_id = unique_id(identity, &path, &existing, &mut seen);
        let hash = content_hash(doc, node);
        doc.set_attr(node, CONTENT_ID_ATTR, &segment_id);
        doc.set_attr(node, CONTENT_HASH_ATTR, &hash);
        insert_placeholder(doc, node, &segment_id);
        stats.newly_marked += 1;
        stats.segments += 1;
    }

    stats.orphans_removed = remove_orphaned_placeholders(doc, identity);
    stats
}

/// Marks a document on disk.
///
/// The file is only rewritten when the pass changed something. A document
/// that fails to parse is reported and left untouched.
pub fn mark_file(path: &Path) -> Result<MarkStats, DocumentError> {
    let mut doc = Document::read(path)?;
    let stats = mark(&mut doc, &document_identity(path));
    if stats.changed() {
        doc.save(path)?;
    }
    Ok(stats)
}

/// Identity used to seed segment IDs for a document path.
pub fn document_identity(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Hash of the normalized text of a segment.
pub fn content_hash(doc: &Document, node: NodeId) -> String {
    let text = doc.text_content(node);
    let mut hash = sha256_hex(&normalize_whitespace(&text));
    hash.truncate(HASH_LEN);
    hash
}

/// The placeholder paired with a marked source element, if present.
pub fn placeholder_of(doc: &Document, source: NodeId, segment_id: &str) -> Option<NodeId> {
    doc.next_element_sibling(source)
        .filter(|&sibling| doc.attr(sibling, TRANSLATION_ID_ATTR).as_deref() == Some(segment_id))
}

/// A placeholder for `segment_id` that drifted further down the same
/// parent, e.g. after a block was inserted between it and its source.
///
/// The search stops at the next source element carrying the same ID.
fn displaced_placeholder(doc: &Document, source: NodeId, segment_id: &str) -> Option<NodeId> {
    for sibling in doc.following_element_siblings(source) {
        if doc.attr(sibling, CONTENT_ID_ATTR).as_deref() == Some(segment_id) {
            return None;
        }
        if doc.attr(sibling, TRANSLATION_ID_ATTR).as_deref() == Some(segment_id) {
            return Some(sibling);
        }
    }
    None
}

/// Drops placeholders that are not paired with a source while another
/// placeholder with the same ID is. Returns how many were removed.
fn remove_orphaned_placeholders(doc: &mut Document, identity: &str) -> usize {
    let mut paired_nodes = HashSet::new();
    let mut paired_ids = HashSet::new();
    let mut placeholders = Vec::new();

    for node in doc.descendants(ROOT) {
        if let Some(id) = doc.attr(node, CONTENT_ID_ATTR) {
            if let Some(placeholder) = placeholder_of(doc, node, &id) {
                paired_nodes.insert(placeholder);
                paired_ids.insert(id);
            }
        } else if let Some(id) = doc.attr(node, TRANSLATION_ID_ATTR) {
            placeholders.push((node, id));
        }
    }

    let mut removed = 0;
    for (node, id) in placeholders {
        if !paired_nodes.contains(&node) && paired_ids.contains(&id) {
            warn!("Removing duplicate placeholder for '{}' in {}", id, identity);
            doc.detach(node);
            removed += 1;
        }
    }
    removed
}

/// Walks the tree in document order and returns marked and unmarked
/// segments with their structural paths.
fn find_segments(doc: &Document) -> Vec<Found> {
    let mut found = Vec::new();
    let mut stack: Vec<(NodeId, String)> = vec![(ROOT, String::new())];

    while let Some((node, path)) = stack.pop() {
        if node != ROOT {
            let name = doc.element_name(node).unwrap_or_default();
            if doc.has_attr(node, TRANSLATION_ID_ATTR) || EXCLUDED_TAGS.contains(&name.as_str()) {
                continue;
            }
            if doc.has_attr(node, CONTENT_ID_ATTR) {
                found.push(Found::Marked(node, path));
                continue;
            }
            if is_segment(doc, node, &name) {
                found.push(Found::Fresh(node, path));
                continue;
            }
        }

        let mut index = 0;
        let mut frames = Vec::new();
        for &child in doc.children(node) {
            if !doc.is_element(child) || doc.has_attr(child, TRANSLATION_ID_ATTR) {
                continue;
            }
            frames.push((child, format!("{}/{}", path, index)));
            index += 1;
        }
        stack.extend(frames.into_iter().rev());
    }

    found
}

fn is_segment(doc: &Document, node: NodeId, name: &str) -> bool {
    if !SEGMENT_TAGS.contains(&name) {
        return false;
    }
    if !doc.text_content(node).chars().any(char::is_alphabetic) {
        return false;
    }
    !doc.descendants(node).into_iter().any(|d| {
        doc.element_name(d)
            .is_some_and(|child| SEGMENT_TAGS.contains(&child.as_str()))
    })
}

fn unique_id(
    identity: &str,
    path: &str,
    existing: &HashSet<String>,
    seen: &mut HashSet<String>,
) -> String {
    let mut base = sha256_hex(&format!("{}:{}", identity, path));
    base.truncate(ID_LEN);

    let mut candidate = base.clone();
    let mut suffix = 2;
    while existing.contains(&candidate) || seen.contains(&candidate) {
        candidate = format!("{}-{}", base, suffix);
        suffix += 1;
    }
    seen.insert(candidate.clone());
    candidate
}

fn insert_placeholder(doc: &mut Document, source: NodeId, segment_id: &str) -> NodeId {
    let tag = doc.element_name(source).unwrap_or_else(|| "p".to_string());
    let mut attrs: Vec<(String, String)> = doc
        .attrs(source)
        .into_iter()
        .filter(|(key, _)| !NON_INHERITED_ATTRS.contains(&key.as_str()))
        .collect();
    attrs.push((TRANSLATION_ID_ATTR.to_string(), segment_id.to_string()));
    doc.insert_element_after(source, &tag, &attrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CHAPTER: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml">
<head><title>Chapter One</title></head>
<body>
<h1 id="c1">Chapter One</h1>
<p class="body">It was a bright cold day.</p>
<p>   </p>
<p>1984</p>
<pre>code stays</pre>
<div><p>Nested paragraph.</p><ul><li>First item</li><li>Second <em>item</em></li></ul></div>
<script>var a = "not text";</script>
</body>
</html>
"#;

    fn marked_ids(doc: &Document) -> Vec<String> {
        doc.descendants(ROOT)
            .into_iter()
            .filter_map(|id| doc.attr(id, CONTENT_ID_ATTR))
            .collect()
    }

    fn placeholder_ids(doc: &Document) -> Vec<String> {
        doc.descendants(ROOT)
            .into_iter()
            .filter_map(|id| doc.attr(id, TRANSLATION_ID_ATTR))
            .collect()
    }

    #[test]
    fn test_marks_translatable_blocks_only() {
        let mut doc = Document::parse(CHAPTER).unwrap();
        let stats = mark(&mut doc, "ch1.xhtml");

        assert_eq!(stats.newly_marked, 5);
        assert_eq!(stats.segments, 5);
        assert_eq!(marked_ids(&doc), placeholder_ids(&doc));

        let output = doc.to_markup().unwrap();
        assert!(output.contains("<title>Chapter One</title>"));
        assert!(output.contains("<pre>code stays</pre>"));
        assert!(output.contains("<p>1984</p>"));
        assert!(output.contains("<p>   </p>"));
    }

    #[test]
    fn test_placeholder_follows_source() {
        let mut doc = Document::parse(CHAPTER).unwrap();
        mark(&mut doc, "ch1.xhtml");

        let heading = doc.find_by_attr("id", "c1").unwrap();
        let segment_id = doc.attr(heading, CONTENT_ID_ATTR).unwrap();
        let placeholder = placeholder_of(&doc, heading, &segment_id).unwrap();

        assert_eq!(doc.element_name(placeholder).as_deref(), Some("h1"));
        assert!(doc.is_blank(placeholder));
        assert!(!doc.has_attr(placeholder, "id"));
        assert!(!doc.has_attr(placeholder, CONTENT_HASH_ATTR));

        let body_p = doc.find_by_attr("class", "body").unwrap();
        let body_id = doc.attr(body_p, CONTENT_ID_ATTR).unwrap();
        let body_placeholder = placeholder_of(&doc, body_p, &body_id).unwrap();
        assert_eq!(doc.attr(body_placeholder, "class").as_deref(), Some("body"));
    }

    #[test]
    fn test_marking_is_idempotent() {
        let mut doc = Document::parse(CHAPTER).unwrap();
        mark(&mut doc, "ch1.xhtml");
        let once = doc.to_markup().unwrap();

        let stats = mark(&mut doc, "ch1.xhtml");
        assert!(!stats.changed());
        assert_eq!(stats.segments, 5);
        assert_eq!(doc.to_markup().unwrap(), once);

        let mut reparsed = Document::parse(&once).unwrap();
        mark(&mut reparsed, "ch1.xhtml");
        assert_eq!(reparsed.to_markup().unwrap(), once);
    }

    #[test]
    fn test_ids_are_deterministic_and_unique() {
        let mut first = Document::parse(CHAPTER).unwrap();
        let mut second = Document::parse(CHAPTER).unwrap();
        mark(&mut first, "ch1.xhtml");
        mark(&mut second, "ch1.xhtml");
        assert_eq!(marked_ids(&first), marked_ids(&second));

        let ids = marked_ids(&first);
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());

        let mut other = Document::parse(CHAPTER).unwrap();
        mark(&mut other, "ch2.xhtml");
        assert_ne!(marked_ids(&other), ids);
    }

    #[test]
    fn test_new_paragraph_gets_fresh_id_and_keeps_old_ones() {
        let mut doc = Document::parse("<body><p>Alpha</p></body>").unwrap();
        mark(&mut doc, "a.xhtml");
        let before = marked_ids(&doc);

        let edited = doc
            .to_markup()
            .unwrap()
            .replace("<body>", "<body><p>Inserted before</p>");
        let mut doc = Document::parse(&edited).unwrap();
        let stats = mark(&mut doc, "a.xhtml");

        assert_eq!(stats.newly_marked, 1);
        let after = marked_ids(&doc);
        assert_eq!(after.len(), 2);
        assert_eq!(after[1], before[0]);
        assert_ne!(after[0], before[0]);
    }

    #[test]
    fn test_missing_placeholder_is_restored() {
        let input = r#"<body><p data-content-id="x1" data-content-hash="0">Hello</p></body>"#;
        let mut doc = Document::parse(input).unwrap();
        let stats = mark(&mut doc, "a.xhtml");

        assert_eq!(stats.placeholders_restored, 1);
        assert_eq!(stats.newly_marked, 0);
        assert_eq!(placeholder_ids(&doc), vec!["x1".to_string()]);
    }

    #[test]
    fn test_changed_source_flags_placeholder() {
        let mut doc = Document::parse("<body><p>Original text</p></body>").unwrap();
        mark(&mut doc, "a.xhtml");
        let edited = doc.to_markup().unwrap().replace("Original text", "Edited text");

        let mut doc = Document::parse(&edited).unwrap();
        let stats = mark(&mut doc, "a.xhtml");
        assert_eq!(stats.flagged_stale, 1);

        let placeholder = doc
            .descendants(ROOT)
            .into_iter()
            .find(|&id| doc.has_attr(id, TRANSLATION_ID_ATTR))
            .unwrap();
        assert_eq!(doc.attr(placeholder, RETRANSLATE_ATTR).as_deref(), Some("true"));
    }

    #[test]
    fn test_duplicate_ids_are_reassigned() {
        let input = concat!(
            r#"<body><p data-content-id="dup">One</p><p data-translation-id="dup"></p>"#,
            r#"<p data-content-id="dup">Two</p><p data-translation-id="dup"></p></body>"#
        );
        let mut doc = Document::parse(input).unwrap();
        let stats = mark(&mut doc, "a.xhtml");

        assert_eq!(stats.ids_reassigned, 1);
        let ids = marked_ids(&doc);
        assert_eq!(ids[0], "dup");
        assert_ne!(ids[1], "dup");
        assert_eq!(ids, placeholder_ids(&doc));
    }

    #[test]
    fn test_displaced_placeholder_is_moved_back() {
        let mut doc = Document::parse("<body><p>Alpha</p></body>").unwrap();
        mark(&mut doc, "a.xhtml");
        let alpha = marked_ids(&doc)[0].clone();
        let translated = doc.to_markup().unwrap().replace(
            &format!(r#"data-translation-id="{alpha}"></p>"#),
            &format!(r#"data-translation-id="{alpha}">Alfa</p>"#),
        );
        let edited = translated.replacen("</p>", "</p><p>Inserted</p>", 1);

        let mut doc = Document::parse(&edited).unwrap();
        let stats = mark(&mut doc, "a.xhtml");

        assert_eq!(stats.placeholders_moved, 1);
        assert_eq!(stats.placeholders_restored, 0);
        assert_eq!(stats.newly_marked, 1);
        let ids = marked_ids(&doc);
        assert_eq!(ids[0], alpha);
        assert_eq!(placeholder_ids(&doc), ids);

        let source = doc.find_by_attr(CONTENT_ID_ATTR, &alpha).unwrap();
        let placeholder = placeholder_of(&doc, source, &alpha).unwrap();
        assert_eq!(doc.text_content(placeholder), "Alfa");

        let once = doc.to_markup().unwrap();
        assert!(!mark(&mut doc, "a.xhtml").changed());
        assert_eq!(doc.to_markup().unwrap(), once);
    }

    #[test]
    fn test_duplicate_placeholder_is_removed() {
        let input = concat!(
            r#"<body><p data-content-id="x1" data-content-hash="0">Hello</p>"#,
            r#"<p data-translation-id="x1">Hola</p><p data-translation-id="x1">Stale</p></body>"#
        );
        let mut doc = Document::parse(input).unwrap();
        let stats = mark(&mut doc, "a.xhtml");

        assert_eq!(stats.orphans_removed, 1);
        assert_eq!(placeholder_ids(&doc), vec!["x1".to_string()]);
        assert!(!doc.to_markup().unwrap().contains("Stale"));
    }

    #[test]
    fn test_entity_only_paragraph_is_not_a_segment() {
        let mut doc = Document::parse("<body><p>&nbsp;</p><p>Real text</p></body>").unwrap();
        let stats = mark(&mut doc, "a.xhtml");

        assert_eq!(stats.segments, 1);
        let output = doc.to_markup().unwrap();
        assert!(output.starts_with("<body><p>&nbsp;</p><p data-content-id="));
    }

    #[test]
    fn test_html_entities_do_not_change_hash() {
        let plain = Document::parse("<p>caf\u{e9} au lait</p>").unwrap();
        let entity = Document::parse("<p>caf&eacute;&nbsp;au lait</p>").unwrap();
        let p = |doc: &Document| doc.descendants(ROOT)[0];
        assert_eq!(content_hash(&plain, p(&plain)), content_hash(&entity, p(&entity)));
    }

    #[test]
    fn test_mark_file_leaves_malformed_file_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.xhtml");
        let broken = "<html><body><p>Unclosed</body></html>";
        std::fs::write(&path, broken).unwrap();

        assert!(matches!(mark_file(&path), Err(DocumentError::Parse(_))));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), broken);
    }

    #[test]
    fn test_mark_file_writes_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ch.xhtml");
        std::fs::write(&path, "<html><body><p>Hello</p></body></html>").unwrap();

        let first = mark_file(&path).unwrap();
        assert_eq!(first.newly_marked, 1);
        let after_first = std::fs::read_to_string(&path).unwrap();

        let second = mark_file(&path).unwrap();
        assert!(!second.changed());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), after_first);
    }
}
