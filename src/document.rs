//! In-memory tree for XHTML content documents.
//!
//! Documents are parsed with `quick-xml` into an arena of nodes. Nodes keep
//! the events they were read from, so anything that is not touched by the
//! marker or the orchestrator is written back exactly as it was read.
//! Traversal and serialization use explicit stacks; deeply nested markup
//! never recurses.

use crate::error::DocumentError;
use crate::utils::write_atomic;
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::escape::{resolve_html5_entity, resolve_xml_entity, unescape_with};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use std::borrow::Cow;
use std::path::Path;

/// Index of a node inside a [`Document`].
pub type NodeId = usize;

/// The synthetic root every top-level node hangs from.
pub const ROOT: NodeId = 0;

const BOM: char = '\u{feff}';

#[derive(Debug, Clone)]
enum NodeData {
    Root,
    Element {
        start: BytesStart<'static>,
        /// Read as `<tag/>`; written back that way while it has no children.
        empty: bool,
    },
    Text(BytesText<'static>),
    /// Comments, declarations, doctype, CDATA and processing instructions.
    Other(Event<'static>),
}

#[derive(Debug, Clone)]
struct Node {
    data: NodeData,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// A parsed content document.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
    bom: bool,
}

enum Step {
    Enter(NodeId),
    Leave(NodeId),
}

impl Document {
    fn empty() -> Self {
        Self {
            nodes: vec![Node {
                data: NodeData::Root,
                parent: None,
                children: Vec::new(),
            }],
            bom: false,
        }
    }

    /// Parses markup into a tree.
    ///
    /// Fails on empty input, mismatched or unclosed tags, and any other
    /// markup `quick-xml` cannot read.
    pub fn parse(markup: &str) -> Result<Self, DocumentError> {
        let mut doc = Self::empty();
        let body = match markup.strip_prefix(BOM) {
            Some(rest) => {
                doc.bom = true;
                rest
            }
            None => markup,
        };
        if body.trim().is_empty() {
            return Err(DocumentError::Parse("document is empty".to_string()));
        }
        doc.parse_into(ROOT, body)?;
        Ok(doc)
    }

    /// Reads and parses a document from disk.
    pub fn read(path: &Path) -> Result<Self, DocumentError> {
        let bytes = std::fs::read(path)?;
        let markup = String::from_utf8(bytes)
            .map_err(|e| DocumentError::Parse(format!("not valid UTF-8: {}", e)))?;
        Self::parse(&markup)
    }

    /// Serializes and atomically replaces the file at `path`.
    pub fn save(&self, path: &Path) -> Result<(), DocumentError> {
        let markup = self.to_markup()?;
        write_atomic(path, markup.as_bytes())?;
        Ok(())
    }

    fn parse_into(&mut self, parent: NodeId, markup: &str) -> Result<(), DocumentError> {
        let mut reader = Reader::from_str(markup);
        let mut open: Vec<NodeId> = vec![parent];

        loop {
            let current = open.last().copied().unwrap_or(parent);
            match reader.read_event() {
                Ok(Event::Start(start)) => {
                    let id = self.append(
                        current,
                        NodeData::Element {
                            start: start.into_owned(),
                            empty: false,
                        },
                    );
                    open.push(id);
                }
                Ok(Event::End(end)) => {
                    if open.len() <= 1 {
                        return Err(DocumentError::Parse(format!(
                            "unexpected closing tag </{}>",
                            String::from_utf8_lossy(end.name().as_ref())
                        )));
                    }
                    open.pop();
                }
                Ok(Event::Empty(start)) => {
                    self.append(
                        current,
                        NodeData::Element {
                            start: start.into_owned(),
                            empty: true,
                        },
                    );
                }
                Ok(Event::Text(text)) => {
                    self.append(current, NodeData::Text(text.into_owned()));
                }
                Ok(Event::Eof) => break,
                Ok(other) => {
                    self.append(current, NodeData::Other(other.into_owned()));
                }
                Err(e) => {
                    return Err(DocumentError::Parse(format!(
                        "at byte {}: {}",
                        reader.buffer_position(),
                        e
                    )));
                }
            }
        }

        if open.len() > 1 {
            let unclosed = open
                .last()
                .and_then(|&id| self.element_name(id))
                .unwrap_or_default();
            return Err(DocumentError::Parse(format!(
                "unclosed element <{}>",
                unclosed
            )));
        }

        Ok(())
    }

    fn append(&mut self, parent: NodeId, data: NodeData) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            data,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent].children.push(id);
        id
    }

    /// Serializes the whole document.
    pub fn to_markup(&self) -> Result<String, DocumentError> {
        let body = self.write_nodes(&self.nodes[ROOT].children)?;
        if self.bom {
            Ok(format!("{}{}", BOM, body))
        } else {
            Ok(body)
        }
    }

    /// Serializes the children of `id`, the element's inner markup.
    pub fn inner_markup(&self, id: NodeId) -> Result<String, DocumentError> {
        self.write_nodes(&self.nodes[id].children)
    }

    fn write_nodes(&self, roots: &[NodeId]) -> Result<String, DocumentError> {
        let mut writer = Writer::new(Vec::new());
        let mut stack: Vec<Step> = roots.iter().rev().map(|&id| Step::Enter(id)).collect();

        while let Some(step) = stack.pop() {
            let event = match step {
                Step::Enter(id) => {
                    let node = &self.nodes[id];
                    match &node.data {
                        NodeData::Root => continue,
                        NodeData::Element { start, empty } => {
                            if *empty && node.children.is_empty() {
                                Event::Empty(start.clone())
                            } else {
                                stack.push(Step::Leave(id));
                                stack.extend(node.children.iter().rev().map(|&c| Step::Enter(c)));
                                Event::Start(start.clone())
                            }
                        }
                        NodeData::Text(text) => Event::Text(text.clone()),
                        NodeData::Other(event) => event.clone(),
                    }
                }
                Step::Leave(id) => match &self.nodes[id].data {
                    NodeData::Element { start, .. } => Event::End(BytesEnd::new(
                        String::from_utf8_lossy(start.name().as_ref()).into_owned(),
                    )),
                    _ => continue,
                },
            };
            writer
                .write_event(event)
                .map_err(|e| DocumentError::Serialize(e.to_string()))?;
        }

        String::from_utf8(writer.into_inner())
            .map_err(|e| DocumentError::Serialize(e.to_string()))
    }

    /// Children of a node, in document order.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn is_element(&self, id: NodeId) -> bool {
        matches!(self.nodes[id].data, NodeData::Element { .. })
    }

    /// Lower-cased local name of an element (namespace prefix dropped).
    pub fn element_name(&self, id: NodeId) -> Option<String> {
        match &self.nodes[id].data {
            NodeData::Element { start, .. } => Some(
                String::from_utf8_lossy(start.local_name().as_ref()).to_ascii_lowercase(),
            ),
            _ => None,
        }
    }

    /// Unescaped value of an attribute.
    pub fn attr(&self, id: NodeId, name: &str) -> Option<String> {
        let NodeData::Element { start, .. } = &self.nodes[id].data else {
            return None;
        };
        start
            .attributes()
            .with_checks(false)
            .flatten()
            .find(|a| a.key.as_ref() == name.as_bytes())
            .map(|a| match a.unescape_value() {
                Ok(value) => value.into_owned(),
                Err(_) => String::from_utf8_lossy(&a.value).into_owned(),
            })
    }

    pub fn has_attr(&self, id: NodeId, name: &str) -> bool {
        self.attr(id, name).is_some()
    }

    /// Sets an attribute, replacing an existing value in place.
    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) {
        self.rebuild_attrs(id, name, Some(value));
    }

    pub fn remove_attr(&mut self, id: NodeId, name: &str) {
        if self.has_attr(id, name) {
            self.rebuild_attrs(id, name, None);
        }
    }

    fn rebuild_attrs(&mut self, id: NodeId, name: &str, value: Option<&str>) {
        let NodeData::Element { start, .. } = &mut self.nodes[id].data else {
            return;
        };

        let tag = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut rebuilt = BytesStart::new(tag);
        let mut written = false;
        for attribute in start.attributes().with_checks(false).flatten() {
            if attribute.key.as_ref() == name.as_bytes() {
                if let (Some(value), false) = (value, written) {
                    rebuilt.push_attribute((name, value));
                    written = true;
                }
            } else {
                rebuilt.push_attribute(attribute);
            }
        }
        if let (Some(value), false) = (value, written) {
            rebuilt.push_attribute((name, value));
        }
        *start = rebuilt;
    }

    /// Attributes of an element as (name, unescaped value) pairs.
    pub fn attrs(&self, id: NodeId) -> Vec<(String, String)> {
        let NodeData::Element { start, .. } = &self.nodes[id].data else {
            return Vec::new();
        };
        start
            .attributes()
            .with_checks(false)
            .flatten()
            .map(|a| {
                let key = String::from_utf8_lossy(a.key.as_ref()).into_owned();
                let value = match a.unescape_value() {
                    Ok(value) => value.into_owned(),
                    Err(_) => String::from_utf8_lossy(&a.value).into_owned(),
                };
                (key, value)
            })
            .collect()
    }

    /// Inserts a new empty element right after `sibling`, under the same parent.
    pub fn insert_element_after(
        &mut self,
        sibling: NodeId,
        tag: &str,
        attrs: &[(String, String)],
    ) -> NodeId {
        let mut start = BytesStart::new(tag.to_string());
        for (key, value) in attrs {
            start.push_attribute((key.as_str(), value.as_str()));
        }

        let id = self.nodes.len();
        self.nodes.push(Node {
            data: NodeData::Element {
                start,
                empty: false,
            },
            parent: None,
            children: Vec::new(),
        });
        self.place_after(id, sibling);
        id
    }

    /// Next element sibling, skipping whitespace-only text and comments.
    pub fn next_element_sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.nodes[id].parent?;
        let siblings = &self.nodes[parent].children;
        let position = siblings.iter().position(|&c| c == id)?;

        for &candidate in &siblings[position + 1..] {
            match &self.nodes[candidate].data {
                NodeData::Element { .. } => return Some(candidate),
                NodeData::Text(text) if text.iter().all(|b| b.is_ascii_whitespace()) => continue,
                NodeData::Other(Event::Comment(_)) => continue,
                _ => return None,
            }
        }
        None
    }

    /// All nodes below `id` in pre-order, `id` excluded.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack: Vec<NodeId> = self.nodes[id].children.iter().rev().copied().collect();
        while let Some(current) = stack.pop() {
            order.push(current);
            stack.extend(self.nodes[current].children.iter().rev().copied());
        }
        order
    }

    /// Concatenated unescaped text below `id`.
    ///
    /// HTML named entities such as `&nbsp;` resolve to their characters.
    pub fn text_content(&self, id: NodeId) -> String {
        let mut text = String::new();
        for node in self.descendants(id) {
            match &self.nodes[node].data {
                NodeData::Text(t) => match t.unescape_with(resolve_html5_entity) {
                    Ok(value) => text.push_str(&value),
                    Err(_) => text.push_str(&String::from_utf8_lossy(t)),
                },
                NodeData::Other(Event::CData(data)) => {
                    text.push_str(&String::from_utf8_lossy(data));
                }
                _ => {}
            }
        }
        text
    }

    /// Whether an element has no text (after trimming) and no child elements.
    pub fn is_blank(&self, id: NodeId) -> bool {
        self.nodes[id]
            .children
            .iter()
            .all(|&c| match &self.nodes[c].data {
                NodeData::Text(t) => t.iter().all(|b| b.is_ascii_whitespace()),
                NodeData::Other(Event::Comment(_)) => true,
                _ => false,
            })
    }

    /// Replaces the children of `id` with a parsed markup fragment.
    ///
    /// Text with stray `&` or HTML-only entities is re-escaped so the
    /// output stays well-formed XML. A fragment that does not parse, or has
    /// broken attributes, is inserted as escaped text instead.
    pub fn set_inner_markup(&mut self, id: NodeId, markup: &str) {
        let mut fragment = Self::empty();
        let parsed = fragment
            .parse_into(ROOT, markup)
            .and_then(|()| fragment.repair_fragment());
        match parsed {
            Ok(()) => {
                self.detach_children(id);
                self.graft(&fragment, id);
            }
            Err(e) => {
                tracing::debug!("Fragment is not well-formed ({}), storing as text", e);
                self.set_inner_text(id, markup);
            }
        }
    }

    /// Makes every text node of a parsed fragment valid XML text and checks
    /// its attributes.
    fn repair_fragment(&mut self) -> Result<(), DocumentError> {
        for node in &mut self.nodes {
            match &mut node.data {
                NodeData::Element { start, .. } => {
                    for attribute in start.attributes() {
                        let attribute = attribute
                            .map_err(|e| DocumentError::Parse(format!("attribute: {}", e)))?;
                        attribute
                            .unescape_value_with(resolve_xml_entity)
                            .map_err(|e| DocumentError::Parse(format!("attribute value: {}", e)))?;
                    }
                }
                NodeData::Text(text) if text.unescape_with(resolve_xml_entity).is_err() => {
                    let raw = String::from_utf8_lossy(&**text).into_owned();
                    let value = match unescape_with(&raw, resolve_html5_entity) {
                        Ok(value) => value.into_owned(),
                        Err(_) => raw.clone(),
                    };
                    *text = BytesText::new(&value).into_owned();
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Replaces the children of `id` with a single text node.
    pub fn set_inner_text(&mut self, id: NodeId, text: &str) {
        self.detach_children(id);
        if !text.is_empty() {
            let escaped = BytesText::new(text).into_owned();
            self.append(id, NodeData::Text(escaped));
        }
    }

    /// Unlinks a node from its parent. The node stays in the arena but is
    /// no longer reachable from the root.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id].parent.take() {
            self.nodes[parent].children.retain(|&c| c != id);
        }
    }

    /// Moves `id` so that it directly follows `anchor`.
    pub fn move_after(&mut self, id: NodeId, anchor: NodeId) {
        self.detach(id);
        self.place_after(id, anchor);
    }

    fn place_after(&mut self, id: NodeId, anchor: NodeId) {
        let parent = self.nodes[anchor].parent.unwrap_or(ROOT);
        self.nodes[id].parent = Some(parent);
        let siblings = &mut self.nodes[parent].children;
        let position = siblings
            .iter()
            .position(|&c| c == anchor)
            .map(|p| p + 1)
            .unwrap_or(siblings.len());
        siblings.insert(position, id);
    }

    /// Element siblings following `id`, in document order.
    pub fn following_element_siblings(&self, id: NodeId) -> Vec<NodeId> {
        let Some(parent) = self.nodes[id].parent else {
            return Vec::new();
        };
        let siblings = &self.nodes[parent].children;
        let Some(position) = siblings.iter().position(|&c| c == id) else {
            return Vec::new();
        };
        siblings[position + 1..]
            .iter()
            .copied()
            .filter(|&c| self.is_element(c))
            .collect()
    }

    fn detach_children(&mut self, id: NodeId) {
        let children = std::mem::take(&mut self.nodes[id].children);
        for child in children {
            self.nodes[child].parent = None;
        }
    }

    fn graft(&mut self, fragment: &Document, parent: NodeId) {
        let mut stack: Vec<(NodeId, NodeId)> = fragment.nodes[ROOT]
            .children
            .iter()
            .rev()
            .map(|&c| (c, parent))
            .collect();

        while let Some((source, target_parent)) = stack.pop() {
            let copied = self.append(target_parent, fragment.nodes[source].data.clone());
            stack.extend(
                fragment.nodes[source]
                    .children
                    .iter()
                    .rev()
                    .map(|&c| (c, copied)),
            );
        }
    }

    /// First element in document order carrying `name="value"`.
    pub fn find_by_attr(&self, name: &str, value: &str) -> Option<NodeId> {
        self.descendants(ROOT)
            .into_iter()
            .find(|&id| self.is_element(id) && self.attr(id, name).as_deref() == Some(value))
    }
}

/// Collapses runs of whitespace and trims, for hashing and emptiness checks.
pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
    let collapsed: Vec<&str> = text.split_whitespace().collect();
    if collapsed.len() == 1 && collapsed[0] == text {
        Cow::Borrowed(text)
    } else {
        Cow::Owned(collapsed.join(" "))
    }
}
