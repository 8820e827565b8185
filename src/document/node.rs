//! CM-001: Node arena for span-retaining YAML documents.
//!
//! Every node records the byte range it was read from, so callers can
//! patch the original text instead of re-serializing it.

use indexmap::IndexMap;
use std::fmt;

/// Index of a node inside a [`Document`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Half-open byte range `[start, end)` into the document source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarStyle {
    Plain,
    SingleQuoted,
    DoubleQuoted,
    Literal,
    Folded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionStyle {
    Block,
    Flow,
}

/// One `key: value` pair of a mapping.
#[derive(Debug, Clone)]
pub struct Entry {
    pub key: NodeId,
    pub value: NodeId,
    /// Whole-entry text: from the line's indentation (or the key itself when
    /// the key shares its line with a `- ` indicator) through the line break
    /// that ends the value's last line.
    pub line: Span,
    /// True when the key sits on the same line as a sequence `- ` indicator.
    pub leads_item: bool,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Scalar {
        value: String,
        style: ScalarStyle,
    },
    Sequence {
        items: Vec<NodeId>,
        style: CollectionStyle,
    },
    Mapping {
        entries: Vec<Entry>,
        style: CollectionStyle,
    },
    Alias {
        name: String,
        target: NodeId,
    },
    /// A sequence item that failed to parse; the reader resumed after it.
    Invalid {
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    /// Content span, excluding any anchor or tag properties.
    pub span: Span,
    pub anchor: Option<String>,
    /// Zero-based column of the node's first character.
    pub column: usize,
}

/// A YAML syntax problem with a 1-based position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub offset: usize,
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}: {}", self.line, self.column, self.message)
    }
}

/// Result of a merge-aware key lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    /// Mapping that physically holds the entry.
    pub owner: NodeId,
    /// Entry index inside `owner`.
    pub index: usize,
    pub value: NodeId,
    /// Mappings reached through `<<` merge keys, outermost first. Empty when
    /// the entry is the mapping's own.
    pub merged_through: Vec<NodeId>,
}

impl Lookup {
    pub fn is_own(&self) -> bool {
        self.merged_through.is_empty()
    }
}

const MERGE_KEY: &str = "<<";
const MAX_ALIAS_DEPTH: usize = 64;

/// A parsed YAML document: source text plus a node arena.
#[derive(Debug, Clone)]
pub struct Document {
    pub(crate) source: String,
    pub(crate) nodes: Vec<Node>,
    pub(crate) root: Option<NodeId>,
    pub(crate) anchors: IndexMap<String, NodeId>,
    pub(crate) errors: Vec<SyntaxError>,
}

impl Document {
    /// Parse `source`. Errors inside individual block-sequence items are
    /// recovered and listed in [`Document::errors`]; anything else fails the
    /// whole document.
    pub fn parse(source: &str) -> Result<Document, SyntaxError> {
        super::parser::parse(source)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn errors(&self) -> &[SyntaxError] {
        &self.errors
    }

    pub fn anchor(&self, name: &str) -> Option<NodeId> {
        self.anchors.get(name).copied()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn slice(&self, span: Span) -> &str {
        &self.source[span.start..span.end]
    }

    /// Follow aliases to the node they name.
    pub fn resolve(&self, id: NodeId) -> NodeId {
        let mut current = id;
        for _ in 0..MAX_ALIAS_DEPTH {
            match &self.node(current).kind {
                NodeKind::Alias { target, .. } => current = *target,
                _ => return current,
            }
        }
        current
    }

    pub fn is_mapping(&self, id: NodeId) -> bool {
        matches!(self.node(self.resolve(id)).kind, NodeKind::Mapping { .. })
    }

    pub fn is_sequence(&self, id: NodeId) -> bool {
        matches!(self.node(self.resolve(id)).kind, NodeKind::Sequence { .. })
    }

    pub fn is_invalid(&self, id: NodeId) -> bool {
        matches!(self.node(id).kind, NodeKind::Invalid { .. })
    }

    pub fn mapping_style(&self, id: NodeId) -> Option<CollectionStyle> {
        match &self.node(self.resolve(id)).kind {
            NodeKind::Mapping { style, .. } => Some(*style),
            _ => None,
        }
    }

    pub fn sequence_style(&self, id: NodeId) -> Option<CollectionStyle> {
        match &self.node(self.resolve(id)).kind {
            NodeKind::Sequence { style, .. } => Some(*style),
            _ => None,
        }
    }

    /// Entries of a mapping (aliases resolved). Empty for non-mappings.
    pub fn entries(&self, id: NodeId) -> &[Entry] {
        match &self.node(self.resolve(id)).kind {
            NodeKind::Mapping { entries, .. } => entries,
            _ => &[],
        }
    }

    /// Items of a sequence (aliases resolved). Empty for non-sequences.
    pub fn items(&self, id: NodeId) -> &[NodeId] {
        match &self.node(self.resolve(id)).kind {
            NodeKind::Sequence { items, .. } => items,
            _ => &[],
        }
    }

    /// Text of a non-null scalar, aliases resolved.
    pub fn scalar(&self, id: NodeId) -> Option<&str> {
        let id = self.resolve(id);
        if self.is_null(id) {
            return None;
        }
        match &self.node(id).kind {
            NodeKind::Scalar { value, .. } => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn is_null(&self, id: NodeId) -> bool {
        match &self.node(self.resolve(id)).kind {
            NodeKind::Scalar {
                value,
                style: ScalarStyle::Plain,
            } => matches!(value.as_str(), "" | "~" | "null" | "Null" | "NULL"),
            _ => false,
        }
    }

    /// YAML 1.1 boolean of a plain scalar.
    pub fn as_bool(&self, id: NodeId) -> Option<bool> {
        match &self.node(self.resolve(id)).kind {
            NodeKind::Scalar {
                value,
                style: ScalarStyle::Plain,
            } => match value.as_str() {
                "true" | "True" | "TRUE" | "yes" | "Yes" | "YES" | "on" | "On" | "ON" | "y"
                | "Y" => Some(true),
                "false" | "False" | "FALSE" | "no" | "No" | "NO" | "off" | "Off" | "OFF"
                | "n" | "N" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Unsigned integer of a plain scalar.
    pub fn as_u64(&self, id: NodeId) -> Option<u64> {
        match &self.node(self.resolve(id)).kind {
            NodeKind::Scalar {
                value,
                style: ScalarStyle::Plain,
            } => {
                let digits = value.strip_prefix('+').unwrap_or(value);
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                digits.parse().ok()
            }
            _ => None,
        }
    }

    /// Key text of an entry.
    pub fn key_text(&self, entry: &Entry) -> Option<&str> {
        match &self.node(self.resolve(entry.key)).kind {
            NodeKind::Scalar { value, .. } => Some(value.as_str()),
            _ => None,
        }
    }

    /// The mapping's own entry for `key`, ignoring merge keys.
    pub fn own_entry(&self, map: NodeId, key: &str) -> Option<(usize, &Entry)> {
        self.entries(map)
            .iter()
            .enumerate()
            .find(|(_, e)| self.key_text(e) == Some(key) && key != MERGE_KEY)
    }

    /// Mappings merged into `map` through `<<`, in priority order.
    pub fn merge_sources(&self, map: NodeId) -> Vec<NodeId> {
        let mut sources = Vec::new();
        for entry in self.entries(map) {
            if self.key_text(entry) != Some(MERGE_KEY) {
                continue;
            }
            let value = self.resolve(entry.value);
            match &self.node(value).kind {
                NodeKind::Mapping { .. } => sources.push(value),
                NodeKind::Sequence { items, .. } => sources.extend(
                    items
                        .iter()
                        .map(|i| self.resolve(*i))
                        .filter(|i| self.is_mapping(*i)),
                ),
                _ => {}
            }
        }
        sources
    }

    /// Look up `key` in `map`: own entries first, then merged mappings.
    pub fn lookup(&self, map: NodeId, key: &str) -> Option<Lookup> {
        let mut path = Vec::new();
        self.lookup_in(self.resolve(map), key, &mut path, 0)
    }

    fn lookup_in(
        &self,
        map: NodeId,
        key: &str,
        path: &mut Vec<NodeId>,
        depth: usize,
    ) -> Option<Lookup> {
        if depth > MAX_ALIAS_DEPTH {
            return None;
        }
        if let Some((index, entry)) = self.own_entry(map, key) {
            return Some(Lookup {
                owner: map,
                index,
                value: entry.value,
                merged_through: path.clone(),
            });
        }
        for source in self.merge_sources(map) {
            path.push(source);
            if let Some(found) = self.lookup_in(source, key, path, depth + 1) {
                return Some(found);
            }
            path.pop();
        }
        None
    }

    /// Number of aliases that name `target`.
    pub fn alias_count(&self, target: NodeId) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(&n.kind, NodeKind::Alias { target: t, .. } if *t == target))
            .count()
    }

    /// Offset just past the line break at or after `offset`, or the end of
    /// the source when the last line has none.
    pub fn line_end(&self, offset: usize) -> usize {
        match self.source[offset..].find('\n') {
            Some(i) => offset + i + 1,
            None => self.source.len(),
        }
    }

    pub fn line_start(&self, offset: usize) -> usize {
        self.source[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0)
    }

    /// The mapping entry whose value is `child`.
    pub fn parent_entry(&self, child: NodeId) -> Option<&Entry> {
        self.nodes.iter().find_map(|node| match &node.kind {
            NodeKind::Mapping { entries, .. } => entries.iter().find(|e| e.value == child),
            _ => None,
        })
    }

    /// Span to delete so that entry `index` disappears from `map` without
    /// disturbing its neighbours.
    pub fn removal_span(&self, map: NodeId, index: usize) -> Span {
        let entries = self.entries(map);
        let entry = &entries[index];
        if !entry.leads_item {
            return entry.line;
        }
        match entries.get(index + 1) {
            // Keep the dash: pull the next key up onto this line.
            Some(next) => Span::new(entry.line.start, self.first_content(next.line.start)),
            None => Span::new(entry.line.start, self.node(entry.value).span.end),
        }
    }

    fn first_content(&self, offset: usize) -> usize {
        let rest = &self.source[offset..];
        offset + (rest.len() - rest.trim_start_matches(' ').len())
    }
}

pub(crate) fn locate(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let column = before[line_start..].chars().count() + 1;
    (line, column)
}
