//! CM-002: Span-retaining document loader over the `yaml-rust2` event stream.
//!
//! The event parser supplies structure, decoded scalars and the start marker
//! of every node; this module turns them into arena nodes with byte spans.
//! A syntax error inside one block-sequence item blanks that item out and
//! the text is parsed again, so sibling items survive.

use super::node::{
    locate, CollectionStyle, Document, Entry, Node, NodeId, NodeKind, ScalarStyle, Span,
    SyntaxError,
};
use indexmap::IndexMap;
use std::collections::{HashMap, VecDeque};
use tracing::debug;
use yaml_rust2::parser::{Event, MarkedEventReceiver, Parser};
use yaml_rust2::scanner::{Marker, TScalarStyle};

/// Upper bound on sequence items blanked out while recovering.
const MAX_RECOVERIES: usize = 32;

#[derive(Debug, Clone)]
struct Failure {
    offset: usize,
    message: String,
}

pub(crate) fn parse(source: &str) -> Result<Document, SyntaxError> {
    let items = dash_items(source);
    let mut blanked: Vec<(usize, Failure)> = Vec::new();

    let mut loaded = loop {
        let text = mask(source, &items, blanked.iter().map(|(i, _)| *i));
        match load(&text) {
            Ok(loaded) => break loaded,
            Err(failure) => {
                let culprit = culprit(source, &items, &blanked, failure.offset)
                    .filter(|_| blanked.len() < MAX_RECOVERIES);
                let Some(index) = culprit else {
                    return Err(to_syntax_error(source, failure));
                };
                debug!(offset = items[index].dash, error = %failure.message, "blanking sequence item");
                blanked.push((index, failure));
            }
        }
    };

    // An unterminated construct can surface its error in a later, valid
    // item. Give every blanked item a second chance on its own.
    let mut k = 0;
    while blanked.len() > 1 && k < blanked.len() {
        let rest = blanked
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != k)
            .map(|(_, (i, _))| *i);
        match load(&mask(source, &items, rest)) {
            Ok(retry) => {
                blanked.remove(k);
                loaded = retry;
            }
            Err(_) => k += 1,
        }
    }

    let mut errors = Vec::new();
    blanked.sort_by_key(|(i, _)| *i);
    for (index, failure) in blanked {
        let item = &items[index];
        if let Some(id) = loaded.dashes.get(&item.dash) {
            loaded.nodes[id.0] = Node {
                kind: NodeKind::Invalid {
                    message: failure.message.clone(),
                },
                span: Span::new(item.dash, item.content_end),
                anchor: None,
                column: item.column,
            };
        }
        errors.push(to_syntax_error(source, failure));
    }

    Ok(Document {
        source: source.to_string(),
        nodes: loaded.nodes,
        root: loaded.root,
        anchors: loaded.anchors,
        errors,
    })
}

fn to_syntax_error(source: &str, failure: Failure) -> SyntaxError {
    let (line, column) = locate(source, failure.offset);
    SyntaxError {
        offset: failure.offset,
        line,
        column,
        message: failure.message,
    }
}

// ============================================================================
// Event capture
// ============================================================================

/// Byte offset of every char index, plus one past the end.
struct CharOffsets(Vec<usize>);

impl CharOffsets {
    fn new(text: &str, base: usize) -> Self {
        let mut offsets: Vec<usize> = text.char_indices().map(|(i, _)| base + i).collect();
        offsets.push(base + text.len());
        Self(offsets)
    }

    fn byte(&self, mark: &Marker) -> usize {
        let last = self.0.last().copied().unwrap_or(0);
        self.0.get(mark.index()).copied().unwrap_or(last)
    }
}

struct Recorder<'o> {
    offsets: &'o CharOffsets,
    events: VecDeque<(Event, usize)>,
}

impl MarkedEventReceiver for Recorder<'_> {
    fn on_event(&mut self, ev: Event, mark: Marker) {
        let at = self.offsets.byte(&mark);
        self.events.push_back((ev, at));
    }
}

struct Loaded {
    nodes: Vec<Node>,
    root: Option<NodeId>,
    anchors: IndexMap<String, NodeId>,
    dashes: HashMap<usize, NodeId>,
}

fn load(text: &str) -> Result<Loaded, Failure> {
    let base = if text.starts_with('\u{feff}') {
        '\u{feff}'.len_utf8()
    } else {
        0
    };
    let body = &text[base..];
    let offsets = CharOffsets::new(body, base);
    let mut recorder = Recorder {
        offsets: &offsets,
        events: VecDeque::new(),
    };
    Parser::new(body.chars())
        .load(&mut recorder, true)
        .map_err(|e| Failure {
            offset: offsets.byte(e.marker()),
            message: e.info().to_string(),
        })?;

    let mut builder = Builder {
        src: text,
        events: recorder.events,
        nodes: Vec::new(),
        anchors: IndexMap::new(),
        ids: HashMap::new(),
        dashes: HashMap::new(),
    };
    let root = builder.stream()?;
    Ok(Loaded {
        nodes: builder.nodes,
        root,
        anchors: builder.anchors,
        dashes: builder.dashes,
    })
}

// ============================================================================
// Arena construction
// ============================================================================

fn is_blank(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n')
}

fn is_flow_indicator(b: u8) -> bool {
    matches!(b, b',' | b'[' | b']' | b'{' | b'}')
}

struct Builder<'s> {
    src: &'s str,
    events: VecDeque<(Event, usize)>,
    nodes: Vec<Node>,
    anchors: IndexMap<String, NodeId>,
    /// Parser anchor ids to the nodes that carry them.
    ids: HashMap<usize, NodeId>,
    /// Block-sequence items by the offset of their `-`.
    dashes: HashMap<usize, NodeId>,
}

impl Builder<'_> {
    fn next(&mut self) -> Result<(Event, usize), Failure> {
        self.events.pop_front().ok_or_else(|| Failure {
            offset: self.src.len(),
            message: "unexpected end of event stream".to_string(),
        })
    }

    fn peek(&self) -> Option<&Event> {
        self.events.front().map(|(e, _)| e)
    }

    fn byte(&self, at: usize) -> Option<u8> {
        self.src.as_bytes().get(at).copied()
    }

    fn line_start(&self, at: usize) -> usize {
        self.src[..at].rfind('\n').map(|i| i + 1).unwrap_or(0)
    }

    fn line_end(&self, at: usize) -> usize {
        match self.src[at..].find('\n') {
            Some(i) => at + i + 1,
            None => self.src.len(),
        }
    }

    fn column(&self, at: usize) -> usize {
        at - self.line_start(at)
    }

    /// Block structure must be indented with spaces.
    fn check_indent(&self, at: usize) -> Result<(), Failure> {
        let start = self.line_start(at);
        match self.src[start..at].find('\t') {
            Some(i) => Err(Failure {
                offset: start + i,
                message: "tabs cannot be used for indentation".to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Skip blanks and comments from `from`; the offset of `indicator` if it
    /// comes next.
    fn find_indicator(&self, from: usize, indicator: u8) -> Option<usize> {
        let b = self.src.as_bytes();
        let mut i = from;
        while i < b.len() {
            match b[i] {
                c if is_blank(c) => i += 1,
                b'#' if i == 0 || is_blank(b[i - 1]) => {
                    while i < b.len() && b[i] != b'\n' {
                        i += 1;
                    }
                }
                c if c == indicator => return Some(i),
                _ => return None,
            }
        }
        None
    }

    /// Anchor name and end of the last property (`&a`, `!tag`) found
    /// between an indicator and the node content.
    fn properties(&self, from: usize, to: usize) -> (Option<String>, Option<usize>) {
        let b = self.src.as_bytes();
        let to = to.min(b.len());
        let mut i = from.min(to);
        let mut anchor = None;
        let mut end = None;
        while i < to {
            match b[i] {
                c if is_blank(c) => i += 1,
                b'#' => {
                    while i < to && b[i] != b'\n' {
                        i += 1;
                    }
                }
                c => {
                    let start = i;
                    while i < to && !is_blank(b[i]) && !is_flow_indicator(b[i]) {
                        i += 1;
                    }
                    if i == start {
                        i += 1;
                        continue;
                    }
                    match c {
                        b'&' => {
                            anchor = Some(self.src[start + 1..i].to_string());
                            end = Some(i);
                        }
                        b'!' => end = Some(i),
                        _ => {}
                    }
                }
            }
        }
        (anchor, end)
    }

    fn push(
        &mut self,
        kind: NodeKind,
        span: Span,
        anchor_id: usize,
        anchor: Option<String>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        let column = self.column(span.start);
        if anchor_id > 0 {
            self.ids.insert(anchor_id, id);
        }
        if let Some(name) = &anchor {
            self.anchors.insert(name.clone(), id);
        }
        self.nodes.push(Node {
            kind,
            span,
            anchor,
            column,
        });
        id
    }

    /// Root of the single document in the stream, `None` when empty.
    fn stream(&mut self) -> Result<Option<NodeId>, Failure> {
        let mut root = None;
        while let Some((event, at)) = self.events.pop_front() {
            if event != Event::DocumentStart {
                continue;
            }
            let node = self.node(at, -1)?;
            if self.is_implicit_null(node) {
                continue;
            }
            if root.is_some() {
                return Err(Failure {
                    offset: self.nodes[node.0].span.start,
                    message: "a manifest holds a single YAML document".to_string(),
                });
            }
            root = Some(node);
        }
        Ok(root)
    }

    fn is_implicit_null(&self, id: NodeId) -> bool {
        let node = &self.nodes[id.0];
        node.anchor.is_none()
            && node.span.is_empty()
            && matches!(&node.kind, NodeKind::Scalar { value, .. } if value.is_empty())
    }

    /// Build the next node. `intro` is where the text that introduced it
    /// ends (after `:`, `-`, `,` or the document start); `parent` is the
    /// indentation of the enclosing block, -1 at the root.
    fn node(&mut self, intro: usize, parent: isize) -> Result<NodeId, Failure> {
        let (event, at) = self.next()?;
        match event {
            Event::Scalar(value, style, anchor_id, _) => {
                Ok(self.scalar(value, style == TScalarStyle::Plain, anchor_id, at, intro, parent))
            }
            Event::Alias(id) => self.alias(id, at),
            Event::SequenceStart(anchor_id, _) => self.sequence(anchor_id, at, intro, parent),
            Event::MappingStart(anchor_id, _) => self.mapping(anchor_id, at, intro, parent),
            other => Err(Failure {
                offset: at,
                message: format!("unexpected {:?}", other),
            }),
        }
    }

    fn scalar(
        &mut self,
        value: String,
        plain: bool,
        anchor_id: usize,
        at: usize,
        intro: usize,
        parent: isize,
    ) -> NodeId {
        let (anchor, props_end) = self.properties(intro, at.max(intro));

        // The parser reports an absent value as an empty plain scalar
        // positioned at whatever token follows it.
        if plain && value.is_empty() {
            let p = props_end.unwrap_or(intro);
            let kind = NodeKind::Scalar {
                value,
                style: ScalarStyle::Plain,
            };
            return self.push(kind, Span::new(p, p), anchor_id, anchor);
        }

        let style = match (plain, self.byte(at)) {
            (true, _) => ScalarStyle::Plain,
            (false, Some(b'\'')) => ScalarStyle::SingleQuoted,
            (false, Some(b'"')) => ScalarStyle::DoubleQuoted,
            (false, Some(b'|')) => ScalarStyle::Literal,
            (false, _) => ScalarStyle::Folded,
        };
        let end = match style {
            ScalarStyle::Plain => plain_end(self.src, at, &value),
            ScalarStyle::SingleQuoted => single_quoted_end(self.src, at),
            ScalarStyle::DoubleQuoted => double_quoted_end(self.src, at),
            ScalarStyle::Literal | ScalarStyle::Folded => block_scalar_end(self.src, at, parent),
        };
        self.push(
            NodeKind::Scalar { value, style },
            Span::new(at, end),
            anchor_id,
            anchor,
        )
    }

    fn alias(&mut self, id: usize, at: usize) -> Result<NodeId, Failure> {
        let b = self.src.as_bytes();
        let mut end = at + 1;
        while end < b.len() && !is_blank(b[end]) && !is_flow_indicator(b[end]) {
            end += 1;
        }
        let name = self.src[at + 1..end].to_string();
        let target = self.ids.get(&id).copied().ok_or_else(|| Failure {
            offset: at,
            message: format!("undefined alias '{}'", name),
        })?;
        Ok(self.push(NodeKind::Alias { name, target }, Span::new(at, end), 0, None))
    }

    /// End of a flow collection whose closer the parser reported at `close`.
    fn flow_close(&self, close: usize, cursor: usize, closer: u8) -> usize {
        if self.byte(close) == Some(closer) {
            return close + 1;
        }
        let b = self.src.as_bytes();
        let mut i = cursor;
        while i < b.len() && (is_blank(b[i]) || b[i] == b',') {
            i += 1;
        }
        if self.byte(i) == Some(closer) {
            i + 1
        } else {
            cursor
        }
    }

    fn sequence(
        &mut self,
        anchor_id: usize,
        at: usize,
        intro: usize,
        parent: isize,
    ) -> Result<NodeId, Failure> {
        let (anchor, _) = self.properties(intro, at.max(intro));
        let flow = self.byte(at) == Some(b'[');
        let child_parent = if flow { parent } else { self.column(at) as isize };
        let mut items = Vec::new();
        let mut cursor = at + 1;

        let end = loop {
            if matches!(self.peek(), Some(Event::SequenceEnd)) {
                let (_, close) = self.next()?;
                break if flow {
                    self.flow_close(close, cursor, b']')
                } else {
                    cursor
                };
            }
            let item_intro = match (flow, items.is_empty()) {
                (_, true) => at + 1,
                (true, false) => self.find_indicator(cursor, b',').map_or(cursor, |i| i + 1),
                (false, false) => self.find_indicator(cursor, b'-').map_or(cursor, |i| i + 1),
            };
            if !flow {
                self.check_indent(item_intro - 1)?;
            }
            let item = self.node(item_intro, child_parent)?;
            if !flow {
                self.dashes.insert(item_intro - 1, item);
            }
            cursor = self.nodes[item.0].span.end.max(item_intro);
            items.push(item);
        };

        let style = if flow {
            CollectionStyle::Flow
        } else {
            CollectionStyle::Block
        };
        Ok(self.push(
            NodeKind::Sequence { items, style },
            Span::new(at, end),
            anchor_id,
            anchor,
        ))
    }

    fn mapping(
        &mut self,
        anchor_id: usize,
        at: usize,
        intro: usize,
        parent: isize,
    ) -> Result<NodeId, Failure> {
        let (anchor, _) = self.properties(intro, at.max(intro));
        let flow = self.byte(at) == Some(b'{');
        let child_parent = if flow { parent } else { self.column(at) as isize };
        let mut entries: Vec<Entry> = Vec::new();
        let mut cursor = if flow { at + 1 } else { at };

        let end = loop {
            if matches!(self.peek(), Some(Event::MappingEnd)) {
                let (_, close) = self.next()?;
                break if flow {
                    self.flow_close(close, cursor, b'}')
                } else {
                    cursor
                };
            }
            let key_intro = if flow && !entries.is_empty() {
                self.find_indicator(cursor, b',').map_or(cursor, |i| i + 1)
            } else {
                cursor
            };
            let key = self.node(key_intro, child_parent)?;
            let key_span = self.nodes[key.0].span;
            if !flow {
                self.check_indent(key_span.start)?;
            }
            let value_intro = self
                .find_indicator(key_span.end, b':')
                .map_or(key_span.end, |i| i + 1);
            let value = self.node(value_intro, child_parent)?;
            let value_end = self.nodes[value.0].span.end.max(value_intro);

            let line_start = self.line_start(key_span.start);
            let leads_item = !flow
                && !self.src[line_start..key_span.start]
                    .bytes()
                    .all(|b| b == b' ');
            let line = if flow {
                Span::new(key_span.start, value_end)
            } else if leads_item {
                Span::new(key_span.start, self.line_end(value_end))
            } else {
                Span::new(line_start, self.line_end(value_end))
            };
            entries.push(Entry {
                key,
                value,
                line,
                leads_item,
            });
            cursor = value_end;
        };

        let style = if flow {
            CollectionStyle::Flow
        } else {
            CollectionStyle::Block
        };
        Ok(self.push(
            NodeKind::Mapping { entries, style },
            Span::new(at, end),
            anchor_id,
            anchor,
        ))
    }
}

// ============================================================================
// Scalar extents
// ============================================================================

/// Plain scalars carry no escapes: the decoded value is the source text
/// with line breaks folded, so walking its non-blank chars finds the end.
fn plain_end(src: &str, at: usize, value: &str) -> usize {
    let b = src.as_bytes();
    let mut i = at;
    let mut end = at;
    for ch in value.chars() {
        if matches!(ch, ' ' | '\t' | '\n' | '\r') {
            continue;
        }
        while i < b.len() && is_blank(b[i]) {
            i += 1;
        }
        if !src[i..].starts_with(ch) {
            break;
        }
        i += ch.len_utf8();
        end = i;
    }
    end
}

fn single_quoted_end(src: &str, at: usize) -> usize {
    let b = src.as_bytes();
    let mut i = at + 1;
    while i < b.len() {
        if b[i] == b'\'' {
            if b.get(i + 1) == Some(&b'\'') {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    b.len()
}

fn double_quoted_end(src: &str, at: usize) -> usize {
    let b = src.as_bytes();
    let mut i = at + 1;
    while i < b.len() {
        match b[i] {
            b'\\' => i += 2,
            b'"' => return i + 1,
            _ => i += 1,
        }
    }
    b.len()
}

/// End of the last content line of a `|` or `>` scalar whose indicator is
/// at `at`. Trailing blank lines are not part of the span.
fn block_scalar_end(src: &str, at: usize, parent: isize) -> usize {
    let b = src.as_bytes();
    let mut i = at + 1;
    let mut explicit = None;
    while i < b.len() {
        match b[i] {
            b'-' | b'+' => i += 1,
            d @ b'1'..=b'9' => {
                explicit = Some((d - b'0') as usize);
                i += 1;
            }
            _ => break,
        }
    }
    let header_end = i;
    let next_line = |from: usize| match src[from..].find('\n') {
        Some(k) => from + k + 1,
        None => src.len(),
    };

    let body_start = next_line(header_end);
    let base = parent.max(0) as usize;
    let min_indent = (parent + 1).max(1) as usize;
    let indent = match explicit {
        Some(d) => base + d,
        None => detect_indent(src, body_start).max(min_indent),
    };

    let mut end = header_end;
    let mut cursor = body_start;
    while cursor < src.len() {
        let line_end = next_line(cursor);
        let raw = src[cursor..line_end].trim_end_matches(['\n', '\r']);
        let spaces = raw.bytes().take_while(|c| *c == b' ').count();
        if spaces == raw.len() {
            if spaces > indent {
                end = cursor + raw.len();
            }
        } else if spaces < indent {
            break;
        } else {
            end = cursor + raw.len();
        }
        cursor = line_end;
    }
    end
}

fn detect_indent(src: &str, from: usize) -> usize {
    src[from..]
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .find(|l| !l.trim_start_matches(' ').is_empty())
        .map(|l| l.len() - l.trim_start_matches(' ').len())
        .unwrap_or(0)
}

// ============================================================================
// Block-sequence item recovery
// ============================================================================

/// A line-leading `- ` and the lines that belong to it.
#[derive(Debug, Clone)]
struct DashItem {
    dash: usize,
    column: usize,
    /// Start of the first later line indented at most `column`.
    end: usize,
    content_end: usize,
}

fn dash_items(src: &str) -> Vec<DashItem> {
    let mut lines = Vec::new();
    let mut start = 0;
    for line in src.split_inclusive('\n') {
        let text = line.trim_end_matches(['\n', '\r']);
        let indent = text.len() - text.trim_start_matches(' ').len();
        let rest = &text[indent..];
        let blank = rest.is_empty() || rest.starts_with('#');
        lines.push((start, indent, rest, blank));
        start += line.len();
    }

    let mut items = Vec::new();
    for (n, (line_start, indent, rest, _)) in lines.iter().enumerate() {
        let is_dash = rest.starts_with('-')
            && rest.as_bytes().get(1).is_none_or(|b| is_blank(*b));
        if !is_dash {
            continue;
        }
        let dash = line_start + indent;
        let mut end = src.len();
        let mut content_end = dash + rest.trim_end().len();
        for (start, i, text, blank) in &lines[n + 1..] {
            if *blank {
                continue;
            }
            if i <= indent {
                end = *start;
                break;
            }
            content_end = start + i + text.trim_end().len();
        }
        items.push(DashItem {
            dash,
            column: *indent,
            end,
            content_end,
        });
    }
    items
}

/// `src` with the bodies of the chosen items replaced by spaces. Byte
/// offsets and line breaks are unchanged.
fn mask(src: &str, items: &[DashItem], chosen: impl Iterator<Item = usize>) -> String {
    let mut out = src.to_string();
    for index in chosen {
        let item = &items[index];
        let body: String = src[item.dash + 1..item.end]
            .chars()
            .flat_map(|c| {
                let fill = if matches!(c, '\n' | '\r') { c } else { ' ' };
                std::iter::repeat_n(fill, if fill == ' ' { c.len_utf8() } else { 1 })
            })
            .collect();
        out.replace_range(item.dash + 1..item.end, &body);
    }
    out
}

/// The item to blank out for an error at `offset`: the innermost open item
/// whose body holds it. An error on a dash itself, inside blanked text or
/// at the end of input belongs to the last open item before it.
fn culprit(
    src: &str,
    items: &[DashItem],
    blanked: &[(usize, Failure)],
    offset: usize,
) -> Option<usize> {
    let holds = |i: usize, at: usize| {
        items[i].dash < at && (at < items[i].end || items[i].end == src.len())
    };
    let in_blanked = |at: usize| blanked.iter().any(|(b, _)| holds(*b, at));
    let open = |i: &usize| !blanked.iter().any(|(b, _)| b == i) && !in_blanked(items[*i].dash);

    let containing = (0..items.len())
        .filter(open)
        .filter(|i| holds(*i, offset))
        .max_by_key(|i| items[*i].dash);
    if containing.is_some() {
        return containing;
    }
    let on_dash = items.iter().any(|item| item.dash == offset);
    if on_dash || in_blanked(offset) || offset >= src.trim_end().len() {
        return (0..items.len())
            .filter(open)
            .filter(|i| items[*i].dash < offset)
            .max_by_key(|i| items[*i].dash);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar<'d>(doc: &'d Document, map: NodeId, key: &str) -> Option<&'d str> {
        doc.lookup(map, key).and_then(|l| doc.scalar(l.value))
    }

    #[test]
    fn test_cm002_empty_document() {
        assert!(Document::parse("").unwrap().root().is_none());
        assert!(Document::parse("# only a comment\n").unwrap().root().is_none());
        assert!(Document::parse("---\n").unwrap().root().is_none());
    }

    #[test]
    fn test_cm002_block_mapping_spans() {
        let src = "name: app\nmemory: 512M # half a gig\n";
        let doc = Document::parse(src).unwrap();
        let root = doc.root().unwrap();
        let (_, entry) = doc.own_entry(root, "memory").unwrap();
        assert_eq!(doc.slice(entry.line), "memory: 512M # half a gig\n");
        assert_eq!(doc.slice(doc.node(entry.value).span), "512M");
        assert_eq!(doc.slice(doc.node(entry.key).span), "memory");
        assert_eq!(doc.node(root).column, 0);
    }

    #[test]
    fn test_cm002_indentless_sequence_of_mappings() {
        let src = "applications:\n- name: a\n  memory: 1G\n- name: b\n";
        let doc = Document::parse(src).unwrap();
        let root = doc.root().unwrap();
        let apps = doc.lookup(root, "applications").unwrap().value;
        let items = doc.items(apps);
        assert_eq!(items.len(), 2);
        assert_eq!(scalar(&doc, items[0], "memory"), Some("1G"));
        assert_eq!(scalar(&doc, items[1], "name"), Some("b"));
        assert_eq!(doc.node(items[0]).column, 2);
        assert_eq!(doc.node(apps).column, 0);
        let (_, name) = doc.own_entry(items[0], "name").unwrap();
        assert!(name.leads_item);
        assert_eq!(doc.slice(name.line), "name: a\n");
        assert_eq!(doc.slice(doc.node(items[0]).span), "name: a\n  memory: 1G");
    }

    #[test]
    fn test_cm002_nested_sequence_indented() {
        let src = "services:\n  - s1\n  - s2\nenv:\n  K: v\n";
        let doc = Document::parse(src).unwrap();
        let root = doc.root().unwrap();
        let services = doc.lookup(root, "services").unwrap().value;
        let names: Vec<_> = doc.items(services).iter().filter_map(|i| doc.scalar(*i)).collect();
        assert_eq!(names, vec!["s1", "s2"]);
        assert_eq!(doc.slice(doc.node(services).span), "- s1\n  - s2");
        let env = doc.lookup(root, "env").unwrap().value;
        assert_eq!(scalar(&doc, env, "K"), Some("v"));
    }

    #[test]
    fn test_cm002_quoted_scalars() {
        let src = "a: \"x\\ty \\\"q\\\"\"\nb: 'it''s'\nc: \"multi\n  line\"\n";
        let doc = Document::parse(src).unwrap();
        let root = doc.root().unwrap();
        assert_eq!(scalar(&doc, root, "a"), Some("x\ty \"q\""));
        assert_eq!(scalar(&doc, root, "b"), Some("it's"));
        assert_eq!(scalar(&doc, root, "c"), Some("multi line"));
        let b = doc.lookup(root, "b").unwrap().value;
        assert_eq!(doc.slice(doc.node(b).span), "'it''s'");
        let c = doc.lookup(root, "c").unwrap().value;
        assert_eq!(doc.slice(doc.node(c).span), "\"multi\n  line\"");
    }

    #[test]
    fn test_cm002_block_scalars() {
        let src = "lit: |\n  one\n  two\nfold: >-\n  one\n  two\n\n  three\n\nnext: x\n";
        let doc = Document::parse(src).unwrap();
        let root = doc.root().unwrap();
        assert_eq!(scalar(&doc, root, "lit"), Some("one\ntwo\n"));
        assert_eq!(scalar(&doc, root, "fold"), Some("one two\nthree"));
        assert_eq!(scalar(&doc, root, "next"), Some("x"));
        let fold = doc.lookup(root, "fold").unwrap().value;
        assert_eq!(doc.slice(doc.node(fold).span), ">-\n  one\n  two\n\n  three");
    }

    #[test]
    fn test_cm002_plain_multiline() {
        let doc = Document::parse("cmd: java -jar\n  app.jar\nx: 1\n").unwrap();
        let root = doc.root().unwrap();
        assert_eq!(scalar(&doc, root, "cmd"), Some("java -jar app.jar"));
        let cmd = doc.lookup(root, "cmd").unwrap().value;
        assert_eq!(doc.slice(doc.node(cmd).span), "java -jar\n  app.jar");
    }

    #[test]
    fn test_cm002_flow_collections() {
        let src = "services: [a, 'b c', d]\nenv: {K1: v1, K2: \"v 2\"}\nempty: []\n";
        let doc = Document::parse(src).unwrap();
        let root = doc.root().unwrap();
        let services = doc.lookup(root, "services").unwrap().value;
        assert_eq!(doc.sequence_style(services), Some(CollectionStyle::Flow));
        let names: Vec<_> = doc.items(services).iter().filter_map(|i| doc.scalar(*i)).collect();
        assert_eq!(names, vec!["a", "b c", "d"]);
        assert_eq!(doc.slice(doc.node(services).span), "[a, 'b c', d]");
        let env = doc.lookup(root, "env").unwrap().value;
        assert_eq!(scalar(&doc, env, "K2"), Some("v 2"));
        assert_eq!(doc.slice(doc.node(env).span), "{K1: v1, K2: \"v 2\"}");
        let empty = doc.lookup(root, "empty").unwrap().value;
        assert!(doc.items(empty).is_empty());
        assert_eq!(doc.slice(doc.node(empty).span), "[]");
    }

    #[test]
    fn test_cm002_multiline_flow_closed_at_key_indent() {
        let src = "applications:\n- name: app\n  services: [\n    db,\n    mq\n  ]\n  env: {\n    A: x\n  }\n";
        let doc = Document::parse(src).unwrap();
        assert!(doc.errors().is_empty());
        let root = doc.root().unwrap();
        let apps = doc.lookup(root, "applications").unwrap().value;
        let app = doc.items(apps)[0];
        let services = doc.lookup(app, "services").unwrap().value;
        let names: Vec<_> = doc.items(services).iter().filter_map(|i| doc.scalar(*i)).collect();
        assert_eq!(names, vec!["db", "mq"]);
        assert!(doc.slice(doc.node(services).span).ends_with("mq\n  ]"));
        let env = doc.lookup(app, "env").unwrap().value;
        assert_eq!(scalar(&doc, env, "A"), Some("x"));
        assert!(doc.slice(doc.node(env).span).ends_with('}'));
    }

    #[test]
    fn test_cm002_explicit_key() {
        let doc = Document::parse("? a\n: 1\nb: 2\n").unwrap();
        let root = doc.root().unwrap();
        assert_eq!(scalar(&doc, root, "a"), Some("1"));
        assert_eq!(scalar(&doc, root, "b"), Some("2"));
    }

    #[test]
    fn test_cm002_anchor_alias_merge() {
        let src = "defaults: &defaults\n  instances: 3\napplications:\n- name: app\n  <<: *defaults\n";
        let doc = Document::parse(src).unwrap();
        let root = doc.root().unwrap();
        let apps = doc.lookup(root, "applications").unwrap().value;
        let app = doc.items(apps)[0];
        let found = doc.lookup(app, "instances").unwrap();
        assert_eq!(found.merged_through.len(), 1);
        assert_eq!(doc.as_u64(found.value), Some(3));
        let anchor = doc.anchor("defaults").unwrap();
        assert_eq!(doc.node(anchor).anchor.as_deref(), Some("defaults"));
        assert_eq!(doc.slice(doc.node(anchor).span), "instances: 3");
        let merge = &doc.entries(app)[1];
        assert!(matches!(&doc.node(merge.value).kind, NodeKind::Alias { name, .. } if name == "defaults"));
    }

    #[test]
    fn test_cm002_anchored_empty_value() {
        let src = "d: &d\nnext: 1\n";
        let doc = Document::parse(src).unwrap();
        let root = doc.root().unwrap();
        let d = doc.anchor("d").unwrap();
        assert!(doc.is_null(d));
        assert_eq!(doc.node(d).span, Span::new(5, 5));
        assert_eq!(scalar(&doc, root, "next"), Some("1"));
    }

    #[test]
    fn test_cm002_undefined_alias_fails() {
        let err = Document::parse("a: *missing\n").unwrap_err();
        assert_eq!(err.line, 1);
    }

    #[test]
    fn test_cm002_tab_indentation_fails() {
        let err = Document::parse("a:\n\tb: 1\n").unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_cm002_recover_bad_sequence_item() {
        let src = "applications:\n- name: good1\n- name: bad\n  memory: [1G\n- name: good2\n  memory: 2G\n";
        let doc = Document::parse(src).unwrap();
        assert_eq!(doc.errors().len(), 1);
        let root = doc.root().unwrap();
        let apps = doc.lookup(root, "applications").unwrap().value;
        let items = doc.items(apps);
        assert_eq!(items.len(), 3);
        assert!(doc.is_invalid(items[1]));
        assert_eq!(doc.slice(doc.node(items[1]).span), "- name: bad\n  memory: [1G");
        assert_eq!(scalar(&doc, items[0], "name"), Some("good1"));
        assert_eq!(scalar(&doc, items[2], "memory"), Some("2G"));
    }

    #[test]
    fn test_cm002_error_outside_sequence_fails() {
        let err = Document::parse("a: 1\n  b: 2\n").unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_cm002_value_with_mapping_indicator_fails() {
        assert!(Document::parse("a: b: c\n").is_err());
    }

    #[test]
    fn test_cm002_document_markers() {
        let doc = Document::parse("---\nname: x\n...\n").unwrap();
        let root = doc.root().unwrap();
        assert_eq!(scalar(&doc, root, "name"), Some("x"));
    }

    #[test]
    fn test_cm002_second_document_rejected() {
        assert!(Document::parse("name: x\n...\n---\nname: y\n").is_err());
    }

    #[test]
    fn test_cm002_trailing_content_after_end_marker_rejected() {
        let err = Document::parse("a: 1\n...\nb: 2\n").unwrap_err();
        assert_eq!(err.line, 3);
    }

    #[test]
    fn test_cm002_byte_order_mark_skipped() {
        let src = "\u{feff}name: app\n";
        let doc = Document::parse(src).unwrap();
        let root = doc.root().unwrap();
        let name = doc.lookup(root, "name").unwrap().value;
        assert_eq!(doc.slice(doc.node(name).span), "app");
    }

    #[test]
    fn test_cm002_implicit_null_value_span() {
        let src = "a:\nb: 1\n";
        let doc = Document::parse(src).unwrap();
        let root = doc.root().unwrap();
        let (_, entry) = doc.own_entry(root, "a").unwrap();
        assert!(doc.is_null(entry.value));
        assert_eq!(doc.node(entry.value).span, Span::new(2, 2));
        assert_eq!(doc.slice(entry.line), "a:\n");
    }

    #[test]
    fn test_cm002_entry_line_without_trailing_newline() {
        let src = "a: 1\nb: 2";
        let doc = Document::parse(src).unwrap();
        let root = doc.root().unwrap();
        let (_, entry) = doc.own_entry(root, "b").unwrap();
        assert_eq!(entry.line, Span::new(5, 10));
    }

    #[test]
    fn test_cm002_unicode_offsets() {
        let src = "name: café\nnote: 'naïve'\nnext: ok\n";
        let doc = Document::parse(src).unwrap();
        let root = doc.root().unwrap();
        let note = doc.lookup(root, "note").unwrap().value;
        assert_eq!(doc.slice(doc.node(note).span), "'naïve'");
        assert_eq!(scalar(&doc, root, "next"), Some("ok"));
        let next = doc.lookup(root, "next").unwrap().value;
        assert_eq!(doc.slice(doc.node(next).span), "ok");
    }

    #[test]
    fn test_cm002_dash_items_and_mask() {
        let src = "- a: 1\n  b: é\n# note\n- c\n";
        let items = dash_items(src);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].end, 22);
        assert_eq!(&src[items[0].dash..items[0].content_end], "- a: 1\n  b: é");
        let masked = mask(src, &items, std::iter::once(0));
        assert_eq!(masked.len(), src.len());
        assert!(masked.starts_with("-     \n"));
        assert!(masked.ends_with("- c\n"));
    }
}
