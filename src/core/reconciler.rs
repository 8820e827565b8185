//! CM-010: Reconciliation into minimal, format-preserving manifest edits.
//!
//! Given desired `DeploymentProperties` and the existing manifest text,
//! compute the edit script that makes the text describe the desired state.
//! Every field is compared by meaning, not by text; lines whose decoded
//! value already matches are never touched. `None` means no write is needed.

use super::catalog::DomainCatalog;
use super::error::ManifestError;
use super::generator::{generate_app, generate_text, key_rank, route_value, string_list, string_map};
use super::parser::{
    collect_entries, env_of, locate_blocks, read_application, read_uris, routes_of, strings_of,
    BlockLayout, BlockView,
};
use super::resolver::{format_memory, parse_memory, Route, RouteValue, ROUTE_KEYS};
use super::types::*;
use crate::document::{CollectionStyle, Document, Entry, Lookup, NodeId, NodeKind, Span};
use indexmap::{IndexMap, IndexSet};
use serde_yaml_ng::{Mapping, Value};
use std::collections::HashSet;
use tracing::{debug, info};

/// Compute the edits that make `existing` describe `desired`.
///
/// Returns `Ok(None)` when the text already represents the desired state.
pub fn reconcile(
    desired: &DeploymentProperties,
    existing: &str,
    catalog: &DomainCatalog,
) -> Result<Option<EditScript>, ManifestError> {
    let ops = plan(desired, existing, catalog)?;
    if ops.is_empty() {
        info!(app = %desired.app_name, "manifest already up to date");
        return Ok(None);
    }
    info!(app = %desired.app_name, edits = ops.len(), "reconciled manifest");
    EditScript::new(existing, ops).map(Some)
}

/// `reconcile` followed by applying the result; returns the text unchanged
/// when no edit is required.
pub fn reconcile_text(
    desired: &DeploymentProperties,
    existing: &str,
    catalog: &DomainCatalog,
) -> Result<String, ManifestError> {
    match reconcile(desired, existing, catalog)? {
        Some(script) => script.apply(existing),
        None => Ok(existing.to_string()),
    }
}

enum Target {
    /// Synthesize the whole document.
    Replace,
    /// Add a new element to `applications`.
    Append,
    /// Edit an existing application block.
    Patch(NodeId),
}

fn parse_clean(text: &str) -> Result<Document, ManifestError> {
    let doc = Document::parse(text)?;
    if let Some(e) = doc.errors().first() {
        return Err(e.clone().into());
    }
    Ok(doc)
}

fn block_name(doc: &Document, block: NodeId) -> Option<&str> {
    doc.lookup(block, "name")
        .and_then(|l| doc.scalar(l.value))
        .map(str::trim)
}

fn find_target(doc: &Document, layout: &BlockLayout, name: &str) -> Result<Target, ManifestError> {
    let Some(root) = layout.root else {
        return Ok(Target::Replace);
    };
    if layout.applications.is_none() {
        return Ok(if block_name(doc, root) == Some(name) {
            Target::Patch(root)
        } else {
            Target::Replace
        });
    }
    let matches: Vec<NodeId> = layout
        .blocks
        .iter()
        .copied()
        .filter(|b| doc.is_mapping(*b) && block_name(doc, *b) == Some(name))
        .collect();
    match matches[..] {
        [] => Ok(Target::Append),
        [one] => Ok(Target::Patch(one)),
        _ => Err(ManifestError::AmbiguousApplicationName {
            name: name.to_string(),
            count: matches.len(),
        }),
    }
}

fn plan(
    desired: &DeploymentProperties,
    existing: &str,
    catalog: &DomainCatalog,
) -> Result<Vec<EditOp>, ManifestError> {
    let doc = parse_clean(existing)?;
    let layout = locate_blocks(&doc)?;
    match find_target(&doc, &layout, &desired.app_name)? {
        Target::Replace => {
            debug!(app = %desired.app_name, "no block to patch, generating the whole manifest");
            let text = generate_text(desired, catalog)?;
            if text == existing {
                return Ok(Vec::new());
            }
            Ok(vec![EditOp::new(0, existing.len(), text)])
        }
        Target::Append => {
            let first = append_op(&doc, &layout, desired, catalog)?;
            debug!(app = %desired.app_name, at = first.offset, "appending application block");
            follow_up(first, desired, existing, catalog)
        }
        Target::Patch(block) => Patcher::new(&doc, catalog, &layout, block).run(desired),
    }
}

/// Op that adds a generated element for `desired` to `applications`.
fn append_op(
    doc: &Document,
    layout: &BlockLayout,
    desired: &DeploymentProperties,
    catalog: &DomainCatalog,
) -> Result<EditOp, ManifestError> {
    let root = layout
        .root
        .ok_or_else(|| ManifestError::InvalidManifest("manifest has no root mapping".into()))?;
    let (_, entry) = doc.own_entry(root, "applications").ok_or_else(|| {
        ManifestError::InvalidManifest("'applications' comes from a merge key".into())
    })?;
    if matches!(doc.node(entry.value).kind, NodeKind::Alias { .. }) {
        return Err(ManifestError::InvalidManifest(
            "'applications' is an alias".into(),
        ));
    }
    let element = serde_yaml_ng::to_string(&Value::Sequence(vec![generate_app(desired, catalog)]))?;
    let source = doc.source();
    let seq = entry.value;

    if !doc.items(seq).is_empty() {
        if doc.sequence_style(seq) == Some(CollectionStyle::Flow) {
            return Err(ManifestError::InvalidManifest(
                "cannot append to a flow-style 'applications' list".into(),
            ));
        }
        let node = doc.node(seq);
        let at = doc.line_end(node.span.end);
        let mut text = indent_lines(&element, node.column);
        if at == source.len() && !source.ends_with('\n') {
            text.insert(0, '\n');
        }
        return Ok(EditOp::insert(at, text));
    }

    // `applications:` is null or `[]`: the list goes under the key.
    let key = doc.node(entry.key);
    let value = doc.node(entry.value);
    let end = value.span.end.max(key.span.end);
    let body = indent_lines(&element, key.column);
    Ok(EditOp::new(
        key.span.end,
        end - key.span.end,
        format!(":\n{}", body.trim_end_matches('\n')),
    ))
}

/// Apply `first`, patch the block it produced against the new text, and
/// express the combined result as edits against the original text.
fn follow_up(
    first: EditOp,
    desired: &DeploymentProperties,
    existing: &str,
    catalog: &DomainCatalog,
) -> Result<Vec<EditOp>, ManifestError> {
    let staged = EditScript::new(existing, vec![first.clone()])?.apply_unchecked(existing)?;
    let doc = parse_clean(&staged)?;
    let layout = locate_blocks(&doc)?;
    let Target::Patch(block) = find_target(&doc, &layout, &desired.app_name)? else {
        return Err(ManifestError::InvalidManifest(format!(
            "appended application '{}' cannot be located",
            desired.app_name
        )));
    };
    let second = Patcher::new(&doc, catalog, &layout, block).run(desired)?;

    let start = first.offset;
    let end = start + first.replacement.len();
    let shift = first.replacement.len() as isize - first.length as isize;
    let mut inner = Vec::new();
    let mut outer = Vec::new();
    for op in second {
        let inside = op.offset > start && op.end() <= end && !(op.offset == end && op.length > 0);
        if inside {
            inner.push(EditOp::new(op.offset - start, op.length, op.replacement));
        } else if op.end() <= start {
            outer.push(op);
        } else if op.offset >= end {
            let offset = (op.offset as isize - shift) as usize;
            outer.push(EditOp::new(offset, op.length, op.replacement));
        } else {
            return Err(ManifestError::InvalidEdit(format!(
                "edit {} straddles the appended block",
                op
            )));
        }
    }
    let replacement = EditScript::new(&first.replacement, inner)?.apply_unchecked(&first.replacement)?;
    outer.push(EditOp::new(first.offset, first.length, replacement));
    Ok(outer)
}

// ============================================================================
// Rendering
// ============================================================================

const FLOW_SPECIAL: [char; 7] = [',', '[', ']', '{', '}', ':', '#'];

/// Single-line YAML text for a scalar or empty collection.
fn inline_scalar(value: &Value) -> Result<String, ManifestError> {
    if let Value::String(s) = value {
        if s.chars().any(char::is_control) {
            return Ok(serde_json::to_string(s)?);
        }
    }
    let text = serde_yaml_ng::to_string(value)?;
    Ok(text.trim_end_matches('\n').to_string())
}

fn flow_text(value: &Value) -> Result<String, ManifestError> {
    Ok(match value {
        Value::Sequence(items) => {
            let parts = items.iter().map(flow_text).collect::<Result<Vec<_>, _>>()?;
            format!("[{}]", parts.join(", "))
        }
        Value::Mapping(map) => {
            let parts = map
                .iter()
                .map(|(k, v)| Ok(format!("{}: {}", flow_text(k)?, flow_text(v)?)))
                .collect::<Result<Vec<String>, ManifestError>>()?;
            format!("{{{}}}", parts.join(", "))
        }
        Value::String(s) if s.contains(&FLOW_SPECIAL[..]) => serde_json::to_string(s)?,
        other => inline_scalar(other)?,
    })
}

/// Block YAML for a collection, without a trailing line break.
fn block_text(value: &Value) -> Result<String, ManifestError> {
    let text = serde_yaml_ng::to_string(value)?;
    Ok(text.trim_end_matches('\n').to_string())
}

/// Prefix every non-empty line with `column` spaces.
fn indent_lines(text: &str, column: usize) -> String {
    let pad = " ".repeat(column);
    let mut out = String::with_capacity(text.len() + column * 4);
    for line in text.lines() {
        if !line.is_empty() {
            out.push_str(&pad);
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn render_entry(key: &str, value: &Value, column: usize) -> Result<String, ManifestError> {
    let mut map = Mapping::new();
    map.insert(Value::String(key.to_string()), value.clone());
    let text = serde_yaml_ng::to_string(&Value::Mapping(map))?;
    Ok(indent_lines(&text, column))
}

fn is_nonempty_collection(value: &Value) -> bool {
    match value {
        Value::Sequence(items) => !items.is_empty(),
        Value::Mapping(map) => !map.is_empty(),
        _ => false,
    }
}

fn is_block_collection(kind: &NodeKind) -> bool {
    matches!(
        kind,
        NodeKind::Mapping {
            style: CollectionStyle::Block,
            ..
        } | NodeKind::Sequence {
            style: CollectionStyle::Block,
            ..
        }
    )
}

fn is_flow_collection(kind: &NodeKind) -> bool {
    matches!(
        kind,
        NodeKind::Mapping {
            style: CollectionStyle::Flow,
            ..
        } | NodeKind::Sequence {
            style: CollectionStyle::Flow,
            ..
        }
    )
}

/// Document node as a plain tree, merge keys applied.
fn to_value(doc: &Document, node: NodeId) -> Value {
    let id = doc.resolve(node);
    match &doc.node(id).kind {
        _ if doc.is_null(id) => Value::Null,
        NodeKind::Scalar { value, style } => {
            if *style == crate::document::ScalarStyle::Plain {
                if let Some(b) = doc.as_bool(id) {
                    return Value::Bool(b);
                }
                if let Some(n) = doc.as_u64(id) {
                    return Value::Number(n.into());
                }
            }
            Value::String(value.clone())
        }
        NodeKind::Sequence { items, .. } => {
            Value::Sequence(items.iter().map(|i| to_value(doc, *i)).collect())
        }
        NodeKind::Mapping { .. } => {
            let mut entries = IndexMap::new();
            collect_entries(doc, id, &mut entries, 0);
            let mut map = Mapping::new();
            for (k, v) in entries {
                map.insert(Value::String(k), to_value(doc, v));
            }
            Value::Mapping(map)
        }
        NodeKind::Alias { .. } | NodeKind::Invalid { .. } => Value::Null,
    }
}

fn items_of(value: Value) -> Vec<Value> {
    match value {
        Value::Sequence(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

fn route_value_matches(doc: &Document, node: NodeId, want: &RouteValue) -> bool {
    match want {
        RouteValue::Flag(b) => doc.as_bool(node) == Some(*b),
        RouteValue::Text(s) => doc.scalar(node) == Some(s.as_str()),
        RouteValue::List(items) => doc.is_sequence(node) && strings_of(doc, node) == *items,
        RouteValue::Routes(routes) => doc.is_sequence(node) && routes_of(doc, node) == *routes,
    }
}

/// Whether a route key's value contributes nothing.
fn is_inert(doc: &Document, node: NodeId) -> bool {
    doc.is_null(node)
        || doc.as_bool(node) == Some(false)
        || (doc.is_sequence(node) && doc.items(node).is_empty())
}

fn contains(outer: Span, inner: Span) -> bool {
    outer.start <= inner.start && inner.end <= outer.end
}

/// Merge overlapping deletions; they arise when a line-leading entry and its
/// successor are both removed.
fn coalesce(mut ops: Vec<EditOp>) -> Vec<EditOp> {
    ops.sort_by_key(|op| (op.offset, op.length));
    let mut out: Vec<EditOp> = Vec::with_capacity(ops.len());
    for op in ops {
        if let Some(last) = out.last_mut() {
            if last.replacement.is_empty()
                && op.replacement.is_empty()
                && op.length > 0
                && op.offset < last.end()
            {
                last.length = last.end().max(op.end()) - last.offset;
                continue;
            }
        }
        out.push(op);
    }
    out
}

// ============================================================================
// Block patching
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Inherit {
    Scalar,
    List,
    Map,
}

fn inherit_kind(key: &str) -> Inherit {
    match key {
        "services" | "buildpacks" | "hosts" | "domains" | "routes" => Inherit::List,
        "env" => Inherit::Map,
        _ => Inherit::Scalar,
    }
}

struct Patcher<'d> {
    doc: &'d Document,
    catalog: &'d DomainCatalog,
    view: BlockView<'d>,
    block: NodeId,
    blocks: Vec<NodeId>,
    ops: Vec<EditOp>,
    /// New entries per mapping, rendered at the mapping's end.
    pending: IndexMap<NodeId, Vec<(String, Value)>>,
    /// Top-level keys already moved into the application blocks.
    migrated: HashSet<String>,
    /// Entries to delete, per mapping.
    removed: IndexMap<NodeId, IndexSet<usize>>,
}

impl<'d> Patcher<'d> {
    fn new(doc: &'d Document, catalog: &'d DomainCatalog, layout: &BlockLayout, block: NodeId) -> Self {
        let view = BlockView::new(doc, block, layout.inherit);
        Self {
            doc,
            catalog,
            block: view.block,
            view,
            blocks: layout
                .blocks
                .iter()
                .copied()
                .filter(|b| doc.is_mapping(*b))
                .map(|b| doc.resolve(b))
                .collect(),
            ops: Vec::new(),
            pending: IndexMap::new(),
            migrated: HashSet::new(),
            removed: IndexMap::new(),
        }
    }

    fn run(mut self, desired: &DeploymentProperties) -> Result<Vec<EditOp>, ManifestError> {
        if self.doc.mapping_style(self.block) == Some(CollectionStyle::Flow) {
            return Err(ManifestError::InvalidManifest(format!(
                "application '{}' is a flow-style mapping",
                desired.app_name
            )));
        }
        if let Ok(current) = read_application(&self.view, 0, self.catalog) {
            if current.semantically_eq(desired, self.catalog) {
                debug!(app = %desired.app_name, "block already matches");
                return Ok(Vec::new());
            }
        }

        self.patch_scalars(desired)?;
        self.patch_health_check(desired)?;
        self.patch_services(desired)?;
        self.patch_buildpacks(desired)?;
        self.patch_env(desired)?;
        self.patch_routes(desired)?;
        self.finish()
    }

    // ------------------------------------------------------------------
    // Primitive edits
    // ------------------------------------------------------------------

    fn replace(&mut self, span: Span, text: String) {
        self.ops.push(EditOp::new(span.start, span.len(), text));
    }

    fn delete(&mut self, span: Span) {
        self.ops.push(EditOp::delete(span.start, span.len()));
    }

    fn delete_entry(&mut self, map: NodeId, index: usize) {
        self.removed.entry(map).or_default().insert(index);
    }

    fn queue_insert(&mut self, map: NodeId, key: &str, value: Value) -> Result<(), ManifestError> {
        if self.doc.mapping_style(map) != Some(CollectionStyle::Block) || self.doc.entries(map).is_empty() {
            return Err(ManifestError::InvalidManifest(format!(
                "cannot add '{}' to a flow-style mapping",
                key
            )));
        }
        debug!(key, "adding entry");
        self.pending
            .entry(self.doc.resolve(map))
            .or_default()
            .push((key.to_string(), value));
        Ok(())
    }

    /// Replace an entry's value, keeping its anchor and collection style.
    fn replace_value(&mut self, entry: &Entry, value: &Value) -> Result<(), ManifestError> {
        let doc = self.doc;
        let key = doc.node(entry.key);
        let old = doc.node(entry.value);
        let anchor = old.anchor.as_deref();

        if !is_nonempty_collection(value) {
            let text = inline_scalar(value)?;
            if is_block_collection(&old.kind) {
                let prefix = anchor.map(|a| format!("&{} ", a)).unwrap_or_default();
                self.replace(Span::new(key.span.end, old.span.end), format!(": {}{}", prefix, text));
            } else if old.span.is_empty() {
                self.replace(old.span, format!(" {}", text));
            } else {
                self.replace(old.span, text);
            }
            return Ok(());
        }

        if is_flow_collection(&old.kind) {
            self.replace(old.span, flow_text(value)?);
        } else if is_block_collection(&old.kind) {
            let pad = format!("\n{}", " ".repeat(old.column));
            let text = block_text(value)?.lines().collect::<Vec<_>>().join(&pad);
            self.replace(old.span, text);
        } else {
            let prefix = anchor.map(|a| format!(" &{}", a)).unwrap_or_default();
            let body = indent_lines(&block_text(value)?, key.column + 2);
            let end = old.span.end.max(key.span.end);
            self.replace(
                Span::new(key.span.end, end),
                format!(":{}\n{}", prefix, body.trim_end_matches('\n')),
            );
        }
        Ok(())
    }

    /// A merged value may be edited in place when every anchor on the path
    /// is used once and lives outside the other application blocks.
    fn is_private(&self, found: &Lookup, block: NodeId) -> bool {
        let doc = self.doc;
        found.merged_through.iter().all(|anchor| {
            let span = doc.node(*anchor).span;
            doc.alias_count(*anchor) == 1
                && !self
                    .blocks
                    .iter()
                    .any(|b| *b != block && contains(doc.node(*b).span, span))
        })
    }

    fn root_has(&self, key: &str) -> bool {
        !self.migrated.contains(key) && self.view.root_value(key).is_some()
    }

    /// Make `block`'s effective `key` equal `value`.
    fn set_in(&mut self, block: NodeId, key: &str, value: &Value) -> Result<(), ManifestError> {
        let doc = self.doc;
        match doc.lookup(block, key) {
            Some(found) if found.is_own() || self.is_private(&found, block) => {
                let entry = &doc.entries(found.owner)[found.index];
                self.replace_value(entry, value)
            }
            _ => self.queue_insert(block, key, value.clone()),
        }
    }

    fn set(&mut self, key: &str, value: Value) -> Result<(), ManifestError> {
        debug!(key, "updating value");
        self.set_in(self.block, key, &value)
    }

    /// Make `block`'s `key` absent. `empty` is written as an override when
    /// deleting would expose an inherited value.
    fn clear_in(
        &mut self,
        block: NodeId,
        key: &str,
        empty: Value,
        root_fallback: bool,
    ) -> Result<(), ManifestError> {
        let doc = self.doc;
        let provides = |map: NodeId| {
            doc.lookup(map, key)
                .is_some_and(|l| !doc.is_null(l.value))
        };

        if let Some((index, entry)) = doc.own_entry(block, key) {
            let merged_fallback = doc.merge_sources(block).into_iter().any(provides);
            if root_fallback || merged_fallback {
                if !doc.is_null(entry.value) {
                    self.replace_value(entry, &empty)?;
                }
            } else {
                self.delete_entry(block, index);
            }
            return Ok(());
        }

        match doc.lookup(block, key) {
            Some(found) if !doc.is_null(found.value) => {
                let first = found.merged_through.first().copied();
                let others = doc
                    .merge_sources(block)
                    .into_iter()
                    .filter(|s| Some(*s) != first)
                    .any(provides);
                if self.is_private(&found, block) && !others && !root_fallback {
                    self.delete_entry(found.owner, found.index);
                    Ok(())
                } else {
                    self.queue_insert(block, key, empty)
                }
            }
            _ if root_fallback => self.queue_insert(block, key, empty),
            _ => Ok(()),
        }
    }

    fn clear(&mut self, key: &str) -> Result<(), ManifestError> {
        debug!(key, "clearing value");
        let root_fallback = self.root_has(key);
        self.clear_in(self.block, key, Value::Null, root_fallback)
    }

    /// Delete the block's own or privately merged entry, if any.
    fn remove_local(&mut self, key: &str) {
        let doc = self.doc;
        if let Some((index, _)) = doc.own_entry(self.block, key) {
            self.delete_entry(self.block, index);
        } else if let Some(found) = doc.lookup(self.block, key) {
            if self.is_private(&found, self.block) {
                self.delete_entry(found.owner, found.index);
            }
        }
    }

    /// Key-wise edit of a string map so that `block`'s own `key` equals
    /// `target`.
    fn sync_map(
        &mut self,
        block: NodeId,
        key: &str,
        target: &IndexMap<String, String>,
    ) -> Result<(), ManifestError> {
        let doc = self.doc;
        let found = doc.lookup(block, key).filter(|l| !doc.is_null(l.value));
        if let Some(l) = &found {
            if env_of(doc, l.value) == *target {
                return Ok(());
            }
        }
        if target.is_empty() {
            return self.clear_in(block, key, Value::Mapping(Mapping::new()), false);
        }

        let editable = found
            .as_ref()
            .filter(|l| l.is_own() || self.is_private(l, block))
            .map(|l| (l.owner, l.index));
        let Some((owner, index)) = editable else {
            return match doc.own_entry(block, key) {
                Some((_, entry)) => self.replace_value(entry, &string_map(target)),
                None => self.queue_insert(block, key, string_map(target)),
            };
        };

        let entry = &doc.entries(owner)[index];
        let map = entry.value;
        let keywise = doc.mapping_style(map) == Some(CollectionStyle::Block)
            && !matches!(doc.node(map).kind, NodeKind::Alias { .. })
            && doc.merge_sources(map).is_empty();
        if !keywise {
            return self.replace_value(entry, &string_map(target));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for (i, e) in doc.entries(map).iter().enumerate() {
            let Some(k) = doc.key_text(e) else { continue };
            seen.insert(k);
            match target.get(k) {
                None if doc.scalar(e.value).is_some() => self.delete_entry(map, i),
                None => {}
                Some(v) if doc.scalar(e.value) == Some(v.as_str()) => {}
                Some(v) => self.replace_value(e, &Value::String(v.clone()))?,
            }
        }
        for (k, v) in target {
            if !seen.contains(k.as_str()) {
                self.queue_insert(map, k, Value::String(v.clone()))?;
            }
        }
        Ok(())
    }

    /// Move a top-level key into every other application block, then delete
    /// it from the root, so the target block can be edited on its own.
    fn migrate_root(&mut self, key: &str) -> Result<(), ManifestError> {
        if !self.root_has(key) {
            return Ok(());
        }
        let doc = self.doc;
        let Some(root) = self.view.inherit else {
            return Ok(());
        };
        let found = doc
            .lookup(root, key)
            .ok_or_else(|| ManifestError::InvalidManifest(format!("top-level '{}' vanished", key)))?;
        if !found.is_own() {
            return Err(ManifestError::InvalidManifest(format!(
                "top-level '{}' comes from a merge key and cannot be moved",
                key
            )));
        }
        self.migrated.insert(key.to_string());

        let others: Vec<NodeId> = self.blocks.iter().copied().filter(|b| *b != self.block).collect();
        for other in others {
            let own = doc.lookup(other, key).filter(|l| !doc.is_null(l.value));
            match inherit_kind(key) {
                Inherit::Scalar => {
                    if doc.lookup(other, key).is_none() {
                        self.queue_insert(other, key, to_value(doc, found.value))?;
                    }
                }
                Inherit::List => {
                    let mut items = items_of(to_value(doc, found.value));
                    if let Some(l) = &own {
                        items.extend(items_of(to_value(doc, l.value)));
                    }
                    match doc.own_entry(other, key) {
                        Some((_, entry)) => self.replace_value(entry, &Value::Sequence(items))?,
                        None => self.queue_insert(other, key, Value::Sequence(items))?,
                    }
                }
                Inherit::Map => {
                    let mut merged = env_of(doc, found.value);
                    if let Some(l) = &own {
                        merged.extend(env_of(doc, l.value));
                    }
                    self.sync_map(other, key, &merged)?;
                }
            }
        }
        self.delete_entry(root, found.index);
        info!(key, "moved top-level key into the application blocks");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Fields
    // ------------------------------------------------------------------

    fn patch_quantity(&mut self, key: &str, want: u32, default: u32) -> Result<(), ManifestError> {
        let doc = self.doc;
        let (current, unitless) = match self.view.value(key) {
            None => (Some(default), false),
            Some(n) => (doc.scalar(n).and_then(parse_memory), doc.as_u64(n).is_some()),
        };
        if current == Some(want) {
            return Ok(());
        }
        let value = if unitless {
            Value::Number(want.into())
        } else {
            Value::String(format_memory(want))
        };
        self.set(key, value)
    }

    fn patch_text(&mut self, key: &str, want: Option<&str>) -> Result<(), ManifestError> {
        let present = self.view.value(key).is_some();
        let current = self.view.text(key);
        match want {
            Some(w) if current.as_deref() != Some(w) => self.set(key, Value::String(w.to_string())),
            None if present => self.clear(key),
            _ => Ok(()),
        }
    }

    fn positive(&self, key: &str) -> (bool, Option<u32>) {
        match self.view.value(key) {
            None => (false, None),
            Some(n) => (
                true,
                self.doc
                    .scalar(n)
                    .and_then(|s| s.trim().parse::<u32>().ok())
                    .filter(|v| *v > 0),
            ),
        }
    }

    fn patch_scalars(&mut self, desired: &DeploymentProperties) -> Result<(), ManifestError> {
        self.patch_quantity("memory", desired.memory, DEFAULT_MEMORY_MB)?;
        self.patch_quantity("disk_quota", desired.disk_quota, DEFAULT_DISK_QUOTA_MB)?;

        let want = desired.effective_instances();
        let current = match self.positive("instances") {
            (false, _) => Some(DEFAULT_INSTANCES),
            (true, parsed) => parsed,
        };
        if current != Some(want) {
            self.set("instances", Value::Number(want.into()))?;
        }

        let (present, current) = self.positive("timeout");
        match desired.timeout {
            Some(t) if current != Some(t) => self.set("timeout", Value::Number(t.into()))?,
            None if present => self.clear("timeout")?,
            _ => {}
        }

        self.patch_text("command", desired.command.as_deref())?;
        self.patch_text("buildpack", desired.buildpack.as_deref())?;

        let current = self.view.text("stack").filter(|s| self.catalog.has_stack(s));
        let want = desired.effective_stack(self.catalog);
        if current.as_deref() != want {
            match want {
                Some(s) => self.set("stack", Value::String(s.to_string()))?,
                None => self.clear("stack")?,
            }
        }
        Ok(())
    }

    fn patch_health_check(&mut self, desired: &DeploymentProperties) -> Result<(), ManifestError> {
        let current = match self.view.value("health-check-type") {
            None => Some(HealthCheckType::Port),
            Some(n) => self.doc.scalar(n).and_then(|s| s.parse().ok()),
        };
        let want = desired.health_check_type;
        if current != Some(want) {
            if want == HealthCheckType::Port {
                // An inherited type is shadowed with an explicit `port`.
                let root_fallback = self.root_has("health-check-type");
                let port = Value::String(HealthCheckType::Port.as_str().to_string());
                self.clear_in(self.block, "health-check-type", port, root_fallback)?;
            } else {
                self.set("health-check-type", Value::String(want.as_str().to_string()))?;
            }
        }

        if want == HealthCheckType::Http {
            self.patch_text(
                "health-check-http-endpoint",
                desired.health_check_http_endpoint.as_deref(),
            )?;
        } else if current == Some(HealthCheckType::Http) {
            self.remove_local("health-check-http-endpoint");
        }
        Ok(())
    }

    fn patch_services(&mut self, desired: &DeploymentProperties) -> Result<(), ManifestError> {
        let current: IndexSet<String> = self.view.list("services").into_iter().collect();
        let want = desired.service_set();
        if current.iter().map(String::as_str).collect::<IndexSet<_>>() == want {
            return Ok(());
        }

        let root: Vec<String> = if self.root_has("services") {
            self.view
                .root_value("services")
                .map(|n| strings_of(self.doc, n))
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        let wanted: Vec<String> = want.iter().map(|s| s.to_string()).collect();
        let target: Vec<String> = if root.iter().all(|r| want.contains(r.as_str())) {
            wanted.into_iter().filter(|s| !root.contains(s)).collect()
        } else {
            self.migrate_root("services")?;
            wanted
        };

        if target.is_empty() {
            return self.clear_in(self.block, "services", Value::Sequence(Vec::new()), false);
        }
        let block_current: IndexSet<String> = self
            .view
            .block_value("services")
            .map(|n| strings_of(self.doc, n))
            .unwrap_or_default()
            .into_iter()
            .collect();
        if block_current == target.iter().cloned().collect::<IndexSet<_>>() {
            return Ok(());
        }
        self.set("services", string_list(&target))
    }

    /// Like `services`, but the order of the list is part of its meaning:
    /// inherited root buildpacks must be a prefix of the desired list.
    fn patch_buildpacks(&mut self, desired: &DeploymentProperties) -> Result<(), ManifestError> {
        let current: IndexSet<String> = self.view.list("buildpacks").into_iter().collect();
        let want: Vec<String> = desired.buildpack_list().into_iter().map(str::to_string).collect();
        if current.iter().eq(want.iter()) {
            return Ok(());
        }

        let root: IndexSet<String> = if self.root_has("buildpacks") {
            self.view
                .root_value("buildpacks")
                .map(|n| strings_of(self.doc, n))
                .unwrap_or_default()
                .into_iter()
                .collect()
        } else {
            IndexSet::new()
        };
        let target: Vec<String> = if want.len() >= root.len() && root.iter().eq(want[..root.len()].iter()) {
            want[root.len()..].to_vec()
        } else {
            self.migrate_root("buildpacks")?;
            want
        };

        if target.is_empty() {
            return self.clear_in(self.block, "buildpacks", Value::Sequence(Vec::new()), false);
        }
        let block_current: Vec<String> = self
            .view
            .block_value("buildpacks")
            .map(|n| strings_of(self.doc, n))
            .unwrap_or_default();
        if block_current == target {
            return Ok(());
        }
        self.set("buildpacks", string_list(&target))
    }

    fn patch_env(&mut self, desired: &DeploymentProperties) -> Result<(), ManifestError> {
        let want = &desired.environment_variables;
        if self.view.env() == *want {
            return Ok(());
        }
        let root = if self.root_has("env") {
            self.view.root_value("env").map(|n| env_of(self.doc, n)).unwrap_or_default()
        } else {
            IndexMap::new()
        };
        let block_current = self
            .view
            .block_value("env")
            .map(|n| env_of(self.doc, n))
            .unwrap_or_default();

        let target: IndexMap<String, String> = if root.keys().all(|k| want.contains_key(k)) {
            want.iter()
                .filter(|(k, v)| root.get(*k) != Some(*v) || block_current.contains_key(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        } else {
            self.migrate_root("env")?;
            want.clone()
        };
        self.sync_map(self.block, "env", &target)
    }

    fn random_match(&self, current: &IndexSet<String>, desired: &DeploymentProperties) -> bool {
        let (Some(cur), Some(want)) = (current.first(), desired.uris.first()) else {
            return false;
        };
        if current.len() != 1 || desired.uris.len() != 1 {
            return false;
        }
        let Some(domain) = cur.strip_prefix(RANDOM_HOST).and_then(|d| d.strip_prefix('.')) else {
            return false;
        };
        let route = Route::parse(want, self.catalog);
        route.is_host_domain_only() && route.domain.as_deref() == Some(domain)
    }

    fn patch_routes(&mut self, desired: &DeploymentProperties) -> Result<(), ManifestError> {
        let current = read_uris(&self.view, &desired.app_name, self.catalog);
        if current == desired.uris {
            return Ok(());
        }
        if self.random_match(&current, desired) {
            debug!(app = %desired.app_name, "random route already covers the desired route");
            return Ok(());
        }

        for key in ROUTE_KEYS {
            self.migrate_root(key)?;
        }

        let layout = super::resolver::RouteLayout::choose(&desired.uris, self.catalog);
        debug!(app = %desired.app_name, layout = %layout, "rewriting routes");
        let entries = layout.entries();
        for (key, want) in &entries {
            let matches = self
                .view
                .block_value(key)
                .is_some_and(|n| route_value_matches(self.doc, n, want));
            if !matches {
                self.set(key, route_value(want))?;
            }
        }
        for key in ROUTE_KEYS {
            if entries.iter().any(|(k, _)| *k == key) {
                continue;
            }
            let active = self
                .view
                .block_value(key)
                .is_some_and(|n| !is_inert(self.doc, n));
            if active {
                self.clear_in(self.block, key, Value::Null, false)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    /// Turn queued entry removals into deletions. An anchored mapping that
    /// would lose every entry becomes `{}` so the aliases that merge it
    /// still point at a mapping.
    fn flush_removals(&mut self) -> Result<(), ManifestError> {
        let doc = self.doc;
        for (map, indices) in std::mem::take(&mut self.removed) {
            let emptied = indices.len() == doc.entries(map).len()
                && doc.node(map).anchor.is_some()
                && !self.pending.contains_key(&map);
            if !emptied {
                for index in indices {
                    self.delete(doc.removal_span(map, index));
                }
                continue;
            }
            debug!(anchor = ?doc.node(map).anchor, "anchored mapping emptied");
            let empty = Value::Mapping(Mapping::new());
            match doc.parent_entry(map) {
                Some(entry) => self.replace_value(entry, &empty)?,
                None => self.replace(doc.node(map).span, inline_scalar(&empty)?),
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<EditOp>, ManifestError> {
        self.flush_removals()?;
        let doc = self.doc;
        let source = doc.source();
        let mut groups: Vec<(usize, usize, String)> = Vec::new();
        for (map, mut entries) in std::mem::take(&mut self.pending) {
            entries.sort_by_key(|(k, _)| key_rank(k));
            let Some(last) = doc.entries(map).last() else {
                continue;
            };
            let column = doc.node(map).column;
            let mut text = String::new();
            for (key, value) in &entries {
                text.push_str(&render_entry(key, value, column)?);
            }
            groups.push((last.line.end, column, text));
        }
        // Deeper mappings first when several end on the same line.
        groups.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        let mut inserts: Vec<EditOp> = Vec::new();
        for (offset, _, text) in groups {
            match inserts.last_mut() {
                Some(prev) if prev.offset == offset => prev.replacement.push_str(&text),
                _ => inserts.push(EditOp::insert(offset, text)),
            }
        }
        for op in &mut inserts {
            if op.offset == source.len() && !source.is_empty() && !source.ends_with('\n') {
                op.replacement.insert(0, '\n');
            }
        }

        let mut ops = coalesce(self.ops);
        ops.extend(inserts);
        Ok(ops)
    }
}
