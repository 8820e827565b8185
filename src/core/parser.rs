//! CM-007: Manifest parsing from a YAML document to `DeploymentProperties`.
//!
//! Parsing is total over the document: per-application problems are
//! collected next to the applications that did parse.

use super::catalog::DomainCatalog;
use super::error::ManifestError;
use super::resolver::{expand_routes, parse_memory};
use super::types::*;
use crate::document::{Document, NodeId};
use indexmap::{IndexMap, IndexSet};
use std::path::Path;
use tracing::{debug, info};

/// Where the application blocks of a manifest live.
#[derive(Debug, Clone, Default)]
pub(crate) struct BlockLayout {
    /// Root mapping, if the document has one.
    pub root: Option<NodeId>,
    /// Value of the root `applications` key, when present.
    pub applications: Option<NodeId>,
    /// Candidate application blocks (may include invalid items).
    pub blocks: Vec<NodeId>,
    /// Mapping whose keys every block inherits (the root, when
    /// `applications` exists).
    pub inherit: Option<NodeId>,
}

pub(crate) fn locate_blocks(doc: &Document) -> Result<BlockLayout, ManifestError> {
    let Some(root) = doc.root() else {
        return Ok(BlockLayout::default());
    };
    if doc.is_null(root) {
        return Ok(BlockLayout::default());
    }
    if !doc.is_mapping(root) {
        return Err(ManifestError::InvalidManifest(
            "manifest root must be a mapping".to_string(),
        ));
    }
    let root = doc.resolve(root);
    match doc.lookup(root, "applications") {
        Some(found) => {
            let value = doc.resolve(found.value);
            let blocks = if doc.is_null(value) {
                Vec::new()
            } else if doc.is_sequence(value) {
                doc.items(value).to_vec()
            } else {
                return Err(ManifestError::InvalidManifest(
                    "'applications' must be a sequence".to_string(),
                ));
            };
            Ok(BlockLayout {
                root: Some(root),
                applications: Some(value),
                blocks,
                inherit: Some(root),
            })
        }
        None => Ok(BlockLayout {
            root: Some(root),
            applications: None,
            blocks: vec![root],
            inherit: None,
        }),
    }
}

/// Effective-value reader for one application block.
#[derive(Clone, Copy)]
pub(crate) struct BlockView<'d> {
    pub doc: &'d Document,
    pub block: NodeId,
    pub inherit: Option<NodeId>,
}

impl<'d> BlockView<'d> {
    pub fn new(doc: &'d Document, block: NodeId, inherit: Option<NodeId>) -> Self {
        Self {
            doc,
            block: doc.resolve(block),
            inherit,
        }
    }

    /// Block-level value (own or merged), skipping explicit nulls.
    pub fn block_value(&self, key: &str) -> Option<NodeId> {
        self.doc
            .lookup(self.block, key)
            .map(|l| l.value)
            .filter(|v| !self.doc.is_null(*v))
    }

    /// Root-level value this block inherits.
    pub fn root_value(&self, key: &str) -> Option<NodeId> {
        let root = self.inherit?;
        self.doc
            .lookup(root, key)
            .map(|l| l.value)
            .filter(|v| !self.doc.is_null(*v))
    }

    /// Scalar-style lookup: the block wins (an explicit null included),
    /// otherwise the root.
    pub fn value(&self, key: &str) -> Option<NodeId> {
        match self.doc.lookup(self.block, key) {
            Some(found) if self.doc.is_null(found.value) => None,
            Some(found) => Some(found.value),
            None => self.root_value(key),
        }
    }

    pub fn text(&self, key: &str) -> Option<String> {
        self.value(key)
            .and_then(|v| self.doc.scalar(v))
            .map(str::to_string)
    }

    pub fn flag(&self, key: &str) -> bool {
        self.value(key).and_then(|v| self.doc.as_bool(v)) == Some(true)
    }

    /// Whether the key carries a non-null value anywhere this block sees.
    pub fn present(&self, key: &str) -> bool {
        self.value(key).is_some() || self.root_value(key).is_some()
    }

    /// List-style lookup: root items followed by block items.
    pub fn list(&self, key: &str) -> Vec<String> {
        let mut out = self.root_value(key).map(|v| strings_of(self.doc, v)).unwrap_or_default();
        if let Some(v) = self.block_value(key) {
            out.extend(strings_of(self.doc, v));
        }
        out
    }

    /// Root and block `routes` entries.
    pub fn routes(&self) -> Vec<String> {
        let mut out = self.root_value("routes").map(|v| routes_of(self.doc, v)).unwrap_or_default();
        if let Some(v) = self.block_value("routes") {
            out.extend(routes_of(self.doc, v));
        }
        out
    }

    /// Map-style lookup: root entries overlaid by block entries.
    pub fn env(&self) -> IndexMap<String, String> {
        let mut out = self.root_value("env").map(|v| env_of(self.doc, v)).unwrap_or_default();
        if let Some(v) = self.block_value("env") {
            for (k, val) in env_of(self.doc, v) {
                out.insert(k, val);
            }
        }
        out
    }
}

/// Scalar items of a sequence, or a lone scalar as a one-item list.
pub(crate) fn strings_of(doc: &Document, node: NodeId) -> Vec<String> {
    if doc.is_sequence(node) {
        doc.items(node)
            .iter()
            .filter_map(|i| doc.scalar(*i))
            .map(str::to_string)
            .collect()
    } else {
        doc.scalar(node).map(|s| vec![s.to_string()]).unwrap_or_default()
    }
}

/// `route` values of a `routes` sequence.
pub(crate) fn routes_of(doc: &Document, node: NodeId) -> Vec<String> {
    doc.items(node)
        .iter()
        .filter_map(|item| {
            if doc.is_mapping(*item) {
                doc.lookup(*item, "route").and_then(|l| doc.scalar(l.value))
            } else {
                doc.scalar(*item)
            }
        })
        .map(str::to_string)
        .collect()
}

/// Scalar entries of a mapping with merge keys applied.
pub(crate) fn env_of(doc: &Document, node: NodeId) -> IndexMap<String, String> {
    let mut values: IndexMap<String, NodeId> = IndexMap::new();
    collect_entries(doc, doc.resolve(node), &mut values, 0);
    values
        .into_iter()
        .filter_map(|(k, v)| doc.scalar(v).map(|s| (k, s.to_string())))
        .collect()
}

pub(crate) fn collect_entries(doc: &Document, map: NodeId, out: &mut IndexMap<String, NodeId>, depth: usize) {
    if depth > 16 {
        return;
    }
    for entry in doc.entries(map) {
        match doc.key_text(entry) {
            Some("<<") | None => {}
            Some(key) => {
                out.entry(key.to_string()).or_insert(entry.value);
            }
        }
    }
    for source in doc.merge_sources(map) {
        collect_entries(doc, source, out, depth + 1);
    }
}

/// Read one application block.
pub(crate) fn read_application(
    view: &BlockView<'_>,
    index: usize,
    catalog: &DomainCatalog,
) -> Result<DeploymentProperties, ManifestError> {
    let doc = view.doc;
    let name = view
        .block_value("name")
        .and_then(|v| doc.scalar(v))
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or(ManifestError::MissingName { index })?
        .to_string();

    let mut props = DeploymentProperties::new(name.clone());
    let raw = |v: NodeId| doc.scalar(v).unwrap_or_else(|| doc.slice(doc.node(v).span)).to_string();

    if let Some(v) = view.value("memory") {
        props.memory = doc
            .scalar(v)
            .and_then(parse_memory)
            .ok_or_else(|| ManifestError::InvalidMemory {
                app: name.clone(),
                value: raw(v),
            })?;
    }
    if let Some(v) = view.value("disk_quota") {
        props.disk_quota =
            doc.scalar(v)
                .and_then(parse_memory)
                .ok_or_else(|| ManifestError::InvalidValue {
                    app: name.clone(),
                    key: "disk_quota".to_string(),
                    value: raw(v),
                })?;
    }
    props.instances = positive_int(view, "instances", &name)?;
    props.timeout = positive_int(view, "timeout", &name)?;

    if let Some(v) = view.value("health-check-type") {
        let text = doc.scalar(v).unwrap_or_default();
        props.health_check_type = text.parse().map_err(|_| ManifestError::InvalidValue {
            app: name.clone(),
            key: "health-check-type".to_string(),
            value: raw(v),
        })?;
    }
    if props.health_check_type == HealthCheckType::Http {
        props.health_check_http_endpoint = view.text("health-check-http-endpoint");
    }

    props.command = view.text("command");
    props.buildpack = view.text("buildpack");
    props.stack = view.text("stack").filter(|s| {
        let known = catalog.has_stack(s);
        if !known {
            debug!(app = %name, stack = %s, "ignoring stack unknown to the catalog");
        }
        known
    });

    props.buildpacks = dedupe(view.list("buildpacks"));
    props.services = dedupe(view.list("services"));
    props.environment_variables = view.env();
    props.uris = read_uris(view, &name, catalog);
    Ok(props)
}

fn positive_int(view: &BlockView<'_>, key: &str, app: &str) -> Result<Option<u32>, ManifestError> {
    let Some(v) = view.value(key) else {
        return Ok(None);
    };
    let text = view.doc.scalar(v).unwrap_or_default();
    match text.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(Some(n)),
        _ => Err(ManifestError::InvalidValue {
            app: app.to_string(),
            key: key.to_string(),
            value: text.to_string(),
        }),
    }
}

fn dedupe(items: Vec<String>) -> Vec<String> {
    items.into_iter().collect::<IndexSet<_>>().into_iter().collect()
}

/// Reconstruct the routes a block describes.
pub(crate) fn read_uris(view: &BlockView<'_>, app: &str, catalog: &DomainCatalog) -> IndexSet<String> {
    if view.flag("no-route") {
        return IndexSet::new();
    }
    if view.present("routes") {
        return view.routes().into_iter().collect();
    }

    let mut hosts: Vec<String> = view.text("host").into_iter().collect();
    hosts.extend(view.list("hosts"));
    let mut hosts = dedupe(hosts);
    if hosts.is_empty() {
        if view.flag("no-hostname") {
            // Routes are the bare domains.
        } else if view.flag("random-route") {
            hosts.push(RANDOM_HOST.to_string());
        } else {
            hosts.push(app.to_string());
        }
    }

    let mut domains: Vec<String> = view.text("domain").into_iter().collect();
    domains.extend(view.list("domains"));
    let mut domains = dedupe(domains);
    if domains.is_empty() {
        domains.extend(catalog.default_domain().map(str::to_string));
    }

    expand_routes(&hosts, &domains)
}

/// Parse every application block of a parsed document.
pub fn parse_document(doc: &Document, catalog: &DomainCatalog) -> ParsedManifest {
    let mut result = ParsedManifest::default();
    result
        .errors
        .extend(doc.errors().iter().cloned().map(ManifestError::from));

    let layout = match locate_blocks(doc) {
        Ok(layout) => layout,
        Err(e) => {
            result.errors.push(e);
            return result;
        }
    };

    for (index, block) in layout.blocks.iter().enumerate() {
        if doc.is_invalid(*block) {
            continue;
        }
        if doc.is_null(*block) {
            continue;
        }
        if !doc.is_mapping(*block) {
            result.errors.push(ManifestError::InvalidManifest(format!(
                "application #{} is not a mapping",
                index
            )));
            continue;
        }
        let view = BlockView::new(doc, *block, layout.inherit);
        match read_application(&view, index, catalog) {
            Ok(props) => result.applications.push(props),
            Err(e) => {
                debug!(index, error = %e, "skipping application block");
                result.errors.push(e);
            }
        }
    }

    info!(
        applications = result.applications.len(),
        errors = result.errors.len(),
        "parsed manifest"
    );
    result
}

/// Parse manifest text. Never fails: a document that cannot be read at all
/// yields a single `InvalidYamlSyntax` error.
pub fn parse_manifest(text: &str, catalog: &DomainCatalog) -> ParsedManifest {
    match Document::parse(text) {
        Ok(doc) => parse_document(&doc, catalog),
        Err(e) => ParsedManifest {
            applications: Vec::new(),
            errors: vec![e.into()],
        },
    }
}

/// Read and parse a manifest file.
pub fn parse_manifest_file(path: &Path, catalog: &DomainCatalog) -> Result<ParsedManifest, ManifestError> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_manifest(&text, catalog))
}
