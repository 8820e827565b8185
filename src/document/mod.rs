//! YAML document model with node arena, spans, anchors and merge-aware lookup.

pub mod node;
pub mod parser;

pub use node::{
    CollectionStyle, Document, Entry, Lookup, Node, NodeId, NodeKind, ScalarStyle, Span,
    SyntaxError,
};
