//! CM-004: Error taxonomy for manifest parsing and reconciliation.

use crate::document::SyntaxError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("application '{app}': invalid memory value '{value}'")]
    InvalidMemory { app: String, value: String },

    #[error("application '{app}': invalid value '{value}' for '{key}'")]
    InvalidValue {
        app: String,
        key: String,
        value: String,
    },

    #[error("invalid YAML syntax at line {line}, column {column}: {message}")]
    InvalidYamlSyntax {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("{count} applications are named '{name}'")]
    AmbiguousApplicationName { name: String, count: usize },

    #[error("application #{index} has no name")]
    MissingName { index: usize },

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("invalid edit script: {0}")]
    InvalidEdit(String),

    #[error("manifest changed since the edits were computed (expected {expected}, found {actual})")]
    StaleEdit { expected: String, actual: String },

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SyntaxError> for ManifestError {
    fn from(e: SyntaxError) -> Self {
        Self::InvalidYamlSyntax {
            line: e.line,
            column: e.column,
            message: e.message,
        }
    }
}

impl ManifestError {
    /// Errors confined to a single application block. Parsing of sibling
    /// blocks continues past these.
    pub fn is_block_local(&self) -> bool {
        matches!(
            self,
            Self::InvalidMemory { .. }
                | Self::InvalidValue { .. }
                | Self::MissingName { .. }
                | Self::InvalidYamlSyntax { .. }
        )
    }
}
