//! CM-005: Domain and stack catalog of the current target.
//!
//! Read-only during any parse/generate/reconcile call. The first domain is
//! the target's default domain.

use super::error::ManifestError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainCatalog {
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub stacks: Vec<String>,
}

impl DomainCatalog {
    pub fn new<D, S>(domains: D, stacks: S) -> Self
    where
        D: IntoIterator,
        D::Item: Into<String>,
        S: IntoIterator,
        S::Item: Into<String>,
    {
        let mut catalog = Self::default();
        catalog.extend(domains, stacks);
        catalog
    }

    /// Add domains and stacks, skipping blanks and duplicates.
    pub fn extend<D, S>(&mut self, domains: D, stacks: S)
    where
        D: IntoIterator,
        D::Item: Into<String>,
        S: IntoIterator,
        S::Item: Into<String>,
    {
        for d in domains {
            push_unique(&mut self.domains, d.into());
        }
        for s in stacks {
            push_unique(&mut self.stacks, s.into());
        }
    }

    pub fn default_domain(&self) -> Option<&str> {
        self.domains.first().map(String::as_str)
    }

    pub fn has_domain(&self, domain: &str) -> bool {
        self.domains.iter().any(|d| d == domain)
    }

    pub fn has_stack(&self, stack: &str) -> bool {
        self.stacks.iter().any(|s| s == stack)
    }

    /// Longest catalog domain that `host_part` equals or ends with
    /// (as `.domain`).
    pub fn longest_suffix(&self, host_part: &str) -> Option<&str> {
        self.domains
            .iter()
            .filter(|d| {
                host_part == d.as_str()
                    || (host_part.len() > d.len()
                        && host_part.ends_with(d.as_str())
                        && host_part.as_bytes()[host_part.len() - d.len() - 1] == b'.')
            })
            .max_by_key(|d| d.len())
            .map(String::as_str)
    }

    /// Parse a catalog from YAML (`domains: [...]`, `stacks: [...]`).
    pub fn from_yaml(text: &str) -> Result<Self, ManifestError> {
        let raw: DomainCatalog = serde_yaml_ng::from_str(text)
            .map_err(|e| ManifestError::Catalog(format!("YAML parse error: {}", e)))?;
        if let Some(bad) = raw.domains.iter().find(|d| d.trim().is_empty() || d.contains('/')) {
            return Err(ManifestError::Catalog(format!("invalid domain '{}'", bad)));
        }
        Ok(Self::new(raw.domains, raw.stacks))
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ManifestError::Catalog(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml(&text)
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    let value = value.trim().to_string();
    if !value.is_empty() && !list.contains(&value) {
        list.push(value);
    }
}
