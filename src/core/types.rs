//! CM-003: Deployment model types.
//!
//! `DeploymentProperties` is the typed state of one application block; the
//! parser produces it, the generator and reconciler consume it. Edit scripts
//! are plain data so they can be validated, serialized and applied later.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::catalog::DomainCatalog;
use super::error::ManifestError;

/// Plain key/value tree for a freshly generated manifest.
pub type KeyValueTree = serde_yaml_ng::Value;

pub const DEFAULT_MEMORY_MB: u32 = 1024;
pub const DEFAULT_DISK_QUOTA_MB: u32 = 1024;
pub const DEFAULT_INSTANCES: u32 = 1;

/// Host placeholder for `random-route: true` without an explicit host.
pub const RANDOM_HOST: &str = "${random}";

// ============================================================================
// Health checks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckType {
    /// Equivalent to the key being absent.
    #[default]
    Port,
    Process,
    Http,
    None,
}

impl HealthCheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Port => "port",
            Self::Process => "process",
            Self::Http => "http",
            Self::None => "none",
        }
    }
}

impl fmt::Display for HealthCheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthCheckType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "port" => Ok(Self::Port),
            "process" => Ok(Self::Process),
            "http" => Ok(Self::Http),
            "none" => Ok(Self::None),
            other => Err(format!("unknown health check type '{}'", other)),
        }
    }
}

// ============================================================================
// Deployment properties
// ============================================================================

/// Desired (or current) deployment state of one application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeploymentProperties {
    /// Application name; locates the block during reconciliation.
    pub app_name: String,

    /// Memory in megabytes
    #[serde(default = "default_memory")]
    pub memory: u32,

    /// Disk quota in megabytes
    #[serde(default = "default_disk_quota")]
    pub disk_quota: u32,

    /// Instance count; `None` means unspecified (one instance)
    #[serde(default)]
    pub instances: Option<u32>,

    /// Start timeout in seconds
    #[serde(default)]
    pub timeout: Option<u32>,

    /// Fully-qualified routes, `host.domain[/path][:port]`
    #[serde(default)]
    pub uris: IndexSet<String>,

    #[serde(default)]
    pub services: Vec<String>,

    #[serde(default)]
    pub environment_variables: IndexMap<String, String>,

    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub buildpack: Option<String>,

    /// Buildpacks in detection order; the last one supplies the start command
    #[serde(default)]
    pub buildpacks: Vec<String>,

    #[serde(default)]
    pub stack: Option<String>,

    #[serde(default)]
    pub health_check_type: HealthCheckType,

    #[serde(default)]
    pub health_check_http_endpoint: Option<String>,
}

fn default_memory() -> u32 {
    DEFAULT_MEMORY_MB
}

fn default_disk_quota() -> u32 {
    DEFAULT_DISK_QUOTA_MB
}

impl DeploymentProperties {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            memory: DEFAULT_MEMORY_MB,
            disk_quota: DEFAULT_DISK_QUOTA_MB,
            instances: None,
            timeout: None,
            uris: IndexSet::new(),
            services: Vec::new(),
            environment_variables: IndexMap::new(),
            command: None,
            buildpack: None,
            buildpacks: Vec::new(),
            stack: None,
            health_check_type: HealthCheckType::Port,
            health_check_http_endpoint: None,
        }
    }

    pub fn effective_instances(&self) -> u32 {
        self.instances.unwrap_or(DEFAULT_INSTANCES)
    }

    /// Stack, if the catalog knows it.
    pub fn effective_stack<'a>(&'a self, catalog: &DomainCatalog) -> Option<&'a str> {
        self.stack.as_deref().filter(|s| catalog.has_stack(s))
    }

    /// Endpoint, meaningful only for `http` health checks.
    pub fn effective_endpoint(&self) -> Option<&str> {
        match self.health_check_type {
            HealthCheckType::Http => self.health_check_http_endpoint.as_deref(),
            _ => None,
        }
    }

    pub fn service_set(&self) -> IndexSet<&str> {
        self.services.iter().map(String::as_str).collect()
    }

    /// Buildpacks without repeats. Order is significant, unlike services.
    pub fn buildpack_list(&self) -> Vec<&str> {
        let unique: IndexSet<&str> = self.buildpacks.iter().map(String::as_str).collect();
        unique.into_iter().collect()
    }

    /// Equality modulo representation: defaults, set-valued fields, and
    /// fields that only matter in certain configurations.
    pub fn semantically_eq(&self, other: &Self, catalog: &DomainCatalog) -> bool {
        self.app_name == other.app_name
            && self.memory == other.memory
            && self.disk_quota == other.disk_quota
            && self.effective_instances() == other.effective_instances()
            && self.timeout == other.timeout
            && self.uris == other.uris
            && self.service_set() == other.service_set()
            && self.environment_variables == other.environment_variables
            && self.command == other.command
            && self.buildpack == other.buildpack
            && self.buildpack_list() == other.buildpack_list()
            && self.effective_stack(catalog) == other.effective_stack(catalog)
            && self.health_check_type == other.health_check_type
            && self.effective_endpoint() == other.effective_endpoint()
    }
}

/// Partial-success result of parsing a manifest.
#[derive(Debug, Default)]
pub struct ParsedManifest {
    pub applications: Vec<DeploymentProperties>,
    pub errors: Vec<ManifestError>,
}

impl ParsedManifest {
    pub fn find(&self, name: &str) -> Option<&DeploymentProperties> {
        self.applications.iter().find(|a| a.app_name == name)
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

// ============================================================================
// Edit scripts
// ============================================================================

/// Replace `length` bytes at `offset` with `replacement`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditOp {
    pub offset: usize,
    pub length: usize,
    pub replacement: String,
}

impl EditOp {
    pub fn new(offset: usize, length: usize, replacement: impl Into<String>) -> Self {
        Self {
            offset,
            length,
            replacement: replacement.into(),
        }
    }

    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self::new(offset, 0, text)
    }

    pub fn delete(offset: usize, length: usize) -> Self {
        Self::new(offset, length, String::new())
    }

    pub fn end(&self) -> usize {
        self.offset + self.length
    }
}

impl fmt::Display for EditOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.length, self.replacement.is_empty()) {
            (0, _) => write!(f, "INSERT @{} {:?}", self.offset, self.replacement),
            (n, true) => write!(f, "DELETE @{}+{}", self.offset, n),
            (n, false) => write!(f, "REPLACE @{}+{} {:?}", self.offset, n, self.replacement),
        }
    }
}

/// Ordered, non-overlapping edits against one exact manifest text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditScript {
    /// `blake3:` hash of the text the edits were computed against.
    pub base_hash: String,
    pub ops: Vec<EditOp>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cm003_health_check_parse() {
        assert_eq!("http".parse::<HealthCheckType>(), Ok(HealthCheckType::Http));
        assert_eq!(" none ".parse::<HealthCheckType>(), Ok(HealthCheckType::None));
        assert!("tcp".parse::<HealthCheckType>().is_err());
        assert_eq!(HealthCheckType::default(), HealthCheckType::Port);
        assert_eq!(HealthCheckType::Process.to_string(), "process");
    }

    #[test]
    fn test_cm003_semantic_eq_defaults() {
        let catalog = DomainCatalog::new(["example.org"], ["cflinuxfs3"]);
        let a = DeploymentProperties::new("app");
        let mut b = a.clone();
        b.instances = Some(1);
        assert!(a.semantically_eq(&b, &catalog));
        b.instances = Some(2);
        assert!(!a.semantically_eq(&b, &catalog));
    }

    #[test]
    fn test_cm003_semantic_eq_sets() {
        let catalog = DomainCatalog::default();
        let mut a = DeploymentProperties::new("app");
        a.uris.extend(["a.x.org".to_string(), "b.x.org".to_string()]);
        a.services = vec!["s1".into(), "s2".into()];
        a.environment_variables.insert("A".into(), "1".into());
        a.environment_variables.insert("B".into(), "2".into());
        let mut b = DeploymentProperties::new("app");
        b.uris.extend(["b.x.org".to_string(), "a.x.org".to_string()]);
        b.services = vec!["s2".into(), "s1".into()];
        b.environment_variables.insert("B".into(), "2".into());
        b.environment_variables.insert("A".into(), "1".into());
        assert!(a.semantically_eq(&b, &catalog));
    }

    #[test]
    fn test_cm003_semantic_eq_ignores_irrelevant_fields() {
        let catalog = DomainCatalog::new(["example.org"], ["cflinuxfs3"]);
        let mut a = DeploymentProperties::new("app");
        a.health_check_http_endpoint = Some("/health".into());
        a.stack = Some("unknown-stack".into());
        let b = DeploymentProperties::new("app");
        assert!(a.semantically_eq(&b, &catalog));
        a.health_check_type = HealthCheckType::Http;
        assert!(!a.semantically_eq(&b, &catalog));
    }

    #[test]
    fn test_cm003_props_yaml_defaults() {
        let props: DeploymentProperties =
            serde_yaml_ng::from_str("app-name: web\nuris: [web.example.org]\n").unwrap();
        assert_eq!(props.memory, DEFAULT_MEMORY_MB);
        assert_eq!(props.disk_quota, DEFAULT_DISK_QUOTA_MB);
        assert_eq!(props.health_check_type, HealthCheckType::Port);
        assert!(props.uris.contains("web.example.org"));
    }

    #[test]
    fn test_cm003_edit_op_display() {
        assert_eq!(EditOp::insert(3, "x").to_string(), "INSERT @3 \"x\"");
        assert_eq!(EditOp::delete(3, 2).to_string(), "DELETE @3+2");
        assert_eq!(EditOp::new(3, 2, "y").to_string(), "REPLACE @3+2 \"y\"");
        assert_eq!(EditOp::new(3, 2, "y").end(), 5);
    }
}
