//! CM-008: Manifest generation from `DeploymentProperties` to a key/value tree.
//!
//! Keys are emitted in a fixed canonical order and only when they differ
//! from their defaults, so a generated manifest parses back to the same
//! properties.

use super::catalog::DomainCatalog;
use super::error::ManifestError;
use super::resolver::{format_memory, RouteLayout, RouteValue};
use super::types::*;
use serde_yaml_ng::{Mapping, Value};
use tracing::debug;

/// Canonical position of a key inside a generated application block.
/// Unknown keys sort last.
pub fn key_rank(key: &str) -> usize {
    const ORDER: [&str; 21] = [
        "name",
        "memory",
        "disk_quota",
        "instances",
        "timeout",
        "health-check-type",
        "health-check-http-endpoint",
        "command",
        "stack",
        "services",
        "env",
        "buildpack",
        "buildpacks",
        "host",
        "hosts",
        "domain",
        "domains",
        "no-hostname",
        "random-route",
        "no-route",
        "routes",
    ];
    ORDER.iter().position(|k| *k == key).unwrap_or(ORDER.len())
}

/// Convert one route-key value to a tree node.
pub fn route_value(value: &RouteValue) -> Value {
    match value {
        RouteValue::Flag(b) => Value::Bool(*b),
        RouteValue::Text(s) => Value::String(s.clone()),
        RouteValue::List(items) => string_list(items),
        RouteValue::Routes(routes) => Value::Sequence(
            routes
                .iter()
                .map(|r| {
                    let mut m = Mapping::new();
                    m.insert("route".into(), Value::String(r.clone()));
                    Value::Mapping(m)
                })
                .collect(),
        ),
    }
}

pub fn string_list(items: &[String]) -> Value {
    Value::Sequence(items.iter().cloned().map(Value::String).collect())
}

pub fn string_map<'a>(entries: impl IntoIterator<Item = (&'a String, &'a String)>) -> Value {
    let mut m = Mapping::new();
    for (k, v) in entries {
        m.insert(Value::String(k.clone()), Value::String(v.clone()));
    }
    Value::Mapping(m)
}

/// Keys and values describing `props`, in canonical order.
pub fn app_entries(props: &DeploymentProperties, catalog: &DomainCatalog) -> Vec<(String, Value)> {
    let mut out: Vec<(String, Value)> = Vec::new();
    let mut put = |key: &str, value: Value| out.push((key.to_string(), value));

    put("name", Value::String(props.app_name.clone()));
    put("memory", Value::String(format_memory(props.memory)));
    if props.disk_quota != DEFAULT_DISK_QUOTA_MB {
        put("disk_quota", Value::String(format_memory(props.disk_quota)));
    }
    if props.effective_instances() != DEFAULT_INSTANCES {
        put("instances", Value::Number(props.effective_instances().into()));
    }
    if let Some(t) = props.timeout {
        put("timeout", Value::Number(t.into()));
    }
    if props.health_check_type != HealthCheckType::Port {
        put(
            "health-check-type",
            Value::String(props.health_check_type.as_str().to_string()),
        );
    }
    if let Some(endpoint) = props.effective_endpoint() {
        put("health-check-http-endpoint", Value::String(endpoint.to_string()));
    }
    if let Some(c) = &props.command {
        put("command", Value::String(c.clone()));
    }
    if let Some(s) = props.effective_stack(catalog) {
        put("stack", Value::String(s.to_string()));
    }
    if !props.services.is_empty() {
        put("services", string_list(&props.services));
    }
    if !props.environment_variables.is_empty() {
        put("env", string_map(&props.environment_variables));
    }
    if let Some(b) = &props.buildpack {
        put("buildpack", Value::String(b.clone()));
    }
    let buildpacks: Vec<String> = props.buildpack_list().into_iter().map(str::to_string).collect();
    if !buildpacks.is_empty() {
        put("buildpacks", string_list(&buildpacks));
    }

    let layout = RouteLayout::choose(&props.uris, catalog);
    debug!(app = %props.app_name, layout = %layout, "chose route layout");
    for (key, value) in layout.entries() {
        put(key, route_value(&value));
    }
    out
}

/// The application element for `props`.
pub fn generate_app(props: &DeploymentProperties, catalog: &DomainCatalog) -> KeyValueTree {
    let mut m = Mapping::new();
    for (k, v) in app_entries(props, catalog) {
        m.insert(Value::String(k), v);
    }
    Value::Mapping(m)
}

/// A complete manifest holding only `props`.
pub fn generate(props: &DeploymentProperties, catalog: &DomainCatalog) -> KeyValueTree {
    let mut root = Mapping::new();
    root.insert(
        "applications".into(),
        Value::Sequence(vec![generate_app(props, catalog)]),
    );
    Value::Mapping(root)
}

/// Serialize a tree as block-style YAML with an explicit document start.
pub fn to_yaml(tree: &KeyValueTree) -> Result<String, ManifestError> {
    let body = serde_yaml_ng::to_string(tree)?;
    Ok(format!("---\n{}", body))
}

/// `generate` followed by `to_yaml`.
pub fn generate_text(props: &DeploymentProperties, catalog: &DomainCatalog) -> Result<String, ManifestError> {
    to_yaml(&generate(props, catalog))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::parse_manifest;

    fn catalog() -> DomainCatalog {
        DomainCatalog::new(["springsource.org", "spring.io"], ["cflinuxfs3"])
    }

    fn app_keys(tree: &KeyValueTree) -> Vec<String> {
        let app = &tree["applications"][0];
        app.as_mapping()
            .unwrap()
            .keys()
            .map(|k| k.as_str().unwrap().to_string())
            .collect()
    }

    fn round_trip(props: &DeploymentProperties) -> DeploymentProperties {
        let text = generate_text(props, &catalog()).unwrap();
        let parsed = parse_manifest(&text, &catalog());
        assert!(parsed.errors.is_empty(), "{:?}\n{}", parsed.errors, text);
        parsed.applications.into_iter().next().unwrap()
    }

    #[test]
    fn test_cm008_minimal() {
        let props = DeploymentProperties::new("app");
        let tree = generate(&props, &catalog());
        assert_eq!(app_keys(&tree), vec!["name", "memory", "no-route"]);
        assert_eq!(tree["applications"][0]["memory"], Value::String("1024M".into()));
        assert_eq!(tree["applications"][0]["no-route"], Value::Bool(true));
    }

    #[test]
    fn test_cm008_canonical_order() {
        let mut props = DeploymentProperties::new("app");
        props.buildpack = Some("java".into());
        props.services = vec!["db".into()];
        props.instances = Some(2);
        props.health_check_type = HealthCheckType::Http;
        props.health_check_http_endpoint = Some("/h".into());
        props.uris.insert("app.spring.io".into());
        let tree = generate(&props, &catalog());
        assert_eq!(
            app_keys(&tree),
            vec![
                "name",
                "memory",
                "instances",
                "health-check-type",
                "health-check-http-endpoint",
                "services",
                "buildpack",
                "host",
                "domain"
            ]
        );
    }

    #[test]
    fn test_cm008_port_and_stray_endpoint_omitted() {
        let mut props = DeploymentProperties::new("app");
        props.health_check_http_endpoint = Some("/ignored".into());
        props.stack = Some("not-in-catalog".into());
        let keys = app_keys(&generate(&props, &catalog()));
        assert!(!keys.iter().any(|k| k.starts_with("health-check")));
        assert!(!keys.contains(&"stack".to_string()));
    }

    #[test]
    fn test_cm008_routes_with_path() {
        let mut props = DeploymentProperties::new("app");
        props.uris.insert("app.springsource.org/myPath/more".into());
        let tree = generate(&props, &catalog());
        assert_eq!(
            tree["applications"][0]["routes"][0]["route"],
            Value::String("app.springsource.org/myPath/more".into())
        );
        assert_eq!(round_trip(&props).uris, props.uris);
    }

    #[test]
    fn test_cm008_hosts_domains_round_trip() {
        let mut props = DeploymentProperties::new("app");
        for u in ["a.spring.io", "a.springsource.org", "b.spring.io", "b.springsource.org"] {
            props.uris.insert(u.into());
        }
        let tree = generate(&props, &catalog());
        assert!(tree["applications"][0]["hosts"].is_sequence());
        assert!(tree["applications"][0]["domains"].is_sequence());
        let back = round_trip(&props);
        assert!(back.semantically_eq(&props, &catalog()));
    }

    #[test]
    fn test_cm008_no_hostname_round_trip() {
        let mut props = DeploymentProperties::new("app");
        props.uris.insert("spring.io".into());
        let tree = generate(&props, &catalog());
        assert_eq!(tree["applications"][0]["no-hostname"], Value::Bool(true));
        assert_eq!(round_trip(&props).uris, props.uris);
    }

    #[test]
    fn test_cm008_unknown_domain_round_trip() {
        let mut props = DeploymentProperties::new("app");
        props.uris.insert("app.example.com".into());
        assert_eq!(round_trip(&props).uris, props.uris);
    }

    #[test]
    fn test_cm008_full_round_trip() {
        let mut props = DeploymentProperties::new("full");
        props.memory = 2048;
        props.disk_quota = 512;
        props.instances = Some(3);
        props.timeout = Some(90);
        props.command = Some("run --fast".into());
        props.buildpack = Some("java_buildpack".into());
        props.stack = Some("cflinuxfs3".into());
        props.services = vec!["db".into(), "mq".into()];
        props.environment_variables.insert("PORT".into(), "8080".into());
        props.environment_variables.insert("FLAG".into(), "true".into());
        props.health_check_type = HealthCheckType::Process;
        props.uris.insert("tcp.spring.io:9003".into());
        let back = round_trip(&props);
        assert!(back.semantically_eq(&props, &catalog()), "{:?}", back);
    }

    #[test]
    fn test_cm008_text_has_document_start() {
        let text = generate_text(&DeploymentProperties::new("x"), &catalog()).unwrap();
        assert!(text.starts_with("---\napplications:\n"));
    }

    #[test]
    fn test_cm008_buildpacks_deduplicated_in_order() {
        let mut props = DeploymentProperties::new("app");
        props.buildpack = Some("legacy".into());
        props.buildpacks = vec!["nodejs".into(), "java".into(), "nodejs".into()];
        let tree = generate(&props, &catalog());
        let app = &tree["applications"][0];
        assert_eq!(app["buildpacks"], string_list(&["nodejs".to_string(), "java".to_string()]));
        let keys = app_keys(&tree);
        let pos = |k: &str| keys.iter().position(|x| x == k).unwrap();
        assert_eq!(pos("buildpacks"), pos("buildpack") + 1);
        assert!(round_trip(&props).semantically_eq(&props, &catalog()));
    }

    #[test]
    fn test_cm008_key_rank() {
        assert!(key_rank("name") < key_rank("memory"));
        assert!(key_rank("buildpack") < key_rank("host"));
        assert_eq!(key_rank("path"), key_rank("unknown"));
    }
}
