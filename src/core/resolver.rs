//! CM-006: Memory units, route classification, and route layout selection.
//!
//! A route `host.domain[/path][:port]` is split against the domain catalog by
//! longest known-domain suffix; unknown domains fall back to "everything after
//! the first label". Layout selection picks the most compact manifest keys
//! that reproduce a set of routes exactly.

use super::catalog::DomainCatalog;
use indexmap::IndexSet;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

static MEMORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\s*([MmGg][Bb]?)?$").expect("memory regex is valid")
});

/// Parse a memory quantity into megabytes. Accepts `512`, `512M`, `512MB`,
/// `1G`, `1GB` (case-insensitive). Zero and overflow are rejected.
pub fn parse_memory(text: &str) -> Option<u32> {
    let caps = MEMORY_RE.captures(text.trim())?;
    let amount: u32 = caps.get(1)?.as_str().parse().ok()?;
    let factor = match caps.get(2).map(|m| m.as_str().as_bytes()[0]) {
        Some(b'G' | b'g') => 1024,
        _ => 1,
    };
    amount.checked_mul(factor).filter(|mb| *mb > 0)
}

pub fn format_memory(mb: u32) -> String {
    format!("{}M", mb)
}

/// A route split into its components. `raw` is the text it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub host: Option<String>,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub port: Option<u16>,
    pub raw: String,
}

impl Route {
    pub fn parse(uri: &str, catalog: &DomainCatalog) -> Self {
        let (host_port, path) = match uri.find('/') {
            Some(i) => (&uri[..i], Some(uri[i..].to_string())),
            None => (uri, None),
        };
        let (host_part, port) = split_port(host_port);

        let (host, domain) = match catalog.longest_suffix(host_part) {
            Some(d) if d == host_part => (None, Some(d.to_string())),
            Some(d) => (
                Some(host_part[..host_part.len() - d.len() - 1].to_string()),
                Some(d.to_string()),
            ),
            None => match host_part.split_once('.') {
                Some((h, d)) => (non_empty(h), non_empty(d)),
                None => (non_empty(host_part), None),
            },
        };

        Self {
            host,
            domain,
            path,
            port,
            raw: uri.to_string(),
        }
    }

    /// True when `host` and `domain` alone reproduce the raw text.
    pub fn is_host_domain_only(&self) -> bool {
        match (&self.host, &self.domain) {
            (Some(h), Some(d)) => {
                self.path.is_none() && self.port.is_none() && format!("{}.{}", h, d) == self.raw
            }
            _ => false,
        }
    }

    /// True for a bare domain with no host, path or port.
    pub fn is_bare_domain(&self) -> bool {
        self.host.is_none()
            && self.path.is_none()
            && self.port.is_none()
            && self.domain.as_deref() == Some(self.raw.as_str())
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn split_port(host_port: &str) -> (&str, Option<u16>) {
    if host_port.matches(':').count() == 1 {
        if let Some((h, p)) = host_port.split_once(':') {
            if let Ok(port) = p.parse::<u16>() {
                return (h, Some(port));
            }
        }
    }
    (host_port, None)
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Expand hosts × domains (host-major). With no hosts the domains themselves
/// are the routes; with no domains the hosts are.
pub fn expand_routes(hosts: &[String], domains: &[String]) -> IndexSet<String> {
    match (hosts.is_empty(), domains.is_empty()) {
        (true, _) => domains.iter().cloned().collect(),
        (false, true) => hosts.iter().cloned().collect(),
        (false, false) => hosts
            .iter()
            .flat_map(|h| domains.iter().map(move |d| format!("{}.{}", h, d)))
            .collect(),
    }
}

/// Manifest representation chosen for a set of routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteLayout {
    NoRoute,
    HostsDomains {
        hosts: Vec<String>,
        domains: Vec<String>,
    },
    NoHostname {
        domains: Vec<String>,
    },
    Routes(Vec<String>),
}

/// Value of one route-related manifest key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteValue {
    Flag(bool),
    Text(String),
    List(Vec<String>),
    Routes(Vec<String>),
}

/// Every manifest key that contributes to an application's routes.
pub const ROUTE_KEYS: [&str; 8] = [
    "host",
    "hosts",
    "domain",
    "domains",
    "no-hostname",
    "random-route",
    "no-route",
    "routes",
];

impl RouteLayout {
    pub fn choose(uris: &IndexSet<String>, catalog: &DomainCatalog) -> Self {
        if uris.is_empty() {
            return Self::NoRoute;
        }
        let routes: Vec<Route> = uris.iter().map(|u| Route::parse(u, catalog)).collect();

        if routes.iter().all(Route::is_bare_domain) {
            return Self::NoHostname {
                domains: routes.iter().filter_map(|r| r.domain.clone()).collect(),
            };
        }

        if routes.iter().all(Route::is_host_domain_only) {
            let mut hosts: IndexSet<&str> = IndexSet::new();
            let mut domains: IndexSet<&str> = IndexSet::new();
            for r in &routes {
                hosts.extend(r.host.as_deref());
                domains.extend(r.domain.as_deref());
            }
            if hosts.len() * domains.len() == routes.len() {
                return Self::HostsDomains {
                    hosts: hosts.iter().map(|s| s.to_string()).collect(),
                    domains: domains.iter().map(|s| s.to_string()).collect(),
                };
            }
        }

        Self::Routes(uris.iter().cloned().collect())
    }

    /// Manifest keys and values for this layout, in writing order.
    pub fn entries(&self) -> Vec<(&'static str, RouteValue)> {
        fn one_or_many(
            single: &'static str,
            plural: &'static str,
            values: &[String],
        ) -> (&'static str, RouteValue) {
            match values {
                [one] => (single, RouteValue::Text(one.clone())),
                many => (plural, RouteValue::List(many.to_vec())),
            }
        }
        match self {
            Self::NoRoute => vec![("no-route", RouteValue::Flag(true))],
            Self::HostsDomains { hosts, domains } => vec![
                one_or_many("host", "hosts", hosts),
                one_or_many("domain", "domains", domains),
            ],
            Self::NoHostname { domains } => vec![
                one_or_many("domain", "domains", domains),
                ("no-hostname", RouteValue::Flag(true)),
            ],
            Self::Routes(routes) => vec![("routes", RouteValue::Routes(routes.clone()))],
        }
    }
}

impl fmt::Display for RouteLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRoute => write!(f, "no-route"),
            Self::HostsDomains { hosts, domains } => {
                write!(f, "hosts[{}] x domains[{}]", hosts.len(), domains.len())
            }
            Self::NoHostname { domains } => write!(f, "no-hostname domains[{}]", domains.len()),
            Self::Routes(r) => write!(f, "routes[{}]", r.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> DomainCatalog {
        DomainCatalog::new(["springsource.org", "spring.io"], Vec::<String>::new())
    }

    fn set(items: &[&str]) -> IndexSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_cm006_parse_memory_units() {
        assert_eq!(parse_memory("512"), Some(512));
        assert_eq!(parse_memory("512M"), Some(512));
        assert_eq!(parse_memory("512mb"), Some(512));
        assert_eq!(parse_memory("1G"), Some(1024));
        assert_eq!(parse_memory("2gb"), Some(2048));
        assert_eq!(parse_memory(" 64 M "), Some(64));
    }

    #[test]
    fn test_cm006_parse_memory_invalid() {
        assert_eq!(parse_memory("0"), None);
        assert_eq!(parse_memory("0G"), None);
        assert_eq!(parse_memory("-1M"), None);
        assert_eq!(parse_memory("1T"), None);
        assert_eq!(parse_memory("lots"), None);
        assert_eq!(parse_memory(""), None);
        assert_eq!(parse_memory("99999999G"), None);
    }

    #[test]
    fn test_cm006_format_memory() {
        assert_eq!(format_memory(512), "512M");
        assert_eq!(parse_memory(&format_memory(3072)), Some(3072));
    }

    #[test]
    fn test_cm006_route_known_domain() {
        let r = Route::parse("my-app.springsource.org", &catalog());
        assert_eq!(r.host.as_deref(), Some("my-app"));
        assert_eq!(r.domain.as_deref(), Some("springsource.org"));
        assert!(r.is_host_domain_only());
    }

    #[test]
    fn test_cm006_route_multi_segment_host() {
        let r = Route::parse("a.b.spring.io", &catalog());
        assert_eq!(r.host.as_deref(), Some("a.b"));
        assert_eq!(r.domain.as_deref(), Some("spring.io"));
    }

    #[test]
    fn test_cm006_route_bare_domain() {
        let r = Route::parse("spring.io", &catalog());
        assert_eq!(r.host, None);
        assert!(r.is_bare_domain());
    }

    #[test]
    fn test_cm006_route_unknown_domain_fallback() {
        let r = Route::parse("app.example.com", &catalog());
        assert_eq!(r.host.as_deref(), Some("app"));
        assert_eq!(r.domain.as_deref(), Some("example.com"));
        let r = Route::parse("localhost", &catalog());
        assert_eq!(r.host.as_deref(), Some("localhost"));
        assert_eq!(r.domain, None);
    }

    #[test]
    fn test_cm006_route_path_and_port() {
        let r = Route::parse("app.springsource.org/myPath/more", &catalog());
        assert_eq!(r.path.as_deref(), Some("/myPath/more"));
        assert_eq!(r.host.as_deref(), Some("app"));
        assert!(!r.is_host_domain_only());

        let r = Route::parse("tcp.springsource.org:9003", &catalog());
        assert_eq!(r.port, Some(9003));
        assert_eq!(r.host.as_deref(), Some("tcp"));

        let r = Route::parse("tcp.springsource.org:http", &catalog());
        assert_eq!(r.port, None);
        assert_eq!(r.raw, "tcp.springsource.org:http");
    }

    #[test]
    fn test_cm006_expand_routes() {
        let hosts = vec!["a".to_string(), "b".to_string()];
        let domains = vec!["x.org".to_string(), "y.org".to_string()];
        let uris: Vec<_> = expand_routes(&hosts, &domains).into_iter().collect();
        assert_eq!(uris, vec!["a.x.org", "a.y.org", "b.x.org", "b.y.org"]);
        assert_eq!(expand_routes(&[], &domains).len(), 2);
        assert_eq!(expand_routes(&hosts, &[]).len(), 2);
    }

    #[test]
    fn test_cm006_layout_no_route() {
        assert_eq!(RouteLayout::choose(&IndexSet::new(), &catalog()), RouteLayout::NoRoute);
    }

    #[test]
    fn test_cm006_layout_product() {
        let uris = set(&["a.springsource.org", "b.springsource.org", "a.spring.io", "b.spring.io"]);
        match RouteLayout::choose(&uris, &catalog()) {
            RouteLayout::HostsDomains { hosts, domains } => {
                assert_eq!(hosts, vec!["a", "b"]);
                assert_eq!(domains, vec!["springsource.org", "spring.io"]);
            }
            other => panic!("unexpected layout {:?}", other),
        }
    }

    #[test]
    fn test_cm006_layout_incomplete_product_uses_routes() {
        let uris = set(&["a.springsource.org", "b.springsource.org", "a.spring.io"]);
        assert!(matches!(RouteLayout::choose(&uris, &catalog()), RouteLayout::Routes(_)));
    }

    #[test]
    fn test_cm006_layout_path_forces_routes() {
        let uris = set(&["app.springsource.org", "app.springsource.org/myPath/more"]);
        match RouteLayout::choose(&uris, &catalog()) {
            RouteLayout::Routes(r) => assert_eq!(r.len(), 2),
            other => panic!("unexpected layout {:?}", other),
        }
    }

    #[test]
    fn test_cm006_layout_bare_domains() {
        let uris = set(&["springsource.org", "spring.io"]);
        assert_eq!(
            RouteLayout::choose(&uris, &catalog()),
            RouteLayout::NoHostname {
                domains: vec!["springsource.org".into(), "spring.io".into()]
            }
        );
    }

    #[test]
    fn test_cm006_layout_entries() {
        let single = RouteLayout::HostsDomains {
            hosts: vec!["a".into()],
            domains: vec!["x.org".into()],
        };
        let keys: Vec<_> = single.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["host", "domain"]);
        let multi = RouteLayout::HostsDomains {
            hosts: vec!["a".into(), "b".into()],
            domains: vec!["x.org".into()],
        };
        let keys: Vec<_> = multi.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["hosts", "domain"]);
        for (key, _) in RouteLayout::NoRoute.entries() {
            assert!(ROUTE_KEYS.contains(&key));
        }
    }
}
