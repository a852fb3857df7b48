//! Route resolution: mapping preview hostnames onto backend sandboxes.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

/// Port of the sandbox-internal multiplexer every backend exposes.
pub const CMUX_PROXY_PORT: u16 = 39_379;

/// Workspace label used when a hostname does not name one explicitly.
pub const DEFAULT_SCOPE: &str = "base";

const MORPH_DOMAIN_SUFFIX: &str = "http.cloud.morph.so";
const MORPH_DEFAULT_DOMAIN: &str = "cmux.app";

/// Domains whose `cmux-<id>-<scope>-<port>` subdomains are intercepted.
pub const CMUX_DOMAINS: &[&str] = &[
    "cmux.app",
    "cmux.sh",
    "cmux.dev",
    "cmux.local",
    "cmux.localhost",
    "autobuild.app",
];

/// The HTTP/2-reachable origin of a sandbox's internal multiplexer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CmuxProxyOrigin {
    pub host: String,
    pub port: u16,
}

impl CmuxProxyOrigin {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Identifies the backend sandbox a preview view is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Opaque sandbox instance id.
    pub id: String,
    /// Workspace scope label, `"base"` when unspecified.
    pub scope: String,
    /// Domain suffix used when synthesizing preview hostnames.
    pub domain_suffix: String,
    /// Origin of the sandbox's internal multiplexer, when reachable.
    pub cmux_proxy_origin: Option<CmuxProxyOrigin>,
}

impl Route {
    /// Synthesize the public preview hostname for a given backend port.
    pub fn preview_host(&self, port: u16) -> String {
        format!(
            "cmux-{}-{}-{}.{}",
            self.id, self.scope, port, self.domain_suffix
        )
    }
}

fn morph_domain_regex() -> &'static Regex {
    static REGEX: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^port-(\d+)-morphvm-([^.]+)\.http\.cloud\.morph\.so$").unwrap());
    &REGEX
}

/// Resolve a Route from a URL. Unparseable URLs and unrecognized hostnames
/// yield None, which callers treat as "do not intercept".
pub fn resolve_route(initial_url: &str) -> Option<Route> {
    let parsed = Url::parse(initial_url).ok()?;
    let hostname = parsed.host_str()?.to_ascii_lowercase();
    resolve_route_for_hostname(&hostname)
}

/// Resolve a Route from an already-extracted lowercase hostname.
pub fn resolve_route_for_hostname(hostname: &str) -> Option<Route> {
    if let Some(captures) = morph_domain_regex().captures(hostname) {
        let morph_id = captures.get(2)?.as_str().to_string();
        if morph_id.is_empty() {
            return None;
        }
        // The multiplexer sits on the same VM, exposed through the same
        // port-in-hostname scheme as the original port.
        let origin_host = format!("port-{}-morphvm-{}.{}", CMUX_PROXY_PORT, morph_id, MORPH_DOMAIN_SUFFIX);
        return Some(Route {
            id: morph_id,
            scope: DEFAULT_SCOPE.to_string(),
            domain_suffix: MORPH_DEFAULT_DOMAIN.to_string(),
            cmux_proxy_origin: Some(CmuxProxyOrigin {
                host: origin_host,
                port: 443,
            }),
        });
    }

    for domain in CMUX_DOMAINS {
        let suffix = format!(".{domain}");
        if !hostname.ends_with(&suffix) {
            continue;
        }
        let subdomain = hostname.trim_end_matches(&suffix);
        if !subdomain.starts_with("cmux-") {
            continue;
        }
        let remainder = &subdomain[5..];
        let mut segments: Vec<&str> = remainder.split('-').filter(|s| !s.is_empty()).collect();
        if segments.len() < 3 {
            continue;
        }
        let port_segment = segments.pop().unwrap_or_default();
        let scope_segment = segments.pop().unwrap_or_default();
        if port_segment.parse::<u16>().is_err() {
            continue;
        }
        let id = segments.join("-");
        if id.is_empty() {
            continue;
        }
        let origin_host = format!("cmux-{}-{}-{}.{}", id, scope_segment, CMUX_PROXY_PORT, domain);
        return Some(Route {
            id,
            scope: scope_segment.to_string(),
            domain_suffix: domain.to_string(),
            cmux_proxy_origin: Some(CmuxProxyOrigin {
                host: origin_host,
                port: 443,
            }),
        });
    }

    None
}
