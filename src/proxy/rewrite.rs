//! Target rewriting: mapping loopback destinations onto sandbox backends.

use crate::routes::Route;
use crate::utils::url::RequestTarget;
use hyper::header::{HeaderMap, HeaderValue};
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::net::IpAddr;

pub const X_CMUX_PORT_INTERNAL: &str = "x-cmux-port-internal";
pub const X_CMUX_HOST_OVERRIDE: &str = "x-cmux-host-override";
pub const X_CMUX_WORKSPACE_INTERNAL: &str = "x-cmux-workspace-internal";

const LOOPBACK_SUFFIX: &str = ".localhost";

/// Extra routing information attached to targets reached through a
/// sandbox multiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmuxMetadata {
    /// `<originalHost>:<port>` the multiplexer should present upstream.
    pub host_override: String,
    /// Backend port inside the sandbox.
    pub upstream_port: u16,
    /// Workspace scope, omitted for the default scope.
    pub workspace: Option<String>,
}

/// Where a proxied request actually goes after rewriting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path_and_query: String,
    pub cmux: Option<CmuxMetadata>,
}

impl ProxyTarget {
    pub fn authority(&self) -> String {
        let default = if self.is_secure() { 443 } else { 80 };
        if self.port == default {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == "https"
    }

    pub fn uri_string(&self) -> String {
        format!("{}://{}{}", self.scheme, self.authority(), self.path_and_query)
    }
}

/// Apply the rewrite rule: loopback hosts belonging to a routed view are
/// redirected at the backend sandbox; everything else passes through to
/// its literal destination.
pub fn rewrite_target(target: &RequestTarget, route: Option<&Route>) -> ProxyTarget {
    let route = match route {
        Some(route) if is_loopback_hostname(&target.host) => route,
        _ => {
            return ProxyTarget {
                scheme: target.scheme.clone(),
                host: target.host.clone(),
                port: target.port,
                path_and_query: target.path_and_query.clone(),
                cmux: None,
            };
        }
    };

    let requested_port = target.port;

    if let Some(origin) = &route.cmux_proxy_origin {
        let workspace = if route.scope == crate::routes::DEFAULT_SCOPE {
            None
        } else {
            Some(route.scope.clone())
        };
        return ProxyTarget {
            scheme: "https".to_string(),
            host: origin.host.clone(),
            port: origin.port,
            path_and_query: target.path_and_query.clone(),
            cmux: Some(CmuxMetadata {
                host_override: format!("{}:{}", target.host, requested_port),
                upstream_port: requested_port,
                workspace,
            }),
        };
    }

    ProxyTarget {
        scheme: "https".to_string(),
        host: route.preview_host(requested_port),
        port: 443,
        path_and_query: target.path_and_query.clone(),
        cmux: None,
    }
}

/// Inject the multiplexer routing headers for a cmux-bound request.
pub fn apply_cmux_headers(headers: &mut HeaderMap, meta: &CmuxMetadata) {
    if let Ok(value) = HeaderValue::from_str(&meta.upstream_port.to_string()) {
        headers.insert(X_CMUX_PORT_INTERNAL, value);
    }
    if let Ok(value) = HeaderValue::from_str(&meta.host_override) {
        headers.insert(X_CMUX_HOST_OVERRIDE, value);
    }
    if let Some(workspace) = &meta.workspace {
        if let Ok(value) = HeaderValue::from_str(workspace) {
            headers.insert(X_CMUX_WORKSPACE_INTERNAL, value);
        }
    }
}

/// Whether a hostname refers to the local machine.
pub fn is_loopback_hostname(hostname: &str) -> bool {
    let lower = hostname.to_ascii_lowercase();
    static STATIC_HOSTS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
        HashSet::from([
            "localhost",
            "127.0.0.1",
            "0.0.0.0",
            "::1",
            "[::1]",
            "::ffff:127.0.0.1",
            "[::ffff:127.0.0.1]",
        ])
    });
    if STATIC_HOSTS.contains(lower.as_str()) {
        return true;
    }
    if lower.ends_with(LOOPBACK_SUFFIX) {
        return true;
    }
    if let Ok(addr) = lower.parse::<IpAddr>() {
        return match addr {
            IpAddr::V4(v4) => v4.octets()[0] == 127,
            IpAddr::V6(v6) => v6.is_loopback(),
        };
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::resolve_route;

    fn target(scheme: &str, host: &str, port: u16) -> RequestTarget {
        RequestTarget {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            path_and_query: "/".to_string(),
        }
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback_hostname("localhost"));
        assert!(is_loopback_hostname("LOCALHOST"));
        assert!(is_loopback_hostname("127.0.0.1"));
        assert!(is_loopback_hostname("127.8.9.10"));
        assert!(is_loopback_hostname("::1"));
        assert!(is_loopback_hostname("app.localhost"));
        assert!(!is_loopback_hostname("example.com"));
        assert!(!is_loopback_hostname("192.168.1.5"));
    }

    #[test]
    fn loopback_with_origin_gets_cmux_metadata() {
        let route = resolve_route("https://cmux-abc-myws-8080.cmux.app").unwrap();
        let rewritten = rewrite_target(&target("http", "localhost", 3000), Some(&route));

        assert_eq!(rewritten.scheme, "https");
        assert_eq!(rewritten.host, "cmux-abc-myws-39379.cmux.app");
        assert_eq!(rewritten.port, 443);
        let meta = rewritten.cmux.unwrap();
        assert_eq!(meta.host_override, "localhost:3000");
        assert_eq!(meta.upstream_port, 3000);
        assert_eq!(meta.workspace.as_deref(), Some("myws"));
    }

    #[test]
    fn default_scope_omits_workspace() {
        let route = resolve_route("https://cmux-abc-base-8080.cmux.app").unwrap();
        let rewritten = rewrite_target(&target("http", "127.0.0.1", 3000), Some(&route));
        assert_eq!(rewritten.cmux.unwrap().workspace, None);
    }

    #[test]
    fn loopback_without_origin_synthesizes_preview_host() {
        let mut route = resolve_route("https://cmux-abc-base-8080.cmux.dev").unwrap();
        route.cmux_proxy_origin = None;
        let rewritten = rewrite_target(&target("https", "localhost", 443), Some(&route));

        assert_eq!(rewritten.host, "cmux-abc-base-443.cmux.dev");
        assert_eq!(rewritten.port, 443);
        assert!(rewritten.cmux.is_none());
    }

    #[test]
    fn non_loopback_passes_through() {
        let route = resolve_route("https://cmux-abc-base-8080.cmux.app").unwrap();
        let original = target("https", "example.com", 8443);
        let rewritten = rewrite_target(&original, Some(&route));
        assert_eq!(rewritten.host, "example.com");
        assert_eq!(rewritten.port, 8443);
        assert!(rewritten.cmux.is_none());
    }

    #[test]
    fn no_route_passes_through() {
        let rewritten = rewrite_target(&target("http", "localhost", 3000), None);
        assert_eq!(rewritten.host, "localhost");
        assert_eq!(rewritten.port, 3000);
        assert!(rewritten.cmux.is_none());
    }

    #[test]
    fn cmux_headers_carry_port_and_override() {
        let meta = CmuxMetadata {
            host_override: "localhost:3000".to_string(),
            upstream_port: 3000,
            workspace: None,
        };
        let mut headers = HeaderMap::new();
        apply_cmux_headers(&mut headers, &meta);
        assert_eq!(headers.get(X_CMUX_PORT_INTERNAL).unwrap(), "3000");
        assert_eq!(headers.get(X_CMUX_HOST_OVERRIDE).unwrap(), "localhost:3000");
        assert!(headers.get(X_CMUX_WORKSPACE_INTERNAL).is_none());
    }
}
