//! URL utility functions

use hyper::{Body, Request, Uri};

/// The target of a plain (non-CONNECT) proxy request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Path plus query, always starting with `/`.
    pub path_and_query: String,
}

impl RequestTarget {
    /// Default port implied by the scheme when the URI carries none.
    fn default_port(scheme: &str) -> u16 {
        match scheme {
            "https" | "wss" => 443,
            _ => 80,
        }
    }
}

/// Resolve the origin a proxy request is addressed to.
///
/// Forward proxies normally see an absolute-form URI; origin-form requests
/// fall back to the Host header.
pub fn parse_request_target(req: &Request<Body>) -> Result<RequestTarget, String> {
    let uri = req.uri();

    if let Some(authority) = uri.authority() {
        let scheme = uri
            .scheme_str()
            .map(normalize_ws_scheme)
            .unwrap_or_else(|| "http".to_string());
        let port = authority
            .port_u16()
            .unwrap_or_else(|| RequestTarget::default_port(&scheme));
        return Ok(RequestTarget {
            scheme,
            host: authority.host().to_string(),
            port,
            path_and_query: path_and_query_of(uri),
        });
    }

    let host_header = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "request has neither absolute URI nor Host header".to_string())?;

    let (host, port) = split_host_port(host_header)
        .ok_or_else(|| format!("invalid Host header: {}", host_header))?;

    Ok(RequestTarget {
        scheme: "http".to_string(),
        host,
        port: port.unwrap_or(80),
        path_and_query: path_and_query_of(uri),
    })
}

/// Map WebSocket schemes onto their HTTP equivalents for forwarding.
pub fn normalize_ws_scheme(scheme: &str) -> String {
    match scheme {
        "ws" => "http".to_string(),
        "wss" => "https".to_string(),
        other => other.to_string(),
    }
}

/// Split `host[:port]`, handling bracketed IPv6 literals.
pub fn split_host_port(value: &str) -> Option<(String, Option<u16>)> {
    if let Some(rest) = value.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = rest[..end].to_string();
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => Some(p.parse::<u16>().ok()?),
            None => None,
        };
        return Some((host, port));
    }

    match value.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            Some((host.to_string(), Some(port.parse::<u16>().ok()?)))
        }
        // Bare IPv6 without brackets, or no port at all
        _ => Some((value.to_string(), None)),
    }
}

fn path_and_query_of(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_uri_wins() {
        let req = Request::builder()
            .uri("http://example.com:8080/a/b?c=d")
            .header("host", "ignored.example")
            .body(Body::empty())
            .unwrap();
        let target = parse_request_target(&req).unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 8080);
        assert_eq!(target.path_and_query, "/a/b?c=d");
        assert_eq!(target.scheme, "http");
    }

    #[test]
    fn origin_form_falls_back_to_host_header() {
        let req = Request::builder()
            .uri("/index.html")
            .header("host", "localhost:3000")
            .body(Body::empty())
            .unwrap();
        let target = parse_request_target(&req).unwrap();
        assert_eq!(target.host, "localhost");
        assert_eq!(target.port, 3000);
        assert_eq!(target.path_and_query, "/index.html");
    }

    #[test]
    fn host_without_port_defaults_to_80() {
        let req = Request::builder()
            .uri("/")
            .header("host", "example.com")
            .body(Body::empty())
            .unwrap();
        let target = parse_request_target(&req).unwrap();
        assert_eq!(target.port, 80);
    }

    #[test]
    fn ws_schemes_normalize_to_http() {
        assert_eq!(normalize_ws_scheme("ws"), "http");
        assert_eq!(normalize_ws_scheme("wss"), "https");
        assert_eq!(normalize_ws_scheme("https"), "https");
    }

    #[test]
    fn splits_bracketed_ipv6() {
        assert_eq!(
            split_host_port("[::1]:8080"),
            Some(("::1".to_string(), Some(8080)))
        );
        assert_eq!(split_host_port("[::1]"), Some(("::1".to_string(), None)));
    }
}
