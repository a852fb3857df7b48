//! HTTP utility functions

use base64::Engine;
use hyper::header::{HeaderMap, HeaderValue, PROXY_AUTHORIZATION};
use hyper::{Body, Request, Response, StatusCode};

/// Check if a header is a hop-by-hop header
pub fn is_hop_by_hop_header(name: &str) -> bool {
    let hop_by_hop_headers = [
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "proxy-connection",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ];

    hop_by_hop_headers.contains(&name.to_lowercase().as_str())
}

/// Copy end-to-end headers from a proxy request into an upstream request.
///
/// Skips hop-by-hop headers, any header named in the Connection header,
/// and the proxy credentials themselves.
pub fn copy_end_to_end_headers(src: &HeaderMap, dst: &mut HeaderMap) {
    let mut connection_listed: Vec<String> = Vec::new();
    for value in src.get_all(hyper::header::CONNECTION) {
        if let Ok(s) = value.to_str() {
            for token in s.split(',') {
                let token = token.trim().to_lowercase();
                if !token.is_empty() {
                    connection_listed.push(token);
                }
            }
        }
    }

    for (name, value) in src {
        let lower = name.as_str().to_lowercase();
        if is_hop_by_hop_header(&lower) || connection_listed.contains(&lower) {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }
}

/// Parse host and port from a CONNECT target (`host:port`).
pub fn parse_connect_target(target: &str) -> Result<(String, u16), String> {
    // Bracketed IPv6 first: [::1]:443
    if let Some(rest) = target.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = rest[..end].to_string();
            let port = rest[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse::<u16>().ok())
                .ok_or_else(|| format!("Invalid CONNECT target format: {}", target))?;
            return Ok((host, port));
        }
        return Err(format!("Invalid CONNECT target format: {}", target));
    }

    let (host, port_str) = target
        .rsplit_once(':')
        .ok_or_else(|| format!("Invalid CONNECT target format: {}", target))?;
    if host.is_empty() {
        return Err(format!("Invalid CONNECT target format: {}", target));
    }
    let port = port_str
        .parse::<u16>()
        .map_err(|_| format!("Invalid CONNECT target format: {}", target))?;

    Ok((host.to_string(), port))
}

/// Build error response
pub fn build_error_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message.to_string()))
        .unwrap_or_else(|_| {
            let mut resp = Response::new(Body::empty());
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        })
}

/// Build a 407 challenge telling the client which realm to authenticate for.
pub fn build_proxy_auth_required(realm: &str) -> Response<Body> {
    let mut resp = build_error_response(StatusCode::PROXY_AUTHENTICATION_REQUIRED, "");
    if let Ok(value) = HeaderValue::from_str(&format!("Basic realm=\"{}\"", realm)) {
        resp.headers_mut()
            .insert(hyper::header::PROXY_AUTHENTICATE, value);
    }
    resp
}

/// Extract the username and password from a Basic Proxy-Authorization header.
/// Returns None for missing, malformed, or non-Basic credentials.
pub fn parse_basic_proxy_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(PROXY_AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ").or_else(|| value.strip_prefix("basic "))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Encode Basic credentials for an outbound Authorization-style header.
pub fn encode_basic_auth(username: &str, password: &str) -> String {
    let raw = format!("{}:{}", username, password);
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(raw.as_bytes())
    )
}

/// Check whether a request asks for a protocol upgrade (e.g. WebSocket).
pub fn is_upgrade_request(req: &Request<Body>) -> bool {
    let has_upgrade = req.headers().contains_key(hyper::header::UPGRADE);
    let connection_upgrade = req
        .headers()
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    has_upgrade && connection_upgrade
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_covers_proxy_connection() {
        assert!(is_hop_by_hop_header("Proxy-Connection"));
        assert!(is_hop_by_hop_header("transfer-encoding"));
        assert!(!is_hop_by_hop_header("content-type"));
    }

    #[test]
    fn connect_target_parses_host_and_port() {
        assert_eq!(
            parse_connect_target("example.com:443").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            parse_connect_target("[::1]:8443").unwrap(),
            ("::1".to_string(), 8443)
        );
        assert!(parse_connect_target("example.com").is_err());
        assert!(parse_connect_target("example.com:notaport").is_err());
    }

    #[test]
    fn basic_auth_round_trip() {
        let mut headers = HeaderMap::new();
        headers.insert(
            PROXY_AUTHORIZATION,
            HeaderValue::from_str(&encode_basic_auth("view-1", "s3cret")).unwrap(),
        );
        assert_eq!(
            parse_basic_proxy_auth(&headers).unwrap(),
            ("view-1".to_string(), "s3cret".to_string())
        );
    }

    #[test]
    fn rejects_non_basic_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert(
            PROXY_AUTHORIZATION,
            HeaderValue::from_static("Bearer abc123"),
        );
        assert!(parse_basic_proxy_auth(&headers).is_none());
    }

    #[test]
    fn copy_skips_hop_by_hop_and_connection_listed() {
        let mut src = HeaderMap::new();
        src.insert(hyper::header::CONNECTION, HeaderValue::from_static("x-drop-me"));
        src.insert("x-drop-me", HeaderValue::from_static("1"));
        src.insert("x-keep-me", HeaderValue::from_static("2"));
        src.insert(PROXY_AUTHORIZATION, HeaderValue::from_static("Basic abc"));

        let mut dst = HeaderMap::new();
        copy_end_to_end_headers(&src, &mut dst);

        assert!(dst.get("x-drop-me").is_none());
        assert!(dst.get(PROXY_AUTHORIZATION).is_none());
        assert!(dst.get(hyper::header::CONNECTION).is_none());
        assert_eq!(dst.get("x-keep-me").unwrap(), "2");
    }

    #[test]
    fn upgrade_detection_requires_both_headers() {
        let req = Request::builder()
            .header("connection", "keep-alive, Upgrade")
            .header("upgrade", "websocket")
            .body(Body::empty())
            .unwrap();
        assert!(is_upgrade_request(&req));

        let plain = Request::builder().body(Body::empty()).unwrap();
        assert!(!is_upgrade_request(&plain));
    }

    #[test]
    fn challenge_carries_realm() {
        let resp = build_proxy_auth_required("cmux preview proxy");
        assert_eq!(resp.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(
            resp.headers().get("proxy-authenticate").unwrap(),
            "Basic realm=\"cmux preview proxy\""
        );
    }
}
