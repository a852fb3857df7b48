//! The listening proxy: authentication, rewriting, and forwarding.

use crate::error::{Error, Result};
use crate::proxy::h2_pool::Http2SessionPool;
use crate::proxy::http_client::{build_http_client, HttpClient};
use crate::proxy::registry::{ProxyAuthRegistry, ProxyContext};
use crate::proxy::rewrite::{
    apply_cmux_headers, rewrite_target, CmuxMetadata, ProxyTarget, X_CMUX_HOST_OVERRIDE,
    X_CMUX_PORT_INTERNAL, X_CMUX_WORKSPACE_INTERNAL,
};
use crate::proxy_event;
use crate::routes::CmuxProxyOrigin;
use crate::utils::http::{
    build_error_response, build_proxy_auth_required, copy_end_to_end_headers, is_hop_by_hop_header,
    is_upgrade_request, parse_basic_proxy_auth, parse_connect_target,
};
use crate::utils::url::{parse_request_target, RequestTarget};
use crate::config::ProxyConfig;
use bytes::Bytes;
use futures::future;
use hyper::header::{HeaderValue, CONNECTION, HOST, PROXY_AUTHORIZATION};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::upgrade::Upgraded;
use hyper::{Body, Method, Request, Response, StatusCode, Uri, Version};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

const PROXY_REALM: &str = "cmux preview proxy";

struct ServerState {
    registry: Arc<ProxyAuthRegistry>,
    client: HttpClient,
    pool: Http2SessionPool,
    /// TLS connector for nested CONNECTs to multiplexer origins; no h2
    /// ALPN since the nested tunnel speaks HTTP/1.1 CONNECT.
    connect_tls: TlsConnector,
}

struct ServerRuntime {
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// Loopback forward proxy for preview views.
pub struct ProxyServer {
    state: Arc<ServerState>,
    start_port: u16,
    max_attempts: u16,
    runtime: Mutex<Option<ServerRuntime>>,
}

impl ProxyServer {
    pub fn new(config: &ProxyConfig, registry: Arc<ProxyAuthRegistry>) -> Result<Self> {
        let client = build_http_client(&config.http_client);
        let pool = Http2SessionPool::new()?;
        let connect_tls = build_connect_tls()?;

        Ok(Self {
            state: Arc::new(ServerState {
                registry,
                client,
                pool,
                connect_tls,
            }),
            start_port: config.start_port,
            max_attempts: config.max_port_attempts,
            runtime: Mutex::new(None),
        })
    }

    /// Bind and serve, scanning upward from the configured base port.
    /// Idempotent: a second call returns the existing port. Must be called
    /// from within a Tokio runtime.
    pub fn start(&self) -> Result<u16> {
        let mut runtime = self.runtime.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(rt) = runtime.as_ref() {
            return Ok(rt.port);
        }

        let mut last_err: Option<std::io::Error> = None;
        for offset in 0..self.max_attempts {
            let port = self.start_port.saturating_add(offset);
            let addr = SocketAddr::from(([127, 0, 0, 1], port));
            match std::net::TcpListener::bind(addr) {
                Ok(listener) => {
                    listener.set_nonblocking(true)?;
                    let rt = self.spawn_runtime(listener)?;
                    let bound = rt.port;
                    info!("🚀 Preview proxy listening on 127.0.0.1:{}", bound);
                    *runtime = Some(rt);
                    return Ok(bound);
                }
                Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                    last_err = Some(err);
                    continue;
                }
                Err(err) => {
                    return Err(Error::Bind(format!("port {}: {}", port, err)));
                }
            }
        }

        Err(Error::Bind(format!(
            "no free port in {}..{}: {}",
            self.start_port,
            self.start_port.saturating_add(self.max_attempts),
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".into())
        )))
    }

    fn spawn_runtime(&self, listener: std::net::TcpListener) -> Result<ServerRuntime> {
        let state = self.state.clone();
        let make_svc = make_service_fn(move |conn: &AddrStream| {
            let remote_addr = conn.remote_addr();
            let state = state.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    handle_request(state.clone(), remote_addr, req)
                }))
            }
        });

        let server = hyper::Server::from_tcp(listener)
            .map_err(|e| Error::Bind(e.to_string()))?
            .serve(make_svc);
        let port = server.local_addr().port();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let graceful = server.with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                error!("preview proxy server error: {}", err);
            }
        });

        Ok(ServerRuntime {
            port,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    /// Port the server is currently bound to, if started.
    pub fn port(&self) -> Option<u16> {
        self.runtime
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|rt| rt.port)
    }

    /// Gracefully stop the listener. Safe to call when not started.
    pub async fn stop(&self) {
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(mut rt) = runtime {
            if let Some(tx) = rt.shutdown.take() {
                let _ = tx.send(());
            }
            let _ = (&mut rt.task).await;
        }
    }
}

fn build_connect_tls() -> Result<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().map_err(Error::Io)? {
        let _ = roots.add(&rustls::Certificate(cert.0));
    }
    let tls = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(tls)))
}

async fn handle_request(
    state: Arc<ServerState>,
    remote_addr: SocketAddr,
    req: Request<Body>,
) -> std::result::Result<Response<Body>, Infallible> {
    let context = match authenticate(&state, req.headers()) {
        Ok(ctx) => ctx,
        Err(resp) => return Ok(resp),
    };

    if req.method() == Method::CONNECT {
        return Ok(handle_connect(state, context, remote_addr, req).await);
    }

    if is_upgrade_request(&req) {
        return Ok(handle_upgrade(state, context, remote_addr, req).await);
    }

    Ok(handle_http(state, context, remote_addr, req).await)
}

/// Every request must carry valid Basic proxy credentials; anything else
/// gets a generic challenge and is never forwarded.
fn authenticate(
    state: &ServerState,
    headers: &hyper::HeaderMap,
) -> std::result::Result<Arc<ProxyContext>, Response<Body>> {
    let (username, password) =
        parse_basic_proxy_auth(headers).ok_or_else(|| build_proxy_auth_required(PROXY_REALM))?;
    state
        .registry
        .authenticate(&username, &password)
        .ok_or_else(|| build_proxy_auth_required(PROXY_REALM))
}

async fn handle_http(
    state: Arc<ServerState>,
    context: Arc<ProxyContext>,
    remote_addr: SocketAddr,
    req: Request<Body>,
) -> Response<Body> {
    let target = match parse_request_target(&req) {
        Ok(target) => target,
        Err(msg) => return build_error_response(StatusCode::BAD_REQUEST, &msg),
    };
    let rewritten = rewrite_target(&target, Some(&context.route));

    proxy_event!(
        "http-request",
        Some(context.view_id.as_str()),
        "client={} host={} rewritten_host={}:{}",
        remote_addr,
        target.host,
        rewritten.host,
        rewritten.port
    );

    let (parts, body) = req.into_parts();

    if let Some(meta) = rewritten.cmux.clone() {
        // Buffer the body so the same request can be replayed over a
        // direct connection if the pooled session fails before any
        // response bytes reach the client.
        let body_bytes = match hyper::body::to_bytes(body).await {
            Ok(bytes) => bytes,
            Err(err) => {
                return build_error_response(
                    StatusCode::BAD_GATEWAY,
                    &format!("failed to read request body: {}", err),
                )
            }
        };

        match forward_via_pool(&state, &rewritten, &meta, &parts, body_bytes.clone()).await {
            Ok(resp) => return resp,
            Err(err) => {
                warn!(
                    "pooled h2 request to {} failed, retrying direct: {}",
                    rewritten.host, err
                );
                return forward_direct(&state, &rewritten, &parts, Body::from(body_bytes)).await;
            }
        }
    }

    forward_direct(&state, &rewritten, &parts, body).await
}

async fn forward_via_pool(
    state: &ServerState,
    rewritten: &ProxyTarget,
    meta: &CmuxMetadata,
    parts: &http::request::Parts,
    body: Bytes,
) -> anyhow::Result<Response<Body>> {
    let origin = CmuxProxyOrigin {
        host: rewritten.host.clone(),
        port: rewritten.port,
    };
    let session = state.pool.get_session(&origin).await?;

    let mut head = http::Request::builder()
        .method(parts.method.clone())
        .uri(rewritten.uri_string())
        .version(http::Version::HTTP_2)
        .body(())?;
    copy_end_to_end_headers(&parts.headers, head.headers_mut());
    // h2 carries the authority in the URI, not a Host header.
    head.headers_mut().remove(HOST);
    apply_cmux_headers(head.headers_mut(), meta);

    let resp = session.send_request(head, body).await?;
    Ok(sanitize_response(resp))
}

async fn forward_direct(
    state: &ServerState,
    rewritten: &ProxyTarget,
    parts: &http::request::Parts,
    body: Body,
) -> Response<Body> {
    let uri: Uri = match rewritten.uri_string().parse() {
        Ok(uri) => uri,
        Err(_) => return build_error_response(StatusCode::BAD_REQUEST, "invalid rewritten uri"),
    };

    let mut new_req = match Request::builder()
        .method(parts.method.clone())
        .uri(uri)
        .body(body)
    {
        Ok(req) => req,
        Err(_) => {
            return build_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to build upstream request",
            )
        }
    };
    *new_req.version_mut() = Version::HTTP_11;

    copy_end_to_end_headers(&parts.headers, new_req.headers_mut());
    if let Ok(host) = HeaderValue::from_str(&rewritten.authority()) {
        new_req.headers_mut().insert(HOST, host);
    }
    if let Some(meta) = &rewritten.cmux {
        apply_cmux_headers(new_req.headers_mut(), meta);
    }

    match state.client.request(new_req).await {
        Ok(resp) => sanitize_response(resp),
        Err(err) => build_error_response(
            StatusCode::BAD_GATEWAY,
            &format!("upstream request failed: {}", err),
        ),
    }
}

/// Mirror an upstream response minus hop-by-hop headers.
fn sanitize_response(resp: Response<Body>) -> Response<Body> {
    let (parts, body) = resp.into_parts();
    let mut builder = Response::builder().status(parts.status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in parts.headers.iter() {
            if !is_hop_by_hop_header(name.as_str()) {
                headers.append(name.clone(), value.clone());
            }
        }
    }
    builder
        .body(body)
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

async fn handle_connect(
    state: Arc<ServerState>,
    context: Arc<ProxyContext>,
    remote_addr: SocketAddr,
    mut req: Request<Body>,
) -> Response<Body> {
    let (host, port) = match connect_target(&req) {
        Some(pair) => pair,
        None => return build_error_response(StatusCode::BAD_REQUEST, "invalid CONNECT target"),
    };

    let target = RequestTarget {
        scheme: "https".to_string(),
        host: host.clone(),
        port,
        path_and_query: "/".to_string(),
    };
    let rewritten = rewrite_target(&target, Some(&context.route));

    proxy_event!(
        "connect-request",
        Some(context.view_id.as_str()),
        "client={} target={}:{} rewritten_host={}:{}",
        remote_addr,
        host,
        port,
        rewritten.host,
        rewritten.port
    );

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(CONNECTION, HeaderValue::from_static("upgrade"))
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty()));

    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(mut upgraded) => {
                let result = match rewritten.cmux.clone() {
                    Some(meta) => tunnel_via_cmux(&state, &rewritten, &meta, &mut upgraded).await,
                    None => tunnel_direct(&rewritten, &mut upgraded).await,
                };
                if let Err(err) = result {
                    warn!("CONNECT tunnel to {} failed: {}", rewritten.host, err);
                    let _ = upgraded
                        .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n")
                        .await;
                    let _ = upgraded.shutdown().await;
                }
            }
            Err(err) => warn!("CONNECT upgrade error: {}", err),
        }
    });

    response
}

fn connect_target(req: &Request<Body>) -> Option<(String, u16)> {
    if let Some(authority) = req.uri().authority() {
        return Some((
            authority.host().to_string(),
            authority.port_u16().unwrap_or(443),
        ));
    }
    parse_connect_target(&req.uri().to_string()).ok()
}

/// Splice the caller against the rewritten host:port; opaque bytes only,
/// no TLS termination on this path.
async fn tunnel_direct(rewritten: &ProxyTarget, upgraded: &mut Upgraded) -> anyhow::Result<()> {
    let mut upstream = TcpStream::connect((rewritten.host.as_str(), rewritten.port)).await?;
    if let Err(err) = copy_bidirectional(upgraded, &mut upstream).await {
        debug!("CONNECT tunnel ended: {}", err);
    }
    let _ = upgraded.shutdown().await;
    let _ = upstream.shutdown().await;
    Ok(())
}

/// Serialize the nested CONNECT request sent to a multiplexer origin. The
/// routing headers name the real internal host; the caller's proxy
/// credentials are never part of it.
fn build_cmux_connect_request(meta: &CmuxMetadata) -> String {
    let mut head = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\n",
        meta.host_override, meta.host_override
    );
    head.push_str(&format!("{}: {}\r\n", X_CMUX_PORT_INTERNAL, meta.upstream_port));
    head.push_str(&format!("{}: {}\r\n", X_CMUX_HOST_OVERRIDE, meta.host_override));
    if let Some(workspace) = &meta.workspace {
        head.push_str(&format!("{}: {}\r\n", X_CMUX_WORKSPACE_INTERNAL, workspace));
    }
    head.push_str("\r\n");
    head
}

/// Tunnel through the sandbox multiplexer: TLS to the origin, a nested
/// CONNECT naming the real internal host, then a byte-for-byte splice.
async fn tunnel_via_cmux(
    state: &ServerState,
    rewritten: &ProxyTarget,
    meta: &CmuxMetadata,
    upgraded: &mut Upgraded,
) -> anyhow::Result<()> {
    let tcp = TcpStream::connect((rewritten.host.as_str(), rewritten.port)).await?;
    let server_name = rustls::ServerName::try_from(rewritten.host.as_str())
        .map_err(|_| anyhow::anyhow!("invalid TLS server name: {}", rewritten.host))?;
    let mut tls = state.connect_tls.connect(server_name, tcp).await?;

    let connect_req = build_cmux_connect_request(meta);
    tls.write_all(connect_req.as_bytes()).await?;

    // Read the multiplexer's response head; anything past the blank line
    // already belongs to the tunnel.
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 512];
    let head_end = loop {
        let n = tls.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("multiplexer closed connection during CONNECT");
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 8192 {
            anyhow::bail!("oversized CONNECT response from multiplexer");
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]);
    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("");
    if status != "200" {
        anyhow::bail!("multiplexer refused CONNECT: status {}", status);
    }

    if head_end < buf.len() {
        upgraded.write_all(&buf[head_end..]).await?;
    }

    if let Err(err) = copy_bidirectional(upgraded, &mut tls).await {
        debug!("cmux CONNECT tunnel ended: {}", err);
    }
    let _ = upgraded.shutdown().await;
    let _ = tls.shutdown().await;
    Ok(())
}

async fn handle_upgrade(
    state: Arc<ServerState>,
    context: Arc<ProxyContext>,
    remote_addr: SocketAddr,
    mut req: Request<Body>,
) -> Response<Body> {
    let target = match parse_request_target(&req) {
        Ok(target) => target,
        Err(msg) => return build_error_response(StatusCode::BAD_REQUEST, &msg),
    };
    let rewritten = rewrite_target(&target, Some(&context.route));

    proxy_event!(
        "upgrade-request",
        Some(context.view_id.as_str()),
        "client={} host={} rewritten_host={}:{}",
        remote_addr,
        target.host,
        rewritten.host,
        rewritten.port
    );

    let uri: Uri = match rewritten.uri_string().parse() {
        Ok(uri) => uri,
        Err(_) => return build_error_response(StatusCode::BAD_REQUEST, "invalid rewritten uri"),
    };

    let mut proxied_req = match Request::builder()
        .method(req.method().clone())
        .uri(uri)
        .body(Body::empty())
    {
        Ok(r) => r,
        Err(_) => {
            return build_error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to build upgrade request",
            )
        }
    };
    *proxied_req.version_mut() = Version::HTTP_11;

    // Upgrades need Connection/Upgrade forwarded intact; only the proxy
    // credentials are dropped.
    for (name, value) in req.headers().iter() {
        if name == PROXY_AUTHORIZATION {
            continue;
        }
        proxied_req.headers_mut().insert(name.clone(), value.clone());
    }
    if let Ok(host) = HeaderValue::from_str(&rewritten.authority()) {
        proxied_req.headers_mut().insert(HOST, host);
    }
    if let Some(meta) = &rewritten.cmux {
        apply_cmux_headers(proxied_req.headers_mut(), meta);
    }

    let mut upstream_resp = match state.client.request(proxied_req).await {
        Ok(resp) => resp,
        Err(err) => {
            return build_error_response(
                StatusCode::BAD_GATEWAY,
                &format!("upstream upgrade failed: {}", err),
            )
        }
    };

    if upstream_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
        return sanitize_response(upstream_resp);
    }

    let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in upstream_resp.headers().iter() {
            headers.insert(name.clone(), value.clone());
        }
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    }
    let client_resp = builder
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty()));

    tokio::spawn(async move {
        match future::try_join(
            hyper::upgrade::on(&mut req),
            hyper::upgrade::on(&mut upstream_resp),
        )
        .await
        {
            Ok((mut client_upgraded, mut upstream_upgraded)) => {
                if let Err(err) =
                    copy_bidirectional(&mut client_upgraded, &mut upstream_upgraded).await
                {
                    debug!("upgrade tunnel ended: {}", err);
                }
                let _ = client_upgraded.shutdown().await;
                let _ = upstream_upgraded.shutdown().await;
            }
            Err(err) => warn!("upgrade splice error: {}", err),
        }
    });

    client_resp
}
