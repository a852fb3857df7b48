//! Pooled HTTP/2 sessions to sandbox multiplexer origins.
//!
//! One connection per origin: concurrent requests multiplex over the same
//! session, and concurrent connection attempts to a not-yet-connected
//! origin collapse into a single shared dial.

use crate::error::{Error, Result};
use crate::routes::CmuxProxyOrigin;
use anyhow::{anyhow, Context};
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use hyper::{Body, Response};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

type StdResult<T, E> = std::result::Result<T, E>;
type ConnectResult = StdResult<H2Session, Arc<anyhow::Error>>;
type ConnectFuture = Shared<BoxFuture<'static, ConnectResult>>;
type SessionMap = Arc<Mutex<HashMap<String, PoolEntry>>>;

const SEND_CHUNK_SIZE: usize = 16 * 1024;

/// A live multiplexed session. Cloning shares the underlying connection.
#[derive(Clone)]
pub struct H2Session {
    send: h2::client::SendRequest<Bytes>,
    closed: Arc<AtomicBool>,
    id: u64,
}

impl H2Session {
    /// The connection driver has finished; no new streams will succeed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send one request over the session. The body is pre-buffered so the
    /// caller can retry the same request elsewhere if this session fails
    /// before producing a response.
    pub async fn send_request(
        &self,
        head: http::Request<()>,
        body: Bytes,
    ) -> StdResult<Response<Body>, h2::Error> {
        let mut send = self.send.clone().ready().await?;
        let end_stream = body.is_empty();
        let (response, mut stream) = send.send_request(head, end_stream)?;

        if !end_stream {
            let mut offset = 0;
            while offset < body.len() {
                let end = (offset + SEND_CHUNK_SIZE).min(body.len());
                let last = end == body.len();
                stream.send_data(body.slice(offset..end), last)?;
                offset = end;
            }
        }

        let resp = response.await?;
        let (parts, recv) = resp.into_parts();
        Ok(Response::from_parts(parts, recv_stream_body(recv)))
    }
}

enum PoolEntry {
    Ready(H2Session),
    Connecting { id: u64, fut: ConnectFuture },
}

/// Origin-keyed pool of HTTP/2 sessions.
pub struct Http2SessionPool {
    sessions: SessionMap,
    connector: TlsConnector,
    next_id: AtomicU64,
}

impl Http2SessionPool {
    pub fn new() -> Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().map_err(Error::Io)? {
            let _ = roots.add(&rustls::Certificate(cert.0));
        }
        let mut tls = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();
        tls.alpn_protocols = vec![b"h2".to_vec()];

        Ok(Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            connector: TlsConnector::from(Arc::new(tls)),
            next_id: AtomicU64::new(0),
        })
    }

    /// Return the live session for `origin`, dialing one if needed.
    pub async fn get_session(&self, origin: &CmuxProxyOrigin) -> Result<H2Session> {
        let key = origin.authority();
        let sessions = self.sessions.clone();
        let connector = self.connector.clone();
        let host = origin.host.clone();
        let port = origin.port;
        let driver_key = key.clone();
        self.get_or_connect(key, move |id| {
            connect_tls(sessions, driver_key, host, port, connector, id).boxed()
        })
        .await
    }

    async fn get_or_connect<F>(&self, key: String, connect: F) -> Result<H2Session>
    where
        F: FnOnce(u64) -> BoxFuture<'static, ConnectResult>,
    {
        if let Some(session) = self.lookup_ready(&key) {
            // A GOAWAY can arrive before the connection driver finishes, so
            // the closed flag alone can lag. Probing readiness catches the
            // stale session here instead of sending a doomed request into it.
            if session.send.clone().ready().await.is_ok() {
                debug!("Reusing pooled h2 session for {}", key);
                return Ok(session);
            }
            debug!("Pooled h2 session for {} is stale, evicting", key);
            session.closed.store(true, Ordering::SeqCst);
            evict_if_current(&self.sessions, &key, session.id);
        }

        let (id, fut) = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
            let pending = match sessions.get(&key) {
                // A racer may have dialed a replacement in the meantime.
                Some(PoolEntry::Ready(session)) if !session.is_closed() => {
                    return Ok(session.clone());
                }
                Some(PoolEntry::Connecting { id, fut }) => Some((*id, fut.clone())),
                _ => None,
            };
            match pending {
                Some(pair) => pair,
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let fut = connect(id).shared();
                    sessions.insert(
                        key.clone(),
                        PoolEntry::Connecting {
                            id,
                            fut: fut.clone(),
                        },
                    );
                    (id, fut)
                }
            }
        };

        match fut.await {
            Ok(session) => {
                let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
                let still_pending = matches!(
                    sessions.get(&key),
                    Some(PoolEntry::Connecting { id: entry_id, .. }) if *entry_id == id
                );
                if still_pending {
                    sessions.insert(key, PoolEntry::Ready(session.clone()));
                }
                Ok(session)
            }
            Err(err) => {
                let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
                let still_pending = matches!(
                    sessions.get(&key),
                    Some(PoolEntry::Connecting { id: entry_id, .. }) if *entry_id == id
                );
                if still_pending {
                    sessions.remove(&key);
                }
                Err(Error::UpstreamConnection(format!(
                    "h2 connect to {} failed: {}",
                    key, err
                )))
            }
        }
    }

    fn lookup_ready(&self, key: &str) -> Option<H2Session> {
        let sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        match sessions.get(key) {
            Some(PoolEntry::Ready(session)) if !session.is_closed() => Some(session.clone()),
            _ => None,
        }
    }
}

/// Drop the Ready entry for `key`, but only when it still holds the session
/// identified by `id`; a newer replacement is left alone.
fn evict_if_current(sessions: &SessionMap, key: &str, id: u64) {
    let mut sessions = sessions.lock().unwrap_or_else(|p| p.into_inner());
    let is_current = matches!(
        sessions.get(key),
        Some(PoolEntry::Ready(session)) if session.id == id
    );
    if is_current {
        sessions.remove(key);
    }
}

async fn connect_tls(
    sessions: SessionMap,
    key: String,
    host: String,
    port: u16,
    connector: TlsConnector,
    id: u64,
) -> ConnectResult {
    let result: anyhow::Result<H2Session> = async {
        let tcp = TcpStream::connect((host.as_str(), port))
            .await
            .with_context(|| format!("TCP connect to {}:{}", host, port))?;
        let server_name = rustls::ServerName::try_from(host.as_str())
            .map_err(|_| anyhow!("invalid TLS server name: {}", host))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .with_context(|| format!("TLS handshake with {}", host))?;
        let (send, connection) = h2::client::handshake(tls)
            .await
            .with_context(|| format!("h2 handshake with {}", host))?;

        let closed = Arc::new(AtomicBool::new(false));
        spawn_driver(sessions, key.clone(), id, closed.clone(), connection);
        info!("🔗 Established h2 session to {}", key);

        Ok(H2Session { send, closed, id })
    }
    .await;

    result.map_err(Arc::new)
}

/// Drive the connection to completion, then mark the session closed and
/// drop it from the pool. GOAWAY and transport errors both surface as the
/// driver finishing; removal is skipped when a newer session has already
/// replaced this one.
fn spawn_driver<T>(
    sessions: SessionMap,
    key: String,
    id: u64,
    closed: Arc<AtomicBool>,
    connection: h2::client::Connection<T, Bytes>,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match connection.await {
            Ok(()) => debug!("h2 session to {} ended", key),
            Err(err) => warn!("h2 session to {} failed: {}", key, err),
        }
        closed.store(true, Ordering::SeqCst);
        evict_if_current(&sessions, &key, id);
    });
}

fn recv_stream_body(recv: h2::RecvStream) -> Body {
    let stream = futures::stream::unfold(recv, |mut recv| async move {
        match recv.data().await {
            Some(Ok(chunk)) => {
                let _ = recv.flow_control().release_capacity(chunk.len());
                Some((Ok(chunk), recv))
            }
            Some(Err(err)) => Some((Err(err), recv)),
            None => None,
        }
    });
    Body::wrap_stream(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// h2 test server answering every request with an empty 200, serving
    /// at most `max_connections` connections before shutting down.
    async fn spawn_h2_server(max_connections: usize) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for _ in 0..max_connections {
                let (socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut conn = match h2::server::handshake(socket).await {
                        Ok(conn) => conn,
                        Err(_) => return,
                    };
                    while let Some(result) = conn.accept().await {
                        let (_request, mut respond) = match result {
                            Ok(pair) => pair,
                            Err(_) => return,
                        };
                        let response = http::Response::builder().status(200).body(()).unwrap();
                        let _ = respond.send_response(response, true);
                    }
                });
            }
        });
        addr
    }

    fn test_pool() -> Http2SessionPool {
        Http2SessionPool {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            connector: TlsConnector::from(Arc::new(
                rustls::ClientConfig::builder()
                    .with_safe_defaults()
                    .with_root_certificates(rustls::RootCertStore::empty())
                    .with_no_client_auth(),
            )),
            next_id: AtomicU64::new(0),
        }
    }

    fn plain_connector(
        sessions: SessionMap,
        key: String,
        addr: SocketAddr,
        dials: Arc<AtomicUsize>,
    ) -> impl FnOnce(u64) -> BoxFuture<'static, ConnectResult> {
        move |id| {
            async move {
                dials.fetch_add(1, Ordering::SeqCst);
                let tcp = TcpStream::connect(addr)
                    .await
                    .map_err(|e| Arc::new(anyhow::Error::from(e)))?;
                let (send, connection) = h2::client::handshake(tcp)
                    .await
                    .map_err(|e| Arc::new(anyhow::Error::from(e)))?;
                let closed = Arc::new(AtomicBool::new(false));
                spawn_driver(sessions, key, id, closed.clone(), connection);
                Ok(H2Session { send, closed, id })
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn simultaneous_connects_coalesce() {
        let addr = spawn_h2_server(4).await;
        let pool = test_pool();
        let dials = Arc::new(AtomicUsize::new(0));
        let key = "origin:443".to_string();

        let a = pool.get_or_connect(
            key.clone(),
            plain_connector(pool.sessions.clone(), key.clone(), addr, dials.clone()),
        );
        let b = pool.get_or_connect(
            key.clone(),
            plain_connector(pool.sessions.clone(), key.clone(), addr, dials.clone()),
        );
        let (a, b) = tokio::join!(a, b);
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn closed_session_is_replaced() {
        let addr = spawn_h2_server(4).await;
        let pool = test_pool();
        let dials = Arc::new(AtomicUsize::new(0));
        let key = "origin:443".to_string();

        let first = pool
            .get_or_connect(
                key.clone(),
                plain_connector(pool.sessions.clone(), key.clone(), addr, dials.clone()),
            )
            .await
            .unwrap();

        // Simulate the server going away: the driver marks the session
        // closed, so the pool must dial again for the next request.
        first.closed.store(true, Ordering::SeqCst);

        let second = pool
            .get_or_connect(
                key.clone(),
                plain_connector(pool.sessions.clone(), key.clone(), addr, dials.clone()),
            )
            .await
            .unwrap();

        assert_eq!(dials.load(Ordering::SeqCst), 2);
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn goaway_session_is_replaced_on_next_request() {
        // First connection: the server announces shutdown but keeps the
        // socket open, so the client may learn of the GOAWAY before its
        // connection driver finishes. Second connection serves normally.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut conn = h2::server::handshake(socket).await.unwrap();
            conn.graceful_shutdown();
            tokio::spawn(async move {
                let _ = conn.accept().await;
                std::future::pending::<()>().await;
            });

            let (socket, _) = listener.accept().await.unwrap();
            let mut conn = h2::server::handshake(socket).await.unwrap();
            while let Some(Ok((_request, mut respond))) = conn.accept().await {
                let response = http::Response::builder().status(200).body(()).unwrap();
                let _ = respond.send_response(response, true);
            }
        });

        let pool = test_pool();
        let dials = Arc::new(AtomicUsize::new(0));
        let key = "origin:443".to_string();

        let first = pool
            .get_or_connect(
                key.clone(),
                plain_connector(pool.sessions.clone(), key.clone(), addr, dials.clone()),
            )
            .await
            .unwrap();

        // Wait until the client side has taken the GOAWAY on board.
        let mut went_away = false;
        for _ in 0..100 {
            if first.send.clone().ready().await.is_err() {
                went_away = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(went_away, "first session never observed the GOAWAY");

        let second = pool
            .get_or_connect(
                key.clone(),
                plain_connector(pool.sessions.clone(), key.clone(), addr, dials.clone()),
            )
            .await
            .unwrap();

        assert_eq!(dials.load(Ordering::SeqCst), 2);
        assert_ne!(first.id, second.id);

        let head = http::Request::builder()
            .method("GET")
            .uri("https://origin/")
            .body(())
            .unwrap();
        let resp = second.send_request(head, Bytes::new()).await.unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn connection_end_evicts_pool_entry() {
        // Server accepts exactly one connection; dropping its end closes
        // the client session.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut conn = h2::server::handshake(socket).await.unwrap();
            if let Some(Ok((_request, mut respond))) = conn.accept().await {
                let response = http::Response::builder().status(200).body(()).unwrap();
                let _ = respond.send_response(response, true);
            }
            // Flush the queued response, then close the connection with a
            // GOAWAY; dropping without polling would discard the response.
            conn.graceful_shutdown();
            let _ = futures::future::poll_fn(|cx| conn.poll_closed(cx)).await;
        });

        let pool = test_pool();
        let dials = Arc::new(AtomicUsize::new(0));
        let key = "origin:443".to_string();

        let session = pool
            .get_or_connect(
                key.clone(),
                plain_connector(pool.sessions.clone(), key.clone(), addr, dials.clone()),
            )
            .await
            .unwrap();

        let head = http::Request::builder()
            .method("GET")
            .uri("https://origin/")
            .body(())
            .unwrap();
        let resp = session.send_request(head, Bytes::new()).await.unwrap();
        assert_eq!(resp.status(), 200);

        // Wait for the driver to notice the close and evict the entry.
        let mut evicted = false;
        for _ in 0..100 {
            if pool
                .sessions
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .is_empty()
            {
                evicted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(evicted, "closed session was not removed from the pool");
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn failed_connect_clears_pending_entry() {
        let pool = test_pool();
        let key = "origin:443".to_string();

        let result = pool
            .get_or_connect(key.clone(), |_id| {
                async { Err(Arc::new(anyhow::anyhow!("dial refused"))) }.boxed()
            })
            .await;
        assert!(result.is_err());
        assert!(pool
            .sessions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_empty());
    }
}
