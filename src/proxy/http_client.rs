//! Shared hyper client for direct upstream forwarding.

use crate::config::HttpClientConfig;
use hyper::client::HttpConnector;
use hyper::{Body, Client};
use hyper_rustls::HttpsConnectorBuilder;
use std::time::Duration;
use tracing::debug;

pub type HttpClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>;

/// Build the client used for plain forwarding and WebSocket upgrades.
/// Speaks both HTTP/1.1 and HTTP/2 to upstreams, negotiated per connection.
pub fn build_http_client(config: &HttpClientConfig) -> HttpClient {
    debug!(
        "Building upstream HTTP client (max_idle_per_host: {}, idle_timeout: {}s)",
        config.max_idle_per_host, config.idle_timeout_secs
    );

    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(Duration::from_secs(config.connect_timeout_secs)));

    let https = HttpsConnectorBuilder::new()
        .with_native_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder()
        .pool_max_idle_per_host(config.max_idle_per_host)
        .pool_idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .http2_adaptive_window(true)
        .build(https)
}
