//! Proxy module: server, registry, session pool, and the facade the
//! hosting shell drives.

pub mod h2_pool;
pub mod http_client;
pub mod registry;
pub mod rewrite;
pub mod server;

pub use registry::{ProxyAuthRegistry, ProxyContext, ProxyCredentials};
pub use server::ProxyServer;

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::proxy_event;
use crate::routes::resolve_route;
use crate::tls::{CertificateData, CertificateManager};
use std::sync::Arc;

/// The preview proxy service: one listener, one credential registry, one
/// certificate authority.
pub struct PreviewProxy {
    server: ProxyServer,
    registry: Arc<ProxyAuthRegistry>,
    certificates: Arc<CertificateManager>,
}

impl PreviewProxy {
    /// Construct the service. CA load/generation failures are fatal.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let certificates = Arc::new(
            CertificateManager::new(&config.tls)
                .map_err(|e| crate::error::Error::Certificate(e.to_string()))?,
        );
        let registry = Arc::new(ProxyAuthRegistry::new());
        let server = ProxyServer::new(&config, registry.clone())?;

        crate::logging::set_proxy_logging_enabled(config.logging.proxy_events_enabled);

        Ok(Self {
            server,
            registry,
            certificates,
        })
    }

    /// Ensure the listener is running and return its port. Idempotent.
    pub fn start(&self) -> Result<u16> {
        self.server.start()
    }

    /// Configure proxying for a view. Returns None (and leaves the view on
    /// direct networking) when the URL's hostname resolves to no route.
    pub fn configure_view(
        &self,
        view_id: &str,
        initial_url: &str,
        persist_key: Option<String>,
    ) -> Result<Option<ProxyCredentials>> {
        let route = match resolve_route(initial_url) {
            Some(route) => route,
            None => {
                proxy_event!(
                    "skip-view",
                    Some(view_id),
                    "no route for {}, proxying skipped",
                    initial_url
                );
                return Ok(None);
            }
        };

        self.start()?;
        let credentials = self.registry.configure(view_id, route, persist_key)?;
        Ok(Some(credentials))
    }

    /// Drop a view's proxy context. Idempotent.
    pub fn release_view(&self, view_id: &str) -> bool {
        self.registry.release(view_id)
    }

    /// Current credentials for a configured view.
    pub fn credentials_for(&self, view_id: &str) -> Option<ProxyCredentials> {
        self.registry.credentials_for(view_id)
    }

    /// Toggle per-request proxy event logging at runtime.
    pub fn set_logging_enabled(&self, enabled: bool) {
        crate::logging::set_proxy_logging_enabled(enabled);
    }

    /// CA certificate PEM for trust-store installation.
    pub fn ca_certificate_pem(&self) -> &str {
        self.certificates.ca_certificate_pem()
    }

    /// Base64 SHA-256 SPKI digest of the CA public key.
    pub fn ca_spki_fingerprint(&self) -> &str {
        self.certificates.ca_spki_fingerprint()
    }

    /// Ready TLS server context for a hostname, for callers that terminate
    /// TLS themselves (verification harnesses).
    pub fn secure_context_for_host(&self, hostname: &str) -> Result<Arc<rustls::ServerConfig>> {
        self.certificates
            .secure_context_for_host(hostname)
            .map_err(|e| crate::error::Error::Certificate(e.to_string()))
    }

    /// Raw leaf key/cert material for a hostname.
    pub fn cert_data_for_host(&self, hostname: &str) -> Result<CertificateData> {
        self.certificates
            .cert_data_for_host(hostname)
            .map_err(|e| crate::error::Error::Certificate(e.to_string()))
    }

    /// Gracefully stop the listener.
    pub async fn stop(&self) {
        self.server.stop().await;
    }
}
