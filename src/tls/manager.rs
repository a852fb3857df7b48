//! Certificate manager: per-hostname TLS contexts backed by the CA.

use crate::config::TlsConfig;
use crate::tls::ca::CertificateAuthority;
use crate::tls::cert_gen::{issue_leaf, CertificateData};
use anyhow::{anyhow, Result};
use rustls::{Certificate as RustlsCertificate, PrivateKey, ServerConfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Owns the CA and caches issued material per hostname.
///
/// Two caches are kept: ready rustls server contexts, and raw PEM/DER
/// material for callers that terminate TLS themselves. Both are filled
/// lazily; repeated hosts never pay a second key generation.
pub struct CertificateManager {
    ca: CertificateAuthority,
    ca_der: Vec<u8>,
    leaf_validity_days: u32,
    contexts: Mutex<HashMap<String, Arc<ServerConfig>>>,
    materials: Mutex<HashMap<String, CertificateData>>,
}

impl CertificateManager {
    /// Load or create the CA per the TLS configuration. CA failures are
    /// fatal here; the proxy never runs without its trust anchor.
    pub fn new(tls_config: &TlsConfig) -> Result<Self> {
        let dir = tls_config.resolved_cert_dir();
        let ca = CertificateAuthority::load_or_generate(
            &dir,
            &tls_config.cert_organization,
            &tls_config.ca_common_name,
            tls_config.ca_validity_days,
        )?;

        let (_, pem) = x509_parser::pem::parse_x509_pem(ca.certificate_pem().as_bytes())
            .map_err(|e| anyhow!("Failed to parse CA PEM: {}", e))?;
        let ca_der = pem.contents.clone();

        Ok(Self {
            ca,
            ca_der,
            leaf_validity_days: tls_config.leaf_validity_days,
            contexts: Mutex::new(HashMap::new()),
            materials: Mutex::new(HashMap::new()),
        })
    }

    /// Return the cached TLS server context for `hostname`, issuing a new
    /// leaf on first use.
    pub fn secure_context_for_host(&self, hostname: &str) -> Result<Arc<ServerConfig>> {
        if let Some(ctx) = self
            .contexts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(hostname)
        {
            debug!("TLS context cache hit for {}", hostname);
            return Ok(ctx.clone());
        }

        let leaf = issue_leaf(&self.ca, hostname, self.leaf_validity_days)?;
        let chain = vec![
            RustlsCertificate(leaf.cert_der.clone()),
            RustlsCertificate(self.ca_der.clone()),
        ];
        let mut config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(chain, PrivateKey(leaf.key_der.clone()))
            .map_err(|e| anyhow!("Failed to build TLS context for {}: {}", hostname, e))?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        let ctx = Arc::new(config);
        let mut contexts = self.contexts.lock().unwrap_or_else(|p| p.into_inner());
        // A concurrent issuer may have won the race; keep whichever entry
        // landed first so callers keep seeing one identity per host.
        let entry = contexts
            .entry(hostname.to_string())
            .or_insert_with(|| ctx.clone());
        Ok(entry.clone())
    }

    /// Return raw PEM key/cert material for `hostname`, cached separately
    /// from the ready contexts.
    pub fn cert_data_for_host(&self, hostname: &str) -> Result<CertificateData> {
        if let Some(data) = self
            .materials
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(hostname)
        {
            return Ok(data.clone());
        }

        let leaf = issue_leaf(&self.ca, hostname, self.leaf_validity_days)?;
        let mut materials = self.materials.lock().unwrap_or_else(|p| p.into_inner());
        let entry = materials
            .entry(hostname.to_string())
            .or_insert(leaf);
        Ok(entry.clone())
    }

    /// PEM text of the CA certificate.
    pub fn ca_certificate_pem(&self) -> &str {
        self.ca.certificate_pem()
    }

    /// Base64 SHA-256 digest of the CA public key, for pinning display.
    pub fn ca_spki_fingerprint(&self) -> &str {
        self.ca.spki_fingerprint()
    }
}
