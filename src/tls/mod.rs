//! TLS module: certificate authority, leaf issuance, and caching.

pub mod ca;
pub mod cert_gen;
pub mod manager;

pub use ca::CertificateAuthority;
pub use cert_gen::CertificateData;
pub use manager::CertificateManager;
