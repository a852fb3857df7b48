//! Configuration module for the preview proxy

pub mod settings;

pub use settings::{HttpClientConfig, LoggingConfig, ProxyConfig, TlsConfig};
