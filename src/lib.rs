//! cmux preview proxy - a loopback forward proxy for sandboxed previews
//!
//! Maps loopback-addressed preview traffic onto per-task backend sandboxes:
//! per-view Basic proxy credentials, hostname rewriting, pooled HTTP/2
//! sessions to sandbox multiplexers, and an on-demand certificate authority.

pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod routes;
pub mod tls;
pub mod utils;

// Re-export commonly used items
pub use config::ProxyConfig;
pub use error::{Error, Result};
pub use logging::{init_logger, init_logger_with_level, parse_level, set_proxy_logging_enabled};
pub use proxy::{PreviewProxy, ProxyAuthRegistry, ProxyCredentials, ProxyServer};
pub use routes::{resolve_route, Route};
pub use tls::CertificateManager;
