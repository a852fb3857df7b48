//! Error handling module for the preview proxy

use thiserror::Error;

/// Custom error type for the preview proxy
#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("HTTP/2 error: {0}")]
    Http2(#[from] h2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Upstream connection error: {0}")]
    UpstreamConnection(String),

    #[error("View {0} already has an active proxy context")]
    ViewAlreadyConfigured(String),

    #[error("Unable to bind proxy listener: {0}")]
    Bind(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Result type for the preview proxy
pub type Result<T> = std::result::Result<T, Error>;

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Unknown(err.to_string())
    }
}
