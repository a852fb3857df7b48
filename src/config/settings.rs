//! Preview proxy configuration settings

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// First port tried when binding the proxy listener.
pub const DEFAULT_START_PORT: u16 = 39385;

/// How many consecutive ports are tried before giving up.
pub const DEFAULT_MAX_PORT_ATTEMPTS: u16 = 50;

/// Main configuration for the preview proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// First port to try when binding the loopback listener
    #[serde(default = "default_start_port")]
    pub start_port: u16,

    /// Number of consecutive ports to try before failing startup
    #[serde(default = "default_max_port_attempts")]
    pub max_port_attempts: u16,

    /// Log level configuration
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// TLS / certificate authority configuration
    #[serde(default)]
    pub tls: TlsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// HTTP client configuration
    #[serde(default)]
    pub http_client: HttpClientConfig,
}

/// TLS / certificate authority configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Directory holding the persisted CA certificate and key.
    /// Defaults to ~/.cmux-preview-proxy/ca when unset.
    pub cert_dir: Option<PathBuf>,

    /// CA certificate validity period in days
    pub ca_validity_days: u32,

    /// Leaf certificate validity period in days
    pub leaf_validity_days: u32,

    /// Organization name stamped into generated certificates
    pub cert_organization: String,

    /// Common name of the generated CA certificate
    pub ca_common_name: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit per-request proxy events at startup (can be toggled at runtime)
    pub proxy_events_enabled: bool,
}

/// HTTP client configuration for direct upstream forwarding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,

    /// Idle timeout in seconds
    pub idle_timeout_secs: u64,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
}

fn default_start_port() -> u16 {
    DEFAULT_START_PORT
}

fn default_max_port_attempts() -> u16 {
    DEFAULT_MAX_PORT_ATTEMPTS
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            start_port: DEFAULT_START_PORT,
            max_port_attempts: DEFAULT_MAX_PORT_ATTEMPTS,
            log_level: default_log_level(),
            tls: TlsConfig::default(),
            logging: LoggingConfig::default(),
            http_client: HttpClientConfig::default(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_dir: None,
            ca_validity_days: 3650,
            leaf_validity_days: 365,
            cert_organization: "cmux".to_string(),
            ca_common_name: "cmux Preview Proxy CA".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            proxy_events_enabled: false,
        }
    }
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 32,
            idle_timeout_secs: 90,
            connect_timeout_secs: 10,
        }
    }
}

impl TlsConfig {
    /// Resolve the directory where CA material lives, falling back to
    /// ~/.cmux-preview-proxy/ca when no explicit directory is configured.
    pub fn resolved_cert_dir(&self) -> PathBuf {
        if let Some(dir) = &self.cert_dir {
            return dir.clone();
        }
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        home.join(".cmux-preview-proxy").join("ca")
    }
}

impl ProxyConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: ProxyConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load configuration from an optional YAML file with environment
    /// variable overrides. A missing file is not an error; defaults apply.
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_yaml_file(p)?,
            None => {
                let default_path = Path::new("config.yml");
                if default_path.exists() {
                    Self::from_yaml_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };

        if let Ok(port) = std::env::var("PREVIEW_PROXY_START_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.start_port = port;
            }
        }

        if let Ok(attempts) = std::env::var("PREVIEW_PROXY_MAX_PORT_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse::<u16>() {
                config.max_port_attempts = attempts;
            }
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            config.log_level = log_level;
        }

        if let Ok(cert_dir) = std::env::var("PREVIEW_PROXY_CERT_DIR") {
            config.tls.cert_dir = Some(PathBuf::from(cert_dir));
        }

        if let Ok(enabled) = std::env::var("PREVIEW_PROXY_EVENTS") {
            config.logging.proxy_events_enabled = enabled.to_lowercase() == "true";
        }

        Ok(config)
    }
}
