//! Main entry point for the cmux preview proxy

use clap::{Parser, Subcommand};
use cmux_preview_proxy::{
    init_logger, init_logger_with_level, log_info, parse_level, set_proxy_logging_enabled,
    CertificateManager, PreviewProxy, ProxyConfig,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cmux-preview-proxy")]
#[command(about = "Loopback forward proxy mapping preview traffic onto sandbox backends")]
struct Cli {
    /// Path to a YAML configuration file (defaults to ./config.yml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the proxy server until interrupted
    Serve {
        /// Log every proxied request as a structured event
        #[arg(long)]
        verbose_events: bool,
    },
    /// Print the CA certificate (or its SPKI fingerprint) for trust-store installation
    Ca {
        /// Print the base64 SHA-256 SPKI fingerprint instead of the PEM
        #[arg(long)]
        fingerprint: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = ProxyConfig::load_config(cli.config.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::process::exit(1);
    });

    // Plain level names map directly; filter-style values (or anything
    // unrecognized) are left to EnvFilter via RUST_LOG.
    match parse_level(&config.log_level) {
        Some(level) => init_logger_with_level(level),
        None => init_logger(),
    }

    match cli.command {
        Command::Serve { verbose_events } => {
            let proxy = PreviewProxy::new(config).unwrap_or_else(|e| {
                eprintln!("Failed to initialize preview proxy: {}", e);
                std::process::exit(1);
            });
            if verbose_events {
                set_proxy_logging_enabled(true);
            }

            let port = proxy.start().unwrap_or_else(|e| {
                eprintln!("Failed to start preview proxy: {}", e);
                std::process::exit(1);
            });
            log_info!("Preview proxy ready on 127.0.0.1:{}", port);
            log_info!("CA fingerprint: {}", proxy.ca_spki_fingerprint());

            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("Failed to wait for shutdown signal: {}", e);
            }
            log_info!("Shutting down preview proxy");
            proxy.stop().await;
        }
        Command::Ca { fingerprint } => {
            let manager = CertificateManager::new(&config.tls).unwrap_or_else(|e| {
                eprintln!("Failed to load certificate authority: {}", e);
                std::process::exit(1);
            });
            if fingerprint {
                println!("{}", manager.ca_spki_fingerprint());
            } else {
                print!("{}", manager.ca_certificate_pem());
            }
        }
    }
}
