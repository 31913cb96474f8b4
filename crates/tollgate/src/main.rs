//! Tollgate - OAuth 2.0 token-exchange reverse proxy
//!
//! Main entry point: reads configuration from flags and environment, sets up
//! logging and serves until interrupted.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use tollgate_oauth::config::{DEFAULT_PORT, DEFAULT_SUBJECT_FIELD};
use tollgate_oauth::{AuthMode, ProxyServer, ServerConfig, TlsSettings};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Tollgate - OAuth 2.0 token-exchange reverse proxy
///
/// Attaches a client-credentials or exchanged bearer token to every request
/// and forwards it to the upstream service.
#[derive(Parser, Debug)]
#[command(name = "tollgate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Upstream service URL
    #[arg(long, env = "UPSTREAM")]
    pub upstream: String,

    /// OAuth2 token endpoint URL
    #[arg(long, env = "TOKEN_URL")]
    pub token_url: String,

    /// OAuth2 client id
    #[arg(long, env = "CLIENT_ID")]
    pub client_id: String,

    /// OAuth2 client secret
    #[arg(long, env = "CLIENT_SECRET", default_value = "", hide_env_values = true)]
    pub client_secret: String,

    /// Comma-separated scopes
    #[arg(long, env = "SCOPE", default_value = "")]
    pub scope: String,

    /// Client certificate (PEM) for mutual TLS to the token endpoint
    #[arg(long, env = "CERT_PATH")]
    pub cert_path: Option<PathBuf>,

    /// Client private key (PEM) matching --cert-path
    #[arg(long, env = "KEY_PATH")]
    pub key_path: Option<PathBuf>,

    /// CA bundle (PEM) trusted for the token endpoint
    #[arg(long, env = "CACERT_PATH")]
    pub cacert_path: Option<PathBuf>,

    /// How subject tokens are obtained: CLIENT_CREDENTIALS or ACTOR_TOKEN
    #[arg(long, env = "TOKEN_EXCHANGE_AUTH_MODE", default_value = "CLIENT_CREDENTIALS")]
    pub auth_mode: String,

    /// Subject field name; the subject is read from header x-<field>
    #[arg(long, env = "TOKEN_EXCHANGE_SUBJECT_FIELD", default_value = DEFAULT_SUBJECT_FIELD)]
    pub subject_field: String,

    /// Listen port
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Listen address
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: IpAddr,

    /// Log level: debug, info, warn, error or fatal
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format: text or json
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,
}

impl Cli {
    /// Turn the parsed arguments into a validated proxy configuration.
    pub fn into_config(self) -> Result<ServerConfig> {
        let auth_mode: AuthMode = self.auth_mode.parse()?;

        let config = ServerConfig::new(&self.upstream, &self.token_url, self.client_id)?
            .with_bind_address(SocketAddr::new(self.bind_address, self.port))
            .with_client_secret(self.client_secret)
            .with_scope(&self.scope)
            .with_auth_mode(auth_mode)
            .with_subject_field(self.subject_field)
            .with_tls(TlsSettings {
                client_cert: self.cert_path,
                client_key: self.key_path,
                ca_bundle: self.cacert_path,
            });

        config.validate()?;
        Ok(config)
    }
}

/// Map a `LOG_LEVEL` value onto a tracing directive.
fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "fatal" => "error",
        _ => "info",
    }
}

fn init_tracing(log_level: &str, log_format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(log_level)));

    let registry = tracing_subscriber::registry().with(filter);
    if log_format.eq_ignore_ascii_case("json") {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutting down");
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, &cli.log_format);

    let config = cli.into_config().context("Invalid configuration")?;
    let server = ProxyServer::new(&config).context("Failed to initialise proxy")?;

    server
        .run_until(shutdown_signal())
        .await
        .with_context(|| format!("Failed to serve on {}", config.bind_address))
}
