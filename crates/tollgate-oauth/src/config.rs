//! Proxy configuration.
//!
//! A [`ServerConfig`] is built once at startup, validated, and then shared
//! read-only by every request handler.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use axum::http::HeaderName;
use reqwest::{Certificate, Client, Identity};
use url::Url;

use crate::oauth::{ClientCredentials, RESERVED_PARAMS};

/// Default name of the subject field (header `x-subject`).
pub const DEFAULT_SUBJECT_FIELD: &str = "subject";

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8080;

/// Errors detected while loading configuration. All of them are fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A URL failed to parse or is not http(s).
    #[error("invalid {name} URL '{value}': {reason}")]
    InvalidUrl {
        name: &'static str,
        value: String,
        reason: String,
    },

    /// Unrecognised authentication mode.
    #[error("unknown auth mode '{0}' (expected CLIENT_CREDENTIALS or ACTOR_TOKEN)")]
    UnknownAuthMode(String),

    /// Subject field cannot be used as a header suffix or form parameter.
    #[error("invalid subject field '{field}': {reason}")]
    InvalidSubjectField { field: String, reason: String },

    /// Only one half of the client certificate/key pair was given.
    #[error("client certificate and key must be supplied together")]
    IncompleteClientIdentity,

    /// Failed to read a TLS file.
    #[error("failed to read '{path}': {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    /// A TLS file did not contain usable PEM material.
    #[error("invalid TLS material in '{path}': {reason}")]
    Tls { path: String, reason: String },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// AuthMode
// ─────────────────────────────────────────────────────────────────────────────

/// How a subject-scoped token is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// Exchange authenticated with the base client id and secret.
    #[default]
    ClientCredentialsExchange,
    /// Fetch the service token first and present it as the actor token.
    ActorTokenExchange,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::ClientCredentialsExchange => "CLIENT_CREDENTIALS",
            AuthMode::ActorTokenExchange => "ACTOR_TOKEN",
        }
    }
}

impl FromStr for AuthMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CLIENT_CREDENTIALS" => Ok(AuthMode::ClientCredentialsExchange),
            "ACTOR_TOKEN" => Ok(AuthMode::ActorTokenExchange),
            _ => Err(ConfigError::UnknownAuthMode(s.to_string())),
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split a comma-separated scope setting, keeping order.
///
/// An empty setting yields a single empty scope, which is then sent to the
/// token endpoint as `scope=`.
pub fn split_scopes(scope: &str) -> Vec<String> {
    scope.split(',').map(str::to_string).collect()
}

/// Header carrying the subject for a given field name: `x-<field>`.
pub fn subject_header_name(field: &str) -> Result<HeaderName, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidSubjectField {
        field: field.to_string(),
        reason: reason.to_string(),
    };

    if field.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if RESERVED_PARAMS.contains(&field) {
        return Err(invalid("collides with a token request parameter"));
    }

    HeaderName::from_bytes(format!("x-{}", field.to_ascii_lowercase()).as_bytes())
        .map_err(|_| invalid("not a valid header name"))
}

// ─────────────────────────────────────────────────────────────────────────────
// TLS
// ─────────────────────────────────────────────────────────────────────────────

/// TLS material for connections to the token endpoint.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    /// PEM client certificate (chain) for mutual TLS.
    pub client_cert: Option<PathBuf>,
    /// PEM private key matching `client_cert`.
    pub client_key: Option<PathBuf>,
    /// PEM bundle replacing the built-in trust roots.
    pub ca_bundle: Option<PathBuf>,
}

impl TlsSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.client_cert, &self.client_key) {
            (Some(_), None) | (None, Some(_)) => Err(ConfigError::IncompleteClientIdentity),
            _ => Ok(()),
        }
    }

    /// Build the HTTP client used for every token endpoint call.
    pub fn build_client(&self) -> Result<Client, ConfigError> {
        self.validate()?;

        let mut builder = Client::builder().use_rustls_tls();

        if let (Some(cert_path), Some(key_path)) = (&self.client_cert, &self.client_key) {
            let mut pem = read_pem(cert_path)?;
            pem.push(b'\n');
            pem.extend(read_pem(key_path)?);

            let identity = Identity::from_pem(&pem).map_err(|e| ConfigError::Tls {
                path: cert_path.display().to_string(),
                reason: e.to_string(),
            })?;
            builder = builder.identity(identity);
            tracing::debug!(cert = %cert_path.display(), "Loaded client certificate");
        }

        if let Some(ca_path) = &self.ca_bundle {
            let pem = read_pem(ca_path)?;
            let certs = Certificate::from_pem_bundle(&pem).map_err(|e| ConfigError::Tls {
                path: ca_path.display().to_string(),
                reason: e.to_string(),
            })?;
            if certs.is_empty() {
                return Err(ConfigError::Tls {
                    path: ca_path.display().to_string(),
                    reason: "no certificates found".to_string(),
                });
            }

            builder = builder.tls_built_in_root_certs(false);
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
            tracing::debug!(ca = %ca_path.display(), "Loaded CA bundle");
        }

        builder
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// ServerConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the proxy to.
    pub bind_address: SocketAddr,

    /// Upstream service receiving authenticated requests.
    pub upstream: Url,

    /// OAuth2 token endpoint.
    pub token_url: Url,

    /// Base service identity and requested scopes.
    pub credentials: ClientCredentials,

    /// How subject-scoped tokens are obtained.
    pub auth_mode: AuthMode,

    /// Subject field name; the header read is `x-<field>`.
    pub subject_field: String,

    /// Transport settings for the token endpoint.
    pub tls: TlsSettings,
}

impl ServerConfig {
    /// Create a config for the given upstream and token endpoint.
    pub fn new(
        upstream: &str,
        token_url: &str,
        client_id: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            upstream: parse_http_url("upstream", upstream, true)?,
            token_url: parse_http_url("token", token_url, false)?,
            credentials: ClientCredentials::new(client_id, "", split_scopes("")),
            auth_mode: AuthMode::default(),
            subject_field: DEFAULT_SUBJECT_FIELD.to_string(),
            tls: TlsSettings::default(),
        })
    }

    /// Set the bind address.
    pub fn with_bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = addr;
        self
    }

    /// Set the client secret.
    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.credentials.client_secret = secret.into();
        self
    }

    /// Set scopes from a comma-separated string.
    pub fn with_scope(mut self, scope: &str) -> Self {
        self.credentials.scopes = split_scopes(scope);
        self
    }

    /// Set the authentication mode.
    pub fn with_auth_mode(mut self, mode: AuthMode) -> Self {
        self.auth_mode = mode;
        self
    }

    /// Set the subject field name.
    pub fn with_subject_field(mut self, field: impl Into<String>) -> Self {
        self.subject_field = field.into();
        self
    }

    /// Set token endpoint TLS settings.
    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }

    /// Header carrying the subject.
    pub fn subject_header(&self) -> Result<HeaderName, ConfigError> {
        subject_header_name(&self.subject_field)
    }

    /// Check everything that can be checked without network access.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.subject_header()?;
        self.tls.validate()
    }
}

fn parse_http_url(name: &'static str, value: &str, require_host: bool) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        name,
        value: value.to_string(),
        reason,
    };

    let url = Url::parse(value).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    if require_host && url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}
