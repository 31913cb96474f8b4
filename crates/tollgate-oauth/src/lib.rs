//! Authenticating OAuth2 reverse proxy.
//!
//! Every inbound request is given a bearer token before it is relayed to a
//! single upstream. Requests without a subject get the proxy's own service
//! token (client-credentials grant, cached until shortly before expiry).
//! Requests naming a subject in the `x-<field>` header get a fresh token from
//! an RFC 8693 token exchange.
//!
//! # Components
//!
//! - [`config`]: startup configuration, auth modes and TLS material
//! - [`oauth`]: token endpoint wire protocol
//! - [`token_source`]: cached client-credentials token source
//! - [`exchange`]: token exchange requests
//! - [`authenticator`]: per-request token decision
//! - [`forwarder`]: upstream relay
//! - [`proxy`]: axum server tying it together

pub mod authenticator;
pub mod config;
pub mod error;
pub mod exchange;
pub mod forwarder;
pub mod oauth;
pub mod proxy;
pub mod token_source;

pub use authenticator::{AuthError, RequestAuthenticator};
pub use config::{AuthMode, ConfigError, ServerConfig, TlsSettings};
pub use error::{OAuthError, Result};
pub use exchange::{ExchangeRequest, HttpTokenExchanger, SharedTokenExchanger, TokenExchanger};
pub use forwarder::{ForwardError, Forwarder};
pub use oauth::{ClientCredentials, OAuthToken, TokenEndpoint};
pub use proxy::{ProxyError, ProxyServer};
pub use token_source::{ClientCredentialsTokenSource, SharedTokenSource, TokenSource};
