//! Base service token source.
//!
//! Obtains the proxy's own token with a client-credentials grant and caches it
//! across requests until it is about to expire.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::oauth::{ClientCredentials, OAuthToken, TokenEndpoint};

/// Tokens are refreshed this many seconds before they expire.
const EXPIRY_DELTA_SECS: i64 = 10;

// ============================================================================
// TokenSource Trait
// ============================================================================

/// Source of the base service token.
///
/// Implementations must be safe to call from any number of concurrent
/// request handlers and handle their own synchronisation.
#[async_trait]
pub trait TokenSource: Send + Sync + std::fmt::Debug {
    /// Return a valid token, fetching a new one if necessary.
    async fn token(&self) -> Result<OAuthToken>;
}

/// Shared token source for use across request handlers.
pub type SharedTokenSource = Arc<dyn TokenSource>;

// ============================================================================
// ClientCredentialsTokenSource
// ============================================================================

/// Client-credentials token source with an in-memory cache.
///
/// The cache lock is held while a refresh is in flight, so concurrent callers
/// wait for a single token request instead of each issuing their own.
#[derive(Debug)]
pub struct ClientCredentialsTokenSource {
    endpoint: TokenEndpoint,
    credentials: ClientCredentials,
    cached: Mutex<Option<OAuthToken>>,
}

impl ClientCredentialsTokenSource {
    pub fn new(endpoint: TokenEndpoint, credentials: ClientCredentials) -> Self {
        Self {
            endpoint,
            credentials,
            cached: Mutex::new(None),
        }
    }

    /// Check if a cached token should be replaced.
    pub fn needs_refresh(token: &OAuthToken) -> bool {
        token.expires_within(Duration::seconds(EXPIRY_DELTA_SECS))
    }
}

#[async_trait]
impl TokenSource for ClientCredentialsTokenSource {
    async fn token(&self) -> Result<OAuthToken> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if !Self::needs_refresh(token) {
                return Ok(token.clone());
            }
            tracing::debug!("Service token expiring, refreshing");
        }

        let token = self
            .endpoint
            .request_token(&self.credentials.form_params())
            .await?;

        tracing::debug!(
            token_url = %self.endpoint.token_url(),
            expires_at = ?token.expires_at,
            "Fetched service token"
        );

        *cached = Some(token.clone());
        Ok(token)
    }
}
