//! RFC 8693 token exchange.
//!
//! An [`ExchangeRequest`] is built per inbound request and never reused:
//! the subject changes from one request to the next.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::oauth::{
    ClientCredentials, FormParams, GRANT_TYPE_TOKEN_EXCHANGE, OAuthToken, TOKEN_TYPE_ACCESS_TOKEN,
    TokenEndpoint, encode_token_request,
};

/// A single token-exchange call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeRequest {
    /// Identity authenticating the call. Empty id and secret are left out of
    /// the request body.
    pub credentials: ClientCredentials,
    /// Name of the form parameter carrying the subject.
    pub subject_field: String,
    pub subject: String,
    /// Access token of the acting service, for delegated exchanges.
    pub actor_token: Option<String>,
}

impl ExchangeRequest {
    /// Exchange authenticated by the base client credentials.
    pub fn client_credentials(
        credentials: &ClientCredentials,
        subject_field: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            credentials: credentials.clone(),
            subject_field: subject_field.into(),
            subject: subject.into(),
            actor_token: None,
        }
    }

    /// Exchange authenticated by an actor token instead of client credentials.
    pub fn actor_token(
        scopes: &[String],
        subject_field: impl Into<String>,
        subject: impl Into<String>,
        actor_token: impl Into<String>,
    ) -> Self {
        Self {
            credentials: ClientCredentials::new("", "", scopes.to_vec()),
            subject_field: subject_field.into(),
            subject: subject.into(),
            actor_token: Some(actor_token.into()),
        }
    }

    /// Exchange-specific parameters layered over the client-credentials form.
    pub fn endpoint_params(&self) -> FormParams {
        let mut params = vec![
            (
                "grant_type".to_string(),
                GRANT_TYPE_TOKEN_EXCHANGE.to_string(),
            ),
            (
                "requested_token_type".to_string(),
                TOKEN_TYPE_ACCESS_TOKEN.to_string(),
            ),
        ];

        if let Some(actor_token) = &self.actor_token {
            params.push((
                "actor_token_type".to_string(),
                TOKEN_TYPE_ACCESS_TOKEN.to_string(),
            ));
            params.push(("actor_token".to_string(), actor_token.clone()));
        }

        params.push((self.subject_field.clone(), self.subject.clone()));
        params
    }

    /// Complete request body.
    pub fn form_params(&self) -> FormParams {
        encode_token_request(&self.credentials, &self.endpoint_params())
    }
}

/// Performs token exchanges against the token endpoint.
#[async_trait]
pub trait TokenExchanger: Send + Sync + std::fmt::Debug {
    /// Execute one exchange. Results are never cached.
    async fn exchange(&self, request: &ExchangeRequest) -> Result<OAuthToken>;
}

/// Shared exchanger for use across request handlers.
pub type SharedTokenExchanger = Arc<dyn TokenExchanger>;

/// Exchanger posting to the same endpoint, over the same transport, as the
/// base token source.
#[derive(Debug, Clone)]
pub struct HttpTokenExchanger {
    endpoint: TokenEndpoint,
}

impl HttpTokenExchanger {
    pub fn new(endpoint: TokenEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl TokenExchanger for HttpTokenExchanger {
    async fn exchange(&self, request: &ExchangeRequest) -> Result<OAuthToken> {
        tracing::debug!(
            subject_field = %request.subject_field,
            actor = request.actor_token.is_some(),
            "Exchanging token for subject"
        );
        self.endpoint.request_token(&request.form_params()).await
    }
}
