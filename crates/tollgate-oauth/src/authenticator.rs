//! Per-request authentication decision.
//!
//! Picks the grant flow for an inbound request from the configured
//! [`AuthMode`] and the presence of the subject header:
//!
//! | subject header | mode                 | token calls                        |
//! |----------------|----------------------|------------------------------------|
//! | absent / empty | any                  | service token                      |
//! | present        | `CLIENT_CREDENTIALS` | exchange (client id + secret)      |
//! | present        | `ACTOR_TOKEN`        | service token, then exchange as actor |

use axum::http::{HeaderMap, HeaderName};

use crate::config::{AuthMode, ConfigError, ServerConfig};
use crate::error::OAuthError;
use crate::exchange::{ExchangeRequest, SharedTokenExchanger};
use crate::oauth::{ClientCredentials, OAuthToken};
use crate::token_source::SharedTokenSource;

/// Reasons a request could not be given a token.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The base service token could not be obtained.
    #[error("failed to obtain service token: {0}")]
    BaseToken(#[source] OAuthError),

    /// The subject token exchange failed.
    #[error("failed to exchange token for subject: {0}")]
    ExchangeToken(#[source] OAuthError),

    /// The subject header value is not valid UTF-8.
    #[error("subject header '{0}' is not valid UTF-8")]
    InvalidSubject(HeaderName),
}

/// Decides which token each inbound request receives.
#[derive(Debug, Clone)]
pub struct RequestAuthenticator {
    mode: AuthMode,
    subject_header: HeaderName,
    subject_field: String,
    credentials: ClientCredentials,
    token_source: SharedTokenSource,
    exchanger: SharedTokenExchanger,
}

impl RequestAuthenticator {
    pub fn new(
        config: &ServerConfig,
        token_source: SharedTokenSource,
        exchanger: SharedTokenExchanger,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            mode: config.auth_mode,
            subject_header: config.subject_header()?,
            subject_field: config.subject_field.clone(),
            credentials: config.credentials.clone(),
            token_source,
            exchanger,
        })
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    pub fn subject_header(&self) -> &HeaderName {
        &self.subject_header
    }

    /// Read the subject from the request headers. An empty value counts as
    /// no subject.
    pub fn subject<'a>(&self, headers: &'a HeaderMap) -> Result<Option<&'a str>, AuthError> {
        let Some(value) = headers.get(&self.subject_header) else {
            return Ok(None);
        };

        let subject = std::str::from_utf8(value.as_bytes())
            .map_err(|_| AuthError::InvalidSubject(self.subject_header.clone()))?;

        Ok((!subject.is_empty()).then_some(subject))
    }

    /// Obtain the token to attach to a request with these headers.
    ///
    /// Makes zero or one call to the token source followed by zero or one
    /// exchange, strictly in that order.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<OAuthToken, AuthError> {
        let Some(subject) = self.subject(headers)? else {
            return self.token_source.token().await.map_err(|e| {
                tracing::error!(error = %e, "Error getting client credential token");
                AuthError::BaseToken(e)
            });
        };

        tracing::debug!(subject = %subject, mode = %self.mode, "Authenticating on behalf of subject");

        let request = match self.mode {
            AuthMode::ClientCredentialsExchange => {
                ExchangeRequest::client_credentials(&self.credentials, &self.subject_field, subject)
            }
            AuthMode::ActorTokenExchange => {
                let actor = self.token_source.token().await.map_err(|e| {
                    tracing::error!(error = %e, "Error getting system token");
                    AuthError::BaseToken(e)
                })?;
                ExchangeRequest::actor_token(
                    &self.credentials.scopes,
                    &self.subject_field,
                    subject,
                    actor.access_token,
                )
            }
        };

        self.exchanger.exchange(&request).await.map_err(|e| {
            tracing::error!(error = %e, subject = %subject, "Error fetching the subject token");
            AuthError::ExchangeToken(e)
        })
    }
}
