//! OAuth 2.0 token endpoint wire protocol.
//!
//! Every token the proxy obtains, whether a plain client-credentials token or
//! a subject-scoped token from an RFC 8693 exchange, goes through
//! [`TokenEndpoint::request_token`] with a form built by
//! [`encode_token_request`].

use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, header};
use serde::Deserialize;
use url::Url;

use crate::error::{OAuthError, Result};

/// Grant type of the standard client-credentials flow.
pub const GRANT_TYPE_CLIENT_CREDENTIALS: &str = "client_credentials";

/// Grant type of an RFC 8693 token exchange.
pub const GRANT_TYPE_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";

/// Token type identifier for OAuth access tokens.
pub const TOKEN_TYPE_ACCESS_TOKEN: &str = "urn:ietf:params:oauth:token-type:access_token";

/// Parameters the proxy itself places in token requests. A subject field may
/// not reuse any of these names.
pub const RESERVED_PARAMS: &[&str] = &[
    "grant_type",
    "scope",
    "client_id",
    "client_secret",
    "requested_token_type",
    "actor_token",
    "actor_token_type",
];

/// Announced lifetimes beyond this many seconds are cut down to it.
const MAX_LIFETIME_SECS: i64 = i32::MAX as i64;

/// Ordered form parameters of a token request.
pub type FormParams = Vec<(String, String)>;

/// Client identity and scopes used to authenticate against the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub scopes: Vec<String>,
}

impl ClientCredentials {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scopes,
        }
    }

    /// Form parameters for a plain client-credentials grant.
    pub fn form_params(&self) -> FormParams {
        encode_token_request(self, &[])
    }
}

/// Encode a token request body.
///
/// Starts from a client-credentials grant (`grant_type`, `scope` joined with
/// spaces whenever the scope list is non-empty, `client_id` and
/// `client_secret` only when set) and then applies `endpoint_params`, which
/// replace any default they name.
pub fn encode_token_request(
    credentials: &ClientCredentials,
    endpoint_params: &[(String, String)],
) -> FormParams {
    let mut params: FormParams = vec![(
        "grant_type".to_string(),
        GRANT_TYPE_CLIENT_CREDENTIALS.to_string(),
    )];

    if !credentials.scopes.is_empty() {
        params.push(("scope".to_string(), credentials.scopes.join(" ")));
    }
    if !credentials.client_id.is_empty() {
        params.push(("client_id".to_string(), credentials.client_id.clone()));
    }
    if !credentials.client_secret.is_empty() {
        params.push((
            "client_secret".to_string(),
            credentials.client_secret.clone(),
        ));
    }

    for (key, value) in endpoint_params {
        match params.iter_mut().find(|(existing, _)| existing == key) {
            Some(slot) => slot.1 = value.clone(),
            None => params.push((key.clone(), value.clone())),
        }
    }

    params
}

/// Access token issued by the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthToken {
    pub access_token: String,
    pub token_type: String,
    /// `None` when the endpoint did not announce a lifetime.
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuthToken {
    /// A bearer token without expiry.
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: "Bearer".to_string(),
            expires_at: None,
        }
    }

    /// Set an absolute expiry.
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// True when the token expires within `margin` from now.
    pub fn expires_within(&self, margin: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() + margin >= expires_at,
            None => false,
        }
    }

    /// Value for the `Authorization` header.
    pub fn authorization_value(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

/// Raw token endpoint response body.
#[derive(Debug, Default, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

impl TokenResponse {
    fn from_form(body: &[u8]) -> Self {
        let mut response = TokenResponse::default();
        for (key, value) in url::form_urlencoded::parse(body) {
            let value = value.into_owned();
            match key.as_ref() {
                "access_token" => response.access_token = value,
                "token_type" => response.token_type = Some(value),
                "expires_in" => response.expires_in = Some(serde_json::Value::String(value)),
                _ => {}
            }
        }
        response
    }

    fn expires_in_secs(&self) -> Result<Option<i64>> {
        match &self.expires_in {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_u64().map(|_| i64::MAX))
                .map(Some)
                .ok_or_else(|| OAuthError::InvalidResponse(format!("invalid expires_in: {}", n))),
            Some(serde_json::Value::String(s)) if s.is_empty() => Ok(None),
            Some(serde_json::Value::String(s)) => s
                .parse::<i64>()
                .map(Some)
                .map_err(|_| OAuthError::InvalidResponse(format!("invalid expires_in: {}", s))),
            Some(other) => Err(OAuthError::InvalidResponse(format!(
                "invalid expires_in: {}",
                other
            ))),
        }
    }

    fn into_token(self) -> Result<OAuthToken> {
        if self.access_token.is_empty() {
            return Err(OAuthError::InvalidResponse(
                "server response missing access_token".to_string(),
            ));
        }

        let expires_at = match self.expires_in_secs()? {
            Some(secs) if secs != 0 => Some(
                Duration::try_seconds(secs.clamp(-MAX_LIFETIME_SECS, MAX_LIFETIME_SECS))
                    .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
                    .ok_or_else(|| {
                        OAuthError::InvalidResponse(format!("expires_in out of range: {}", secs))
                    })?,
            ),
            _ => None,
        };

        Ok(OAuthToken {
            access_token: self.access_token,
            token_type: self
                .token_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "Bearer".to_string()),
            expires_at,
        })
    }
}

fn is_form_content(content_type: &str) -> bool {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    media_type == "application/x-www-form-urlencoded" || media_type == "text/plain"
}

/// HTTP client bound to one token endpoint.
///
/// Cloning is cheap; clones share the underlying connection pool and TLS
/// settings.
#[derive(Debug, Clone)]
pub struct TokenEndpoint {
    client: Client,
    token_url: Url,
}

impl TokenEndpoint {
    pub fn new(client: Client, token_url: Url) -> Self {
        Self { client, token_url }
    }

    pub fn token_url(&self) -> &Url {
        &self.token_url
    }

    /// POST one form-encoded token request. No retries.
    pub async fn request_token(&self, params: &[(String, String)]) -> Result<OAuthToken> {
        let response = self
            .client
            .post(self.token_url.clone())
            .header(header::ACCEPT, "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| OAuthError::Network(format!("Token request failed: {}", e)))?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let body = response
            .bytes()
            .await
            .map_err(|e| OAuthError::Network(format!("Failed to read token response: {}", e)))?;

        if !status.is_success() {
            return Err(OAuthError::Endpoint {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let parsed = if is_form_content(&content_type) {
            TokenResponse::from_form(&body)
        } else {
            serde_json::from_slice::<TokenResponse>(&body).map_err(|e| {
                OAuthError::InvalidResponse(format!("Failed to parse token response: {}", e))
            })?
        };

        parsed.into_token()
    }
}
