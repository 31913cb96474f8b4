//! Forwarding client for relaying authenticated requests upstream.
//!
//! Rewrites the routing fields of the request to the upstream, replaces the
//! `Authorization` header and streams both bodies through unchanged. The
//! client adds no headers of its own beyond `Host`.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Uri, Version, header};
use axum::response::Response;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use url::Url;

use crate::oauth::OAuthToken;

/// Headers that only apply to a single connection and are never relayed.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// HTTP(S) client used for upstream requests. Never follows redirects.
pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Errors raised while relaying a request.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// The token cannot be placed in a header.
    #[error("access token is not a valid header value")]
    InvalidToken,

    /// The upstream could not be reached or the exchange broke off.
    #[error("upstream request failed: {0}")]
    Upstream(String),
}

/// Forwarder bound to one upstream. Built once and shared by all handlers.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: UpstreamClient,
    upstream: Url,
}

impl Forwarder {
    /// Create a forwarder trusting the bundled web PKI roots for https
    /// upstreams.
    pub fn new(upstream: Url) -> Self {
        let connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self::with_client(client, upstream)
    }

    /// Create with a custom client.
    pub fn with_client(client: UpstreamClient, upstream: Url) -> Self {
        Self { client, upstream }
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    /// Map an inbound URI onto the upstream: paths are joined with a single
    /// slash, queries with `&`.
    pub fn target_url(&self, uri: &Uri) -> Url {
        let mut url = self.upstream.clone();

        let base = self.upstream.path();
        let path = uri.path();
        let joined = match (base.ends_with('/'), path.starts_with('/')) {
            (true, true) => format!("{}{}", base, &path[1..]),
            (false, false) => format!("{}/{}", base, path),
            _ => format!("{}{}", base, path),
        };
        url.set_path(&joined);

        let queries: Vec<&str> = [self.upstream.query(), uri.query()]
            .into_iter()
            .flatten()
            .filter(|q| !q.is_empty())
            .collect();
        if queries.is_empty() {
            url.set_query(None);
        } else {
            url.set_query(Some(&queries.join("&")));
        }

        url.set_fragment(None);
        url
    }

    /// Relay `request` upstream with `token` as its bearer credential.
    pub async fn forward(
        &self,
        request: Request,
        token: &OAuthToken,
    ) -> Result<Response, ForwardError> {
        let client_addr = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);

        let (mut parts, body) = request.into_parts();
        let url = self.target_url(&parts.uri);

        strip_hop_by_hop(&mut parts.headers);
        parts.headers.remove(header::HOST);

        let authorization = HeaderValue::from_str(&token.authorization_value())
            .map_err(|_| ForwardError::InvalidToken)?;
        parts.headers.insert(header::AUTHORIZATION, authorization);

        if let Some(addr) = client_addr {
            append_forwarded_for(&mut parts.headers, addr);
        }

        parts.uri = url
            .as_str()
            .parse()
            .map_err(|e| ForwardError::Upstream(format!("invalid upstream URI {}: {}", url, e)))?;
        parts.version = Version::HTTP_11;
        parts.extensions.clear();

        tracing::debug!(method = %parts.method, url = %url, "Forwarding request upstream");

        let upstream_response = self
            .client
            .request(Request::from_parts(parts, body))
            .await
            .map_err(|e| ForwardError::Upstream(e.to_string()))?;

        let mut response = upstream_response.map(Body::new);
        strip_hop_by_hop(response.headers_mut());
        Ok(response)
    }
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, addr: SocketAddr) {
    let prior: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    let value = if prior.is_empty() {
        addr.ip().to_string()
    } else {
        format!("{}, {}", prior.join(", "), addr.ip())
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
