//! HTTP proxy server.
//!
//! Accepts any request on any path, obtains a bearer token for it through the
//! [`RequestAuthenticator`] and relays it to the upstream with the
//! [`Forwarder`]. A request is never forwarded without a token.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router as AxumRouter,
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::authenticator::{AuthError, RequestAuthenticator};
use crate::config::{ConfigError, ServerConfig};
use crate::exchange::HttpTokenExchanger;
use crate::forwarder::{ForwardError, Forwarder};
use crate::oauth::TokenEndpoint;
use crate::token_source::ClientCredentialsTokenSource;

/// Shared state for the proxy server.
struct ProxyState {
    authenticator: RequestAuthenticator,
    forwarder: Forwarder,
}

/// The authenticating reverse proxy.
pub struct ProxyServer {
    bind_addr: SocketAddr,
    state: Arc<ProxyState>,
}

impl ProxyServer {
    /// Build the proxy from configuration.
    ///
    /// Creates one token endpoint client, shared by the token source and the
    /// exchanger, and one upstream forwarder.
    pub fn new(config: &ServerConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let endpoint = TokenEndpoint::new(config.tls.build_client()?, config.token_url.clone());
        let token_source = Arc::new(ClientCredentialsTokenSource::new(
            endpoint.clone(),
            config.credentials.clone(),
        ));
        let exchanger = Arc::new(HttpTokenExchanger::new(endpoint));

        let authenticator = RequestAuthenticator::new(config, token_source, exchanger)?;
        let forwarder = Forwarder::new(config.upstream.clone());

        Ok(Self::from_parts(config.bind_address, authenticator, forwarder))
    }

    /// Create a proxy from pre-built components.
    pub fn from_parts(
        bind_addr: SocketAddr,
        authenticator: RequestAuthenticator,
        forwarder: Forwarder,
    ) -> Self {
        Self {
            bind_addr,
            state: Arc::new(ProxyState {
                authenticator,
                forwarder,
            }),
        }
    }

    /// Build the axum router. Every method and path goes to the proxy handler.
    pub fn router(&self) -> AxumRouter {
        AxumRouter::new()
            .fallback(handle_request)
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Run the proxy server.
    pub async fn run(self) -> std::io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run until `shutdown` resolves, then drain in-flight requests.
    pub async fn run_until(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.log_start(&listener)?;
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
    }

    /// Run in the background with graceful shutdown, returning the bound
    /// address.
    pub async fn run_with_shutdown(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let local_addr = self.log_start(&listener)?;
        tokio::spawn(async move {
            if let Err(e) = axum::serve(
                listener,
                self.router()
                    .into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown)
            .await
            {
                tracing::error!(error = %e, "Proxy server stopped with error");
            }
        });
        Ok(local_addr)
    }

    fn log_start(&self, listener: &TcpListener) -> std::io::Result<SocketAddr> {
        let local_addr = listener.local_addr()?;
        tracing::info!(
            addr = %local_addr,
            upstream = %self.state.forwarder.upstream(),
            mode = %self.state.authenticator.mode(),
            subject_header = %self.state.authenticator.subject_header(),
            "Starting server"
        );
        Ok(local_addr)
    }
}

/// Authenticate, then forward.
async fn handle_request(
    State(state): State<Arc<ProxyState>>,
    request: Request,
) -> Result<Response, ProxyError> {
    let token = state.authenticator.authenticate(request.headers()).await?;
    Ok(state.forwarder.forward(request, &token).await?)
}

/// Error type for proxy responses.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Forward(#[from] ForwardError),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Auth(AuthError::InvalidSubject(_)) => StatusCode::BAD_REQUEST,
            ProxyError::Auth(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Forward(ForwardError::InvalidToken) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Forward(ForwardError::Upstream(_)) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ProxyError {
    /// Only the status reaches the caller; details stay in the log.
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            ProxyError::Auth(AuthError::InvalidSubject(_)) => {
                tracing::warn!(error = %self, "Rejected request")
            }
            _ => tracing::error!(error = %self, status = %status, "Request not forwarded"),
        }
        status.into_response()
    }
}
