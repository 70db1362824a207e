// src/identity/provider.rs
//! Identity provider handshake.
//!
//! The provider is a black box reached by URL: the user is sent to it, and it
//! eventually redirects back with either a principal or an error.
//! [`LoopbackIdentityProvider`] receives that redirect on a short-lived local
//! HTTP listener.

use crate::identity::IdentityError;
use crate::models::principal::Principal;
use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use log::{debug, info, warn};
use rand::{distributions::Alphanumeric, Rng};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;

/// Path the identity provider redirects to.
pub const CALLBACK_PATH: &str = "/callback";

const STATE_LEN: usize = 32;

/// Anything that can run an interactive login and name the resulting subject.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Runs one login handshake. Implementations must not retry on their own.
    async fn authenticate(&self) -> Result<Principal, IdentityError>;
}

/// Query parameters of the provider redirect.
#[derive(Debug, Deserialize)]
struct CallbackParams {
    state: Option<String>,
    principal: Option<String>,
    error: Option<String>,
}

/// State shared with the callback handler.
struct CallbackState {
    expected_state: String,
    outcome: Mutex<Option<oneshot::Sender<Result<Principal, IdentityError>>>>,
}

/// Identity provider reached through a browser redirect to a loopback listener.
#[derive(Debug, Clone)]
pub struct LoopbackIdentityProvider {
    /// Login page of the identity provider
    identity_provider_url: Url,
    /// Local port for the redirect listener (0 picks a free port)
    callback_port: u16,
    /// How long the user has to complete the login
    login_timeout: Duration,
}

/// A login that has been started and is waiting for the provider redirect.
pub struct PendingLogin {
    login_url: Url,
    redirect_uri: Url,
    outcome: oneshot::Receiver<Result<Principal, IdentityError>>,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<()>,
    login_timeout: Duration,
}

impl LoopbackIdentityProvider {
    /// Creates a provider for the login page at `identity_provider_url`.
    ///
    /// # Errors
    /// Returns [`IdentityError::InvalidProviderUrl`] if the URL does not parse.
    pub fn new(
        identity_provider_url: &str,
        callback_port: u16,
        login_timeout: Duration,
    ) -> Result<Self, IdentityError> {
        let identity_provider_url = Url::parse(identity_provider_url)
            .map_err(|e| IdentityError::InvalidProviderUrl(e.to_string()))?;
        Ok(Self {
            identity_provider_url,
            callback_port,
            login_timeout,
        })
    }

    /// Builds the URL the user has to open to log in.
    pub fn login_url(&self, redirect_uri: &Url, state: &str) -> Url {
        let mut url = self.identity_provider_url.clone();
        url.query_pairs_mut()
            .append_pair("redirect_uri", redirect_uri.as_str())
            .append_pair("state", state);
        url
    }

    /// Binds the redirect listener and starts waiting for the provider.
    pub async fn start(&self) -> Result<PendingLogin, IdentityError> {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], self.callback_port))).await?;
        let local_addr = listener.local_addr()?;
        let redirect_uri = Url::parse(&format!("http://{}{}", local_addr, CALLBACK_PATH))
            .map_err(|e| IdentityError::InvalidProviderUrl(e.to_string()))?;

        let state: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(STATE_LEN)
            .map(char::from)
            .collect();
        let login_url = self.login_url(&redirect_uri, &state);

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let shared = Arc::new(CallbackState {
            expected_state: state,
            outcome: Mutex::new(Some(outcome_tx)),
        });

        let app = Router::new()
            .route(CALLBACK_PATH, get(callback_handler))
            .with_state(shared);

        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                warn!("Login callback listener stopped: {}", e);
            }
        });

        debug!("Login callback listening on {}", redirect_uri);
        Ok(PendingLogin {
            login_url,
            redirect_uri,
            outcome: outcome_rx,
            shutdown: shutdown_tx,
            server,
            login_timeout: self.login_timeout,
        })
    }
}

impl PendingLogin {
    /// URL the user has to open to log in.
    pub fn login_url(&self) -> &Url {
        &self.login_url
    }

    /// Address the identity provider redirects back to.
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    /// Waits for the provider redirect and stops the listener.
    ///
    /// # Errors
    /// [`IdentityError::AuthenticationFailed`] when the provider reports an
    /// error, the user cancels, the redirect is forged, or the login times out.
    pub async fn complete(self) -> Result<Principal, IdentityError> {
        let outcome = tokio::time::timeout(self.login_timeout, self.outcome).await;

        let _ = self.shutdown.send(());
        let _ = self.server.await;

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(IdentityError::AuthenticationFailed(
                "login callback listener closed before the provider answered".into(),
            )),
            Err(_) => Err(IdentityError::AuthenticationFailed(format!(
                "login not completed within {}s",
                self.login_timeout.as_secs()
            ))),
        }
    }
}

#[async_trait]
impl IdentityProvider for LoopbackIdentityProvider {
    async fn authenticate(&self) -> Result<Principal, IdentityError> {
        let pending = self.start().await?;
        info!("Open {} to log in", pending.login_url());
        pending.complete().await
    }
}

/// Handles `GET /callback?state=...&principal=...` (or `&error=...`).
///
/// # Responses
/// - 200 OK: Principal accepted
/// - 400 Bad Request: State mismatch, missing principal, or provider error
/// - 409 Conflict: The login was already completed
async fn callback_handler(
    State(shared): State<Arc<CallbackState>>,
    Query(params): Query<CallbackParams>,
) -> impl IntoResponse {
    let result = evaluate_callback(&shared.expected_state, params);
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::BAD_REQUEST,
    };
    let message = match &result {
        Ok(principal) => format!("Logged in as {}. You can close this window.", principal),
        Err(e) => format!("Login failed: {}", e),
    };

    let sender = shared
        .outcome
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
    match sender {
        Some(sender) => {
            let _ = sender.send(result);
            (status, message)
        }
        None => (StatusCode::CONFLICT, "Login already completed".to_string()),
    }
}

fn evaluate_callback(expected_state: &str, params: CallbackParams) -> Result<Principal, IdentityError> {
    if params.state.as_deref() != Some(expected_state) {
        return Err(IdentityError::AuthenticationFailed(
            "state parameter does not match the login request".into(),
        ));
    }
    if let Some(error) = params.error {
        return Err(IdentityError::AuthenticationFailed(error));
    }
    let principal = params.principal.ok_or_else(|| {
        IdentityError::AuthenticationFailed("provider redirect carried no principal".into())
    })?;
    Principal::from_text(&principal)
        .map_err(|e| IdentityError::AuthenticationFailed(format!("invalid principal: {}", e)))
}
