// src/services/verifier.rs
//! Verification backend client.
//!
//! The verification backend hands out single-use nonces and exchanges a signed
//! proof over a nonce for a bearer token.

use crate::error::{RemoteError, TransportError};
use crate::models::proof::{AuthenticateRequest, Nonce};
use crate::services::credential_service::endpoint_base;
use crate::utils::serialization::decode;
use async_trait::async_trait;
use log::debug;
use std::time::Duration;
use url::Url;

/// Outcome of one token request, in a shape the retry predicate can inspect.
///
/// Transport failures are kept as values instead of errors so that the
/// exchange can decide to retry them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenAttempt {
    /// The backend answered; `body` is the raw response text.
    Responded { status: u16, body: String },
    /// No response was received (connection refused, reset, timed out).
    Unreachable(String),
}

impl TokenAttempt {
    /// HTTP status of the answer, or `None` when nothing came back.
    pub fn status(&self) -> Option<u16> {
        match self {
            TokenAttempt::Responded { status, .. } => Some(*status),
            TokenAttempt::Unreachable(_) => None,
        }
    }
}

#[async_trait]
pub trait VerificationBackend: Send + Sync {
    /// Fetches a fresh nonce.
    async fn fetch_nonce(&self) -> Result<Nonce, RemoteError>;

    /// Submits one token request. Never retries on its own.
    async fn authenticate(&self, request: &AuthenticateRequest) -> TokenAttempt;
}

/// Verification backend reached over HTTP:
/// - `GET <base>/nonce` answers `{nonce, timestamp}`
/// - `POST <base>/authenticate` answers `{token}`
#[derive(Debug, Clone)]
pub struct HttpVerificationBackend {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpVerificationBackend {
    /// Creates a client for the verification backend.
    ///
    /// # Arguments
    /// * `base_url` - Root URL; `nonce` and `authenticate` are resolved below it
    /// * `request_timeout` - Upper bound for every call
    ///
    /// # Errors
    /// [`TransportError`] if the URL does not parse or the HTTP client cannot
    /// be built.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|source| TransportError::Request {
                url: base_url.to_string(),
                source,
            })?;
        Ok(Self {
            client,
            base_url: endpoint_base(base_url)?,
        })
    }
}

#[async_trait]
impl VerificationBackend for HttpVerificationBackend {
    async fn fetch_nonce(&self) -> Result<Nonce, RemoteError> {
        let url = self.base_url.join("nonce").map_err(TransportError::from)?;
        debug!("Fetching nonce from {}", url);

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        let body = response.text().await.map_err(|source| TransportError::Request {
            url: url.to_string(),
            source,
        })?;

        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            }
            .into());
        }
        Ok(decode(&body)?)
    }

    async fn authenticate(&self, request: &AuthenticateRequest) -> TokenAttempt {
        let url = match self.base_url.join("authenticate") {
            Ok(url) => url,
            Err(e) => return TokenAttempt::Unreachable(e.to_string()),
        };
        debug!("Requesting token for {} from {}", request.did, url);

        let response = match self.client.post(url).json(request).send().await {
            Ok(response) => response,
            Err(e) => return TokenAttempt::Unreachable(e.to_string()),
        };
        let status = response.status().as_u16();
        match response.text().await {
            Ok(body) => TokenAttempt::Responded { status, body },
            Err(e) => TokenAttempt::Unreachable(e.to_string()),
        }
    }
}
