// src/services/signer.rs
//! External proof signing.
//!
//! Producing a proof requires key material the client never holds. The
//! [`ProofSigner`] seam delegates it; [`HttpProofSigner`] forwards to a signing
//! service over HTTP.

use crate::error::{DecodeError, TransportError};
use crate::models::principal::Principal;
use crate::models::proof::{Nonce, Proof};
use crate::services::credential_service::endpoint_base;
use crate::utils::serialization::decode;
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum SignerError {
    /// The signer refused to sign for this principal or nonce.
    #[error("signer declined: {0}")]
    Declined(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[async_trait]
pub trait ProofSigner: Send + Sync {
    /// Signs `nonce` on behalf of `principal`.
    ///
    /// # Errors
    /// - [`SignerError::Declined`] if the signer refuses
    /// - [`SignerError::Transport`] / [`SignerError::Decode`] if the signer
    ///   cannot be reached or answers garbage
    async fn request_proof(&self, principal: &Principal, nonce: &Nonce) -> Result<Proof, SignerError>;
}

#[derive(Debug, Serialize)]
struct ProveRequest<'a> {
    principal: &'a Principal,
    nonce: &'a Nonce,
}

#[derive(Debug, Deserialize)]
struct ProveResponse {
    proof: Proof,
}

/// Signing service at `POST <base>/prove`.
#[derive(Debug, Clone)]
pub struct HttpProofSigner {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpProofSigner {
    /// Creates a client for the signing service.
    ///
    /// # Arguments
    /// * `base_url` - Root URL; `prove` is resolved below it
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
impl ProofSigner for HttpProofSigner {
    async fn request_proof(&self, principal: &Principal, nonce: &Nonce) -> Result<Proof, SignerError> {
        let url = self.base_url.join("prove").map_err(TransportError::from)?;
        debug!("Requesting proof for {} from {}", principal, url);

        let response = self
            .client
            .post(url.clone())
            .json(&ProveRequest { principal, nonce })
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

        if status.is_client_error() {
            warn!("Signer declined to sign for {} ({})", principal, status);
            return Err(SignerError::Declined(body));
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let response: ProveResponse = decode(&body)?;
        Ok(response.proof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{mock, Matcher};

    fn signer(prefix: &str) -> HttpProofSigner {
        HttpProofSigner::new(&format!("{}/{}", mockito::server_url(), prefix), Duration::from_secs(5)).unwrap()
    }

    fn nonce() -> Nonce {
        Nonce { nonce: "n-1".into(), timestamp: 1_700_000_000_000 }
    }

    #[tokio::test]
    async fn test_request_proof() {
        let _m = mock("POST", "/signer-ok/prove")
            .match_body(Matcher::Json(serde_json::json!({
                "principal": "aaaaa-aa",
                "nonce": { "nonce": "n-1", "timestamp": 1_700_000_000_000i64 }
            })))
            .with_status(200)
            .with_body(r#"{"proof":"0xsigned"}"#)
            .create();

        let proof = signer("signer-ok")
            .request_proof(&Principal::from_text("aaaaa-aa").unwrap(), &nonce())
            .await
            .unwrap();
        assert_eq!(proof.as_str(), "0xsigned");
    }

    #[tokio::test]
    async fn test_client_error_is_declined() {
        let _m = mock("POST", "/signer-no/prove")
            .with_status(403)
            .with_body("not your key")
            .create();

        let err = signer("signer-no")
            .request_proof(&Principal::from_text("aaaaa-aa").unwrap(), &nonce())
            .await
            .unwrap_err();
        assert!(matches!(err, SignerError::Declined(reason) if reason == "not your key"));
    }

    #[tokio::test]
    async fn test_server_error_is_transport() {
        let _m = mock("POST", "/signer-down/prove").with_status(500).create();

        let err = signer("signer-down")
            .request_proof(&Principal::from_text("aaaaa-aa").unwrap(), &nonce())
            .await
            .unwrap_err();
        assert!(matches!(err, SignerError::Transport(TransportError::Status { status: 500, .. })));
    }
}
