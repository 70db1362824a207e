// src/services/credential_service.rs
//! Credential Service
//!
//! Typed client for the issuer backend. It provides:
//! - Credential storage: add, list, update and remove credentials of a principal
//! - Two-phase issuance: prepare a credential, then fetch it with the prepared context
//!
//! The backend is the source of truth; nothing is cached locally beyond the
//! request in flight.

use crate::error::{DecodeError, TransportError};
use crate::models::credential::{InvalidCredential, StoredCredential};
use crate::models::issuance::{
    AddCredentialsRequest, CredentialError, GetCredentialRequest, IssueCredentialError,
    IssuedCredentialData, PrepareCredentialRequest, PreparedCredentialData, PrincipalRequest,
    RemoveCredentialRequest, Reply, UpdateCredentialRequest,
};
use crate::models::principal::Principal;
use crate::models::proof::AuthToken;
use crate::utils::serialization::decode;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Everything that can go wrong talking to the issuer backend.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Closed error variant returned by a storage method.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Closed error variant returned by an issuance method.
    #[error(transparent)]
    Issue(#[from] IssueCredentialError),

    /// The credential was refused locally and never sent.
    #[error("invalid credential: {0}")]
    InvalidCredential(#[from] InvalidCredential),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Remote methods of the issuer backend.
///
/// Outer errors are transport and decoding failures; backend rejections come
/// back as [`ServiceError::Credential`] or [`ServiceError::Issue`].
///
/// Write methods name the `caller` on whose behalf they run. Only authorized
/// issuers may write; anyone else gets
/// [`CredentialError::UnauthorizedSubject`].
#[async_trait]
pub trait IssuerBackend: Send + Sync {
    /// Stores `credentials` for `principal`, skipping ids already present.
    ///
    /// # Returns
    /// The backend's acknowledgement message.
    async fn add_credentials(
        &self,
        caller: &Principal,
        principal: &Principal,
        credentials: Vec<StoredCredential>,
    ) -> Result<String, ServiceError>;

    /// Lists every credential stored for `principal`. Reads are not gated.
    async fn get_all_credentials(&self, principal: &Principal) -> Result<Vec<StoredCredential>, ServiceError>;

    async fn remove_credential(
        &self,
        caller: &Principal,
        principal: &Principal,
        credential_id: &str,
    ) -> Result<String, ServiceError>;

    async fn update_credential(
        &self,
        caller: &Principal,
        principal: &Principal,
        credential_id: &str,
        credential: StoredCredential,
    ) -> Result<String, ServiceError>;

    async fn prepare_credential(
        &self,
        request: &PrepareCredentialRequest,
    ) -> Result<PreparedCredentialData, ServiceError>;

    async fn get_credential(&self, request: &GetCredentialRequest) -> Result<IssuedCredentialData, ServiceError>;
}

/// Issuer backend reached over HTTP: each method is `POST <base>/<method>`
/// with a JSON body, answered by a `{"Ok": ...}` / `{"Err": ...}` envelope.
///
/// Write bodies carry the `caller` principal. When a bearer token is set it is
/// sent with every request so the backend can authenticate that caller.
#[derive(Clone)]
pub struct HttpIssuerBackend {
    client: reqwest::Client,
    base_url: Url,
    bearer_token: Option<String>,
}

impl fmt::Debug for HttpIssuerBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpIssuerBackend")
            .field("base_url", &self.base_url.as_str())
            .field("authenticated", &self.bearer_token.is_some())
            .finish()
    }
}

impl HttpIssuerBackend {
    /// Creates a backend client.
    ///
    /// # Arguments
    /// * `base_url` - Root URL of the issuer backend
    /// * `request_timeout` - Upper bound for every call
    ///
    /// # Errors
    /// [`ServiceError::Transport`] if the URL does not parse or the HTTP client
    /// cannot be built.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, ServiceError> {
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
            bearer_token: None,
        })
    }

    /// Sends `token` as `Authorization: Bearer <token>` on every call.
    ///
    /// # Arguments
    /// * `token` - Token obtained from the proof exchange
    pub fn with_bearer_token(mut self, token: &AuthToken) -> Self {
        self.bearer_token = Some(token.as_str().to_string());
        self
    }

    async fn call<Req, T, E>(&self, method: &str, body: &Req) -> Result<T, ServiceError>
    where
        Req: Serialize + Sync + ?Sized,
        T: DeserializeOwned + Send,
        E: DeserializeOwned + Into<ServiceError> + Send,
    {
        let url = self.base_url.join(method).map_err(TransportError::from)?;
        debug!("Calling issuer backend {}", url);

        let mut request = self.client.post(url.clone()).json(body);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        let text = response.text().await.map_err(|source| TransportError::Request {
            url: url.to_string(),
            source,
        })?;

        if !status.is_success() {
            warn!("Issuer backend {} answered {}", method, status);
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body: text,
            }
            .into());
        }

        let reply: Reply<T, E> = decode(&text)?;
        let result: Result<T, E> = reply.into();
        result.map_err(Into::into)
    }
}

/// Parses a base URL so that `join` appends to its path instead of replacing
/// the last segment.
pub(crate) fn endpoint_base(base_url: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(base_url)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[async_trait]
impl IssuerBackend for HttpIssuerBackend {
    async fn add_credentials(
        &self,
        caller: &Principal,
        principal: &Principal,
        credentials: Vec<StoredCredential>,
    ) -> Result<String, ServiceError> {
        let body = AddCredentialsRequest {
            caller: caller.clone(),
            principal: principal.clone(),
            credentials,
        };
        self.call::<_, String, CredentialError>("add_credentials", &body).await
    }

    async fn get_all_credentials(&self, principal: &Principal) -> Result<Vec<StoredCredential>, ServiceError> {
        let body = PrincipalRequest {
            principal: principal.clone(),
        };
        self.call::<_, Vec<StoredCredential>, CredentialError>("get_all_credentials", &body)
            .await
    }

    async fn remove_credential(
        &self,
        caller: &Principal,
        principal: &Principal,
        credential_id: &str,
    ) -> Result<String, ServiceError> {
        let body = RemoveCredentialRequest {
            caller: caller.clone(),
            principal: principal.clone(),
            credential_id: credential_id.to_string(),
        };
        self.call::<_, String, CredentialError>("remove_credential", &body).await
    }

    async fn update_credential(
        &self,
        caller: &Principal,
        principal: &Principal,
        credential_id: &str,
        credential: StoredCredential,
    ) -> Result<String, ServiceError> {
        let body = UpdateCredentialRequest {
            caller: caller.clone(),
            principal: principal.clone(),
            credential_id: credential_id.to_string(),
            credential,
        };
        self.call::<_, String, CredentialError>("update_credential", &body).await
    }

    async fn prepare_credential(
        &self,
        request: &PrepareCredentialRequest,
    ) -> Result<PreparedCredentialData, ServiceError> {
        self.call::<_, PreparedCredentialData, IssueCredentialError>("prepare_credential", request)
            .await
    }

    async fn get_credential(&self, request: &GetCredentialRequest) -> Result<IssuedCredentialData, ServiceError> {
        self.call::<_, IssuedCredentialData, IssueCredentialError>("get_credential", request)
            .await
    }
}

/// Client-side entry point for credential storage and issuance.
///
/// Every write is made on behalf of one issuer principal, fixed at
/// construction.
pub struct CredentialService<B> {
    backend: B,
    issuer: Principal,
}

impl<B: IssuerBackend> CredentialService<B> {
    /// Creates a service writing to `backend` as `issuer`.
    ///
    /// # Arguments
    /// * `backend` - Issuer backend to talk to
    /// * `issuer` - Principal named as the caller of every write
    pub fn new(backend: B, issuer: Principal) -> Self {
        Self { backend, issuer }
    }

    /// Principal the service writes as.
    pub fn issuer(&self) -> &Principal {
        &self.issuer
    }

    /// Registers `credential` under `principal`.
    ///
    /// # Returns
    /// The id of the stored credential.
    ///
    /// # Errors
    /// - [`ServiceError::InvalidCredential`] if the credential has no id or no
    ///   claims; nothing is sent in that case
    /// - [`ServiceError::Credential`] if the backend refuses it, e.g.
    ///   `UnauthorizedSubject` when the issuer is not authorized
    pub async fn add_credential(
        &self,
        principal: &Principal,
        credential: StoredCredential,
    ) -> Result<String, ServiceError> {
        credential.validate()?;
        let id = credential.id.clone();
        info!("Adding credential {} for {}", id, principal);

        let acknowledgement = self
            .backend
            .add_credentials(&self.issuer, principal, vec![credential])
            .await?;
        debug!("Issuer backend acknowledged: {}", acknowledgement);
        Ok(id)
    }

    /// Registers several credentials in one call, returning their ids in order.
    pub async fn add_credentials(
        &self,
        principal: &Principal,
        credentials: Vec<StoredCredential>,
    ) -> Result<Vec<String>, ServiceError> {
        for credential in &credentials {
            credential.validate()?;
        }
        let ids = credentials.iter().map(|c| c.id.clone()).collect();
        info!("Adding {} credentials for {}", credentials.len(), principal);

        self.backend
            .add_credentials(&self.issuer, principal, credentials)
            .await?;
        Ok(ids)
    }

    /// Lists the credentials stored for `principal`.
    ///
    /// # Errors
    /// [`CredentialError::NoCredentialsFound`] (as [`ServiceError::Credential`])
    /// when the backend has no record of the principal. This is distinct from
    /// a principal whose record holds zero credentials, which is `Ok(vec![])`.
    pub async fn get_credentials(&self, principal: &Principal) -> Result<Vec<StoredCredential>, ServiceError> {
        let credentials = self.backend.get_all_credentials(principal).await?;
        debug!("Fetched {} credentials for {}", credentials.len(), principal);
        Ok(credentials)
    }

    /// Removes the credential stored under `credential_id`.
    ///
    /// # Errors
    /// [`CredentialError::NoCredentialsFound`] if no such credential exists,
    /// [`CredentialError::UnauthorizedSubject`] if the issuer may not write.
    pub async fn remove_credential(&self, principal: &Principal, credential_id: &str) -> Result<(), ServiceError> {
        info!("Removing credential {} for {}", credential_id, principal);
        self.backend
            .remove_credential(&self.issuer, principal, credential_id)
            .await?;
        Ok(())
    }

    /// Replaces the credential stored under `credential_id`.
    pub async fn update_credential(
        &self,
        principal: &Principal,
        credential_id: &str,
        credential: StoredCredential,
    ) -> Result<(), ServiceError> {
        credential.validate()?;
        info!("Updating credential {} for {}", credential_id, principal);
        self.backend
            .update_credential(&self.issuer, principal, credential_id, credential)
            .await?;
        Ok(())
    }

    /// First issuance phase.
    pub async fn prepare_credential(
        &self,
        request: &PrepareCredentialRequest,
    ) -> Result<PreparedCredentialData, ServiceError> {
        debug!(
            "Preparing {} credential",
            request.credential_spec.credential_type
        );
        self.backend.prepare_credential(request).await
    }

    /// Second issuance phase. `request.prepared_context` must be the value
    /// returned by [`Self::prepare_credential`], unchanged.
    pub async fn get_credential(&self, request: &GetCredentialRequest) -> Result<IssuedCredentialData, ServiceError> {
        debug!(
            "Fetching prepared {} credential",
            request.credential_spec.credential_type
        );
        self.backend.get_credential(request).await
    }

    /// Runs both issuance phases, forwarding the prepared context untouched.
    pub async fn issue_credential(
        &self,
        request: PrepareCredentialRequest,
    ) -> Result<IssuedCredentialData, ServiceError> {
        let prepared = self.prepare_credential(&request).await?;
        let request = GetCredentialRequest::from_prepared(request, prepared);
        self.get_credential(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::credential::{Claim, ClaimValue};
    use crate::models::issuance::{CredentialSpec, SignedIdAlias};
    use crate::storage::credential_store::InMemoryIssuerBackend;
    use mockito::{mock, Matcher};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn principal() -> Principal {
        Principal::from_text("76y74-qa4vu-2cdd6-typ2d-4c57m-jixbc-dmusq-uvl3n-635df-if7wp-qae").unwrap()
    }

    fn issuer() -> Principal {
        Principal::from_text("rrkah-fqaaa-aaaaa-aaaaq-cai").unwrap()
    }

    fn in_memory() -> CredentialService<InMemoryIssuerBackend> {
        CredentialService::new(InMemoryIssuerBackend::new(issuer()), issuer())
    }

    fn verified_adult() -> StoredCredential {
        StoredCredential {
            id: "urn:uuid:6a9c92a9-2530-4e2b-9776-530467e9bbe0".into(),
            context: vec!["https://www.w3.org/2018/credentials/v1".into()],
            types: vec!["VerifiableCredential".into(), "VerifiedAdult".into()],
            claim: vec![Claim::new().with("Is over 18", ClaimValue::Boolean(true))],
            issuer: "https://civic.com".into(),
        }
    }

    fn http_backend(prefix: &str) -> HttpIssuerBackend {
        HttpIssuerBackend::new(&format!("{}/{}", mockito::server_url(), prefix), TIMEOUT).unwrap()
    }

    #[tokio::test]
    async fn test_add_then_get_credentials() {
        let service = in_memory();
        let p = principal();

        let id = service.add_credential(&p, verified_adult()).await.unwrap();
        assert!(!id.is_empty());

        let credentials = service.get_credentials(&p).await.unwrap();
        assert!(credentials.iter().any(|c| c.id == id));
    }

    #[tokio::test]
    async fn test_unknown_principal_is_an_error() {
        let service = in_memory();

        let err = service.get_credentials(&principal()).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Credential(CredentialError::NoCredentialsFound(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_claims_are_refused_locally() {
        let service = in_memory();
        let mut credential = verified_adult();
        credential.claim.clear();

        let err = service.add_credential(&principal(), credential).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidCredential(InvalidCredential::NoClaims(_))));

        // Nothing reached the backend.
        assert!(service.get_credentials(&principal()).await.is_err());
    }

    #[tokio::test]
    async fn test_update_and_remove() {
        let service = in_memory();
        let p = principal();
        let id = service.add_credential(&p, verified_adult()).await.unwrap();

        let mut updated = verified_adult();
        updated.claim = vec![Claim::new().with("Is over 21", ClaimValue::Boolean(true))];
        service.update_credential(&p, &id, updated.clone()).await.unwrap();
        assert_eq!(service.get_credentials(&p).await.unwrap(), vec![updated]);

        service.remove_credential(&p, &id).await.unwrap();
        assert!(service.get_credentials(&p).await.unwrap().is_empty());

        let err = service.remove_credential(&p, &id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Credential(CredentialError::NoCredentialsFound(_))));
    }

    #[tokio::test]
    async fn test_two_phase_issuance() {
        let backend = InMemoryIssuerBackend::new(issuer());
        let alias = SignedIdAlias { credential_jws: "alias-jws".into() };
        backend.register_id_alias(&alias, principal());
        let service = CredentialService::new(backend, issuer());
        service.add_credential(&principal(), verified_adult()).await.unwrap();

        let issued = service
            .issue_credential(PrepareCredentialRequest {
                signed_id_alias: alias,
                credential_spec: CredentialSpec::new("VerifiedAdult"),
            })
            .await
            .unwrap();

        assert_eq!(issued.vc_jws.split('.').count(), 3);
    }

    #[tokio::test]
    async fn test_unsupported_spec_is_reported() {
        let backend = InMemoryIssuerBackend::new(issuer());
        let alias = SignedIdAlias { credential_jws: "alias-jws".into() };
        backend.register_id_alias(&alias, principal());
        let service = CredentialService::new(backend, issuer());

        let err = service
            .prepare_credential(&PrepareCredentialRequest {
                signed_id_alias: alias,
                credential_spec: CredentialSpec::new("VerifiedEmployee"),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Issue(IssueCredentialError::UnsupportedCredentialSpec(_))
        ));
    }

    #[tokio::test]
    async fn test_http_add_credentials() {
        let _m = mock("POST", "/issuer-add/add_credentials")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "principal": principal().as_str()
            })))
            .with_status(200)
            .with_body(r#"{"Ok":"Added credentials"}"#)
            .create();

        let service = CredentialService::new(http_backend("issuer-add"), issuer());
        let id = service.add_credential(&principal(), verified_adult()).await.unwrap();
        assert_eq!(id, "urn:uuid:6a9c92a9-2530-4e2b-9776-530467e9bbe0");
    }

    #[tokio::test]
    async fn test_http_get_credentials_round_trips() {
        let body = serde_json::json!({ "Ok": [verified_adult()] }).to_string();
        let _m = mock("POST", "/issuer-get/get_all_credentials")
            .with_status(200)
            .with_body(body)
            .create();

        let service = CredentialService::new(http_backend("issuer-get"), issuer());
        let credentials = service.get_credentials(&principal()).await.unwrap();
        assert_eq!(credentials, vec![verified_adult()]);
    }

    #[tokio::test]
    async fn test_http_no_credentials_found() {
        let _m = mock("POST", "/issuer-none/get_all_credentials")
            .with_status(200)
            .with_body(r#"{"Err":{"NoCredentialFound":"No credentials found for principal"}}"#)
            .create();

        let service = CredentialService::new(http_backend("issuer-none"), issuer());
        let err = service.get_credentials(&principal()).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Credential(CredentialError::NoCredentialsFound(_))
        ));
    }

    #[tokio::test]
    async fn test_http_unknown_error_variant_fails_loudly() {
        let _m = mock("POST", "/issuer-unknown/get_credential")
            .with_status(200)
            .with_body(r#"{"Err":{"QuotaExceeded":"try later"}}"#)
            .create();

        let service = CredentialService::new(http_backend("issuer-unknown"), issuer());
        let err = service
            .get_credential(&GetCredentialRequest {
                signed_id_alias: SignedIdAlias { credential_jws: "jws".into() },
                credential_spec: CredentialSpec::new("VerifiedAdult"),
                prepared_context: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Decode(DecodeError::UnknownVariant(_))));
    }

    #[tokio::test]
    async fn test_http_server_error_is_transport_error() {
        let _m = mock("POST", "/issuer-down/get_all_credentials")
            .with_status(503)
            .with_body("unavailable")
            .create();

        let service = CredentialService::new(http_backend("issuer-down"), issuer());
        let err = service.get_credentials(&principal()).await.unwrap_err();
        match err {
            ServiceError::Transport(transport) => assert_eq!(transport.status(), Some(503)),
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unauthorized_issuer_cannot_write() {
        let backend = InMemoryIssuerBackend::new(issuer());
        let owner = CredentialService::new(backend, issuer());
        let p = principal();
        let id = owner.add_credential(&p, verified_adult()).await.unwrap();

        let intruder = CredentialService::new(
            InMemoryIssuerBackend::new(issuer()),
            Principal::from_text("aaaaa-aa").unwrap(),
        );
        let unauthorized = |err: ServiceError| {
            matches!(err, ServiceError::Credential(CredentialError::UnauthorizedSubject(_)))
        };

        assert!(unauthorized(intruder.add_credential(&p, verified_adult()).await.unwrap_err()));
        assert!(unauthorized(
            intruder.update_credential(&p, &id, verified_adult()).await.unwrap_err()
        ));
        assert!(unauthorized(intruder.remove_credential(&p, &id).await.unwrap_err()));

        // Reads are open to anyone.
        assert_eq!(owner.get_credentials(&p).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_http_write_carries_caller_and_token() {
        let token = AuthToken::from_jwt(crate::models::proof::SAMPLE_JWT).unwrap();
        let _m = mock("POST", "/issuer-auth/remove_credential")
            .match_header("authorization", format!("Bearer {}", token.as_str()).as_str())
            .match_body(Matcher::PartialJson(serde_json::json!({
                "caller": issuer().as_str(),
                "credential_id": "urn:uuid:1"
            })))
            .with_status(200)
            .with_body(r#"{"Ok":"Credential with ID urn:uuid:1 removed successfully"}"#)
            .create();

        let backend = http_backend("issuer-auth").with_bearer_token(&token);
        assert!(!format!("{:?}", backend).contains(token.as_str()));

        let service = CredentialService::new(backend, issuer());
        service.remove_credential(&principal(), "urn:uuid:1").await.unwrap();
    }

    #[tokio::test]
    async fn test_http_unauthorized_subject() {
        let _m = mock("POST", "/issuer-denied/update_credential")
            .with_status(200)
            .with_body(r#"{"Err":{"UnauthorizedSubject":"Unauthorized: You do not have permission to update credentials."}}"#)
            .create();

        let service = CredentialService::new(http_backend("issuer-denied"), issuer());
        let err = service
            .update_credential(&principal(), "urn:uuid:1", verified_adult())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Credential(CredentialError::UnauthorizedSubject(_))
        ));
    }

    #[test]
    fn test_endpoint_base_keeps_path() {
        let base = endpoint_base("http://127.0.0.1:4943/issuer").unwrap();
        assert_eq!(
            base.join("get_credential").unwrap().as_str(),
            "http://127.0.0.1:4943/issuer/get_credential"
        );
    }
}
