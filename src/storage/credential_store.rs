// src/storage/credential_store.rs
//! In-memory issuer backend.
//!
//! Reproduces the issuer backend contract without a network:
//! - Only authorized issuers may add, update or remove credentials; the admin
//!   is authorized from the start and manages the issuer list
//! - Credentials are kept per principal, in insertion order
//! - Adding a credential whose id is already stored for the principal is a no-op
//! - A principal that was never written to has no record (`NoCredentialsFound`),
//!   while a principal whose credentials were all removed has an empty record
//! - Issuance only supports `VerifiedAdult` and hands out prepared contexts that
//!   must come back unchanged
//!
//! Used by the offline tests and as a reference for backend behaviour.

use crate::models::credential::StoredCredential;
use crate::models::issuance::{
    CredentialError, CredentialSpec, GetCredentialRequest, IssueCredentialError, IssuedCredentialData,
    PrepareCredentialRequest, PreparedContext, PreparedCredentialData, SignedIdAlias,
};
use crate::models::principal::Principal;
use crate::services::credential_service::{IssuerBackend, ServiceError};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, warn};
use rand::RngCore;
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Credential types this backend can issue.
pub const SUPPORTED_CREDENTIAL_TYPES: [&str; 1] = ["VerifiedAdult"];

/// Lifetime of an issued credential.
const VC_EXPIRATION_MINUTES: i64 = 15;

const PREPARED_CONTEXT_LEN: usize = 32;

/// Per-principal credential lists.
///
/// # Note
/// Not synchronised; [`InMemoryIssuerBackend`] wraps it in a mutex.
#[derive(Debug, Default)]
pub struct CredentialStore {
    credentials: HashMap<Principal, Vec<StoredCredential>>,
}

impl CredentialStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores credentials for `principal`, skipping ids it already holds.
    ///
    /// # Returns
    /// Ids of the credentials that were actually added.
    pub fn store_credentials(&mut self, principal: &Principal, credentials: Vec<StoredCredential>) -> Vec<String> {
        let entry = self.credentials.entry(principal.clone()).or_default();
        let mut added = Vec::new();
        for credential in credentials {
            if !entry.iter().any(|c| c.id == credential.id) {
                added.push(credential.id.clone());
                entry.push(credential);
            }
        }
        added
    }

    /// All credentials of `principal`, or `None` if the principal has no record.
    pub fn get_credentials(&self, principal: &Principal) -> Option<&[StoredCredential]> {
        self.credentials.get(principal).map(Vec::as_slice)
    }

    /// Looks up a single credential.
    ///
    /// # Arguments
    /// * `principal` - Owner of the credential
    /// * `id` - Credential identifier
    ///
    /// # Returns
    /// The credential, or `None` if the principal holds no credential with that id.
    pub fn get_credential(&self, principal: &Principal, id: &str) -> Option<&StoredCredential> {
        self.credentials.get(principal)?.iter().find(|c| c.id == id)
    }

    /// Number of credentials stored for `principal`.
    pub fn count_credentials(&self, principal: &Principal) -> usize {
        self.credentials.get(principal).map_or(0, Vec::len)
    }

    /// Whether `principal` holds a credential with the given `id`.
    pub fn contains_credential(&self, principal: &Principal, id: &str) -> bool {
        self.get_credential(principal, id).is_some()
    }

    /// Replaces the credential stored under `id`.
    ///
    /// # Returns
    /// `true` if a credential was replaced.
    pub fn replace_credential(&mut self, principal: &Principal, id: &str, credential: StoredCredential) -> bool {
        match self
            .credentials
            .get_mut(principal)
            .and_then(|list| list.iter_mut().find(|c| c.id == id))
        {
            Some(slot) => {
                *slot = credential;
                true
            }
            None => false,
        }
    }

    /// Removes the credential stored under `id`.
    ///
    /// The principal keeps an (possibly empty) record afterwards.
    ///
    /// # Returns
    /// `true` if a credential was removed.
    pub fn remove_credential(&mut self, principal: &Principal, id: &str) -> bool {
        match self.credentials.get_mut(principal) {
            Some(list) => {
                let before = list.len();
                list.retain(|c| c.id != id);
                list.len() != before
            }
            None => false,
        }
    }
}

/// A prepared issuance waiting for `get_credential`.
#[derive(Debug, Clone)]
struct PreparedIssuance {
    alias: SignedIdAlias,
    spec: CredentialSpec,
    credential_jws: String,
}

/// [`IssuerBackend`] backed by process memory.
#[derive(Debug)]
pub struct InMemoryIssuerBackend {
    admin: Principal,
    issuers: Mutex<BTreeSet<Principal>>,
    store: Mutex<CredentialStore>,
    aliases: Mutex<HashMap<String, Principal>>,
    prepared: Mutex<HashMap<Vec<u8>, PreparedIssuance>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryIssuerBackend {
    /// Creates an empty backend administered by `admin`.
    ///
    /// # Arguments
    /// * `admin` - Principal allowed to manage issuers; it is also the first
    ///   authorized issuer
    pub fn new(admin: Principal) -> Self {
        Self {
            issuers: Mutex::new(BTreeSet::from([admin.clone()])),
            admin,
            store: Mutex::new(CredentialStore::new()),
            aliases: Mutex::new(HashMap::new()),
            prepared: Mutex::new(HashMap::new()),
        }
    }

    /// The principal that manages the issuer list.
    pub fn admin(&self) -> &Principal {
        &self.admin
    }

    /// Authorizes `issuer` to write credentials.
    ///
    /// # Arguments
    /// * `caller` - Must be the admin
    /// * `issuer` - Principal to authorize; adding it twice is a no-op
    ///
    /// # Errors
    /// [`CredentialError::UnauthorizedSubject`] if `caller` is not the admin.
    pub fn add_issuer(&self, caller: &Principal, issuer: Principal) -> Result<(), CredentialError> {
        self.require_admin(caller)?;
        debug!("Authorizing issuer {}", issuer);
        lock(&self.issuers).insert(issuer);
        Ok(())
    }

    /// Revokes the write permission of `issuer`.
    ///
    /// # Errors
    /// [`CredentialError::UnauthorizedSubject`] if `caller` is not the admin.
    pub fn remove_issuer(&self, caller: &Principal, issuer: &Principal) -> Result<(), CredentialError> {
        self.require_admin(caller)?;
        debug!("Revoking issuer {}", issuer);
        lock(&self.issuers).remove(issuer);
        Ok(())
    }

    /// Whether `principal` may write credentials.
    pub fn is_authorized_issuer(&self, principal: &Principal) -> bool {
        lock(&self.issuers).contains(principal)
    }

    fn require_admin(&self, caller: &Principal) -> Result<(), CredentialError> {
        if caller != &self.admin {
            return Err(CredentialError::UnauthorizedSubject(format!(
                "Unauthorized: {} is not the admin",
                caller
            )));
        }
        Ok(())
    }

    fn require_issuer(&self, caller: &Principal, action: &str) -> Result<(), CredentialError> {
        if !self.is_authorized_issuer(caller) {
            warn!("Refusing to {} credentials for unauthorized caller {}", action, caller);
            return Err(CredentialError::UnauthorizedSubject(format!(
                "Unauthorized: You do not have permission to {} credentials.",
                action
            )));
        }
        Ok(())
    }

    /// Makes `alias` resolve to `principal`, standing in for the identity
    /// provider's signed alias verification.
    ///
    /// # Arguments
    /// * `alias` - Alias later presented in issuance requests
    /// * `principal` - Subject the alias stands for
    pub fn register_id_alias(&self, alias: &SignedIdAlias, principal: Principal) {
        lock(&self.aliases).insert(alias.credential_jws.clone(), principal);
    }

    fn resolve_alias(&self, alias: &SignedIdAlias) -> Result<Principal, IssueCredentialError> {
        if alias.credential_jws.trim().is_empty() {
            return Err(IssueCredentialError::InvalidIdAlias("empty id alias".into()));
        }
        lock(&self.aliases)
            .get(&alias.credential_jws)
            .cloned()
            .ok_or_else(|| IssueCredentialError::InvalidIdAlias("id alias could not be verified".into()))
    }

    fn prepare(&self, request: &PrepareCredentialRequest) -> Result<PreparedCredentialData, IssueCredentialError> {
        let credential_type = request.credential_spec.credential_type.as_str();
        if !SUPPORTED_CREDENTIAL_TYPES.contains(&credential_type) {
            return Err(IssueCredentialError::UnsupportedCredentialSpec(format!(
                "Credential {} is not supported",
                credential_type
            )));
        }

        let principal = self.resolve_alias(&request.signed_id_alias)?;
        let credential = {
            let store = lock(&self.store);
            let credentials = store.get_credentials(&principal).ok_or_else(|| {
                IssueCredentialError::UnknownSubject(format!("unknown principal {}", principal))
            })?;
            credentials
                .iter()
                .find(|c| c.has_type(credential_type))
                .cloned()
                .ok_or_else(|| {
                    IssueCredentialError::UnauthorizedSubject(format!("unauthorized principal {}", principal))
                })?
        };

        let credential_jws = build_credential_jws(&principal, &request.credential_spec, credential);
        let mut context = vec![0u8; PREPARED_CONTEXT_LEN];
        rand::thread_rng().fill_bytes(&mut context);

        lock(&self.prepared).insert(
            context.clone(),
            PreparedIssuance {
                alias: request.signed_id_alias.clone(),
                spec: request.credential_spec.clone(),
                credential_jws,
            },
        );
        debug!("Prepared {} credential for {}", credential_type, principal);

        Ok(PreparedCredentialData {
            prepared_context: Some(PreparedContext::from_bytes(context)),
        })
    }

    fn issue(&self, request: &GetCredentialRequest) -> Result<IssuedCredentialData, IssueCredentialError> {
        self.resolve_alias(&request.signed_id_alias)?;
        let context = request
            .prepared_context
            .as_ref()
            .ok_or_else(|| IssueCredentialError::Internal("missing prepared_context".into()))?;

        let mut prepared = lock(&self.prepared);
        let issuance = prepared
            .get(context.as_bytes())
            .ok_or_else(|| IssueCredentialError::SignatureNotFound("no signature prepared for this context".into()))?;

        if issuance.alias != request.signed_id_alias || issuance.spec != request.credential_spec {
            return Err(IssueCredentialError::Internal(
                "request does not match the prepared credential".into(),
            ));
        }

        let vc_jws = issuance.credential_jws.clone();
        prepared.remove(context.as_bytes());
        Ok(IssuedCredentialData { vc_jws })
    }
}

/// Renders `credential` as an unsigned JWS (`header.payload.`).
///
/// Signing belongs to the real issuer and is out of scope here; the empty
/// signature segment keeps the three-part shape.
fn build_credential_jws(principal: &Principal, spec: &CredentialSpec, credential: StoredCredential) -> String {
    let now = Utc::now();
    let subjects: Vec<_> = credential
        .claim
        .into_iter()
        .map(|claim| {
            let mut subject = claim.into_subject();
            subject["id"] = json!(principal.did());
            subject
        })
        .collect();

    let header = json!({ "alg": "none", "typ": "JWT" });
    let payload = json!({
        "iss": credential.issuer,
        "sub": principal.did(),
        "jti": credential.id,
        "nbf": now.timestamp(),
        "exp": (now + ChronoDuration::minutes(VC_EXPIRATION_MINUTES)).timestamp(),
        "vc": {
            "@context": credential.context,
            "type": [crate::models::credential::VERIFIABLE_CREDENTIAL_TYPE, spec.credential_type.as_str()],
            "credentialSubject": subjects,
        }
    });

    format!(
        "{}.{}.",
        base64::encode_config(header.to_string(), base64::URL_SAFE_NO_PAD),
        base64::encode_config(payload.to_string(), base64::URL_SAFE_NO_PAD)
    )
}

#[async_trait]
impl IssuerBackend for InMemoryIssuerBackend {
    async fn add_credentials(
        &self,
        caller: &Principal,
        principal: &Principal,
        credentials: Vec<StoredCredential>,
    ) -> Result<String, ServiceError> {
        self.require_issuer(caller, "add")?;
        let added = lock(&self.store).store_credentials(principal, credentials);
        Ok(format!("Added credentials: {:?}", added))
    }

    async fn get_all_credentials(&self, principal: &Principal) -> Result<Vec<StoredCredential>, ServiceError> {
        lock(&self.store)
            .get_credentials(principal)
            .map(<[StoredCredential]>::to_vec)
            .ok_or_else(|| {
                CredentialError::NoCredentialsFound(format!("No credentials found for principal {}", principal)).into()
            })
    }

    async fn remove_credential(
        &self,
        caller: &Principal,
        principal: &Principal,
        credential_id: &str,
    ) -> Result<String, ServiceError> {
        self.require_issuer(caller, "remove")?;
        if lock(&self.store).remove_credential(principal, credential_id) {
            Ok(format!("Credential with ID {} removed successfully", credential_id))
        } else {
            Err(no_credential(principal, credential_id).into())
        }
    }

    async fn update_credential(
        &self,
        caller: &Principal,
        principal: &Principal,
        credential_id: &str,
        credential: StoredCredential,
    ) -> Result<String, ServiceError> {
        self.require_issuer(caller, "update")?;
        if lock(&self.store).replace_credential(principal, credential_id, credential) {
            Ok(format!("Credential {} updated successfully", credential_id))
        } else {
            Err(no_credential(principal, credential_id).into())
        }
    }

    async fn prepare_credential(
        &self,
        request: &PrepareCredentialRequest,
    ) -> Result<PreparedCredentialData, ServiceError> {
        self.prepare(request).map_err(Into::into)
    }

    async fn get_credential(&self, request: &GetCredentialRequest) -> Result<IssuedCredentialData, ServiceError> {
        self.issue(request).map_err(Into::into)
    }
}

fn no_credential(principal: &Principal, credential_id: &str) -> CredentialError {
    CredentialError::NoCredentialsFound(format!(
        "No credential found with ID {} for principal {}",
        credential_id, principal
    ))
}
