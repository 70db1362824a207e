// src/models/issuance.rs
//! Request, response and error types of the issuer backend.
//!
//! Issuance is two-phase: `prepare_credential` returns a [`PreparedContext`]
//! that must be handed back unchanged to `get_credential`. Errors are closed
//! enumerations; an unknown tag fails decoding instead of being passed through.

use crate::models::principal::Principal;
use crate::models::credential::StoredCredential;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Value of a [`CredentialSpec`] argument.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ArgumentValue {
    Int(i32),
    String(String),
}

/// Describes the credential a relying party asks for.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CredentialSpec {
    pub credential_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<BTreeMap<String, ArgumentValue>>,
}

impl CredentialSpec {
    /// A spec for `credential_type` with no arguments.
    pub fn new(credential_type: impl Into<String>) -> Self {
        Self {
            credential_type: credential_type.into(),
            arguments: None,
        }
    }

    /// Adds an argument, creating the argument map on first use.
    pub fn with_argument(mut self, name: impl Into<String>, value: ArgumentValue) -> Self {
        self.arguments
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value);
        self
    }
}

/// Signed assertion binding a session identity to a principal.
///
/// Produced by the identity layer; this crate never looks inside it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignedIdAlias {
    pub credential_jws: String,
}

/// Opaque capability returned by `prepare_credential`.
///
/// The bytes belong to the backend and have no public accessors; they
/// are only ever forwarded, byte for byte, to `get_credential`.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct PreparedContext(#[serde(with = "crate::utils::serialization::base64_bytes")] Vec<u8>);

impl PreparedContext {
    pub(crate) fn from_bytes(bytes: Vec<u8>) -> Self {
        PreparedContext(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PreparedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PreparedContext(<{} bytes>)", self.0.len())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PrepareCredentialRequest {
    pub signed_id_alias: SignedIdAlias,
    pub credential_spec: CredentialSpec,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PreparedCredentialData {
    #[serde(default)]
    pub prepared_context: Option<PreparedContext>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GetCredentialRequest {
    pub signed_id_alias: SignedIdAlias,
    pub credential_spec: CredentialSpec,
    #[serde(default)]
    pub prepared_context: Option<PreparedContext>,
}

impl GetCredentialRequest {
    /// Builds the second-phase request from the first-phase request and its
    /// response, carrying the prepared context over untouched.
    pub fn from_prepared(request: PrepareCredentialRequest, prepared: PreparedCredentialData) -> Self {
        Self {
            signed_id_alias: request.signed_id_alias,
            credential_spec: request.credential_spec,
            prepared_context: prepared.prepared_context,
        }
    }
}

/// An issued credential, serialized as a JWS.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IssuedCredentialData {
    pub vc_jws: String,
}

/// Errors returned by the credential storage methods of the issuer backend.
#[derive(Error, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// The principal has no credential record, or the addressed credential
    /// does not exist.
    #[serde(alias = "NoCredentialFound")]
    #[error("no credentials found: {0}")]
    NoCredentialsFound(String),
    #[error("unauthorized subject: {0}")]
    UnauthorizedSubject(String),
}

/// Errors returned by the two-phase issuance methods of the issuer backend.
#[derive(Error, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum IssueCredentialError {
    #[error("internal issuer error: {0}")]
    Internal(String),
    #[error("signature not found: {0}")]
    SignatureNotFound(String),
    #[error("invalid id alias: {0}")]
    InvalidIdAlias(String),
    #[error("unauthorized subject: {0}")]
    UnauthorizedSubject(String),
    #[error("unknown subject: {0}")]
    UnknownSubject(String),
    #[error("unsupported credential spec: {0}")]
    UnsupportedCredentialSpec(String),
}

/// Result envelope used on the wire: `{"Ok": ...}` or `{"Err": ...}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Reply<T, E> {
    Ok(T),
    Err(E),
}

impl<T, E> From<Reply<T, E>> for Result<T, E> {
    fn from(reply: Reply<T, E>) -> Self {
        match reply {
            Reply::Ok(value) => Ok(value),
            Reply::Err(err) => Err(err),
        }
    }
}

impl<T, E> From<Result<T, E>> for Reply<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Reply::Ok(value),
            Err(err) => Reply::Err(err),
        }
    }
}

/// Body of `add_credentials`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AddCredentialsRequest {
    /// Issuer on whose behalf the write is made
    pub caller: Principal,
    pub principal: Principal,
    pub credentials: Vec<StoredCredential>,
}

/// Body of `get_all_credentials`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PrincipalRequest {
    pub principal: Principal,
}

/// Body of `remove_credential`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RemoveCredentialRequest {
    /// Issuer on whose behalf the write is made
    pub caller: Principal,
    pub principal: Principal,
    pub credential_id: String,
}

/// Body of `update_credential`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UpdateCredentialRequest {
    /// Issuer on whose behalf the write is made
    pub caller: Principal,
    pub principal: Principal,
    pub credential_id: String,
    pub credential: StoredCredential,
}
