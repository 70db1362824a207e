// src/models/credential.rs
//! Verifiable Credential data model.
//!
//! Defines the credential shape exchanged with the issuer backend: a
//! [`StoredCredential`] carries one or more [`Claim`] trees, and every claim is
//! an ordered list of named [`ClaimValue`]s that may themselves nest further
//! claims.
//!
//! # Wire format
//! Values use serde's externally tagged enum encoding, so a claim such as
//! "Is over 18 = true" travels as:
//! ```json
//! { "claims": [["Is over 18", { "Boolean": true }]] }
//! ```

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// JSON-LD contexts attached to credentials built with [`StoredCredential::builder`].
pub const DEFAULT_CONTEXT: [&str; 2] = [
    "https://www.w3.org/2018/credentials/v1",
    "https://www.w3.org/2018/credentials/examples/v1",
];

/// Base type every credential carries.
pub const VERIFIABLE_CREDENTIAL_TYPE: &str = "VerifiableCredential";

/// A single value inside a [`Claim`].
///
/// Exactly one variant is present. The `Claim` variant makes claims a tree;
/// the nested claim is owned, so the structure can never contain a cycle.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ClaimValue {
    /// Free-form text.
    Text(String),
    /// Boolean assertion, e.g. "Is over 18".
    Boolean(bool),
    /// Signed 64-bit integer.
    Number(i64),
    /// ISO-8601 encoded date or timestamp.
    Date(String),
    /// Nested claim.
    Claim(Claim),
}

impl ClaimValue {
    /// Builds a `Date` value from a UTC timestamp, encoded as RFC 3339 / ISO-8601.
    pub fn date(at: DateTime<Utc>) -> Self {
        ClaimValue::Date(at.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    /// Parses a `Date` value back into a UTC timestamp.
    ///
    /// Returns `None` for non-date variants and for dates that are not valid
    /// RFC 3339 strings.
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            ClaimValue::Date(raw) => DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|parsed| parsed.with_timezone(&Utc)),
            _ => None,
        }
    }
}

impl From<ClaimValue> for Value {
    fn from(claim_value: ClaimValue) -> Self {
        match claim_value {
            ClaimValue::Text(text) => Value::String(text),
            ClaimValue::Boolean(flag) => Value::Bool(flag),
            ClaimValue::Number(number) => Value::Number(number.into()),
            ClaimValue::Date(date) => Value::String(date),
            ClaimValue::Claim(nested) => nested.into_subject(),
        }
    }
}

/// An ordered set of `(name, value)` pairs.
///
/// Names are not required to be unique; lookups by name return the first
/// match in insertion order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Claim {
    pub claims: Vec<(String, ClaimValue)>,
}

impl Claim {
    /// Creates an empty claim.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a named value, returning the claim for chaining.
    pub fn with(mut self, name: impl Into<String>, value: ClaimValue) -> Self {
        self.push(name, value);
        self
    }

    /// Appends a named value.
    pub fn push(&mut self, name: impl Into<String>, value: ClaimValue) {
        self.claims.push((name.into(), value));
    }

    /// Returns the first value recorded under `name`.
    pub fn get(&self, name: &str) -> Option<&ClaimValue> {
        self.claims
            .iter()
            .find(|(claim_name, _)| claim_name == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, ClaimValue)> {
        self.claims.iter()
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Nesting depth of the claim tree. A claim without nested claims has depth 1.
    pub fn depth(&self) -> usize {
        1 + self
            .claims
            .iter()
            .filter_map(|(_, value)| match value {
                ClaimValue::Claim(nested) => Some(nested.depth()),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    /// Renders the claim as a JSON `credentialSubject` object.
    ///
    /// Later duplicates of a name overwrite earlier ones, since a JSON object
    /// cannot hold repeated keys.
    pub fn into_subject(self) -> Value {
        let properties = self
            .claims
            .into_iter()
            .map(|(name, value)| (name, Value::from(value)))
            .collect::<serde_json::Map<String, Value>>();
        Value::Object(properties)
    }
}

/// Reasons a credential is refused before it is sent to the issuer backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidCredential {
    #[error("credential id must not be empty")]
    EmptyId,
    #[error("credential {0} carries no claims")]
    NoClaims(String),
}

/// A credential as stored by the issuer backend.
///
/// The backend owns accepted credentials; values of this type held by the
/// client are transient copies.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredCredential {
    /// Credential identifier, usually a `urn:uuid:` URN.
    pub id: String,

    /// JSON-LD context URIs, in order.
    pub context: Vec<String>,

    /// Credential types, e.g. `["VerifiableCredential", "VerifiedAdult"]`.
    #[serde(rename = "type_", alias = "type")]
    pub types: Vec<String>,

    /// Claims about the subject. Never empty for an accepted credential.
    pub claim: Vec<Claim>,

    /// Issuer URI.
    pub issuer: String,
}

impl StoredCredential {
    /// Starts a credential for `issuer` with a fresh `urn:uuid:` id, the
    /// default contexts and the base `VerifiableCredential` type.
    pub fn builder(issuer: impl Into<String>) -> StoredCredentialBuilder {
        StoredCredentialBuilder {
            credential: StoredCredential {
                id: format!("urn:uuid:{}", uuid::Uuid::new_v4()),
                context: DEFAULT_CONTEXT.iter().map(|c| c.to_string()).collect(),
                types: vec![VERIFIABLE_CREDENTIAL_TYPE.to_string()],
                claim: Vec::new(),
                issuer: issuer.into(),
            },
        }
    }

    /// Checks the invariants the issuer backend relies on: a non-empty id and
    /// at least one claim.
    pub fn validate(&self) -> Result<(), InvalidCredential> {
        if self.id.trim().is_empty() {
            return Err(InvalidCredential::EmptyId);
        }
        if self.claim.is_empty() {
            return Err(InvalidCredential::NoClaims(self.id.clone()));
        }
        Ok(())
    }

    /// Whether the credential lists `credential_type` among its types.
    pub fn has_type(&self, credential_type: &str) -> bool {
        self.types.iter().any(|t| t == credential_type)
    }
}

/// Incremental constructor returned by [`StoredCredential::builder`].
#[derive(Debug, Clone)]
pub struct StoredCredentialBuilder {
    credential: StoredCredential,
}

impl StoredCredentialBuilder {
    /// Replaces the generated id.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.credential.id = id.into();
        self
    }

    /// Adds a credential type.
    pub fn credential_type(mut self, credential_type: impl Into<String>) -> Self {
        self.credential.types.push(credential_type.into());
        self
    }

    /// Adds a JSON-LD context URI.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.credential.context.push(context.into());
        self
    }

    /// Adds a claim.
    pub fn claim(mut self, claim: Claim) -> Self {
        self.credential.claim.push(claim);
        self
    }

    /// Finishes the credential, enforcing [`StoredCredential::validate`].
    pub fn build(self) -> Result<StoredCredential, InvalidCredential> {
        self.credential.validate()?;
        Ok(self.credential)
    }
}
