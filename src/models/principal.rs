// src/models/principal.rs
//! Principal identifiers issued by the identity provider.
//!
//! A principal is rendered in its textual form: lowercase base32 groups
//! separated by dashes, e.g. `76y74-qa4vu-2cdd6-typ2d-4c57m-jixbc-dmusq-uvl3n-635df-if7wp-qae`.
//! The client only checks that shape; the identity provider is the authority
//! on what a valid principal is.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// DID method prefix used when presenting a principal as a DID.
pub const DID_PREFIX: &str = "did:icp:v0:";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrincipalError {
    #[error("principal must not be empty")]
    Empty,
    #[error("principal {0:?} contains characters outside the textual principal alphabet")]
    InvalidCharacters(String),
}

/// A stable subject identifier returned by the identity provider.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct Principal(String);

impl Principal {
    /// Parses the textual form of a principal.
    ///
    /// # Arguments
    /// * `text` - Dash-separated base32 text, e.g. `aaaaa-aa`; surrounding
    ///   whitespace is ignored
    ///
    /// # Errors
    /// - [`PrincipalError::Empty`] for blank input
    /// - [`PrincipalError::InvalidCharacters`] for characters outside
    ///   `a-z`, `2-7` and `-`, or a leading/trailing dash
    pub fn from_text(text: &str) -> Result<Self, PrincipalError> {
        text.parse()
    }

    /// Textual form of the principal, as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The principal as a DID, e.g. `did:icp:v0:aaaaa-aa`.
    pub fn did(&self) -> String {
        format!("{}{}", DID_PREFIX, self.0)
    }
}

impl FromStr for Principal {
    type Err = PrincipalError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = text.trim();
        if text.is_empty() {
            return Err(PrincipalError::Empty);
        }
        let valid = text
            .chars()
            .all(|c| c == '-' || c.is_ascii_lowercase() || ('2'..='7').contains(&c));
        if !valid || text.starts_with('-') || text.ends_with('-') {
            return Err(PrincipalError::InvalidCharacters(text.to_string()));
        }
        Ok(Principal(text.to_string()))
    }
}

impl TryFrom<String> for Principal {
    type Error = PrincipalError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        text.parse()
    }
}

impl From<Principal> for String {
    fn from(principal: Principal) -> Self {
        principal.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
