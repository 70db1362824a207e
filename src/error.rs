// src/error.rs
//! Error types shared by every remote client in the crate.

use std::time::Duration;
use thiserror::Error;

/// Failure to turn a remote payload into a typed value.
///
/// Unknown variant tags are kept apart from other schema mismatches so callers
/// can tell "the backend speaks a newer protocol" from "the payload is garbage".
/// Neither is ever defaulted into a value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown variant: {0}")]
    UnknownVariant(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Failure to complete an HTTP exchange with a backend.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The request never produced a response (connection refused, reset, timeout).
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The backend answered with a non-success status.
    #[error("{url} responded with status {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("invalid endpoint URL: {0}")]
    Url(#[from] url::ParseError),

    /// A call exceeded its per-call deadline.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    /// HTTP status of the failed exchange, when a response was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            TransportError::Request { source, .. } => source.status().map(|s| s.as_u16()),
            TransportError::Url(_) | TransportError::Timeout(_) => None,
        }
    }
}

/// A remote call that failed either on the wire or while decoding the reply.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}
