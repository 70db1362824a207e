// src/identity/mod.rs
//! Identity acquisition.
//!
//! [`PrincipalService`] owns the login session and hands out the principal of
//! the authenticated user; the interactive part is delegated to an
//! [`IdentityProvider`].

pub mod principal_service;
pub mod provider;

pub use principal_service::{PrincipalService, Session};
pub use provider::{IdentityProvider, LoopbackIdentityProvider, PendingLogin};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    /// The provider reported an error, the user cancelled, or the redirect
    /// could not be trusted. Never retried automatically.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("invalid identity provider URL: {0}")]
    InvalidProviderUrl(String),

    /// The local redirect listener could not be started.
    #[error("login callback listener error: {0}")]
    CallbackListener(#[from] std::io::Error),
}
