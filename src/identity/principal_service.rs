// src/identity/principal_service.rs
//! Session-scoped principal cache.

use crate::identity::{IdentityError, IdentityProvider};
use crate::models::principal::Principal;
use chrono::{DateTime, Utc};
use log::{debug, info};
use tokio::sync::Mutex;

/// A successful login.
///
/// Created on the first successful authentication and dropped on
/// [`PrincipalService::logout`] or when the service itself is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    principal: Principal,
    established_at: DateTime<Utc>,
}

impl Session {
    fn new(principal: Principal) -> Self {
        Self {
            principal,
            established_at: Utc::now(),
        }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }
}

/// Hands out the principal of the logged-in user, logging in at most once per
/// session.
///
/// Concurrent callers share a single login: the session lock is held for the
/// duration of the handshake.
pub struct PrincipalService<P> {
    provider: P,
    session: Mutex<Option<Session>>,
}

impl<P: IdentityProvider> PrincipalService<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            session: Mutex::new(None),
        }
    }

    /// Returns the session principal, running the provider login if there is
    /// no session yet.
    ///
    /// # Errors
    /// [`IdentityError`] from the provider. A failed login leaves no session
    /// behind and is not retried.
    pub async fn request_principal(&self) -> Result<Principal, IdentityError> {
        let mut session = self.session.lock().await;
        if let Some(existing) = session.as_ref() {
            debug!("Reusing session principal {}", existing.principal);
            return Ok(existing.principal.clone());
        }

        let principal = self.provider.authenticate().await?;
        info!("Logged in as {}", principal);
        *session = Some(Session::new(principal.clone()));
        Ok(principal)
    }

    /// The current session, if any.
    pub async fn session(&self) -> Option<Session> {
        self.session.lock().await.clone()
    }

    /// Ends the session, returning it if one existed.
    pub async fn logout(&self) -> Option<Session> {
        let ended = self.session.lock().await.take();
        if let Some(session) = &ended {
            info!("Logged out {}", session.principal);
        }
        ended
    }
}
