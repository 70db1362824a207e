// src/services/proof_exchange.rs
//! Challenge-response exchange for an authentication token.
//!
//! ```text
//! Unauthenticated -> Authenticated -> NonceRequested -> ProofProduced
//!     -> TokenPending -> TokenObtained | Failed
//! ```
//!
//! Every transition is explicit: [`ProofExchange::step`] performs exactly one,
//! and any state may move to `Failed`. Only the token request is retried, and
//! only while the backend answers with a server error or not at all.

use crate::error::TransportError;
use crate::identity::{IdentityProvider, PrincipalService};
use crate::models::principal::Principal;
use crate::models::proof::{AuthToken, AuthenticateRequest, Nonce, Proof, TokenResponse};
use crate::services::signer::ProofSigner;
use crate::services::verifier::{TokenAttempt, VerificationBackend};
use crate::utils::retries::{poll_until_condition_met, CancelSignal, PollConfig, RetryError};
use crate::utils::serialization::decode;
use log::{debug, info, warn};
use std::future::Future;
use std::mem;
use std::time::Duration;
use thiserror::Error;

/// Chain name sent with every token request unless configured otherwise.
pub const DEFAULT_CHAIN: &str = "ICP";

/// Network name sent with every token request unless configured otherwise.
/// Empty, as the Civic Sign web client sends it.
pub const DEFAULT_NETWORK: &str = "";

/// Upper bound for a single remote call unless configured otherwise.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Why an exchange ended in [`ExchangeState::Failed`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeFailure {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The nonce could not be fetched. Not retried.
    #[error("nonce unavailable: {0}")]
    NonceUnavailable(String),

    #[error("proof generation failed: {0}")]
    ProofGenerationFailed(String),

    /// The verification backend refused the proof (4xx). Not retried.
    #[error("token request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Every token request failed with a server error or no response.
    #[error("token request failed after {attempts} attempts (last status: {last_status:?})")]
    RetriesExhausted { attempts: u32, last_status: Option<u16> },

    #[error("exchange cancelled")]
    Cancelled,

    /// The backend accepted the proof but did not return a usable token.
    #[error("malformed token response: {0}")]
    MalformedToken(String),

    /// A step was abandoned half way (its future was dropped).
    #[error("exchange interrupted")]
    Interrupted,
}

/// Where an exchange currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeState {
    Unauthenticated,
    Authenticated(Principal),
    NonceRequested { principal: Principal, nonce: Nonce },
    /// The nonce itself is gone at this point; only its timestamp travels on.
    ProofProduced {
        principal: Principal,
        proof: Proof,
        nonce_timestamp: i64,
    },
    TokenPending(AuthenticateRequest),
    TokenObtained(AuthToken),
    Failed(ExchangeFailure),
}

impl ExchangeState {
    /// Whether the exchange is over (`TokenObtained` or `Failed`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExchangeState::TokenObtained(_) | ExchangeState::Failed(_))
    }

    fn name(&self) -> &'static str {
        match self {
            ExchangeState::Unauthenticated => "Unauthenticated",
            ExchangeState::Authenticated(_) => "Authenticated",
            ExchangeState::NonceRequested { .. } => "NonceRequested",
            ExchangeState::ProofProduced { .. } => "ProofProduced",
            ExchangeState::TokenPending(_) => "TokenPending",
            ExchangeState::TokenObtained(_) => "TokenObtained",
            ExchangeState::Failed(_) => "Failed",
        }
    }
}

/// Tunables of an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSettings {
    pub chain: String,
    pub network: String,
    /// Retry policy of the token request
    pub poll: PollConfig,
    /// Deadline of each individual remote call
    pub call_timeout: Duration,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            chain: DEFAULT_CHAIN.to_string(),
            network: DEFAULT_NETWORK.to_string(),
            poll: PollConfig::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// One run of the challenge-response protocol.
///
/// An instance is single use: once it reaches a terminal state further steps
/// are no-ops. A fresh exchange always fetches a fresh nonce.
pub struct ProofExchange<'a, P, V, S> {
    principals: &'a PrincipalService<P>,
    verifier: &'a V,
    signer: &'a S,
    settings: ExchangeSettings,
    cancel: Option<CancelSignal>,
    state: ExchangeState,
}

impl<'a, P, V, S> ProofExchange<'a, P, V, S>
where
    P: IdentityProvider,
    V: VerificationBackend,
    S: ProofSigner,
{
    /// Creates an exchange in the `Unauthenticated` state.
    ///
    /// # Arguments
    /// * `principals` - Session used to log in (an existing session is reused)
    /// * `verifier` - Nonce and token endpoints
    /// * `signer` - Turns the nonce into a proof
    /// * `settings` - Chain/network labels, retry policy and per-call deadline
    pub fn new(
        principals: &'a PrincipalService<P>,
        verifier: &'a V,
        signer: &'a S,
        settings: ExchangeSettings,
    ) -> Self {
        Self {
            principals,
            verifier,
            signer,
            settings,
            cancel: None,
            state: ExchangeState::Unauthenticated,
        }
    }

    /// Makes every subsequent step abort with [`ExchangeFailure::Cancelled`]
    /// once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Current state; only changes through [`Self::step`] and [`Self::run`].
    pub fn state(&self) -> &ExchangeState {
        &self.state
    }

    /// Performs a single transition and returns the new state.
    ///
    /// Checks for cancellation first. Terminal states are returned unchanged.
    /// If the returned future is dropped mid-step the exchange is left in
    /// `Failed(Interrupted)`.
    pub async fn step(&mut self) -> &ExchangeState {
        if self.state.is_terminal() {
            return &self.state;
        }

        let current = mem::replace(&mut self.state, ExchangeState::Failed(ExchangeFailure::Interrupted));
        let from = current.name();
        let next = if self.cancel.as_ref().map_or(false, CancelSignal::is_cancelled) {
            ExchangeState::Failed(ExchangeFailure::Cancelled)
        } else {
            self.transition(current).await
        };

        match &next {
            ExchangeState::Failed(reason) => warn!("Proof exchange failed in {}: {}", from, reason),
            other => debug!("Proof exchange {} -> {}", from, other.name()),
        }
        self.state = next;
        &self.state
    }

    /// Steps until a terminal state is reached.
    ///
    /// # Errors
    /// The [`ExchangeFailure`] of the `Failed` state.
    pub async fn run(&mut self) -> Result<AuthToken, ExchangeFailure> {
        while !self.state.is_terminal() {
            self.step().await;
        }
        match &self.state {
            ExchangeState::TokenObtained(token) => {
                info!("Obtained {:?} token", token.algorithm());
                Ok(token.clone())
            }
            ExchangeState::Failed(reason) => Err(reason.clone()),
            _ => Err(ExchangeFailure::Interrupted),
        }
    }

    async fn transition(&self, current: ExchangeState) -> ExchangeState {
        match current {
            ExchangeState::Unauthenticated => {
                match self.unless_cancelled(self.principals.request_principal()).await {
                    Some(Ok(principal)) => ExchangeState::Authenticated(principal),
                    Some(Err(e)) => ExchangeState::Failed(ExchangeFailure::AuthenticationFailed(e.to_string())),
                    None => ExchangeState::Failed(ExchangeFailure::Cancelled),
                }
            }

            ExchangeState::Authenticated(principal) => {
                match self.bounded(self.verifier.fetch_nonce()).await {
                    Some(Ok(Ok(nonce))) => ExchangeState::NonceRequested { principal, nonce },
                    Some(Ok(Err(e))) => ExchangeState::Failed(ExchangeFailure::NonceUnavailable(e.to_string())),
                    Some(Err(timeout)) => {
                        ExchangeState::Failed(ExchangeFailure::NonceUnavailable(timeout.to_string()))
                    }
                    None => ExchangeState::Failed(ExchangeFailure::Cancelled),
                }
            }

            ExchangeState::NonceRequested { principal, nonce } => {
                match self.bounded(self.signer.request_proof(&principal, &nonce)).await {
                    Some(Ok(Ok(proof))) => ExchangeState::ProofProduced {
                        principal,
                        proof,
                        nonce_timestamp: nonce.timestamp,
                    },
                    Some(Ok(Err(e))) => {
                        ExchangeState::Failed(ExchangeFailure::ProofGenerationFailed(e.to_string()))
                    }
                    Some(Err(timeout)) => {
                        ExchangeState::Failed(ExchangeFailure::ProofGenerationFailed(timeout.to_string()))
                    }
                    None => ExchangeState::Failed(ExchangeFailure::Cancelled),
                }
            }

            ExchangeState::ProofProduced {
                principal,
                proof,
                nonce_timestamp,
            } => ExchangeState::TokenPending(AuthenticateRequest {
                did: principal.did(),
                address: principal.to_string(),
                chain: self.settings.chain.clone(),
                network: self.settings.network.clone(),
                proof,
                nonce_timestamp,
            }),

            ExchangeState::TokenPending(request) => self.request_token(request).await,

            terminal @ (ExchangeState::TokenObtained(_) | ExchangeState::Failed(_)) => terminal,
        }
    }

    /// Submits the proof, retrying while the backend answers 5xx or not at all.
    ///
    /// Consumes the request so the same proof and nonce are never submitted by
    /// a later step.
    async fn request_token(&self, request: AuthenticateRequest) -> ExchangeState {
        let call_timeout = self.settings.call_timeout;
        let outcome = poll_until_condition_met(
            "authenticate",
            || async {
                match tokio::time::timeout(call_timeout, self.verifier.authenticate(&request)).await {
                    Ok(attempt) => attempt,
                    Err(_) => TokenAttempt::Unreachable(TransportError::Timeout(call_timeout).to_string()),
                }
            },
            |attempt: &TokenAttempt| matches!(attempt.status(), Some(status) if status < 500),
            self.settings.poll,
            self.cancel.as_ref(),
        )
        .await;

        let failure = match outcome {
            Ok(TokenAttempt::Responded { status, body }) if status < 400 => return token_from_body(&body),
            Ok(TokenAttempt::Responded { status, body }) => ExchangeFailure::Rejected { status, message: body },
            // Never accepted by the predicate; counts as running out of attempts.
            Ok(TokenAttempt::Unreachable(_)) => ExchangeFailure::RetriesExhausted {
                attempts: self.settings.poll.max_attempts,
                last_status: None,
            },
            Err(RetryError::RetriesExhausted { attempts, last, .. }) => ExchangeFailure::RetriesExhausted {
                attempts,
                last_status: last.as_ref().and_then(TokenAttempt::status),
            },
            Err(RetryError::Cancelled { .. }) => ExchangeFailure::Cancelled,
        };
        ExchangeState::Failed(failure)
    }

    /// Runs `fut` under the per-call deadline, unless the exchange is cancelled.
    ///
    /// # Returns
    /// - `None` if the exchange was cancelled first
    /// - `Some(Err(TransportError::Timeout))` if the deadline passed
    async fn bounded<F: Future>(&self, fut: F) -> Option<Result<F::Output, TransportError>> {
        let call_timeout = self.settings.call_timeout;
        self.unless_cancelled(async move {
            tokio::time::timeout(call_timeout, fut)
                .await
                .map_err(|_| TransportError::Timeout(call_timeout))
        })
        .await
    }

    async fn unless_cancelled<F: Future>(&self, fut: F) -> Option<F::Output> {
        match self.cancel.clone() {
            Some(mut signal) => tokio::select! {
                output = fut => Some(output),
                _ = signal.cancelled() => None,
            },
            None => Some(fut.await),
        }
    }
}

fn token_from_body(body: &str) -> ExchangeState {
    let token = decode::<TokenResponse>(body)
        .map_err(|e| e.to_string())
        .and_then(|response| AuthToken::from_jwt(response.token).map_err(|e| e.to_string()));
    match token {
        Ok(token) => ExchangeState::TokenObtained(token),
        Err(reason) => ExchangeState::Failed(ExchangeFailure::MalformedToken(reason)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::identity::IdentityError;
    use crate::models::proof::SAMPLE_JWT;
    use crate::services::signer::SignerError;
    use crate::utils::retries::cancel_pair;
    use async_trait::async_trait;
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio_test::assert_ok;

    const PRINCIPAL: &str = "76y74-qa4vu-2cdd6-typ2d-4c57m-jixbc-dmusq-uvl3n-635df-if7wp-qae";

    struct StaticProvider {
        fail: bool,
    }

    #[async_trait]
    impl IdentityProvider for StaticProvider {
        async fn authenticate(&self) -> Result<Principal, IdentityError> {
            if self.fail {
                return Err(IdentityError::AuthenticationFailed("UserInterrupt".into()));
            }
            Ok(Principal::from_text(PRINCIPAL).unwrap())
        }
    }

    /// Verification backend that enforces single-use nonces and can be scripted
    /// with canned token responses.
    #[derive(Default)]
    struct FakeVerifier {
        nonce_unavailable: bool,
        nonce_hangs: bool,
        token_hangs: bool,
        scripted: Mutex<VecDeque<TokenAttempt>>,
        used: Mutex<HashSet<i64>>,
        submissions: AtomicU32,
        last_request: Mutex<Option<AuthenticateRequest>>,
    }

    impl FakeVerifier {
        fn scripted(attempts: Vec<TokenAttempt>) -> Self {
            Self {
                scripted: Mutex::new(attempts.into()),
                ..Self::default()
            }
        }

        fn submissions(&self) -> u32 {
            self.submissions.load(Ordering::SeqCst)
        }
    }

    fn token_body() -> String {
        format!(r#"{{"token":"{}"}}"#, SAMPLE_JWT)
    }

    fn responded(status: u16, body: &str) -> TokenAttempt {
        TokenAttempt::Responded { status, body: body.to_string() }
    }

    #[async_trait]
    impl VerificationBackend for FakeVerifier {
        async fn fetch_nonce(&self) -> Result<Nonce, RemoteError> {
            if self.nonce_hangs {
                std::future::pending::<()>().await;
            }
            if self.nonce_unavailable {
                return Err(TransportError::Status {
                    url: "http://verifier/nonce".into(),
                    status: 503,
                    body: String::new(),
                }
                .into());
            }
            // Always the same nonce, as a replaying backend would.
            Ok(Nonce { nonce: "n-1".into(), timestamp: 1_700_000_000_000 })
        }

        async fn authenticate(&self, request: &AuthenticateRequest) -> TokenAttempt {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(request.clone());
            if self.token_hangs {
                std::future::pending::<()>().await;
            }
            if let Some(attempt) = self.scripted.lock().unwrap().pop_front() {
                return attempt;
            }
            if !self.used.lock().unwrap().insert(request.nonce_timestamp) {
                return responded(400, "nonce already used");
            }
            responded(200, &token_body())
        }
    }

    #[derive(Default)]
    struct FakeSigner {
        decline: bool,
        hangs: bool,
    }

    #[async_trait]
    impl ProofSigner for FakeSigner {
        async fn request_proof(&self, _principal: &Principal, nonce: &Nonce) -> Result<Proof, SignerError> {
            if self.hangs {
                std::future::pending::<()>().await;
            }
            if self.decline {
                return Err(SignerError::Declined("no key".into()));
            }
            Ok(Proof::new(format!("signed:{}", nonce.nonce)))
        }
    }

    fn settings(max_attempts: u32) -> ExchangeSettings {
        ExchangeSettings {
            poll: PollConfig { interval: Duration::ZERO, max_attempts },
            ..ExchangeSettings::default()
        }
    }

    #[tokio::test]
    async fn test_exchange_obtains_token() {
        let principals = PrincipalService::new(StaticProvider { fail: false });
        let verifier = FakeVerifier::default();
        let signer = FakeSigner::default();
        let mut exchange = ProofExchange::new(&principals, &verifier, &signer, settings(3));

        assert!(matches!(exchange.step().await, ExchangeState::Authenticated(_)));
        assert!(matches!(exchange.step().await, ExchangeState::NonceRequested { .. }));
        assert!(matches!(exchange.step().await, ExchangeState::ProofProduced { .. }));
        assert!(matches!(exchange.step().await, ExchangeState::TokenPending(_)));
        assert!(matches!(exchange.step().await, ExchangeState::TokenObtained(_)));

        let token = assert_ok!(exchange.run().await);
        assert_eq!(token.as_str(), SAMPLE_JWT);

        let sent = verifier.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(sent.did, format!("did:icp:v0:{}", PRINCIPAL));
        assert_eq!(sent.address, PRINCIPAL);
        assert_eq!(sent.chain, "ICP");
        assert_eq!(sent.proof.as_str(), "signed:n-1");
        assert_eq!(sent.nonce_timestamp, 1_700_000_000_000);
    }

    #[tokio::test]
    async fn test_reused_nonce_is_rejected_without_retry() {
        let principals = PrincipalService::new(StaticProvider { fail: false });
        let verifier = FakeVerifier::default();
        let signer = FakeSigner::default();

        let first = ProofExchange::new(&principals, &verifier, &signer, settings(5)).run().await;
        assert!(first.is_ok());

        let mut second = ProofExchange::new(&principals, &verifier, &signer, settings(5));
        let err = second.run().await.unwrap_err();
        assert_eq!(
            err,
            ExchangeFailure::Rejected { status: 400, message: "nonce already used".into() }
        );
        assert_eq!(verifier.submissions(), 2);
        assert!(matches!(second.state(), ExchangeState::Failed(_)));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_then_succeed() {
        let principals = PrincipalService::new(StaticProvider { fail: false });
        let verifier = FakeVerifier::scripted(vec![
            responded(500, "busy"),
            TokenAttempt::Unreachable("connection reset".into()),
        ]);
        let signer = FakeSigner::default();

        let token = ProofExchange::new(&principals, &verifier, &signer, settings(5)).run().await;
        assert!(token.is_ok());
        assert_eq!(verifier.submissions(), 3);
    }

    #[tokio::test]
    async fn test_persistent_server_errors_exhaust_retries() {
        let principals = PrincipalService::new(StaticProvider { fail: false });
        let verifier = FakeVerifier::scripted(vec![responded(503, "down"); 4]);
        let signer = FakeSigner::default();

        let err = ProofExchange::new(&principals, &verifier, &signer, settings(4))
            .run()
            .await
            .unwrap_err();
        assert_eq!(err, ExchangeFailure::RetriesExhausted { attempts: 4, last_status: Some(503) });
        assert_eq!(verifier.submissions(), 4);
    }

    #[tokio::test]
    async fn test_success_without_jwt_is_malformed() {
        let principals = PrincipalService::new(StaticProvider { fail: false });
        let verifier = FakeVerifier::scripted(vec![responded(200, r#"{"token":"not-a-jwt"}"#)]);
        let signer = FakeSigner::default();

        let err = ProofExchange::new(&principals, &verifier, &signer, settings(3))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeFailure::MalformedToken(_)));
    }

    #[tokio::test]
    async fn test_early_failures() {
        let failing_login = PrincipalService::new(StaticProvider { fail: true });
        let principals = PrincipalService::new(StaticProvider { fail: false });
        let verifier = FakeVerifier::default();
        let no_nonce = FakeVerifier { nonce_unavailable: true, ..FakeVerifier::default() };

        let err = ProofExchange::new(&failing_login, &verifier, &FakeSigner::default(), settings(3))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeFailure::AuthenticationFailed(_)));

        let err = ProofExchange::new(&principals, &no_nonce, &FakeSigner::default(), settings(3))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeFailure::NonceUnavailable(_)));

        let declining = FakeSigner { decline: true, ..FakeSigner::default() };
        let err = ProofExchange::new(&principals, &verifier, &declining, settings(3))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeFailure::ProofGenerationFailed(_)));

        assert_eq!(verifier.submissions(), 0);
        assert_eq!(no_nonce.submissions(), 0);
    }

    fn impatient(max_attempts: u32) -> ExchangeSettings {
        ExchangeSettings {
            call_timeout: Duration::from_millis(50),
            ..settings(max_attempts)
        }
    }

    #[tokio::test]
    async fn test_unanswered_token_request_times_out_and_is_retried() {
        let principals = PrincipalService::new(StaticProvider { fail: false });
        let verifier = FakeVerifier { token_hangs: true, ..FakeVerifier::default() };
        let signer = FakeSigner::default();

        let err = ProofExchange::new(&principals, &verifier, &signer, impatient(2))
            .run()
            .await
            .unwrap_err();
        assert_eq!(err, ExchangeFailure::RetriesExhausted { attempts: 2, last_status: None });
        assert_eq!(verifier.submissions(), 2);
    }

    #[tokio::test]
    async fn test_unanswered_nonce_request_times_out() {
        let principals = PrincipalService::new(StaticProvider { fail: false });
        let verifier = FakeVerifier { nonce_hangs: true, ..FakeVerifier::default() };
        let signer = FakeSigner::default();

        let err = ProofExchange::new(&principals, &verifier, &signer, impatient(3))
            .run()
            .await
            .unwrap_err();
        match err {
            ExchangeFailure::NonceUnavailable(reason) => assert!(reason.contains("timed out")),
            other => panic!("expected NonceUnavailable, got {:?}", other),
        }
        assert_eq!(verifier.submissions(), 0);
    }

    #[tokio::test]
    async fn test_unanswered_signer_times_out() {
        let principals = PrincipalService::new(StaticProvider { fail: false });
        let verifier = FakeVerifier::default();
        let signer = FakeSigner { hangs: true, ..FakeSigner::default() };

        let err = ProofExchange::new(&principals, &verifier, &signer, impatient(3))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeFailure::ProofGenerationFailed(_)));
        assert_eq!(verifier.submissions(), 0);
    }

    #[tokio::test]
    async fn test_default_network_is_empty() {
        let principals = PrincipalService::new(StaticProvider { fail: false });
        let verifier = FakeVerifier::default();
        let signer = FakeSigner::default();

        ProofExchange::new(&principals, &verifier, &signer, settings(1))
            .run()
            .await
            .unwrap();
        let sent = verifier.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(sent.network, "");
    }

    #[tokio::test]
    async fn test_cancel_stops_exchange() {
        let principals = PrincipalService::new(StaticProvider { fail: false });
        let verifier = FakeVerifier::default();
        let signer = FakeSigner::default();
        let (handle, signal) = cancel_pair();

        let mut exchange = ProofExchange::new(&principals, &verifier, &signer, settings(3)).with_cancel(signal);
        exchange.step().await;
        handle.cancel();

        assert_eq!(exchange.run().await.unwrap_err(), ExchangeFailure::Cancelled);
        assert_eq!(verifier.submissions(), 0);
    }

    #[tokio::test]
    async fn test_terminal_state_is_sticky() {
        let principals = PrincipalService::new(StaticProvider { fail: true });
        let verifier = FakeVerifier::default();
        let signer = FakeSigner::default();
        let mut exchange = ProofExchange::new(&principals, &verifier, &signer, settings(3));

        let failed = exchange.step().await.clone();
        assert!(failed.is_terminal());
        assert_eq!(exchange.step().await, &failed);
    }
}
