// src/lib.rs
//! # Civic Sign Client
//!
//! Client for the Civic credential issuance and proof-exchange protocol.
//!
//! ## Layout
//! 1. **Models**: claims, credentials, issuance requests, nonces, proofs, tokens
//! 2. **Identity**: interactive login and the session-scoped principal
//! 3. **Services**: issuer backend client, verification backend client, proof
//!    signer and the challenge-response exchange
//! 4. **Storage**: in-memory issuer backend
//! 5. **Utils**: fixed-interval retries and JSON (de)serialization

pub mod config;
pub mod error;
pub mod identity;
pub mod models;
pub mod services;
pub mod storage;
pub mod utils;

pub use config::ClientConfig;
pub use error::{DecodeError, RemoteError, TransportError};
pub use identity::{IdentityError, LoopbackIdentityProvider, PrincipalService};
pub use services::credential_service::{CredentialService, HttpIssuerBackend, ServiceError};
pub use services::proof_exchange::{ExchangeFailure, ExchangeState, ProofExchange};
pub use utils::retries::{cancel_pair, poll_until_condition_met, CancelSignal, PollConfig, RetryError};
