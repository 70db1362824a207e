// src/services/mod.rs
//! Remote services: the issuer backend, the verification backend, the proof
//! signer, and the exchange that ties the last two together.

pub mod credential_service;
pub mod proof_exchange;
pub mod signer;
pub mod verifier;
