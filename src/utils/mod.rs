// src/utils/mod.rs
//! Helper functions shared across the client.

pub mod retries;
pub mod serialization;
