// src/models/mod.rs
//! Data structures exchanged with the identity provider and both backends.

pub mod credential;
pub mod issuance;
pub mod principal;
pub mod proof;
