//! Cryptographic primitives and identity management.
//!
//! This module provides the node keypair, the PeerId fingerprint and the
//! envelope used to encrypt and sign message bodies point-to-point.

pub mod envelope;
pub mod identity;

pub use envelope::{decrypt_and_verify, encrypt_and_sign};
pub use identity::*;
