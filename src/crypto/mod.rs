//! Cryptographic primitives for the tunnel
//!
//! This module provides:
//! - SHA-256 password key derivation
//! - AES-256-CFB incremental stream encryption with per-connection IVs
//! - The legacy byte-permutation table cipher (interop only)
//! - Secure random number generation

mod cipher;
mod kdf;
mod table;

pub use cipher::Cipher;
pub use kdf::{derive_key, derive_tables};
pub use table::TableCipher;

use thiserror::Error;

/// Length of the AES-256 key in bytes
pub const KEY_LEN: usize = 32;

/// Length of the CFB IV in bytes (one AES block)
pub const IV_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key or IV length")]
    InvalidKeyLength,

    #[error("Peer IV already consumed")]
    IvAlreadySet,

    #[error("Decrypt called before the peer IV arrived")]
    MissingPeerIv,
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).expect("Failed to generate random bytes");
}
