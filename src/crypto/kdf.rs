//! Key derivation
//!
//! Both endpoints derive identical cipher state from the shared password:
//! SHA-256 for the AES-256 key, and an MD5-seeded permutation for the
//! legacy table method.

use super::KEY_LEN;
use md5::{Digest, Md5};
use ring::digest::{digest, SHA256};

/// Derive the AES-256 key from the shared password.
pub fn derive_key(password: &str) -> [u8; KEY_LEN] {
    let hash = digest(&SHA256, password.as_bytes());
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(hash.as_ref());
    key
}

/// Derive the legacy encrypt/decrypt translation tables.
///
/// The first 8 bytes of MD5(password), read little-endian, seed 1023
/// stable-sort passes over the identity permutation; the decrypt table is
/// the inverse of the result. Matches the table format the legacy
/// ecosystem ships, so both ends of a mixed deployment agree.
pub fn derive_tables(password: &str) -> ([u8; 256], [u8; 256]) {
    let hash = Md5::digest(password.as_bytes());
    let mut seed_bytes = [0u8; 8];
    seed_bytes.copy_from_slice(&hash[..8]);
    let a = u64::from_le_bytes(seed_bytes);

    let mut table: Vec<u64> = (0..256).collect();
    for i in 1..1024u64 {
        // Stable sort; the sort key only depends on a % (x + i).
        table.sort_by_key(|&x| a % (x + i));
    }

    let mut encrypt = [0u8; 256];
    let mut decrypt = [0u8; 256];
    for (i, &v) in table.iter().enumerate() {
        encrypt[i] = v as u8;
        decrypt[v as usize] = i as u8;
    }
    (encrypt, decrypt)
}
