//! Legacy byte-permutation "cipher"
//!
//! A password-seeded substitution table applied byte-for-byte. It has no
//! keystream and no IV, and offers no real confidentiality; it exists only
//! to interoperate with legacy deployments and must be opted into via
//! `allow_table` in the configuration.

use super::kdf;

/// Stateless substitution cipher over the two derived tables.
pub struct TableCipher {
    encrypt_table: [u8; 256],
    decrypt_table: [u8; 256],
}

impl TableCipher {
    pub fn new(password: &str) -> Self {
        let (encrypt_table, decrypt_table) = kdf::derive_tables(password);
        Self {
            encrypt_table,
            decrypt_table,
        }
    }

    pub fn encrypt(&self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = self.encrypt_table[*b as usize];
        }
    }

    pub fn decrypt(&self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = self.decrypt_table[*b as usize];
        }
    }
}
