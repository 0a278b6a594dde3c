//! Incremental stream cipher with the one-shot IV exchange
//!
//! Each tunnel direction is a single keystream: the sender's 16-byte IV
//! travels in the clear ahead of the first ciphertext byte, and everything
//! after it is one continuous AES-256-CFB stream. State is strictly
//! positional, so bytes MUST be fed in wire order and nothing can be
//! retried or resumed.

use super::{kdf, CryptoError, TableCipher, IV_LEN};
use crate::config::Method;
use aes::Aes256;
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};

type Aes256CfbEnc = BufEncryptor<Aes256>;
type Aes256CfbDec = BufDecryptor<Aes256>;

/// Keyed cipher state for one tunnel connection.
///
/// The encrypt and decrypt halves are independent: the local IV keys the
/// encryptor at construction, the decryptor waits for the peer IV.
pub enum Cipher {
    Aes256Cfb {
        key: [u8; 32],
        iv: [u8; IV_LEN],
        iv_sent: bool,
        encryptor: Aes256CfbEnc,
        decryptor: Option<Aes256CfbDec>,
    },
    Table(TableCipher),
}

impl Cipher {
    /// Build cipher state from the shared password.
    pub fn new(password: &str, method: Method) -> Result<Self, CryptoError> {
        match method {
            Method::Aes256Cfb => {
                let key = kdf::derive_key(password);
                let mut iv = [0u8; IV_LEN];
                super::random_bytes(&mut iv);
                let encryptor = Aes256CfbEnc::new_from_slices(&key, &iv)
                    .map_err(|_| CryptoError::InvalidKeyLength)?;
                Ok(Cipher::Aes256Cfb {
                    key,
                    iv,
                    iv_sent: false,
                    encryptor,
                    decryptor: None,
                })
            }
            Method::Table => Ok(Cipher::Table(TableCipher::new(password))),
        }
    }

    /// IV length this cipher puts on the wire (0 for the table method).
    pub fn iv_len(&self) -> usize {
        match self {
            Cipher::Aes256Cfb { .. } => IV_LEN,
            Cipher::Table(_) => 0,
        }
    }

    /// The local IV, exactly once; `None` on every later call and for the
    /// table method.
    pub fn iv_to_send(&mut self) -> Option<[u8; IV_LEN]> {
        match self {
            Cipher::Aes256Cfb { iv, iv_sent, .. } => {
                if *iv_sent {
                    None
                } else {
                    *iv_sent = true;
                    Some(*iv)
                }
            }
            Cipher::Table(_) => None,
        }
    }

    /// Whether the peer IV still has to be consumed before decrypting.
    pub fn needs_peer_iv(&self) -> bool {
        match self {
            Cipher::Aes256Cfb { decryptor, .. } => decryptor.is_none(),
            Cipher::Table(_) => false,
        }
    }

    /// Key the decrypt half with the peer's IV.
    pub fn begin_decrypt(&mut self, peer_iv: &[u8]) -> Result<(), CryptoError> {
        match self {
            Cipher::Aes256Cfb { key, decryptor, .. } => {
                if decryptor.is_some() {
                    return Err(CryptoError::IvAlreadySet);
                }
                let dec = Aes256CfbDec::new_from_slices(key, peer_iv)
                    .map_err(|_| CryptoError::InvalidKeyLength)?;
                *decryptor = Some(dec);
                Ok(())
            }
            Cipher::Table(_) => Ok(()),
        }
    }

    /// Encrypt a chunk in place. Chunks may be any length; the keystream
    /// position advances by exactly `buf.len()`.
    pub fn encrypt(&mut self, buf: &mut [u8]) {
        match self {
            Cipher::Aes256Cfb { encryptor, .. } => encryptor.encrypt(buf),
            Cipher::Table(table) => table.encrypt(buf),
        }
    }

    /// Decrypt a chunk in place. The peer IV must have been consumed first.
    pub fn decrypt(&mut self, buf: &mut [u8]) -> Result<(), CryptoError> {
        match self {
            Cipher::Aes256Cfb { decryptor, .. } => match decryptor {
                Some(dec) => {
                    dec.decrypt(buf);
                    Ok(())
                }
                None => Err(CryptoError::MissingPeerIv),
            },
            Cipher::Table(table) => {
                table.decrypt(buf);
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cipher::Aes256Cfb { iv_sent, decryptor, .. } => f
                .debug_struct("Cipher::Aes256Cfb")
                .field("iv_sent", iv_sent)
                .field("peer_iv_set", &decryptor.is_some())
                .finish(),
            Cipher::Table(_) => f.debug_struct("Cipher::Table").finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// NIST SP 800-38A F.3.17 (CFB128-AES256.Encrypt), first block.
    #[test]
    fn test_cfb128_aes256_known_answer() {
        let key: [u8; 32] = [
            0x60, 0x3d, 0xeb, 0x10, 0x15, 0xca, 0x71, 0xbe, 0x2b, 0x73, 0xae, 0xf0, 0x85, 0x7d,
            0x77, 0x81, 0x1f, 0x35, 0x2c, 0x07, 0x3b, 0x61, 0x08, 0xd7, 0x2d, 0x98, 0x10, 0xa3,
            0x09, 0x14, 0xdf, 0xf4,
        ];
        let iv: [u8; 16] = [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d,
            0x0e, 0x0f,
        ];
        let mut block: [u8; 16] = [
            0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93,
            0x17, 0x2a,
        ];
        let expected: [u8; 16] = [
            0xdc, 0x7e, 0x84, 0xbf, 0xda, 0x79, 0x16, 0x4b, 0x7e, 0xcd, 0x84, 0x86, 0x98, 0x5d,
            0x38, 0x60,
        ];

        let mut enc = Aes256CfbEnc::new_from_slices(&key, &iv).unwrap();
        enc.encrypt(&mut block);
        assert_eq!(block, expected);
    }

    #[test]
    fn test_iv_handed_out_once() {
        let mut cipher = Cipher::new("secret", Method::Aes256Cfb).unwrap();
        let iv = cipher.iv_to_send();
        assert!(iv.is_some());
        assert!(cipher.iv_to_send().is_none());
        assert!(cipher.needs_peer_iv());
    }

    #[test]
    fn test_decrypt_before_iv_fails() {
        let mut cipher = Cipher::new("secret", Method::Aes256Cfb).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            cipher.decrypt(&mut buf),
            Err(CryptoError::MissingPeerIv)
        ));
    }

    #[test]
    fn test_streamed_round_trip_uneven_chunks() {
        let mut local = Cipher::new("hunter2", Method::Aes256Cfb).unwrap();
        let mut remote = Cipher::new("hunter2", Method::Aes256Cfb).unwrap();

        let local_iv = local.iv_to_send().unwrap();
        remote.begin_decrypt(&local_iv).unwrap();

        let plaintext: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 251) as u8).collect();
        let mut wire = plaintext.clone();

        // Encrypt and decrypt in mismatched chunk sizes; the stream state
        // must only depend on byte position.
        for chunk in wire.chunks_mut(33) {
            local.encrypt(chunk);
        }
        for chunk in wire.chunks_mut(100) {
            remote.decrypt(chunk).unwrap();
        }
        assert_eq!(wire, plaintext);
    }

    #[test]
    fn test_wrong_password_garbles() {
        let mut local = Cipher::new("alpha", Method::Aes256Cfb).unwrap();
        let mut remote = Cipher::new("bravo", Method::Aes256Cfb).unwrap();

        let local_iv = local.iv_to_send().unwrap();
        remote.begin_decrypt(&local_iv).unwrap();

        let mut wire = b"attack at dawn".to_vec();
        local.encrypt(&mut wire);
        remote.decrypt(&mut wire).unwrap();
        assert_ne!(&wire, b"attack at dawn");
    }

    #[test]
    fn test_table_method_has_no_iv() {
        let mut cipher = Cipher::new("secret", Method::Table).unwrap();
        assert_eq!(cipher.iv_len(), 0);
        assert!(cipher.iv_to_send().is_none());
        assert!(!cipher.needs_peer_iv());

        let mut buf = b"payload".to_vec();
        cipher.encrypt(&mut buf);
        assert_ne!(&buf, b"payload");
        cipher.decrypt(&mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }
}
