//! Single-block AES-256 encryption, used only to produce CTR keystream

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes256;

use crate::{AES_KEY_LEN, BLOCK_LEN};

/// AES-256 in ECB mode over exactly one block at a time.
///
/// The key schedule is computed once in [`AesEcbEncryptor::new`] and wiped on
/// drop (`aes` is built with its `zeroize` feature). Only the forward
/// direction exists; CTR mode never needs block decryption.
pub struct AesEcbEncryptor {
    cipher: Aes256,
}

impl AesEcbEncryptor {
    /// The fixed-size key parameter makes a wrong key length a compile error.
    pub fn new(key: &[u8; AES_KEY_LEN]) -> Self {
        Self {
            cipher: Aes256::new(GenericArray::from_slice(key)),
        }
    }

    /// Encrypt one 16-byte block.
    pub fn encrypt(&self, plain: &[u8; BLOCK_LEN]) -> [u8; BLOCK_LEN] {
        let mut out = *plain;
        self.encrypt_in_place(&mut out);
        out
    }

    pub fn encrypt_in_place(&self, block: &mut [u8; BLOCK_LEN]) {
        self.cipher
            .encrypt_block(GenericArray::from_mut_slice(block.as_mut_slice()));
    }
}

impl std::fmt::Debug for AesEcbEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesEcbEncryptor")
            .field("key", &"[REDACTED]")
            .finish()
    }
}
