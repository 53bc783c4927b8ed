//! AES-256-CTR stream cipher
//!
//! Counter block for keystream block `i`:
//! ```text
//! [12 bytes: nonce][4 bytes: i, big-endian]
//! ```
//!
//! The byte position persists across calls to `process`, so a stream fed in
//! arbitrary chunk sizes produces the same output as one fed all at once.

use std::io::{ErrorKind, Read, Write};

use gitcrypt_core::{GitCryptError, GitCryptResult};
use zeroize::Zeroize;

use crate::block::AesEcbEncryptor;
use crate::{AES_KEY_LEN, BLOCK_LEN, MAX_CRYPT_BYTES, NONCE_LEN};

/// Counter-mode encryptor. Encryption and decryption are the same operation.
pub struct AesCtrEncryptor {
    ecb: AesEcbEncryptor,
    ctr_value: [u8; BLOCK_LEN],
    pad: [u8; BLOCK_LEN],
    byte_counter: u64,
}

impl AesCtrEncryptor {
    pub fn new(key: &[u8; AES_KEY_LEN], nonce: &[u8; NONCE_LEN]) -> Self {
        let mut ctr_value = [0u8; BLOCK_LEN];
        ctr_value[..NONCE_LEN].copy_from_slice(nonce);
        Self {
            ecb: AesEcbEncryptor::new(key),
            ctr_value,
            pad: [0u8; BLOCK_LEN],
            byte_counter: 0,
        }
    }

    /// Bytes processed so far.
    pub fn position(&self) -> u64 {
        self.byte_counter
    }

    /// XOR `buf` with the keystream in place.
    ///
    /// Fails with `CapacityExceeded` before touching `buf` if the stream would
    /// run past 2^32 blocks, since that would reuse counter values.
    pub fn process_in_place(&mut self, buf: &mut [u8]) -> GitCryptResult<()> {
        let len = buf.len() as u64;
        if len > MAX_CRYPT_BYTES - self.byte_counter {
            return Err(GitCryptError::CapacityExceeded);
        }

        for byte in buf.iter_mut() {
            let offset = (self.byte_counter % BLOCK_LEN as u64) as usize;
            if offset == 0 {
                let block_index = (self.byte_counter / BLOCK_LEN as u64) as u32;
                self.ctr_value[NONCE_LEN..].copy_from_slice(&block_index.to_be_bytes());
                self.pad = self.ctr_value;
                self.ecb.encrypt_in_place(&mut self.pad);
            }
            *byte ^= self.pad[offset];
            self.byte_counter += 1;
        }
        Ok(())
    }

    /// Process `input` into `output`, which must be the same length.
    ///
    /// For the in-place case (input and output being the same memory) use
    /// [`AesCtrEncryptor::process_in_place`].
    pub fn process(&mut self, input: &[u8], output: &mut [u8]) -> GitCryptResult<()> {
        if input.len() != output.len() {
            return Err(GitCryptError::Other(anyhow::anyhow!(
                "CTR output buffer is {} bytes, input is {}",
                output.len(),
                input.len()
            )));
        }
        output.copy_from_slice(input);
        self.process_in_place(output)
    }

    #[cfg(test)]
    pub(crate) fn seek_for_test(&mut self, byte_counter: u64) {
        self.byte_counter = byte_counter;
    }
}

impl Drop for AesCtrEncryptor {
    fn drop(&mut self) {
        self.pad.zeroize();
    }
}

impl std::fmt::Debug for AesCtrEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesCtrEncryptor")
            .field("nonce", &hex::encode(&self.ctr_value[..NONCE_LEN]))
            .field("byte_counter", &self.byte_counter)
            .finish()
    }
}

/// Encrypt or decrypt everything from `input` into `output`.
///
/// Returns the number of bytes processed.
pub fn process_stream<R: Read, W: Write>(
    mut input: R,
    mut output: W,
    key: &[u8; AES_KEY_LEN],
    nonce: &[u8; NONCE_LEN],
) -> GitCryptResult<u64> {
    let mut state = AesCtrEncryptor::new(key, nonce);
    let mut buffer = [0u8; 1024];
    loop {
        let n = match input.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        state.process_in_place(&mut buffer[..n])?;
        output.write_all(&buffer[..n])?;
    }
    buffer.zeroize();
    Ok(state.position())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; AES_KEY_LEN] = [0u8; AES_KEY_LEN];

    fn nonce_from_hex(s: &str) -> [u8; NONCE_LEN] {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    #[test]
    fn test_keystream_blocks_use_big_endian_counter() {
        let nonce = [0x11u8; NONCE_LEN];
        let mut ctr = AesCtrEncryptor::new(&KEY, &nonce);
        let mut keystream = [0u8; 3 * BLOCK_LEN];
        ctr.process_in_place(&mut keystream).unwrap();

        let ecb = AesEcbEncryptor::new(&KEY);
        for i in 0..3u32 {
            let mut block = [0u8; BLOCK_LEN];
            block[..NONCE_LEN].copy_from_slice(&nonce);
            block[NONCE_LEN..].copy_from_slice(&i.to_be_bytes());
            let start = i as usize * BLOCK_LEN;
            assert_eq!(&keystream[start..start + BLOCK_LEN], &ecb.encrypt(&block));
        }
    }

    #[test]
    fn test_known_ciphertext() {
        // 20 bytes of 'a' under zero keys, nonce = HMAC-SHA1 prefix of the plaintext
        let nonce = nonce_from_hex("2a79b2045a2e36a0a4bc2b18");
        let mut data = [b'a'; 20];
        AesCtrEncryptor::new(&KEY, &nonce)
            .process_in_place(&mut data)
            .unwrap();
        assert_eq!(
            hex::encode(data),
            "920ed419b67cda0a03d2eef5f0519b1613f0fac0"
        );
    }

    #[test]
    fn test_chunking_does_not_change_output() {
        let nonce = [0x5Au8; NONCE_LEN];
        let plaintext: Vec<u8> = (0..1000u32).map(|i| (i * 31 % 251) as u8).collect();

        let mut whole = plaintext.clone();
        AesCtrEncryptor::new(&KEY, &nonce)
            .process_in_place(&mut whole)
            .unwrap();

        for chunk_size in [1, 7, 15, 16, 17, 333] {
            let mut ctr = AesCtrEncryptor::new(&KEY, &nonce);
            let mut pieces = plaintext.clone();
            for chunk in pieces.chunks_mut(chunk_size) {
                ctr.process_in_place(chunk).unwrap();
            }
            assert_eq!(pieces, whole, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn test_encrypt_then_decrypt_restores_input() {
        let nonce = [9u8; NONCE_LEN];
        let plaintext = b"attack at dawn, bring snacks".to_vec();

        let mut ciphertext = vec![0u8; plaintext.len()];
        AesCtrEncryptor::new(&KEY, &nonce)
            .process(&plaintext, &mut ciphertext)
            .unwrap();
        assert_ne!(ciphertext, plaintext);

        AesCtrEncryptor::new(&KEY, &nonce)
            .process_in_place(&mut ciphertext)
            .unwrap();
        assert_eq!(ciphertext, plaintext);
    }

    #[test]
    fn test_process_rejects_mismatched_lengths() {
        let mut ctr = AesCtrEncryptor::new(&KEY, &[0u8; NONCE_LEN]);
        let mut out = [0u8; 4];
        assert!(ctr.process(b"hello", &mut out).is_err());
        assert_eq!(ctr.position(), 0);
    }

    #[test]
    fn test_capacity_boundary() {
        let mut ctr = AesCtrEncryptor::new(&KEY, &[0u8; NONCE_LEN]);
        ctr.seek_for_test(MAX_CRYPT_BYTES - BLOCK_LEN as u64);

        // The final block (index 2^32 - 1) is still usable.
        let mut last_block = [0u8; BLOCK_LEN];
        ctr.process_in_place(&mut last_block).unwrap();
        assert_eq!(ctr.position(), MAX_CRYPT_BYTES);

        // One more byte would wrap the counter back to zero.
        let mut one = [0u8; 1];
        assert!(matches!(
            ctr.process_in_place(&mut one),
            Err(GitCryptError::CapacityExceeded)
        ));
        assert_eq!(one, [0u8; 1], "buffer must be untouched on failure");
    }

    #[test]
    fn test_capacity_checked_before_processing() {
        let mut ctr = AesCtrEncryptor::new(&KEY, &[0u8; NONCE_LEN]);
        ctr.seek_for_test(MAX_CRYPT_BYTES - 4);
        let mut buf = [0u8; 5];
        assert!(ctr.process_in_place(&mut buf).is_err());
        assert_eq!(buf, [0u8; 5]);
        assert_eq!(ctr.position(), MAX_CRYPT_BYTES - 4);
    }

    #[test]
    fn test_process_stream_counts_bytes() {
        let nonce = [3u8; NONCE_LEN];
        let plaintext = vec![0xEEu8; 5000];
        let mut encrypted = Vec::new();
        let n = process_stream(plaintext.as_slice(), &mut encrypted, &KEY, &nonce).unwrap();
        assert_eq!(n, 5000);

        let mut decrypted = Vec::new();
        process_stream(encrypted.as_slice(), &mut decrypted, &KEY, &nonce).unwrap();
        assert_eq!(decrypted, plaintext);
    }
}
