//! Whole-file encrypt (clean) and decrypt (smudge)
//!
//! Encryption needs two passes over the plaintext: one to compute the HMAC
//! that becomes the nonce, one to run CTR under that nonce. The plaintext is
//! buffered in memory up to `spill_threshold` bytes and the remainder goes to
//! an anonymous scratch file (owner-only, unlinked, removed on drop).
//!
//! Decryption is single pass and streams plaintext to the output before the
//! integrity check completes. A [`DecryptStatus::Tampered`] result therefore
//! means bytes were already written; the caller must treat them as untrusted.

use std::fs::File;
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};

use gitcrypt_core::config::CryptoConfig;
use gitcrypt_core::{GitCryptError, GitCryptResult};
use zeroize::Zeroizing;

use crate::ctr::AesCtrEncryptor;
use crate::key::{KeyEntry, KeyFile};
use crate::mac::{digest_matches_nonce, nonce_from_digest, HmacSha1State};
use crate::{ENCRYPTED_FILE_HEADER_LEN, ENCRYPTED_FILE_MAGIC, MAX_CRYPT_BYTES, NONCE_LEN};

/// Key version used for every envelope. The header carries no version field.
pub const ENVELOPE_KEY_VERSION: u32 = 0;

#[derive(Debug, Clone)]
pub struct CodecOptions {
    /// Plaintext bytes held in memory before spilling to a scratch file
    pub spill_threshold: usize,
    /// Encryption fails once the plaintext reaches this many bytes
    pub max_plaintext_len: u64,
    /// Read size for streaming
    pub io_buffer_size: usize,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            spill_threshold: 8 * 1024 * 1024,
            max_plaintext_len: MAX_CRYPT_BYTES,
            io_buffer_size: 1024,
        }
    }
}

impl From<&CryptoConfig> for CodecOptions {
    fn from(config: &CryptoConfig) -> Self {
        Self {
            spill_threshold: config.spill_threshold_bytes,
            io_buffer_size: config.io_buffer_size,
            ..Self::default()
        }
    }
}

/// Outcome of a decrypt call that got as far as writing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptStatus {
    /// Decrypted and the digest matched the nonce.
    Authentic { bytes: u64 },
    /// No envelope header; the input was copied through unchanged.
    NotEncrypted { bytes: u64 },
    /// Decrypted bytes were written but the digest did not match.
    Tampered { bytes: u64 },
}

impl DecryptStatus {
    pub fn bytes_written(&self) -> u64 {
        match *self {
            Self::Authentic { bytes } | Self::NotEncrypted { bytes } | Self::Tampered { bytes } => {
                bytes
            }
        }
    }

    pub fn is_authentic(&self) -> bool {
        matches!(self, Self::Authentic { .. })
    }

    /// Strict view: anything but `Authentic` becomes an error.
    pub fn into_result(self) -> GitCryptResult<u64> {
        match self {
            Self::Authentic { bytes } => Ok(bytes),
            Self::NotEncrypted { .. } => Err(GitCryptError::NotEncrypted),
            Self::Tampered { .. } => Err(GitCryptError::Tampered),
        }
    }
}

/// True if `data` starts with a complete envelope header.
pub fn is_encrypted(data: &[u8]) -> bool {
    data.len() >= ENCRYPTED_FILE_HEADER_LEN && data.starts_with(ENCRYPTED_FILE_MAGIC)
}

/// Encrypt `input` into `output` with the latest entry of `key_file`.
pub fn encrypt<R: Read, W: Write>(key_file: &KeyFile, input: R, output: W) -> GitCryptResult<u64> {
    encrypt_with(key_file.require_latest()?, input, output, &CodecOptions::default())
}

/// Encrypt with an explicit entry and options. Returns the plaintext length.
///
/// Nothing is written to `output` unless the whole input was read
/// successfully and fits under `max_plaintext_len`.
pub fn encrypt_with<R: Read, W: Write>(
    entry: &KeyEntry,
    mut input: R,
    mut output: W,
    options: &CodecOptions,
) -> GitCryptResult<u64> {
    let mut hmac = HmacSha1State::new(entry.hmac_key());
    let mut buffer = PlaintextBuffer::new(options.spill_threshold);
    let mut chunk = Zeroizing::new(vec![0u8; options.io_buffer_size.max(1)]);

    loop {
        let n = read_some(&mut input, &mut chunk)?;
        if n == 0 {
            break;
        }
        if buffer.len() + n as u64 >= options.max_plaintext_len {
            tracing::warn!(
                limit = options.max_plaintext_len,
                "file too long to encrypt securely"
            );
            return Err(GitCryptError::CapacityExceeded);
        }
        hmac.add(&chunk[..n]);
        buffer.write(&chunk[..n])?;
    }

    let nonce = nonce_from_digest(&hmac.finish());
    output.write_all(ENCRYPTED_FILE_MAGIC)?;
    output.write_all(&nonce)?;

    let mut ctr = AesCtrEncryptor::new(entry.aes_key(), &nonce);
    buffer.replay(&mut chunk, |piece| {
        ctr.process_in_place(piece)?;
        output.write_all(piece)?;
        Ok(())
    })?;
    output.flush()?;

    tracing::debug!(
        bytes = buffer.len(),
        spilled = buffer.spilled(),
        nonce = %hex::encode(nonce),
        key_version = entry.version(),
        "encrypted"
    );
    Ok(buffer.len())
}

/// Decrypt `input` into `output` with the envelope key version of `key_file`.
pub fn decrypt<R: Read, W: Write>(
    key_file: &KeyFile,
    input: R,
    output: W,
) -> GitCryptResult<DecryptStatus> {
    decrypt_with(key_file, input, output, &CodecOptions::default())
}

pub fn decrypt_with<R: Read, W: Write>(
    key_file: &KeyFile,
    input: R,
    output: W,
    options: &CodecOptions,
) -> GitCryptResult<DecryptStatus> {
    decrypt_envelope(input, output, options, || key_file.require(ENVELOPE_KEY_VERSION))
}

/// Decrypt with a specific entry, bypassing the key-file version lookup.
pub fn decrypt_with_entry<R: Read, W: Write>(
    entry: &KeyEntry,
    input: R,
    output: W,
    options: &CodecOptions,
) -> GitCryptResult<DecryptStatus> {
    decrypt_envelope(input, output, options, || Ok(entry))
}

/// Read the header and either pass the input through or decrypt it.
///
/// `select_entry` runs only for encrypted input, so plain text never needs
/// a key.
fn decrypt_envelope<'k, R, W, F>(
    mut input: R,
    output: W,
    options: &CodecOptions,
    select_entry: F,
) -> GitCryptResult<DecryptStatus>
where
    R: Read,
    W: Write,
    F: FnOnce() -> GitCryptResult<&'k KeyEntry>,
{
    let mut header = [0u8; ENCRYPTED_FILE_HEADER_LEN];
    let got = read_up_to(&mut input, &mut header)?;
    if !is_encrypted(&header[..got]) {
        return passthrough(&header[..got], input, output);
    }
    decrypt_body(select_entry()?, &header, input, output, options)
}

fn passthrough<R: Read, W: Write>(
    already_read: &[u8],
    mut input: R,
    mut output: W,
) -> GitCryptResult<DecryptStatus> {
    output.write_all(already_read)?;
    let rest = io::copy(&mut input, &mut output)?;
    output.flush()?;
    Ok(DecryptStatus::NotEncrypted {
        bytes: already_read.len() as u64 + rest,
    })
}

fn decrypt_body<R: Read, W: Write>(
    entry: &KeyEntry,
    header: &[u8; ENCRYPTED_FILE_HEADER_LEN],
    mut input: R,
    mut output: W,
    options: &CodecOptions,
) -> GitCryptResult<DecryptStatus> {
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&header[ENCRYPTED_FILE_MAGIC.len()..]);

    let mut ctr = AesCtrEncryptor::new(entry.aes_key(), &nonce);
    let mut hmac = HmacSha1State::new(entry.hmac_key());
    let mut chunk = Zeroizing::new(vec![0u8; options.io_buffer_size.max(1)]);

    loop {
        let n = read_some(&mut input, &mut chunk)?;
        if n == 0 {
            break;
        }
        ctr.process_in_place(&mut chunk[..n])?;
        hmac.add(&chunk[..n]);
        output.write_all(&chunk[..n])?;
    }
    output.flush()?;

    let bytes = ctr.position();
    if digest_matches_nonce(&hmac.finish(), &nonce) {
        tracing::debug!(bytes, nonce = %hex::encode(nonce), "decrypted");
        Ok(DecryptStatus::Authentic { bytes })
    } else {
        tracing::warn!(bytes, nonce = %hex::encode(nonce), "integrity check failed");
        Ok(DecryptStatus::Tampered { bytes })
    }
}

/// Plaintext held for the second (CTR) pass.
struct PlaintextBuffer {
    memory: Zeroizing<Vec<u8>>,
    spill: Option<File>,
    threshold: usize,
    len: u64,
}

impl PlaintextBuffer {
    fn new(threshold: usize) -> Self {
        Self {
            memory: Zeroizing::new(Vec::new()),
            spill: None,
            threshold,
            len: 0,
        }
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn spilled(&self) -> bool {
        self.spill.is_some()
    }

    fn write(&mut self, data: &[u8]) -> GitCryptResult<()> {
        let room = self.threshold.saturating_sub(self.memory.len()).min(data.len());
        let (in_memory, overflow) = data.split_at(room);
        self.memory.extend_from_slice(in_memory);

        if !overflow.is_empty() {
            if self.spill.is_none() {
                tracing::debug!(threshold = self.threshold, "spilling plaintext to scratch file");
                self.spill = Some(tempfile::tempfile()?);
            }
            if let Some(file) = &mut self.spill {
                file.write_all(overflow)?;
            }
        }
        self.len += data.len() as u64;
        Ok(())
    }

    /// Feed the buffered plaintext, in order, through `sink` in pieces no
    /// larger than `chunk`.
    fn replay<F>(&mut self, chunk: &mut [u8], mut sink: F) -> GitCryptResult<()>
    where
        F: FnMut(&mut [u8]) -> GitCryptResult<()>,
    {
        for piece in self.memory.chunks(chunk.len()) {
            let out = &mut chunk[..piece.len()];
            out.copy_from_slice(piece);
            sink(out)?;
        }

        if let Some(file) = &mut self.spill {
            file.seek(SeekFrom::Start(0))?;
            loop {
                let n = read_some(file, chunk)?;
                if n == 0 {
                    break;
                }
                sink(&mut chunk[..n])?;
            }
        }
        Ok(())
    }
}

fn read_some<R: Read>(input: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match input.read(buf) {
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

/// Read until `buf` is full or the input ends. Returns the bytes read.
fn read_up_to<R: Read>(input: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = read_some(input, &mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AES_KEY_LEN, HMAC_KEY_LEN};

    fn zero_key_file() -> KeyFile {
        let mut kf = KeyFile::new();
        kf.add(KeyEntry::from_parts(0, [0u8; AES_KEY_LEN], [0u8; HMAC_KEY_LEN]))
            .unwrap();
        kf
    }

    fn generated_key_file() -> KeyFile {
        let mut kf = KeyFile::new();
        kf.generate().unwrap();
        kf
    }

    fn encrypt_vec(kf: &KeyFile, plaintext: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        encrypt(kf, plaintext, &mut out).unwrap();
        out
    }

    fn decrypt_vec(kf: &KeyFile, envelope: &[u8]) -> (DecryptStatus, Vec<u8>) {
        let mut out = Vec::new();
        let status = decrypt(kf, envelope, &mut out).unwrap();
        (status, out)
    }

    #[test]
    fn test_hello_known_envelope() {
        let kf = zero_key_file();
        let envelope = encrypt_vec(&kf, b"hello");

        assert_eq!(envelope.len(), 10 + 12 + 5);
        assert_eq!(&envelope[..10], b"\0GITCRYPT\0");
        assert_eq!(hex::encode(&envelope[10..22]), "63cce3559126764fd2581f05");
        assert_eq!(hex::encode(&envelope[22..]), "3a9367e1b0");

        let (status, plaintext) = decrypt_vec(&kf, &envelope);
        assert_eq!(status, DecryptStatus::Authentic { bytes: 5 });
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn test_roundtrip_sizes() {
        let kf = generated_key_file();
        for size in [0usize, 1, 15, 16, 17, 1023, 1024, 1025, 4096 + 3] {
            let plaintext: Vec<u8> = (0..size).map(|i| (i * 7 + 3) as u8).collect();
            let envelope = encrypt_vec(&kf, &plaintext);
            assert_eq!(envelope.len(), ENCRYPTED_FILE_HEADER_LEN + size);

            let (status, decrypted) = decrypt_vec(&kf, &envelope);
            assert!(status.is_authentic(), "size {size}");
            assert_eq!(decrypted, plaintext, "size {size}");
        }
    }

    #[test]
    fn test_deterministic() {
        let kf = generated_key_file();
        let plaintext = b"same input, same output";
        assert_eq!(encrypt_vec(&kf, plaintext), encrypt_vec(&kf, plaintext));
    }

    #[test]
    fn test_spill_threshold_does_not_change_output() {
        let entry = KeyEntry::from_parts(0, [5u8; AES_KEY_LEN], [6u8; HMAC_KEY_LEN]);
        let plaintext: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();

        let mut in_memory = Vec::new();
        encrypt_with(&entry, plaintext.as_slice(), &mut in_memory, &CodecOptions::default()).unwrap();

        let spilling = CodecOptions {
            spill_threshold: 100,
            io_buffer_size: 333,
            ..CodecOptions::default()
        };
        let mut spilled = Vec::new();
        encrypt_with(&entry, plaintext.as_slice(), &mut spilled, &spilling).unwrap();

        let all_on_disk = CodecOptions {
            spill_threshold: 0,
            ..CodecOptions::default()
        };
        let mut on_disk = Vec::new();
        encrypt_with(&entry, plaintext.as_slice(), &mut on_disk, &all_on_disk).unwrap();

        assert_eq!(in_memory, spilled);
        assert_eq!(in_memory, on_disk);
    }

    #[test]
    fn test_capacity_limit() {
        let entry = KeyEntry::from_parts(0, [0u8; AES_KEY_LEN], [0u8; HMAC_KEY_LEN]);
        let options = CodecOptions {
            max_plaintext_len: 64,
            io_buffer_size: 10,
            ..CodecOptions::default()
        };

        let mut out = Vec::new();
        encrypt_with(&entry, &[0u8; 63][..], &mut out, &options).unwrap();
        assert_eq!(out.len(), ENCRYPTED_FILE_HEADER_LEN + 63);

        for size in [64usize, 65] {
            let mut out = Vec::new();
            let result = encrypt_with(&entry, vec![0u8; size].as_slice(), &mut out, &options);
            assert!(matches!(result, Err(GitCryptError::CapacityExceeded)), "size {size}");
            assert!(out.is_empty(), "nothing written on failure");
        }
    }

    #[test]
    fn test_tamper_detected_in_ciphertext_and_nonce() {
        let kf = generated_key_file();
        let envelope = encrypt_vec(&kf, b"the quick brown fox jumps over the lazy dog");

        for index in [10usize, 21, 22, 30, envelope.len() - 1] {
            let mut forged = envelope.clone();
            forged[index] ^= 0x01;
            let (status, _) = decrypt_vec(&kf, &forged);
            assert!(
                matches!(status, DecryptStatus::Tampered { .. }),
                "flip at {index} must be detected"
            );
            assert!(matches!(status.into_result(), Err(GitCryptError::Tampered)));
        }
    }

    #[test]
    fn test_tampered_output_is_still_streamed() {
        let kf = generated_key_file();
        let mut envelope = encrypt_vec(&kf, b"0123456789");
        envelope[22] ^= 0xFF;

        let (status, out) = decrypt_vec(&kf, &envelope);
        assert_eq!(status, DecryptStatus::Tampered { bytes: 10 });
        assert_eq!(out.len(), 10);
        assert_eq!(&out[1..], b"123456789");
    }

    #[test]
    fn test_not_encrypted_passthrough() {
        let kf = zero_key_file();
        let short = b"tiny".to_vec();
        let wrong_magic = b"\0NOTCRYPT\0 this is long enough to have a header".to_vec();
        let just_magic = ENCRYPTED_FILE_MAGIC.to_vec();

        for input in [Vec::new(), short, wrong_magic, just_magic] {
            let (status, out) = decrypt_vec(&kf, &input);
            assert_eq!(
                status,
                DecryptStatus::NotEncrypted {
                    bytes: input.len() as u64
                }
            );
            assert_eq!(out, input);
        }
    }

    #[test]
    fn test_not_encrypted_does_not_need_a_key() {
        let empty = KeyFile::new();
        let (status, out) = decrypt_vec(&empty, b"plain text file");
        assert!(matches!(status, DecryptStatus::NotEncrypted { .. }));
        assert_eq!(out, b"plain text file");
    }

    #[test]
    fn test_entry_and_key_file_paths_agree() {
        let kf = generated_key_file();
        let entry = kf.get(ENVELOPE_KEY_VERSION).unwrap();
        let envelope = encrypt_vec(&kf, b"one code path");

        for input in [b"plain".to_vec(), envelope] {
            let (by_file, out_file) = decrypt_vec(&kf, &input);
            let mut out_entry = Vec::new();
            let by_entry =
                decrypt_with_entry(entry, input.as_slice(), &mut out_entry, &CodecOptions::default())
                    .unwrap();
            assert_eq!(by_file, by_entry);
            assert_eq!(out_file, out_entry);
        }
    }

    #[test]
    fn test_missing_envelope_key_version() {
        let mut kf = KeyFile::new();
        kf.add(KeyEntry::from_parts(3, [1u8; AES_KEY_LEN], [2u8; HMAC_KEY_LEN]))
            .unwrap();
        let envelope = encrypt_vec(&kf, b"secret");

        let mut out = Vec::new();
        let result = decrypt(&kf, envelope.as_slice(), &mut out);
        assert!(matches!(result, Err(GitCryptError::KeyNotFound(_))));
        assert!(out.is_empty());

        let status = decrypt_with_entry(
            kf.get(3).unwrap(),
            envelope.as_slice(),
            &mut out,
            &CodecOptions::default(),
        )
        .unwrap();
        assert!(status.is_authentic());
        assert_eq!(out, b"secret");
    }

    #[test]
    fn test_encrypt_empty_key_file_fails() {
        let mut out = Vec::new();
        let result = encrypt(&KeyFile::new(), &b"data"[..], &mut out);
        assert!(matches!(result, Err(GitCryptError::KeyNotFound(_))));
        assert!(out.is_empty());
    }

    #[test]
    fn test_wrong_key_reports_tampered() {
        let a = generated_key_file();
        let b = generated_key_file();
        let envelope = encrypt_vec(&a, b"for a's eyes only");
        let (status, _) = decrypt_vec(&b, &envelope);
        assert!(matches!(status, DecryptStatus::Tampered { .. }));
    }

    #[test]
    fn test_is_encrypted() {
        let kf = zero_key_file();
        assert!(is_encrypted(&encrypt_vec(&kf, b"")));
        assert!(!is_encrypted(ENCRYPTED_FILE_MAGIC));
        assert!(!is_encrypted(b"plain"));
    }

    /// Reader that hands out at most 3 bytes per call.
    struct Trickle<'a>(&'a [u8]);

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(3).min(self.0.len());
            buf[..n].copy_from_slice(&self.0[..n]);
            self.0 = &self.0[n..];
            Ok(n)
        }
    }

    #[test]
    fn test_short_reads_are_handled() {
        let kf = generated_key_file();
        let plaintext = b"short reads must not split the header or the stream".to_vec();

        let mut envelope = Vec::new();
        encrypt(&kf, Trickle(&plaintext), &mut envelope).unwrap();
        assert_eq!(envelope, encrypt_vec(&kf, &plaintext));

        let mut out = Vec::new();
        let status = decrypt(&kf, Trickle(&envelope), &mut out).unwrap();
        assert!(status.is_authentic());
        assert_eq!(out, plaintext);
    }
}
