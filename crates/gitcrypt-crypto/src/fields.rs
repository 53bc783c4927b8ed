//! Tagged-field encoding shared by the key-file header and key entries
//!
//! ```text
//! [4 bytes: field id, BE][4 bytes: field len, BE][len bytes: payload]
//! ...
//! [4 bytes: 0]            end of the field list (no length, no payload)
//! ```
//!
//! Unknown fields with an odd id are critical: a reader that does not know
//! them must refuse the data. Unknown even ids are skipped.

use std::io::{self, BufRead, Read, Write};

use gitcrypt_core::{GitCryptError, GitCryptResult};

pub const FIELD_END: u32 = 0;

/// Upper bound on the length of a skipped field.
pub const MAX_FIELD_LEN: u32 = 1 << 20;

pub fn is_critical(field_id: u32) -> bool {
    field_id & 1 == 1
}

/// Reads `(id, len, payload)` tuples from a stream.
pub struct FieldReader<'a, R: BufRead> {
    inner: &'a mut R,
    context: &'static str,
}

impl<'a, R: BufRead> FieldReader<'a, R> {
    /// `context` names the structure being parsed in error messages.
    pub fn new(inner: &'a mut R, context: &'static str) -> Self {
        Self { inner, context }
    }

    /// Next field header, or `None` at the END marker.
    pub fn next_field(&mut self) -> GitCryptResult<Option<(u32, u32)>> {
        let field_id = read_be32(self.inner, self.context)?;
        if field_id == FIELD_END {
            return Ok(None);
        }
        let field_len = read_be32(self.inner, self.context)?;
        Ok(Some((field_id, field_len)))
    }

    pub fn read_payload(&mut self, buf: &mut [u8]) -> GitCryptResult<()> {
        read_exact(self.inner, buf, self.context)
    }

    /// Read a field that must hold exactly one big-endian u32.
    pub fn read_u32(&mut self, field_len: u32) -> GitCryptResult<u32> {
        if field_len != 4 {
            return Err(GitCryptError::Malformed(format!(
                "{}: u32 field has length {field_len}",
                self.context
            )));
        }
        read_be32(self.inner, self.context)
    }

    /// Read a field whose length must equal `buf.len()`.
    pub fn read_fixed(&mut self, field_len: u32, buf: &mut [u8]) -> GitCryptResult<()> {
        if field_len as usize != buf.len() {
            return Err(GitCryptError::Malformed(format!(
                "{}: expected {}-byte field, found {field_len}",
                self.context,
                buf.len()
            )));
        }
        self.read_payload(buf)
    }

    /// Apply the forward-compatibility rule to a field this reader does not know.
    pub fn skip_unknown(&mut self, field_id: u32, field_len: u32) -> GitCryptResult<()> {
        if is_critical(field_id) {
            return Err(GitCryptError::Incompatible(format!(
                "{}: unknown critical field {field_id}",
                self.context
            )));
        }
        if field_len > MAX_FIELD_LEN {
            return Err(GitCryptError::Malformed(format!(
                "{}: field {field_id} too long ({field_len} bytes)",
                self.context
            )));
        }
        tracing::debug!(field_id, field_len, context = self.context, "skipping unknown field");
        let copied = io::copy(&mut self.inner.by_ref().take(field_len as u64), &mut io::sink())?;
        if copied != field_len as u64 {
            return Err(truncated(self.context));
        }
        Ok(())
    }
}

pub fn write_field<W: Write>(out: &mut W, field_id: u32, payload: &[u8]) -> io::Result<()> {
    out.write_all(&field_id.to_be_bytes())?;
    out.write_all(&(payload.len() as u32).to_be_bytes())?;
    out.write_all(payload)
}

pub fn write_end<W: Write>(out: &mut W) -> io::Result<()> {
    out.write_all(&FIELD_END.to_be_bytes())
}

pub fn read_be32<R: Read>(inner: &mut R, context: &'static str) -> GitCryptResult<u32> {
    let mut buf = [0u8; 4];
    read_exact(inner, &mut buf, context)?;
    Ok(u32::from_be_bytes(buf))
}

/// `read_exact` that reports a short read as malformed input.
pub fn read_exact<R: Read>(inner: &mut R, buf: &mut [u8], context: &'static str) -> GitCryptResult<()> {
    inner.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            truncated(context)
        } else {
            GitCryptError::Io(e)
        }
    })
}

/// True when the reader has no more bytes.
pub fn at_eof<R: BufRead>(inner: &mut R) -> GitCryptResult<bool> {
    Ok(inner.fill_buf()?.is_empty())
}

fn truncated(context: &'static str) -> GitCryptError {
    GitCryptError::Malformed(format!("{context}: truncated"))
}
