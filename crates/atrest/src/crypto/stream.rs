//! Chunked AES-256-GCM-SIV framing for whole assets.
//!
//! # Stream format (version 1)
//!
//! ```text
//! header  = "ARST" ‖ 0x01 ‖ nonce_prefix[8]
//! chunk_i = len:u32-le ‖ AEAD(plaintext_i)            (len includes the 16-byte tag)
//! stream  = header ‖ chunk_0 ‖ … ‖ chunk_n-1 ‖ final   (final = empty plaintext, len == 16)
//! ```
//!
//! Each chunk is sealed with nonce `nonce_prefix ‖ i:u32-be` and AAD
//! `header ‖ i:u64-le ‖ is_final:u8`, which binds it to its position and to
//! this particular stream. Reordering, truncation, extension and header edits
//! therefore all fail authentication.
//!
//! Plaintext length is not recorded anywhere; it is only known once the final
//! chunk has been verified.

use std::io::{self, Read, Write};

use aes_gcm_siv::{
    aead::{Aead, OsRng, Payload},
    Aes256GcmSiv, Nonce,
};
use tracing::trace;

use super::cipher::{build_cipher, NONCE_LEN, TAG_LEN};
use super::key::EncryptionKey;
use super::CryptoError;

/// Leading magic bytes of every encrypted asset.
pub const MAGIC: &[u8; 4] = b"ARST";

/// Current framing version.
pub const FORMAT_VERSION: u8 = 1;

/// Random per-stream nonce prefix length.
pub const NONCE_PREFIX_LEN: usize = 8;

/// Total header length in bytes.
pub const HEADER_LEN: usize = MAGIC.len() + 1 + NONCE_PREFIX_LEN;

/// Maximum plaintext bytes per chunk (64 KiB).
pub const CHUNK_PLAINTEXT_LEN: usize = 64 * 1024;

/// Maximum sealed chunk length (plaintext + tag).
pub const MAX_CHUNK_LEN: usize = CHUNK_PLAINTEXT_LEN + TAG_LEN;

const LEN_PREFIX: usize = 4;

/// Per-stream header.
#[derive(Clone, Copy)]
struct StreamHeader([u8; HEADER_LEN]);

impl StreamHeader {
    fn generate() -> Self {
        use aes_gcm_siv::aead::rand_core::RngCore;
        let mut bytes = [0u8; HEADER_LEN];
        bytes[..MAGIC.len()].copy_from_slice(MAGIC);
        bytes[MAGIC.len()] = FORMAT_VERSION;
        OsRng.fill_bytes(&mut bytes[MAGIC.len() + 1..]);
        Self(bytes)
    }

    fn parse(bytes: [u8; HEADER_LEN]) -> Result<Self, CryptoError> {
        if &bytes[..MAGIC.len()] != MAGIC || bytes[MAGIC.len()] != FORMAT_VERSION {
            return Err(CryptoError::Authentication);
        }
        Ok(Self(bytes))
    }

    fn nonce(&self, counter: u32) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..NONCE_PREFIX_LEN].copy_from_slice(&self.0[MAGIC.len() + 1..]);
        nonce[NONCE_PREFIX_LEN..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }

    fn aad(&self, counter: u32, is_final: bool) -> [u8; HEADER_LEN + 9] {
        let mut aad = [0u8; HEADER_LEN + 9];
        aad[..HEADER_LEN].copy_from_slice(&self.0);
        aad[HEADER_LEN..HEADER_LEN + 8].copy_from_slice(&u64::from(counter).to_le_bytes());
        aad[HEADER_LEN + 8] = u8::from(is_final);
        aad
    }
}

/// A [`Read`] adapter that yields the encrypted framing of `source`.
///
/// Plaintext is pulled from `source` one chunk at a time, so memory use is
/// bounded by [`MAX_CHUNK_LEN`] regardless of the asset size.
pub struct EncryptingReader<R> {
    source: R,
    cipher: Aes256GcmSiv,
    header: StreamHeader,
    counter: u32,
    plain: Vec<u8>,
    out: Vec<u8>,
    pos: usize,
    header_emitted: bool,
    finished: bool,
    plaintext_len: u64,
}

impl<R> std::fmt::Debug for EncryptingReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptingReader")
            .field("chunks", &self.counter)
            .field("plaintext_len", &self.plaintext_len)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<R: Read> EncryptingReader<R> {
    /// Wrap `source` for encryption under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivation`] if the key is rejected by the cipher.
    pub fn new(source: R, key: &EncryptionKey) -> Result<Self, CryptoError> {
        Ok(Self {
            source,
            cipher: build_cipher(key)?,
            header: StreamHeader::generate(),
            counter: 0,
            plain: vec![0u8; CHUNK_PLAINTEXT_LEN],
            out: Vec::with_capacity(HEADER_LEN + LEN_PREFIX + MAX_CHUNK_LEN),
            pos: 0,
            header_emitted: false,
            finished: false,
            plaintext_len: 0,
        })
    }

    /// Plaintext bytes consumed from the source so far.
    pub fn plaintext_len(&self) -> u64 {
        self.plaintext_len
    }

    fn fill(&mut self) -> io::Result<()> {
        self.out.clear();
        self.pos = 0;
        if !self.header_emitted {
            self.out.extend_from_slice(&self.header.0);
            self.header_emitted = true;
        }

        let n = read_full(&mut self.source, &mut self.plain)?;
        let is_final = n == 0;
        let nonce = self.header.nonce(self.counter);
        let aad = self.header.aad(self.counter, is_final);
        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &self.plain[..n],
                    aad: &aad,
                },
            )
            .map_err(|_| io::Error::other(CryptoError::Authentication))?;

        // Bounded by MAX_CHUNK_LEN, so the cast is lossless.
        self.out.extend_from_slice(&(sealed.len() as u32).to_le_bytes());
        self.out.extend_from_slice(&sealed);
        self.plaintext_len += n as u64;
        trace!(chunk = self.counter, plaintext = n, is_final, "sealed chunk");

        if is_final {
            self.finished = true;
        } else {
            self.counter = self.counter.checked_add(1).ok_or_else(|| {
                io::Error::other(CryptoError::InvalidFormat)
            })?;
        }
        Ok(())
    }
}

impl<R: Read> Read for EncryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.out.len() {
                let n = buf.len().min(self.out.len() - self.pos);
                buf[..n].copy_from_slice(&self.out[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.finished || buf.is_empty() {
                return Ok(0);
            }
            self.fill()?;
        }
    }
}

/// Decrypt a framed stream from `source`, writing verified plaintext to `sink`.
///
/// Every chunk is authenticated before any of its bytes reach `sink`. A
/// failure in a later chunk means earlier chunks were already written; the
/// caller is responsible for discarding that partial output.
///
/// Returns the number of plaintext bytes written.
///
/// # Errors
///
/// - [`CryptoError::Authentication`] for a wrong key or any modification of the
///   framing (including truncation and trailing data).
/// - [`CryptoError::Io`] if reading `source` or writing `sink` fails.
pub fn decrypt_stream<R: Read, W: Write>(
    mut source: R,
    mut sink: W,
    key: &EncryptionKey,
) -> Result<u64, CryptoError> {
    let cipher = build_cipher(key)?;

    let mut header_bytes = [0u8; HEADER_LEN];
    read_exact_framed(&mut source, &mut header_bytes)?;
    let header = StreamHeader::parse(header_bytes)?;

    let mut len_buf = [0u8; LEN_PREFIX];
    let mut chunk = Vec::with_capacity(MAX_CHUNK_LEN);
    let mut counter: u32 = 0;
    let mut written: u64 = 0;

    loop {
        read_exact_framed(&mut source, &mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if !(TAG_LEN..=MAX_CHUNK_LEN).contains(&len) {
            return Err(CryptoError::Authentication);
        }
        chunk.resize(len, 0);
        read_exact_framed(&mut source, &mut chunk)?;

        let is_final = len == TAG_LEN;
        let nonce = header.nonce(counter);
        let aad = header.aad(counter, is_final);
        let plain = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &chunk,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Authentication)?;

        if is_final {
            let mut probe = [0u8; 1];
            if read_full(&mut source, &mut probe)? != 0 {
                return Err(CryptoError::Authentication);
            }
            break;
        }

        sink.write_all(&plain)?;
        written += plain.len() as u64;
        counter = counter
            .checked_add(1)
            .ok_or(CryptoError::Authentication)?;
    }

    sink.flush()?;
    Ok(written)
}

/// Read until `buf` is full or the source is exhausted. Returns bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// `read_exact` where a short read means the framing was truncated.
fn read_exact_framed<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), CryptoError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(CryptoError::Authentication),
        Err(e) => Err(CryptoError::Io(e)),
    }
}
