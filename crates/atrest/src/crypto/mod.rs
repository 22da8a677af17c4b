//! AES-256-GCM-SIV encryption for asset streams and short field values.
//!
//! This module is free of storage and HTTP concerns. [`CryptoService`] is the
//! only entry point the rest of the crate uses; it resolves the key exactly
//! once per operation and never caches derived keys.
//!
//! # Field ciphertext format
//!
//! ```text
//! hex(nonce[12] ‖ ciphertext ‖ tag[16])
//! ```
//!
//! Stored in the same column as plaintext. Whether a stored value is
//! ciphertext is decided by an all-hex-digit check, which is a heuristic:
//! plaintext that happens to be hex (`"abc123"`) triggers a decrypt attempt
//! that fails and falls back to the raw value.

pub mod cipher;
pub mod key;
pub mod stream;

pub use key::{
    candidate_from, derive_key, EncryptionKey, KeyCandidate, KeyProvider, KeyResolver,
    StaticKeyProvider, KEY_LEN,
};
pub use stream::EncryptingReader;

use std::io::{Read, Write};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use cipher::{open_field, seal_field, SealedField};

/// Errors produced by the crypto layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// A secret could not be turned into a key (wrong length or encoding).
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Ciphertext was tampered with, truncated, or sealed under another key.
    #[error("ciphertext failed authentication")]
    Authentication,

    /// A stored value does not have the shape of ciphertext.
    #[error("invalid ciphertext format")]
    InvalidFormat,

    /// Reading the source or writing the sink failed.
    #[error("i/o error during crypto operation: {0}")]
    Io(#[from] std::io::Error),
}

/// Stateless facade over the cipher primitives.
///
/// Cheap to clone; the resolver is shared behind an `Arc`.
#[derive(Clone, Debug)]
pub struct CryptoService {
    resolver: Arc<KeyResolver>,
}

impl CryptoService {
    pub fn new(resolver: KeyResolver) -> Self {
        Self {
            resolver: Arc::new(resolver),
        }
    }

    /// Resolve a candidate through the configured [`KeyResolver`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivation`] if a raw secret is malformed.
    pub fn resolve(&self, candidate: impl Into<KeyCandidate>) -> Result<EncryptionKey, CryptoError> {
        self.resolver.resolve(candidate.into())
    }

    /// Wrap `source` in a reader that yields its ciphertext framing.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivation`] if the key cannot be resolved.
    pub fn encrypt_stream<R: Read>(
        &self,
        source: R,
        key: impl Into<KeyCandidate>,
    ) -> Result<EncryptingReader<R>, CryptoError> {
        let key = self.resolve(key)?;
        EncryptingReader::new(source, &key)
    }

    /// Stream-decrypt `source` into `sink`, returning the plaintext byte count.
    ///
    /// # Errors
    ///
    /// See [`stream::decrypt_stream`].
    pub fn decrypt_stream<R: Read, W: Write>(
        &self,
        source: R,
        sink: W,
        key: impl Into<KeyCandidate>,
    ) -> Result<u64, CryptoError> {
        let key = self.resolve(key)?;
        stream::decrypt_stream(source, sink, &key)
    }

    /// Encrypt a field value under the default key and hex-encode it.
    ///
    /// The empty string is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error only if the default key cannot be derived.
    pub fn encrypt_field(&self, value: &str) -> Result<String, CryptoError> {
        if value.is_empty() {
            return Ok(String::new());
        }
        let key = self.resolve(KeyCandidate::None)?;
        Ok(seal_field(value.as_bytes(), &key)?.to_hex())
    }

    /// Decrypt a stored field value, falling back to `value` itself whenever it
    /// is not hex or does not decrypt.
    pub fn decrypt_field(&self, value: &str) -> String {
        if !looks_like_ciphertext(value) {
            return value.to_owned();
        }
        match self.try_decrypt_field(value) {
            Ok(plain) => plain,
            Err(e) => {
                debug!(error = %e, len = value.len(), "hex field did not decrypt; returning stored value");
                value.to_owned()
            }
        }
    }

    fn try_decrypt_field(&self, value: &str) -> Result<String, CryptoError> {
        let sealed = SealedField::from_hex(value)?;
        let key = self.resolve(KeyCandidate::None)?;
        let plain = open_field(&sealed, &key)?;
        String::from_utf8(plain).map_err(|_| CryptoError::InvalidFormat)
    }
}

/// The ciphertext heuristic: non-empty and every character a hex digit.
pub fn looks_like_ciphertext(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_hexdigit())
}
