//! AES-256-GCM-SIV encryption and decryption of short field values.
//!
//! **Algorithm choice:** AES-256-GCM-SIV (RFC 8452) is nonce-misuse-resistant,
//! so an accidental nonce collision between two field writes leaks equality of
//! the plaintexts and nothing more.
//!
//! Field ciphertext is stored as lowercase hex of `nonce ‖ ciphertext+tag` in
//! the same text column that holds plaintext.

use aes_gcm_siv::{
    aead::{Aead, KeyInit, OsRng},
    Aes256GcmSiv, Nonce,
};

use super::key::EncryptionKey;
use super::CryptoError;

/// Byte length of an AES-GCM-SIV nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of the authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// A sealed field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedField {
    /// Raw nonce bytes.
    pub nonce: [u8; NONCE_LEN],
    /// Raw ciphertext + authentication tag bytes.
    pub ciphertext: Vec<u8>,
}

impl SealedField {
    /// Encode to the stored representation: lowercase hex of `nonce ‖ ciphertext`.
    pub fn to_hex(&self) -> String {
        let mut raw = Vec::with_capacity(NONCE_LEN + self.ciphertext.len());
        raw.extend_from_slice(&self.nonce);
        raw.extend_from_slice(&self.ciphertext);
        hex::encode(raw)
    }

    /// Parse a stored hex value back into a [`SealedField`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidFormat`] if the value is not even-length
    /// hex or is too short to hold a nonce and a tag.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let raw = hex::decode(s).map_err(|_| CryptoError::InvalidFormat)?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::InvalidFormat);
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);
        Ok(Self {
            nonce,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// Seal a plaintext field value under `key`.
///
/// A random 96-bit nonce is generated per call via the OS CSPRNG, so sealing
/// the same value twice yields different ciphertexts.
///
/// # Errors
///
/// Returns [`CryptoError::Authentication`] on an internal AEAD error (unreachable
/// with a valid key and nonce).
pub fn seal_field(plaintext: &[u8], key: &EncryptionKey) -> Result<SealedField, CryptoError> {
    let cipher = build_cipher(key)?;

    use aes_gcm_siv::aead::rand_core::RngCore;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::Authentication)?;

    Ok(SealedField {
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Open a [`SealedField`] back to plaintext bytes.
///
/// # Errors
///
/// Returns [`CryptoError::Authentication`] if authentication fails (wrong key or tampered data).
pub fn open_field(field: &SealedField, key: &EncryptionKey) -> Result<Vec<u8>, CryptoError> {
    let cipher = build_cipher(key)?;
    let nonce = Nonce::from_slice(&field.nonce);
    cipher
        .decrypt(nonce, field.ciphertext.as_ref())
        .map_err(|_| CryptoError::Authentication)
}

pub(crate) fn build_cipher(key: &EncryptionKey) -> Result<Aes256GcmSiv, CryptoError> {
    Aes256GcmSiv::new_from_slice(&key.as_bytes()[..])
        .map_err(|_| CryptoError::KeyDerivation("cipher rejected key length".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key::KEY_LEN;

    fn random_key() -> EncryptionKey {
        use aes_gcm_siv::aead::rand_core::RngCore;
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        EncryptionKey::from_bytes(key)
    }

    #[test]
    fn seal_open_round_trip() {
        let key = random_key();
        let sealed = seal_field(b"hello world", &key).unwrap();
        assert_eq!(open_field(&sealed, &key).unwrap(), b"hello world");
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = seal_field(b"secret", &random_key()).unwrap();
        assert!(matches!(
            open_field(&sealed, &random_key()),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn hex_repr_is_lowercase_and_parses_back() {
        let key = random_key();
        let sealed = seal_field(b"hello", &key).unwrap();
        let s = sealed.to_hex();
        assert!(s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        assert_eq!(s.len(), 2 * (NONCE_LEN + 5 + TAG_LEN));
        assert_eq!(SealedField::from_hex(&s).unwrap(), sealed);
    }

    #[test]
    fn from_hex_rejects_short_values() {
        assert!(SealedField::from_hex("abc123").is_err());
        assert!(SealedField::from_hex("abc").is_err());
        assert!(SealedField::from_hex("").is_err());
    }

    #[test]
    fn nonces_are_fresh() {
        let key = random_key();
        let a = seal_field(b"same", &key).unwrap();
        let b = seal_field(b"same", &key).unwrap();
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let key = random_key();
        let mut field = seal_field(b"tamper me", &key).unwrap();
        field.ciphertext[0] ^= 0xFF;
        assert!(open_field(&field, &key).is_err());
    }
}
