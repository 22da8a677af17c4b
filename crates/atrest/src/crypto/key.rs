//! Key material, key candidates, and the resolver that normalises them.
//!
//! A secret is 32 bytes of hex-encoded entropy. The content key actually fed to
//! the cipher is derived from it with HMAC-SHA256 under a fixed label, so the
//! default secret and per-record secrets go through exactly the same path.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::CryptoError;

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Byte length of a decoded secret.
pub const SECRET_LEN: usize = 32;

const DERIVATION_LABEL: &[u8] = b"atrest/content-key/v1";

/// Fixed-size content key handed to the cipher.
///
/// The buffer is zeroed on drop and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey(Box<[u8; KEY_LEN]>);

impl EncryptionKey {
    /// Wrap raw key bytes that are already suitable for the cipher.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Box::new(bytes))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

/// What a record-level key provider may hand back.
#[derive(Clone, Default)]
pub enum KeyCandidate {
    /// Use the process-wide default key.
    #[default]
    None,
    /// Hex secret to derive a key from.
    RawSecret(String),
    /// A key that is used as-is.
    ResolvedKey(EncryptionKey),
}

impl std::fmt::Debug for KeyCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyCandidate::None => f.write_str("None"),
            KeyCandidate::RawSecret(_) => f.write_str("RawSecret([REDACTED])"),
            KeyCandidate::ResolvedKey(k) => f.debug_tuple("ResolvedKey").field(k).finish(),
        }
    }
}

impl From<EncryptionKey> for KeyCandidate {
    fn from(key: EncryptionKey) -> Self {
        KeyCandidate::ResolvedKey(key)
    }
}

impl From<&EncryptionKey> for KeyCandidate {
    fn from(key: &EncryptionKey) -> Self {
        KeyCandidate::ResolvedKey(key.clone())
    }
}

impl From<Option<String>> for KeyCandidate {
    fn from(secret: Option<String>) -> Self {
        secret.map_or(KeyCandidate::None, KeyCandidate::RawSecret)
    }
}

/// Record-level key override.
///
/// Records that want their own key implement this; records that don't are
/// passed as `None` and fall back to the default key.
#[cfg_attr(test, mockall::automock)]
pub trait KeyProvider {
    fn provide_encryption_key(&self) -> KeyCandidate;
}

/// A provider that always returns the same candidate.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyProvider(pub KeyCandidate);

impl KeyProvider for StaticKeyProvider {
    fn provide_encryption_key(&self) -> KeyCandidate {
        self.0.clone()
    }
}

/// Ask `provider` for a candidate, treating an absent provider as [`KeyCandidate::None`].
pub fn candidate_from(provider: Option<&dyn KeyProvider>) -> KeyCandidate {
    provider.map_or(KeyCandidate::None, |p| p.provide_encryption_key())
}

/// Validated secret bytes. Zeroed on drop.
#[derive(Clone)]
struct SecretBytes(Box<[u8; SECRET_LEN]>);

impl Drop for SecretBytes {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

/// Turns a [`KeyCandidate`] into an [`EncryptionKey`].
///
/// Constructed once from configuration; holds the validated default secret and
/// derives keys on every call.
#[derive(Clone)]
pub struct KeyResolver {
    default_secret: SecretBytes,
}

impl std::fmt::Debug for KeyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyResolver { default_secret: [REDACTED] }")
    }
}

impl KeyResolver {
    /// Validate `default_secret` and build a resolver around it.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivation`] if the secret is not 64 hex characters.
    pub fn new(default_secret: &str) -> Result<Self, CryptoError> {
        Ok(Self {
            default_secret: decode_secret(default_secret)?,
        })
    }

    /// Normalise `candidate` into a usable key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivation`] if a raw secret is malformed.
    pub fn resolve(&self, candidate: KeyCandidate) -> Result<EncryptionKey, CryptoError> {
        match candidate {
            KeyCandidate::None => derive(&self.default_secret),
            KeyCandidate::RawSecret(s) => derive_key(&s),
            KeyCandidate::ResolvedKey(k) => Ok(k),
        }
    }
}

/// Derive a content key from a hex secret.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if the secret is not 64 hex characters.
pub fn derive_key(secret: &str) -> Result<EncryptionKey, CryptoError> {
    derive(&decode_secret(secret)?)
}

fn decode_secret(secret: &str) -> Result<SecretBytes, CryptoError> {
    let trimmed = secret.trim();
    if trimmed.len() != SECRET_LEN * 2 {
        return Err(CryptoError::KeyDerivation(format!(
            "secret must be {} hex characters, got {}",
            SECRET_LEN * 2,
            trimmed.len()
        )));
    }
    let mut buf = Box::new([0u8; SECRET_LEN]);
    hex::decode_to_slice(trimmed, &mut buf[..])
        .map_err(|_| CryptoError::KeyDerivation("secret is not valid hex".into()))?;
    Ok(SecretBytes(buf))
}

fn derive(secret: &SecretBytes) -> Result<EncryptionKey, CryptoError> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&secret.0[..])
        .map_err(|_| CryptoError::KeyDerivation("hmac rejected secret".into()))?;
    mac.update(DERIVATION_LABEL);
    let out = mac.finalize().into_bytes();
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&out);
    Ok(EncryptionKey::from_bytes(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
    const OTHER: &str = "ffeeddccbbaa99887766554433221100ffeeddccbbaa99887766554433221100";

    #[test]
    fn none_resolves_to_default_key() {
        let resolver = KeyResolver::new(DEFAULT).unwrap();
        let a = resolver.resolve(KeyCandidate::None).unwrap();
        assert_eq!(a, derive_key(DEFAULT).unwrap());
    }

    #[test]
    fn raw_secret_is_deterministic() {
        let resolver = KeyResolver::new(DEFAULT).unwrap();
        let a = resolver.resolve(KeyCandidate::RawSecret(OTHER.into())).unwrap();
        let b = resolver.resolve(KeyCandidate::RawSecret(OTHER.into())).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, resolver.resolve(KeyCandidate::None).unwrap());
    }

    #[test]
    fn raw_secret_tolerates_whitespace_and_case() {
        let upper = format!("  {}\n", OTHER.to_uppercase());
        assert_eq!(derive_key(&upper).unwrap(), derive_key(OTHER).unwrap());
    }

    #[test]
    fn resolved_key_passes_through() {
        let resolver = KeyResolver::new(DEFAULT).unwrap();
        let key = EncryptionKey::from_bytes([7u8; KEY_LEN]);
        let out = resolver.resolve(KeyCandidate::from(key.clone())).unwrap();
        assert_eq!(out, key);
    }

    #[test]
    fn derived_key_differs_from_secret_bytes() {
        let key = derive_key(DEFAULT).unwrap();
        let mut raw = [0u8; KEY_LEN];
        hex::decode_to_slice(DEFAULT, &mut raw).unwrap();
        assert_ne!(key.as_bytes(), &raw);
    }

    #[test]
    fn malformed_secrets_rejected() {
        assert!(matches!(
            KeyResolver::new("abc"),
            Err(CryptoError::KeyDerivation(_))
        ));
        let not_hex = "z".repeat(64);
        assert!(matches!(
            derive_key(&not_hex),
            Err(CryptoError::KeyDerivation(_))
        ));
    }

    #[test]
    fn derivation_error_does_not_echo_secret() {
        let bad = "q".repeat(64);
        let err = derive_key(&bad).unwrap_err();
        assert!(!err.to_string().contains(&bad));
    }

    #[test]
    fn absent_provider_is_none() {
        assert!(matches!(candidate_from(None), KeyCandidate::None));
    }

    #[test]
    fn provider_candidate_is_used() {
        let mut mock = MockKeyProvider::new();
        mock.expect_provide_encryption_key()
            .times(1)
            .returning(|| KeyCandidate::RawSecret(OTHER.into()));
        let c = candidate_from(Some(&mock));
        assert!(matches!(c, KeyCandidate::RawSecret(_)));
    }

    #[test]
    fn debug_output_is_redacted() {
        let key = derive_key(DEFAULT).unwrap();
        assert!(format!("{key:?}").contains("REDACTED"));
        let c = KeyCandidate::RawSecret(OTHER.into());
        assert!(!format!("{c:?}").contains(OTHER));
        let r = KeyResolver::new(DEFAULT).unwrap();
        assert!(!format!("{r:?}").contains(DEFAULT));
    }
}
