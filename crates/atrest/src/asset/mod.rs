//! At-rest lifecycle of stored assets.
//!
//! # Lifecycle
//!
//! 1. The host writes the asset's plaintext bytes to its backing store.
//! 2. The host fires its after-persist event into
//!    [`AssetEncryptionManager::on_after_persist`].
//! 3. If the stored name does not already carry [`naming::ENCRYPTED_SUFFIX`],
//!    the bytes are stream-encrypted to a temporary sibling, the sibling is
//!    renamed to `<name>.enc`, and the plaintext file is removed.
//!
//! # Invariants
//!
//! - Encryption state is read from the name only.
//! - After a successful call the plaintext file no longer exists.
//! - On failure the temporary file is removed and the original is untouched.
//! - Two concurrent encryptions of the same asset are the host's to prevent;
//!   this module only guarantees idempotency.

pub mod naming;

use std::borrow::Cow;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto::{candidate_from, CryptoError, CryptoService, KeyProvider};

/// Errors from the asset layer.
#[derive(Debug, Error)]
pub enum AssetError {
    /// The asset does not exist on the backing store.
    #[error("asset not found: {0}")]
    NotFound(PathBuf),

    /// Something already occupies the encrypted name.
    #[error("encrypted target already exists: {0}")]
    TargetExists(PathBuf),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("asset i/o error: {0}")]
    Io(#[from] io::Error),
}

/// A named binary object on a filesystem-backed store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAsset {
    path: PathBuf,
}

impl StoredAsset {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored file name, including the reserved suffix when encrypted.
    pub fn name(&self) -> Cow<'_, str> {
        self.path
            .file_name()
            .map_or(Cow::Borrowed(""), |n| n.to_string_lossy())
    }

    /// Extension of the stored name (`"enc"` for encrypted assets).
    pub fn extension(&self) -> String {
        naming::file_extension(&self.name()).to_owned()
    }

    /// Whether the backing file is present.
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Stored byte length (ciphertext length for encrypted assets).
    pub fn size(&self) -> io::Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }
}

/// Result of [`AssetEncryptionManager::encrypt_if_needed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptOutcome {
    /// The name already carried the suffix; nothing was done.
    AlreadyEncrypted,
    /// The asset was encrypted; `plaintext_bytes` were consumed.
    Encrypted { plaintext_bytes: u64 },
}

/// Owns the encrypt-on-write step and the original-name recovery rules.
#[derive(Clone, Debug)]
pub struct AssetEncryptionManager {
    crypto: CryptoService,
}

impl AssetEncryptionManager {
    pub fn new(crypto: CryptoService) -> Self {
        Self { crypto }
    }

    pub fn crypto(&self) -> &CryptoService {
        &self.crypto
    }

    /// Naming check only; the bytes are never inspected.
    pub fn is_encrypted(&self, asset: &StoredAsset) -> bool {
        naming::is_encrypted_name(&asset.name())
    }

    /// Stored name with one trailing reserved suffix removed.
    pub fn original_name(&self, asset: &StoredAsset) -> String {
        naming::strip_encrypted_suffix(&asset.name()).to_owned()
    }

    /// Extension of [`Self::original_name`].
    pub fn original_extension(&self, asset: &StoredAsset) -> String {
        naming::file_extension(&self.original_name(asset)).to_owned()
    }

    /// Host after-persist hook. Safe to fire on every write, including
    /// metadata-only writes.
    ///
    /// # Errors
    ///
    /// See [`Self::encrypt_if_needed`].
    pub fn on_after_persist(
        &self,
        asset: &mut StoredAsset,
        provider: Option<&dyn KeyProvider>,
    ) -> Result<EncryptOutcome, AssetError> {
        self.encrypt_if_needed(asset, provider)
    }

    /// Encrypt `asset` in place unless its name says it already is.
    ///
    /// `provider` is consulted only when encryption actually happens. On
    /// success `asset` points at the renamed `<name>.enc` file.
    ///
    /// # Errors
    ///
    /// - [`AssetError::NotFound`] if the file is missing.
    /// - [`AssetError::TargetExists`] if `<name>.enc` is already taken.
    /// - [`AssetError::Crypto`] if the key cannot be resolved.
    /// - [`AssetError::Io`] on filesystem failures.
    pub fn encrypt_if_needed(
        &self,
        asset: &mut StoredAsset,
        provider: Option<&dyn KeyProvider>,
    ) -> Result<EncryptOutcome, AssetError> {
        if self.is_encrypted(asset) {
            debug!(asset = %asset.name(), "asset already encrypted; skipping");
            return Ok(EncryptOutcome::AlreadyEncrypted);
        }
        if !asset.exists() {
            return Err(AssetError::NotFound(asset.path.clone()));
        }

        let name = asset.name().into_owned();
        let dir = asset.path.parent().unwrap_or_else(|| Path::new("."));
        let target = dir.join(naming::encrypted_name(&name));
        if target.exists() {
            return Err(AssetError::TargetExists(target));
        }

        let tmp = dir.join(format!(".{name}.{}.tmp", uuid::Uuid::new_v4()));
        let plaintext_bytes = match self.write_ciphertext(&asset.path, &tmp, provider) {
            Ok(n) => n,
            Err(e) => {
                discard(&tmp);
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&tmp, &target) {
            discard(&tmp);
            return Err(e.into());
        }
        if let Err(e) = fs::remove_file(&asset.path) {
            // Keep exactly one copy: back out the ciphertext, leave the original.
            discard(&target);
            return Err(e.into());
        }

        info!(asset = %name, plaintext_bytes, "asset encrypted at rest");
        asset.path = target;
        Ok(EncryptOutcome::Encrypted { plaintext_bytes })
    }

    /// Stream-decrypt an encrypted asset into `sink`.
    ///
    /// The source handle is scoped to this call and released on every exit path.
    ///
    /// # Errors
    ///
    /// [`AssetError::NotFound`] if the file is missing; otherwise the
    /// [`CryptoError`] from the stream.
    pub fn decrypt_to<W: Write>(
        &self,
        asset: &StoredAsset,
        provider: Option<&dyn KeyProvider>,
        sink: W,
    ) -> Result<u64, AssetError> {
        let file = match File::open(&asset.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(AssetError::NotFound(asset.path.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        let written = self
            .crypto
            .decrypt_stream(BufReader::new(file), sink, candidate_from(provider))?;
        Ok(written)
    }

    fn write_ciphertext(
        &self,
        source: &Path,
        tmp: &Path,
        provider: Option<&dyn KeyProvider>,
    ) -> Result<u64, AssetError> {
        let input = BufReader::new(File::open(source)?);
        let mut reader = self.crypto.encrypt_stream(input, candidate_from(provider))?;

        let out = OpenOptions::new().write(true).create_new(true).open(tmp)?;
        let mut writer = BufWriter::new(out);
        io::copy(&mut reader, &mut writer)?;
        let out = writer.into_inner().map_err(|e| e.into_error())?;
        out.sync_all()?;
        Ok(reader.plaintext_len())
    }
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove leftover file");
        }
    }
}
