//! Filesystem-backed asset store.
//!
//! Uploads are streamed to a hidden temporary file under the storage root,
//! moved into place under the requested name, and then handed to
//! [`AssetEncryptionManager::on_after_persist`], which replaces the plaintext
//! with `<name>.enc`. Commits are serialised per name so two uploads of the
//! same name never encrypt concurrently.
//!
//! The temporary file is removed on drop unless it was committed, so an
//! upload abandoned mid-body leaves nothing behind. Once committed, the move
//! and the encryption run on a blocking task that finishes on its own and
//! deletes the plaintext if encryption fails.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, Weak};

use atrest::asset::naming;
use atrest::crypto::StaticKeyProvider;
use atrest::{
    AssetEncryptionManager, AssetError, CryptoError, EncryptOutcome, KeyCandidate, KeyProvider,
    StoredAsset,
};
use axum::body::Body;
use common::protocol::UploadResponse;
use common::ServiceError;
use futures::StreamExt;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Request header carrying a per-asset secret.
pub const ASSET_KEY_HEADER: &str = "x-asset-key";

/// Assets stored as flat files under a single root directory.
#[derive(Clone, Debug)]
pub struct AssetStore {
    root: Arc<PathBuf>,
    manager: AssetEncryptionManager,
    commits: Arc<CommitLocks>,
}

/// One async lock per asset name, kept only while someone holds or waits on
/// it.
#[derive(Debug, Default)]
struct CommitLocks(std::sync::Mutex<HashMap<String, Weak<Mutex<()>>>>);

impl CommitLocks {
    fn for_name(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| lock.strong_count() > 0);
        if let Some(lock) = locks.get(name).and_then(Weak::upgrade) {
            return lock;
        }
        let lock = Arc::new(Mutex::new(()));
        locks.insert(name.to_owned(), Arc::downgrade(&lock));
        lock
    }

    async fn acquire(&self, name: &str) -> OwnedMutexGuard<()> {
        self.for_name(name).lock_owned().await
    }
}

impl AssetStore {
    pub fn new(root: impl Into<PathBuf>, manager: AssetEncryptionManager) -> Self {
        Self {
            root: Arc::new(root.into()),
            manager,
            commits: Arc::default(),
        }
    }

    /// Whether the root exists and is a directory.
    pub async fn is_ready(&self) -> bool {
        tokio::fs::metadata(self.root.as_path())
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Resolve a client-facing name to its stored file: `<name>.enc` if it
    /// exists, otherwise `<name>` (which may itself be missing).
    pub async fn locate(&self, name: &str) -> Result<StoredAsset, ServiceError> {
        validate_name(name)?;
        let encrypted = self.root.join(naming::encrypted_name(name));
        if tokio::fs::try_exists(&encrypted).await.unwrap_or(false) {
            return Ok(StoredAsset::new(encrypted));
        }
        Ok(StoredAsset::new(self.root.join(name)))
    }

    /// Persist `body` under `name` and encrypt it at rest.
    ///
    /// An existing asset with the same name is replaced. With `secret` set the
    /// asset is encrypted under that key instead of the default one.
    ///
    /// # Errors
    ///
    /// - [`ServiceError::BadRequest`] for reserved names, malformed secrets or
    ///   an interrupted request body.
    /// - [`ServiceError::Unavailable`] if the storage root is missing.
    /// - [`ServiceError::Internal`] for filesystem or encryption failures.
    pub async fn save(
        &self,
        name: &str,
        body: Body,
        secret: Option<String>,
    ) -> Result<UploadResponse, ServiceError> {
        validate_name(name)?;
        let provider = self.key_provider(secret)?;

        let upload = tempfile::Builder::new()
            .prefix(&format!(".{name}."))
            .suffix(".upload")
            .tempfile_in(self.root.as_path())
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => {
                    warn!(root = %self.root.display(), "storage root is missing");
                    ServiceError::Unavailable("storage is unavailable".into())
                }
                _ => internal("failed to create upload file", e),
            })?;
        write_body(&upload, body).await?;

        let guard = self.commits.acquire(name).await;
        let manager = self.manager.clone();
        let target = self.root.join(name);
        let (outcome, asset) = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let provider = provider.as_ref().map(|p| p as &dyn KeyProvider);
            commit(upload, &target, &manager, provider)
        })
        .await
        .map_err(|e| ServiceError::Internal(format!("encryption task failed: {e}")))??;

        let bytes_encrypted = match outcome {
            EncryptOutcome::Encrypted { plaintext_bytes } => plaintext_bytes,
            EncryptOutcome::AlreadyEncrypted => 0,
        };
        info!(asset = %name, bytes_encrypted, "upload stored");
        Ok(UploadResponse {
            stored_name: asset.name().into_owned(),
            original_name: self.manager.original_name(&asset),
            encrypted: self.manager.is_encrypted(&asset),
            bytes_encrypted,
        })
    }

    /// Key provider for an optional per-asset secret. The secret is checked
    /// up front so nothing is written or streamed under a key that cannot be
    /// derived.
    ///
    /// # Errors
    ///
    /// [`ServiceError::BadRequest`] if the secret is malformed.
    pub fn key_provider(
        &self,
        secret: Option<String>,
    ) -> Result<Option<StaticKeyProvider>, ServiceError> {
        let Some(secret) = secret else {
            return Ok(None);
        };
        let candidate = KeyCandidate::RawSecret(secret);
        self.manager
            .crypto()
            .resolve(candidate.clone())
            .map_err(|_| ServiceError::BadRequest("invalid asset key".into()))?;
        Ok(Some(StaticKeyProvider(candidate)))
    }
}

/// Reject names that could escape the root, collide with temporary files, or
/// carry the reserved suffix.
pub fn validate_name(name: &str) -> Result<(), ServiceError> {
    let reason = if name.is_empty() {
        Some("asset name must not be empty")
    } else if name.contains(['/', '\\']) || name.contains("..") {
        Some("asset name must not contain path separators or '..'")
    } else if name.starts_with('.') {
        Some("asset name must not start with '.'")
    } else if name.chars().any(char::is_control) {
        Some("asset name must not contain control characters")
    } else if naming::is_encrypted_name(name) {
        Some("asset name must not end with the reserved suffix")
    } else {
        None
    };
    match reason {
        Some(r) => Err(ServiceError::BadRequest(r.into())),
        None => Ok(()),
    }
}

/// Map a core asset error onto the HTTP error model.
pub fn asset_error(err: AssetError) -> ServiceError {
    match err {
        AssetError::NotFound(_) => ServiceError::NotFound("asset does not exist".into()),
        AssetError::Crypto(CryptoError::KeyDerivation(_)) => {
            ServiceError::BadRequest("invalid asset key".into())
        }
        AssetError::Crypto(CryptoError::Authentication | CryptoError::InvalidFormat) => {
            ServiceError::DecryptionFailure("asset could not be decrypted".into())
        }
        other => {
            warn!(error = %other, "asset operation failed");
            ServiceError::Internal("asset operation failed".into())
        }
    }
}

async fn write_body(upload: &NamedTempFile, body: Body) -> Result<(), ServiceError> {
    let file = upload
        .as_file()
        .try_clone()
        .map_err(|e| internal("failed to open upload file", e))?;
    let mut file = tokio::fs::File::from_std(file);

    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ServiceError::BadRequest(format!("upload interrupted: {e}")))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| internal("failed to write upload", e))?;
    }
    file.sync_all()
        .await
        .map_err(|e| internal("failed to sync upload", e))
}

/// Move a finished upload to `target` and encrypt it in place. Runs on a
/// blocking thread; on any failure after the move the plaintext is removed.
fn commit(
    upload: NamedTempFile,
    target: &Path,
    manager: &AssetEncryptionManager,
    provider: Option<&dyn KeyProvider>,
) -> Result<(EncryptOutcome, StoredAsset), ServiceError> {
    upload
        .persist(target)
        .map_err(|e| internal("failed to store upload", e.error))?;

    let mut asset = StoredAsset::new(target.to_path_buf());
    let stale = target.with_file_name(naming::encrypted_name(&asset.name()));
    match std::fs::remove_file(&stale) {
        Ok(()) => debug!(asset = %asset.name(), "replaced previous ciphertext"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            discard(target);
            return Err(internal("failed to replace previous asset", e));
        }
    }

    match manager.on_after_persist(&mut asset, provider) {
        Ok(outcome) => Ok((outcome, asset)),
        Err(e) => {
            discard(target);
            Err(asset_error(e))
        }
    }
}

fn discard(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove leftover file");
        }
    }
}

fn internal(context: &str, err: io::Error) -> ServiceError {
    warn!(error = %err, "{context}");
    ServiceError::Internal(context.into())
}
