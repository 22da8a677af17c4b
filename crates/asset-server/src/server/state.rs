//! Shared application state injected into every Axum handler.

use std::path::PathBuf;
use std::sync::Arc;

use atrest::{AssetEncryptionManager, CryptoService, DeliveryOptions, KeyResolver, StreamingDownloadInterceptor};

use crate::storage::AssetStore;

/// Application state shared across all request handlers.
///
/// Every field is cheap to clone; the crypto service shares its resolver
/// behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Field-level encryption under the default key.
    pub crypto: CryptoService,
    /// Asset persistence and encrypt-on-write.
    pub store: AssetStore,
    /// Decrypt-on-download.
    pub interceptor: Arc<StreamingDownloadInterceptor>,
}

impl AppState {
    /// Wire the core components from a validated resolver.
    pub fn new(storage_root: impl Into<PathBuf>, resolver: KeyResolver, options: DeliveryOptions) -> Self {
        let crypto = CryptoService::new(resolver);
        let manager = AssetEncryptionManager::new(crypto.clone());
        Self {
            store: AssetStore::new(storage_root, manager.clone()),
            interceptor: Arc::new(StreamingDownloadInterceptor::new(manager, options)),
            crypto,
        }
    }
}
