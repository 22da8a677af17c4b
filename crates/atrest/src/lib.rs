//! Transparent at-rest encryption for stored assets and database fields.
//!
//! Components, leaves first:
//!
//! - [`crypto::KeyResolver`] turns a [`crypto::KeyCandidate`] into a key.
//! - [`crypto::CryptoService`] streams asset ciphertext and seals field values.
//! - [`asset::AssetEncryptionManager`] encrypts assets after they are persisted
//!   and recovers their original names.
//! - [`delivery::StreamingDownloadInterceptor`] decrypts encrypted assets
//!   straight into an outbound response.
//! - [`field::EncryptedField`] / [`field::EncryptedEnum`] encrypt column values
//!   on write and decrypt them on read.
//!
//! All I/O is blocking and bounded by a fixed chunk size. Nothing here reads
//! the environment; hosts build the components from their own configuration.
//!
//! # Security invariants
//!
//! - Key material never appears in `Debug` output, errors, or logs.
//! - Field values are never logged.

pub mod asset;
pub mod crypto;
pub mod delivery;
pub mod field;

pub use asset::{AssetEncryptionManager, AssetError, EncryptOutcome, StoredAsset};
pub use crypto::{CryptoError, CryptoService, KeyCandidate, KeyProvider, KeyResolver};
pub use delivery::{
    DeliveryOptions, Interception, ResponseSink, StreamingDownloadInterceptor,
};
pub use field::{EncryptedEnum, EncryptedField, FieldError};
