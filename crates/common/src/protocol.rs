//! Request and response types exchanged with the asset server.
//!
//! All bodies are serialised as JSON. Asset bytes themselves travel as raw
//! request/response bodies and never appear in these types.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Field endpoints
// ---------------------------------------------------------------------------

/// Request body for `POST /fields/encrypt` and `POST /fields/decrypt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldRequest {
    /// Plaintext (encrypt) or stored column value (decrypt).
    pub value: String,
}

/// Response body for both field endpoints.
///
/// For `encrypt` the value is lowercase hex ciphertext (or the empty string
/// when the input was empty). For `decrypt` it is the plaintext, or the input
/// unchanged when it did not look like ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldResponse {
    pub value: String,
}

// ---------------------------------------------------------------------------
// Asset upload
// ---------------------------------------------------------------------------

/// Response body for `PUT /assets/:name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    /// Name the asset is stored under (carries the `.enc` suffix once encrypted).
    pub stored_name: String,
    /// Name the client uploaded, i.e. the stored name without the suffix.
    pub original_name: String,
    /// Whether the stored bytes are ciphertext.
    pub encrypted: bool,
    /// Plaintext byte count that was encrypted by this request (0 if none).
    pub bytes_encrypted: u64,
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// Standard error response body returned on any non-2xx JSON status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. `"bad_request"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&crate::ServiceError> for ErrorResponse {
    fn from(err: &crate::ServiceError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Response body for `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall service status: `"ok"` or `"degraded"`.
    pub status: String,
    /// Whether the storage root exists and is a directory.
    pub storage_ready: bool,
}
