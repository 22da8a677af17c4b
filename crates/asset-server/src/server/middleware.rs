//! Axum middleware settings applied to the router.

use std::time::Duration;

/// Per-request timeout for every route except uploads. On downloads it bounds
/// producing the response head only; a streaming body keeps flowing after the
/// handler has returned.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
