//! Decrypt-on-download interception.
//!
//! The host calls [`StreamingDownloadInterceptor::intercept`] from its
//! before-send-file hook with the target asset and its response. Per request
//! the interceptor walks:
//!
//! ```text
//! Idle → Intercepted ─┬─ PassThrough                       (missing, plaintext, test mode)
//!                     └─ HeadersRewritten → Streaming ─┬─ Completed
//!                                                      └─ Failed
//! ```
//!
//! On `PassThrough` the response is handed back untouched so the host can run
//! its normal path. On `Completed` the response has been finished and dropped,
//! so the host cannot send the file a second time. On `Failed` the headers are
//! reverted to an inline plain-text page and the response is handed back with
//! the error.

pub mod headers;

use std::io::{self, Write};
use std::num::NonZeroU64;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::asset::{AssetEncryptionManager, AssetError, StoredAsset};
use crate::crypto::KeyProvider;

pub use headers::{Disposition, FilenameSource, TransferBudget};

/// Host response the interceptor writes into.
///
/// The body is written through [`Write`]. Implementations decide when headers
/// are committed to the wire; they must accept header changes until the first
/// body byte is written.
pub trait ResponseSink: Write {
    fn set_header(&mut self, name: &'static str, value: String);
    fn remove_header(&mut self, name: &'static str);
    /// Terminate the response cycle.
    fn finish(&mut self) -> io::Result<()>;
}

impl<T: ResponseSink + ?Sized> ResponseSink for &mut T {
    fn set_header(&mut self, name: &'static str, value: String) {
        (**self).set_header(name, value);
    }

    fn remove_header(&mut self, name: &'static str) {
        (**self).remove_header(name);
    }

    fn finish(&mut self) -> io::Result<()> {
        (**self).finish()
    }
}

/// Whether the process runs under a test harness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    #[default]
    Production,
    /// Encrypted assets are passed through undecrypted so fixtures stay
    /// deterministic and fast.
    Test,
}

/// Delivery configuration.
#[derive(Debug, Clone, Default)]
pub struct DeliveryOptions {
    pub disposition: Disposition,
    /// Minimum client bandwidth in bytes per second.
    pub min_bandwidth: Option<NonZeroU64>,
    pub filename: FilenameSource,
    pub mode: ExecutionMode,
}

/// Per-request state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Idle,
    Intercepted,
    HeadersRewritten,
    Streaming,
    Completed,
    PassThrough,
    Failed,
}

/// Why the host's normal delivery path should run instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassThroughReason {
    Missing,
    NotEncrypted,
    TestMode,
}

/// Summary of a completed decrypting download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub filename: String,
    pub content_type: &'static str,
    pub plaintext_bytes: u64,
    pub budget: TransferBudget,
}

/// Outcome of [`StreamingDownloadInterceptor::intercept`].
#[derive(Debug)]
pub enum Interception<R> {
    PassThrough {
        response: R,
        reason: PassThroughReason,
    },
    Completed(DeliveryReport),
}

/// Errors raised on the decrypting path.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error("response i/o error: {0}")]
    Io(#[from] io::Error),
}

/// A failed decrypting download.
///
/// `response` already carries the reverted error headers. If `bytes_sent` is
/// non-zero the body has partially reached the client and must be aborted
/// rather than completed.
#[derive(Debug)]
pub struct DeliveryFailure<R> {
    pub response: R,
    pub error: DeliveryError,
    pub bytes_sent: u64,
}

/// Transient per-request context.
#[derive(Debug)]
struct DeliveryContext {
    asset: String,
    state: DeliveryState,
}

impl DeliveryContext {
    fn new(asset: &StoredAsset) -> Self {
        Self {
            asset: asset.name().into_owned(),
            state: DeliveryState::Idle,
        }
    }

    fn transition(&mut self, next: DeliveryState) {
        debug!(asset = %self.asset, from = ?self.state, to = ?next, "delivery state");
        self.state = next;
    }
}

/// Decides whether a download needs decryption and, if so, streams it.
#[derive(Clone, Debug)]
pub struct StreamingDownloadInterceptor {
    manager: AssetEncryptionManager,
    options: DeliveryOptions,
}

impl StreamingDownloadInterceptor {
    pub fn new(manager: AssetEncryptionManager, options: DeliveryOptions) -> Self {
        Self { manager, options }
    }

    pub fn options(&self) -> &DeliveryOptions {
        &self.options
    }

    /// Run the delivery state machine for one request.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryFailure`] if the asset cannot be read or decrypted, or
    /// if the response cannot be written. Cryptographic failures are never
    /// swallowed.
    pub fn intercept<R: ResponseSink>(
        &self,
        asset: &StoredAsset,
        provider: Option<&dyn KeyProvider>,
        mut response: R,
    ) -> Result<Interception<R>, DeliveryFailure<R>> {
        let mut ctx = DeliveryContext::new(asset);
        ctx.transition(DeliveryState::Intercepted);

        let pass = |mut ctx: DeliveryContext, response: R, reason: PassThroughReason| {
            ctx.transition(DeliveryState::PassThrough);
            debug!(asset = %ctx.asset, ?reason, "passing delivery through to host");
            Ok(Interception::PassThrough { response, reason })
        };

        if !asset.exists() {
            return pass(ctx, response, PassThroughReason::Missing);
        }
        if !self.manager.is_encrypted(asset) {
            return pass(ctx, response, PassThroughReason::NotEncrypted);
        }
        if self.options.mode == ExecutionMode::Test {
            return pass(ctx, response, PassThroughReason::TestMode);
        }

        let encrypted_size = match asset.size() {
            Ok(n) => n,
            Err(e) => return Err(fail(&mut ctx, response, e.into(), 0)),
        };

        let filename = match self.options.filename {
            FilenameSource::Original => self.manager.original_name(asset),
            FilenameSource::Stored => asset.name().into_owned(),
        };
        let content_type = headers::mime_type(&self.manager.original_extension(asset));
        let budget = TransferBudget::for_size(encrypted_size, self.options.min_bandwidth);

        response.remove_header(headers::CONTENT_LENGTH);
        for (name, value) in headers::download_headers(self.options.disposition, &filename, content_type) {
            response.set_header(name, value);
        }
        ctx.transition(DeliveryState::HeadersRewritten);

        ctx.transition(DeliveryState::Streaming);
        let mut counting = CountingWriter::new(&mut response);
        let streamed = self.manager.decrypt_to(asset, provider, &mut counting);
        let sent = counting.count;

        let plaintext_bytes = match streamed {
            Ok(n) => n,
            Err(e) => return Err(fail(&mut ctx, response, e.into(), sent)),
        };
        if let Err(e) = response.finish() {
            return Err(fail(&mut ctx, response, e.into(), sent));
        }

        ctx.transition(DeliveryState::Completed);
        info!(asset = %ctx.asset, plaintext_bytes, ?budget, "decrypted asset delivered");
        Ok(Interception::Completed(DeliveryReport {
            filename,
            content_type,
            plaintext_bytes,
            budget,
        }))
    }
}

fn fail<R: ResponseSink>(
    ctx: &mut DeliveryContext,
    mut response: R,
    error: DeliveryError,
    bytes_sent: u64,
) -> DeliveryFailure<R> {
    for (name, value) in headers::error_headers() {
        response.set_header(name, value);
    }
    ctx.transition(DeliveryState::Failed);
    warn!(asset = %ctx.asset, error = %error, bytes_sent, "decrypting delivery failed");
    DeliveryFailure {
        response,
        error,
        bytes_sent,
    }
}

/// Counts bytes that reached the response body.
struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
