//! Configuration loading and validation for the asset server.
//!
//! All values are read from environment variables at startup. The process will
//! exit with a clear error message if any required variable is missing or invalid.

use std::num::NonZeroU64;
use std::path::PathBuf;

use anyhow::{Context, Result};
use atrest::delivery::{Disposition, ExecutionMode, FilenameSource};
use atrest::{DeliveryOptions, KeyResolver};
use serde::Deserialize;

/// Validated asset server configuration.
#[derive(Clone, Deserialize)]
pub struct Config {
    /// Default encryption secret, 64 hex characters. **Required.**
    pub encryption_secret: String,

    /// Directory assets are stored in. **Required.**
    pub storage_root: String,

    /// Port the HTTP server listens on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// `attachment` or `inline`.
    #[serde(default = "default_content_disposition")]
    pub content_disposition: String,

    /// Minimum client bandwidth in bytes/s used for the transfer budget; 0 disables it.
    #[serde(default)]
    pub min_download_bandwidth: u64,

    /// `original` (suffix stripped) or `stored` (on-disk name).
    #[serde(default = "default_download_filename")]
    pub download_filename: String,

    /// Skip decryption on download so test fixtures stay byte-identical.
    #[serde(default)]
    pub test_mode: bool,

    /// OTLP endpoint; span export is disabled when unset.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("encryption_secret", &"[REDACTED]")
            .field("storage_root", &self.storage_root)
            .field("listen_port", &self.listen_port)
            .field("content_disposition", &self.content_disposition)
            .field("min_download_bandwidth", &self.min_download_bandwidth)
            .field("download_filename", &self.download_filename)
            .field("test_mode", &self.test_mode)
            .field("otel_exporter_otlp_endpoint", &self.otel_exporter_otlp_endpoint)
            .field("log_level", &self.log_level)
            .finish()
    }
}

fn default_listen_port() -> u16 {
    8080
}
fn default_content_disposition() -> String {
    "attachment".into()
}
fn default_download_filename() -> String {
    "original".into()
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    pub fn storage_root(&self) -> PathBuf {
        PathBuf::from(&self.storage_root)
    }

    /// Build the key resolver from the default secret.
    ///
    /// # Errors
    ///
    /// Returns an error if `ENCRYPTION_SECRET` is malformed.
    pub fn key_resolver(&self) -> Result<KeyResolver> {
        KeyResolver::new(&self.encryption_secret).context("ENCRYPTION_SECRET is invalid")
    }

    /// Delivery options for the download interceptor.
    ///
    /// # Errors
    ///
    /// Returns an error if `CONTENT_DISPOSITION` or `DOWNLOAD_FILENAME` is unknown.
    pub fn delivery_options(&self) -> Result<DeliveryOptions> {
        let disposition: Disposition = self
            .content_disposition
            .parse()
            .map_err(|e: String| anyhow::anyhow!("CONTENT_DISPOSITION: {e}"))?;
        let filename: FilenameSource = self
            .download_filename
            .parse()
            .map_err(|e: String| anyhow::anyhow!("DOWNLOAD_FILENAME: {e}"))?;
        Ok(DeliveryOptions {
            disposition,
            min_bandwidth: NonZeroU64::new(self.min_download_bandwidth),
            filename,
            mode: if self.test_mode {
                ExecutionMode::Test
            } else {
                ExecutionMode::Production
            },
        })
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.encryption_secret, "ENCRYPTION_SECRET")?;
        ensure_non_empty(&self.storage_root, "STORAGE_ROOT")?;
        self.key_resolver()?;
        self.delivery_options()?;

        if let Some(endpoint) = &self.otel_exporter_otlp_endpoint {
            ensure_non_empty(endpoint, "OTEL_EXPORTER_OTLP_ENDPOINT")?;
        }
        Ok(())
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}
