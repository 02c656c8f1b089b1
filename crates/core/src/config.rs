//! Archival configuration
//!
//! The process-level configuration loader is out of scope here; what this
//! module owns are the knobs whose *effects* the archival core must honor:
//! tar-queue parallelism, background-uploader worker cap, storage class,
//! server-side encryption, upload verification and the optional client-side
//! encryption key file.
//!
//! Environment keys:
//!
//! - `WALVAULT_UPLOAD_CONCURRENCY` - tar bundle queue parallelism
//! - `WALVAULT_BG_UPLOAD_WORKERS` - background segment uploader worker cap
//! - `WALVAULT_STORAGE_CLASS` - storage class override
//! - `WALVAULT_SSE` - server-side encryption mode (`managed` or
//!   `managed-kms`)
//! - `WALVAULT_SSE_KMS_ID` - key identifier, mandatory iff the mode is
//!   `managed-kms`
//! - `WALVAULT_UPLOAD_VERIFY` - force post-upload checksum verification
//! - `WALVAULT_ENCRYPTION_KEY_FILE` - arms client-side encryption

use std::env;
use std::path::PathBuf;
use thiserror::Error;

/// Server-side encryption mode requiring a key identifier.
pub const SSE_MANAGED_KMS: &str = "managed-kms";

/// Server-side encryption mode using storage-managed keys.
pub const SSE_MANAGED: &str = "managed";

/// Configuration for one archiving session.
///
/// Defaults mirror the values the uploader was tuned for: ten parallel tar
/// streams and a disabled background uploader.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Number of tar parts kept open concurrently by the bundle queue.
    pub upload_concurrency: usize,
    /// Maximum parallel workers for the background segment uploader;
    /// zero disables the daemon.
    pub background_workers: u32,
    /// Storage class override for uploaded objects.
    pub storage_class: Option<String>,
    /// Server-side encryption mode ([`SSE_MANAGED`] or [`SSE_MANAGED_KMS`]).
    pub sse_mode: Option<String>,
    /// Key identifier for the managed-key encryption mode.
    pub sse_key_id: Option<String>,
    /// Verify every WAL upload against the storage-reported checksum.
    pub verify_uploads: bool,
    /// Key file arming client-side encryption; `None` leaves it disarmed.
    pub encryption_key_file: Option<PathBuf>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            upload_concurrency: 10,
            background_workers: 0,
            storage_class: None,
            sse_mode: None,
            sse_key_id: None,
            verify_uploads: false,
            encryption_key_file: None,
        }
    }
}

impl ArchiveConfig {
    /// Read configuration from the environment, falling back to defaults
    /// for unset keys.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = ArchiveConfig::default();

        if let Some(value) = read_env("WALVAULT_UPLOAD_CONCURRENCY") {
            config.upload_concurrency = parse_env("WALVAULT_UPLOAD_CONCURRENCY", &value)?;
        }
        if let Some(value) = read_env("WALVAULT_BG_UPLOAD_WORKERS") {
            config.background_workers = parse_env("WALVAULT_BG_UPLOAD_WORKERS", &value)?;
        }
        config.storage_class = read_env("WALVAULT_STORAGE_CLASS");
        config.sse_mode = read_env("WALVAULT_SSE");
        config.sse_key_id = read_env("WALVAULT_SSE_KMS_ID");
        if let Some(value) = read_env("WALVAULT_UPLOAD_VERIFY") {
            config.verify_uploads = parse_env("WALVAULT_UPLOAD_VERIFY", &value)?;
        }
        config.encryption_key_file = read_env("WALVAULT_ENCRYPTION_KEY_FILE").map(PathBuf::from);

        config.validate()?;
        Ok(config)
    }

    /// Set the tar queue parallelism.
    pub fn with_upload_concurrency(mut self, concurrency: usize) -> Self {
        self.upload_concurrency = concurrency;
        self
    }

    /// Set the background uploader worker cap.
    pub fn with_background_workers(mut self, workers: u32) -> Self {
        self.background_workers = workers;
        self
    }

    /// Validate cross-field constraints.
    ///
    /// The managed-key encryption mode and its key identifier must be
    /// configured together; either one alone is a fatal misconfiguration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upload_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "WALVAULT_UPLOAD_CONCURRENCY",
                value: "0".to_string(),
            });
        }

        if let Some(mode) = &self.sse_mode {
            if mode != SSE_MANAGED && mode != SSE_MANAGED_KMS {
                return Err(ConfigError::InvalidValue {
                    key: "WALVAULT_SSE",
                    value: mode.clone(),
                });
            }
        }

        let wants_kms = self.sse_mode.as_deref() == Some(SSE_MANAGED_KMS);
        let has_key = self.sse_key_id.as_deref().is_some_and(|id| !id.is_empty());
        if wants_kms != has_key {
            return Err(ConfigError::SseKeyMismatch);
        }

        Ok(())
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A key was set to a value that does not parse or is out of range.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue {
        /// Environment key that failed to parse.
        key: &'static str,
        /// The offending value.
        value: String,
    },

    /// The managed-key encryption mode and its key identifier were not
    /// configured together.
    #[error("WALVAULT_SSE_KMS_ID must be set iff WALVAULT_SSE is \"{SSE_MANAGED_KMS}\"")]
    SseKeyMismatch,
}
