//! Remote storage interface and upload coordination
//!
//! The concrete object-storage client (authentication, region discovery,
//! multipart mechanics, backoff) is an external collaborator. This crate
//! defines the seam it plugs into and the pieces the archival pipeline
//! builds on top of it:
//!
//! - [`RemoteStorage`]: the client trait - one streaming put, one checksum
//!   head request; multipart splitting and the retry budget live behind it
//! - [`UploadSettings`]: the configuration the client consumes per call
//! - [`Uploader`]: retry-aware submission with a join primitive so callers
//!   can wait for every outstanding upload before declaring work done
//! - [`MemoryStorage`]: in-memory backend for tests
//! - [`StoragePrefix`]: the remote object naming convention

#![warn(missing_docs)]
#![warn(clippy::all)]

mod memory;
mod paths;
mod uploader;

pub use memory::MemoryStorage;
pub use paths::{
    StoragePrefix, BASE_BACKUP_FOLDER, COMPRESSED_SEGMENT_SUFFIX, SENTINEL_SUFFIX,
    TAR_PARTITION_FOLDER, WAL_FOLDER,
};
pub use uploader::{Uploader, WaitGroup, WaitGuard};

use std::io::Read;
use thiserror::Error;
use walvault_core::config::{ArchiveConfig, ConfigError, SSE_MANAGED, SSE_MANAGED_KMS};
use xxhash_rust::xxh3::xxh3_64;

/// Server-side encryption requested for uploaded objects.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SseMode {
    /// No server-side encryption.
    #[default]
    None,
    /// Storage-managed keys.
    Managed,
    /// Customer-managed key, identified by `key_id`.
    ManagedKey {
        /// Identifier of the managed key.
        key_id: String,
    },
}

/// Per-call configuration consumed by the storage client.
///
/// The retry budget and multipart parameters are configuration, not logic:
/// the client owns backoff and part handling, callers just set the budget.
#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// Storage class for uploaded objects.
    pub storage_class: String,
    /// Server-side encryption mode.
    pub sse: SseMode,
    /// Transient-failure retry budget inside the client.
    pub max_retries: u32,
    /// Multipart part size in bytes.
    pub part_size: usize,
    /// Parallel part uploads within one object.
    pub part_concurrency: usize,
}

impl Default for UploadSettings {
    fn default() -> Self {
        UploadSettings {
            storage_class: "STANDARD".to_string(),
            sse: SseMode::None,
            max_retries: 7,
            part_size: 20 * 1024 * 1024,
            part_concurrency: 10,
        }
    }
}

impl UploadSettings {
    /// Derive settings from the archiving configuration.
    ///
    /// Assumes `config` has already passed [`ArchiveConfig::validate`];
    /// the mode/key pairing is still checked here so a hand-built config
    /// cannot smuggle a keyless managed-key mode through.
    pub fn from_config(config: &ArchiveConfig) -> Result<Self, ConfigError> {
        let mut settings = UploadSettings::default();
        if let Some(class) = &config.storage_class {
            settings.storage_class = class.clone();
        }
        settings.sse = match config.sse_mode.as_deref() {
            None => SseMode::None,
            Some(SSE_MANAGED) => SseMode::Managed,
            Some(SSE_MANAGED_KMS) => match &config.sse_key_id {
                Some(key_id) if !key_id.is_empty() => SseMode::ManagedKey {
                    key_id: key_id.clone(),
                },
                _ => return Err(ConfigError::SseKeyMismatch),
            },
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "WALVAULT_SSE",
                    value: other.to_string(),
                })
            }
        };
        Ok(settings)
    }
}

/// Outcome of one successful stream submission.
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Remote path the object was written to.
    pub path: String,
    /// Checksum reported by storage for the stored bytes (xxh3, hex).
    pub checksum: Option<String>,
    /// Attempts the client needed, including the successful one. More than
    /// one means transient failures were retried within the budget.
    pub attempts: u32,
}

/// Transport-level storage failures.
///
/// Retried inside the client up to the configured budget, then surfaced.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// Network or service failure while transferring an object.
    #[error("transport failure for {path}: {detail}")]
    Transport {
        /// Remote path of the failed transfer.
        path: String,
        /// Client-reported failure description.
        detail: String,
    },

    /// The requested object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// A storage prefix URL could not be parsed.
    #[error("invalid storage prefix: {0}")]
    InvalidPrefix(String),
}

/// The object-storage client seam.
///
/// Implementations must be safe to call concurrently; every archival worker
/// shares one client.
pub trait RemoteStorage: Send + Sync {
    /// Stream `body` to `path`. The client consumes the reader to end of
    /// stream, splitting into parts and retrying transient failures
    /// according to `settings`.
    fn put_object(
        &self,
        path: &str,
        body: &mut dyn Read,
        settings: &UploadSettings,
    ) -> Result<StoredObject, StorageError>;

    /// Checksum of a stored object (head request), if storage reports one.
    fn object_checksum(&self, path: &str) -> Result<Option<String>, StorageError>;
}

/// Hex form of the xxh3 checksum used across the archive.
pub fn xxh3_hex(data: &[u8]) -> String {
    checksum_hex(xxh3_64(data))
}

/// Render an xxh3 digest the way the archive stores it.
pub fn checksum_hex(digest: u64) -> String {
    format!("{:016x}", digest)
}
