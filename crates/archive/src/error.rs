//! Archival pipeline errors

use std::io;
use thiserror::Error;
use walvault_crypto::CryptoError;
use walvault_storage::StorageError;

/// Result type alias for archival operations.
pub type ArchiveResult<T> = std::result::Result<T, ArchiveError>;

/// Errors raised while packaging, protecting and shipping archive bytes.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The compression stage (or a transform inside it) failed.
    #[error("compression failure: {0}")]
    Compression(String),

    /// Encryption configuration or cipher failure.
    #[error("encryption failure: {0}")]
    Crypto(#[from] CryptoError),

    /// Transport failure surfaced after the client exhausted its retries.
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    /// Post-upload checksum verification failed. Fatal: a silent
    /// corruption must halt the archiving session rather than mask it.
    #[error("integrity check failed for {path}: local {local}, remote {remote}")]
    Integrity {
        /// Remote path of the object that failed verification.
        path: String,
        /// Checksum computed over the bytes that were sent.
        local: String,
        /// Checksum storage reports for the stored object.
        remote: String,
    },

    /// Tar stream construction failure.
    #[error("archive failure: {0}")]
    Archive(String),

    /// I/O error from the filesystem or a stream stage.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ArchiveError {
    /// Compression-stage error with context.
    pub fn compression(detail: impl Into<String>) -> Self {
        ArchiveError::Compression(detail.into())
    }

    /// Tar-stage error with context.
    pub fn archive(detail: impl Into<String>) -> Self {
        ArchiveError::Archive(detail.into())
    }
}
