//! Concurrent archival pipeline
//!
//! This crate turns bytes that have already been chosen for archival into
//! verified remote objects with bounded resource use:
//!
//! - [`pipe`]: the in-process byte pipe providing flow control between
//!   producers and the uploader
//! - [`stream`]: the compress → encrypt → upload → verify chain for WAL
//!   segments and tar parts
//! - [`bundle`]: the bounded tar-part queue a base backup streams through
//! - [`watcher`]: the background daemon that discovers sealed WAL segments
//!   and ships them with bounded concurrency
//!
//! Three pools of work run concurrently - tar producers, per-rotation
//! upload threads, background workers - and share only the uploader's
//! transport and join bookkeeping.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bundle;
pub mod error;
pub mod pipe;
pub mod stream;
pub mod watcher;

pub use bundle::{BackupSentinel, Bundle, BundleContext, TarPart, MIN_QUEUE_CONCURRENCY};
pub use error::{ArchiveError, ArchiveResult};
pub use stream::{upload_segment_file, ChecksumReader, CompressedSink};
pub use watcher::{BackgroundUploader, DONE_SUFFIX, READY_SUFFIX, STATUS_DIR};

use std::sync::Arc;
use walvault_core::ArchiveConfig;
use walvault_crypto::{AeadCrypter, Crypter, NoopCrypter};

/// Build the crypter the configuration asks for: armed when a key file is
/// configured, pass-through otherwise.
pub fn crypter_from_config(config: &ArchiveConfig) -> Arc<dyn Crypter> {
    match &config.encryption_key_file {
        Some(path) => Arc::new(AeadCrypter::from_key_file(path)),
        None => Arc::new(NoopCrypter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypter_from_config_disarmed_by_default() {
        let crypter = crypter_from_config(&ArchiveConfig::default());
        assert!(!crypter.is_armed());
    }

    #[test]
    fn test_crypter_from_config_armed_with_key_file() {
        let mut config = ArchiveConfig::default();
        config.encryption_key_file = Some("/etc/walvault/archive.key".into());
        let crypter = crypter_from_config(&config);
        assert!(crypter.is_armed());
    }
}
