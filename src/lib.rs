//! Walvault - streaming WAL and base-backup archiver for object storage
//!
//! Walvault packages a running database's write-ahead log segments and
//! periodic base backups, protects them (lz4 compression, optional
//! AES-256-GCM), and ships them to remote object storage with bounded
//! resource use and exactly-once-per-artifact semantics.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use walvault::{
//!     crypter_from_config, upload_segment_file, ArchiveConfig, StoragePrefix,
//!     UploadSettings, Uploader,
//! };
//!
//! let config = ArchiveConfig::from_env()?;
//! let crypter = crypter_from_config(&config);
//! let settings = UploadSettings::from_config(&config)?;
//! let uploader = Uploader::new(storage_client, settings);
//! let prefix = StoragePrefix::parse("s3://backups/cluster-a")?;
//!
//! // Archive one sealed WAL segment.
//! upload_segment_file(&uploader, &crypter, &prefix, segment_path, config.verify_uploads)?;
//! ```
//!
//! # Architecture
//!
//! Two entry points - the tar [`Bundle`] queue for base backups and the
//! [`BackgroundUploader`] daemon for WAL segments - both funnel into the
//! same streaming compress → encrypt → upload pipe and the shared
//! [`Uploader`] join bookkeeping. The concrete storage client stays behind
//! the [`RemoteStorage`] trait.

// Re-export the public API from the member crates
pub use walvault_archive::*;
pub use walvault_core::*;
pub use walvault_crypto::{AeadCrypter, Crypter, CryptoError, KeySource, NoopCrypter, StreamWriter};
pub use walvault_storage::*;
