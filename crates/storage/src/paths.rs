//! Remote object naming convention
//!
//! Objects live under a bucket-plus-server prefix:
//!
//! ```text
//! <server>/wal_005/<segment>.lz4
//! <server>/basebackups_005/<backup>/tar_partitions/<part>
//! <server>/basebackups_005/<backup>_backup_stop_sentinel.json
//! ```
//!
//! The `_005` folder names are versioned layout markers shared with the
//! restore path; changing them orphans existing archives.

use crate::StorageError;

/// Folder for archived WAL segments.
pub const WAL_FOLDER: &str = "wal_005";

/// Folder for base backups.
pub const BASE_BACKUP_FOLDER: &str = "basebackups_005";

/// Subfolder of a backup holding its tar parts.
pub const TAR_PARTITION_FOLDER: &str = "tar_partitions";

/// Suffix appended to compressed WAL segment objects.
pub const COMPRESSED_SEGMENT_SUFFIX: &str = ".lz4";

/// Suffix of the sentinel document written after a backup completes.
pub const SENTINEL_SUFFIX: &str = "_backup_stop_sentinel.json";

/// Bucket and in-bucket prefix all archive objects are written under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePrefix {
    bucket: String,
    server: String,
}

impl StoragePrefix {
    /// Build a prefix from a bucket and an in-bucket path. Trailing and
    /// leading slashes on `server` are trimmed; the rest of the code
    /// concatenates it with `/`.
    pub fn new(bucket: impl Into<String>, server: impl Into<String>) -> Self {
        let server = server.into();
        StoragePrefix {
            bucket: bucket.into(),
            server: server.trim_matches('/').to_string(),
        }
    }

    /// Parse a `scheme://bucket/server` style prefix URL.
    pub fn parse(url: &str) -> Result<Self, StorageError> {
        let rest = url
            .split_once("://")
            .map(|(_, rest)| rest)
            .filter(|rest| !rest.is_empty())
            .ok_or_else(|| StorageError::InvalidPrefix(url.to_string()))?;
        let (bucket, server) = match rest.split_once('/') {
            Some((bucket, server)) => (bucket, server),
            None => (rest, ""),
        };
        if bucket.is_empty() {
            return Err(StorageError::InvalidPrefix(url.to_string()));
        }
        Ok(StoragePrefix::new(bucket, server))
    }

    /// The bucket objects are written to.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// The in-bucket prefix, without surrounding slashes.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Remote path for an archived WAL segment file.
    pub fn wal_path(&self, segment_file: &str) -> String {
        self.join(&format!(
            "{WAL_FOLDER}/{segment_file}{COMPRESSED_SEGMENT_SUFFIX}"
        ))
    }

    /// Remote path for one tar part of a base backup.
    pub fn tar_partition_path(&self, backup_name: &str, part_name: &str) -> String {
        self.join(&format!(
            "{BASE_BACKUP_FOLDER}/{backup_name}/{TAR_PARTITION_FOLDER}/{part_name}"
        ))
    }

    /// Remote path for a backup's sentinel document.
    pub fn sentinel_path(&self, backup_name: &str) -> String {
        self.join(&format!("{BASE_BACKUP_FOLDER}/{backup_name}{SENTINEL_SUFFIX}"))
    }

    fn join(&self, tail: &str) -> String {
        if self.server.is_empty() {
            tail.to_string()
        } else {
            format!("{}/{}", self.server, tail)
        }
    }
}
