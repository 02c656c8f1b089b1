//! Prefetch cache layout
//!
//! The restore path prefetches upcoming WAL segments into a hidden cache
//! directory inside the WAL directory:
//!
//! ```text
//! <wal_dir>/.wal-g/prefetch/            fully fetched segments
//! <wal_dir>/.wal-g/prefetch/running/    fetches in flight
//! ```
//!
//! Path composition lives here, next to [`SegmentName`], because both sides
//! of the archive share it. These functions perform no I/O.

use crate::segment::SegmentName;
use std::path::{Path, PathBuf};

/// Name of the hidden cache directory inside the WAL directory. Part of the
/// on-disk contract with the restore-side prefetch reader.
const CACHE_DIR: &str = ".wal-g";

/// Subdirectory of the cache holding prefetched segments.
const PREFETCH_DIR: &str = "prefetch";

/// Subdirectory of the prefetch directory holding in-flight fetches.
const RUNNING_DIR: &str = "running";

/// Filesystem locations used by the prefetch reader for one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchPaths {
    /// Directory holding fully prefetched segments.
    pub prefetch_dir: PathBuf,
    /// Directory holding fetches currently in flight.
    pub running_dir: PathBuf,
    /// Marker for this segment while its fetch is in flight.
    pub running_file: PathBuf,
    /// Location of this segment once fully fetched.
    pub fetched_file: PathBuf,
}

/// Compute the prefetch locations for `name` under `wal_dir`.
pub fn prefetch_paths(wal_dir: impl AsRef<Path>, name: &SegmentName) -> PrefetchPaths {
    let prefetch_dir = wal_dir.as_ref().join(CACHE_DIR).join(PREFETCH_DIR);
    let running_dir = prefetch_dir.join(RUNNING_DIR);
    let file_name = name.to_string();
    PrefetchPaths {
        running_file: running_dir.join(&file_name),
        fetched_file: prefetch_dir.join(&file_name),
        prefetch_dir,
        running_dir,
    }
}
