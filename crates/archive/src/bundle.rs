//! Tar bundle queue
//!
//! A base backup packs a filesystem snapshot into size-capped tar parts.
//! Many producer threads add entries in parallel, but the number of open
//! tar streams - each one pinning a pipe buffer and an upload thread - is
//! bounded by a fixed pool of reusable [`TarPart`] handles:
//!
//! - `dequeue()` hands a producer exclusive ownership of one handle
//! - `enqueue_back()` returns it, either as-is or rotated: closed, shipped
//!   asynchronously, and replaced by a fresh part so the pool size never
//!   changes
//! - `finish()` drains the pool, ships what remains and joins every
//!   outstanding upload before reporting the first failure
//!
//! Ownership transfers through the queue, so the tar-writing path itself
//! needs no locking.

use crate::error::{ArchiveError, ArchiveResult};
use crate::pipe;
use crate::stream::CompressedSink;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::mem;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walvault_crypto::Crypter;
use walvault_storage::{StoragePrefix, Uploader};

/// Fewest tar parts the queue will operate with. Liveness needs one slot
/// being written, one being uploaded and one ready to be created; a smaller
/// pool can wedge producers against the rotation path.
pub const MIN_QUEUE_CONCURRENCY: usize = 3;

/// One in-flight tar stream.
///
/// Owned exclusively by whichever producer currently holds it; the queue is
/// the only hand-off point. The underlying writer chain
/// (`tar → lz4 → crypter → pipe`) and its streaming upload thread are
/// created lazily on the first entry, so a part that never receives bytes
/// never ships an empty object.
pub struct TarPart {
    number: u32,
    size: u64,
    state: PartState,
}

enum PartState {
    Idle,
    Open(tar::Builder<CompressedSink>),
    Closed,
}

impl TarPart {
    fn new(number: u32) -> Self {
        TarPart {
            number,
            size: 0,
            state: PartState::Idle,
        }
    }

    /// Monotonic sequence number within the bundle, starting at 1.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Accumulated uncompressed payload bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the part's tar stream has been started and not yet closed.
    pub fn is_open(&self) -> bool {
        matches!(self.state, PartState::Open(_))
    }

    /// Object name of this part within the backup.
    pub fn name(&self) -> String {
        format!("part_{:03}.tar.lz4", self.number)
    }

    /// Add a named entry with the given bytes.
    pub fn append_data(
        &mut self,
        bundle: &BundleContext,
        name: &str,
        data: &[u8],
    ) -> ArchiveResult<()> {
        let tar = self.writer(bundle)?;
        let mut header = tar::Header::new_gnu();
        header
            .set_path(name)
            .map_err(|err| ArchiveError::archive(format!("set path '{}': {}", name, err)))?;
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        tar.append(&header, data)
            .map_err(|err| ArchiveError::archive(format!("append '{}': {}", name, err)))?;
        self.size += data.len() as u64;
        Ok(())
    }

    /// Add a file from disk under `archived_name`.
    pub fn append_file(
        &mut self,
        bundle: &BundleContext,
        path: &Path,
        archived_name: &str,
    ) -> ArchiveResult<()> {
        let len = std::fs::metadata(path)?.len();
        let tar = self.writer(bundle)?;
        tar.append_path_with_name(path, archived_name)
            .map_err(|err| {
                ArchiveError::archive(format!("append '{}': {}", path.display(), err))
            })?;
        self.size += len;
        Ok(())
    }

    fn writer(
        &mut self,
        bundle: &BundleContext,
    ) -> ArchiveResult<&mut tar::Builder<CompressedSink>> {
        if matches!(self.state, PartState::Idle) {
            let remote = bundle
                .prefix
                .tar_partition_path(&bundle.backup_name, &self.name());
            let (writer, reader) = pipe::pipe();
            let sink = CompressedSink::new(bundle.crypter.as_ref(), writer)?;
            info!(part = self.number, path = %remote, "starting tar part");
            bundle.uploader.spawn_submit(reader, remote);
            self.state = PartState::Open(tar::Builder::new(sink));
        }
        match &mut self.state {
            PartState::Open(tar) => Ok(tar),
            PartState::Closed => Err(ArchiveError::archive(format!(
                "part {} is already closed",
                self.number
            ))),
            PartState::Idle => unreachable!("part opened above"),
        }
    }

    /// Close the tar stream, cascading the close down to the pipe so the
    /// upload thread observes end-of-stream. Closing an idle part is a
    /// no-op: it never started an upload.
    pub fn close(&mut self) -> ArchiveResult<()> {
        match mem::replace(&mut self.state, PartState::Closed) {
            PartState::Idle | PartState::Closed => Ok(()),
            PartState::Open(tar) => {
                let sink = tar
                    .into_inner()
                    .map_err(|err| ArchiveError::archive(format!("tar finish: {}", err)))?;
                sink.finish()?;
                debug!(part = self.number, size = self.size, "closed tar part");
                Ok(())
            }
        }
    }
}

/// Metadata document describing a completed backup; written last, after
/// every tar part upload has been acknowledged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSentinel {
    /// LSN at which the backup finished.
    pub finish_lsn: Option<u64>,
    /// Total uncompressed payload bytes across all parts.
    pub uncompressed_size: u64,
    /// Opaque user-supplied metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<serde_json::Value>,
}

/// Shared references a part needs to start its upload.
pub struct BundleContext {
    uploader: Arc<Uploader>,
    crypter: Arc<dyn Crypter>,
    prefix: StoragePrefix,
    backup_name: String,
}

/// One base-backup session: the bounded pool of tar parts plus everything
/// needed to ship them.
pub struct Bundle {
    context: BundleContext,
    size_threshold: u64,
    parts_created: AtomicU32,
    concurrency: usize,
    slots: Mutex<VecDeque<TarPart>>,
    available: Condvar,
}

impl Bundle {
    /// New bundle for `backup_name`; parts rotate once their accumulated
    /// payload crosses `size_threshold` bytes.
    pub fn new(
        uploader: Arc<Uploader>,
        crypter: Arc<dyn Crypter>,
        prefix: StoragePrefix,
        backup_name: impl Into<String>,
        size_threshold: u64,
    ) -> Self {
        Bundle {
            context: BundleContext {
                uploader,
                crypter,
                prefix,
                backup_name: backup_name.into(),
            },
            size_threshold,
            parts_created: AtomicU32::new(0),
            concurrency: 0,
            slots: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    /// Pre-populate the queue with `concurrency` fresh parts, clamped to
    /// [`MIN_QUEUE_CONCURRENCY`].
    pub fn start_queue(&mut self, concurrency: usize) {
        let concurrency = if concurrency < MIN_QUEUE_CONCURRENCY {
            warn!(
                requested = concurrency,
                minimum = MIN_QUEUE_CONCURRENCY,
                "tar queue concurrency below the liveness minimum, clamping"
            );
            MIN_QUEUE_CONCURRENCY
        } else {
            concurrency
        };
        self.concurrency = concurrency;
        let mut slots = self.slots.lock();
        for _ in 0..concurrency {
            slots.push_back(self.new_part());
        }
    }

    /// Take exclusive ownership of a part, blocking until one is available.
    pub fn dequeue(&self) -> TarPart {
        let mut slots = self.slots.lock();
        loop {
            if let Some(part) = slots.pop_front() {
                return part;
            }
            self.available.wait(&mut slots);
        }
    }

    /// Return a part to the queue. With `rotate` set the part is closed,
    /// its upload left to complete in the background, and a fresh part
    /// takes its slot; otherwise the same part is reinserted for further
    /// filling.
    pub fn enqueue_back(&self, part: TarPart, rotate: bool) -> ArchiveResult<()> {
        if rotate {
            self.rotate(part)
        } else {
            self.reinsert(part);
            Ok(())
        }
    }

    /// Apply the size-threshold rotation policy: rotate the part if its
    /// accumulated payload crossed the bundle's threshold, reinsert it
    /// otherwise.
    pub fn check_size_and_enqueue(&self, part: TarPart) -> ArchiveResult<()> {
        if part.size() >= self.size_threshold {
            self.rotate(part)
        } else {
            self.reinsert(part);
            Ok(())
        }
    }

    fn rotate(&self, mut part: TarPart) -> ArchiveResult<()> {
        if !part.is_open() {
            // Nothing was written; reuse the handle instead of shipping an
            // empty tar.
            debug!(part = part.number(), "rotation requested on empty part");
            self.reinsert(part);
            return Ok(());
        }
        let result = part.close();
        // The replacement goes in even if the close failed: the pool must
        // keep its size or producers wedge on dequeue.
        self.reinsert(self.new_part());
        result
    }

    fn reinsert(&self, part: TarPart) {
        self.slots.lock().push_back(part);
        self.available.notify_one();
    }

    fn new_part(&self) -> TarPart {
        TarPart::new(self.parts_created.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Close and ship every remaining part, then join all outstanding
    /// uploads. Returns the first error encountered; no upload is abandoned
    /// because an earlier one failed.
    ///
    /// All producers must have returned their parts before this is called.
    pub fn finish(&mut self) -> ArchiveResult<()> {
        let mut first_error: Option<ArchiveError> = None;
        for _ in 0..self.concurrency {
            let mut part = self.dequeue();
            if let Err(err) = part.close() {
                warn!(part = part.number(), %err, "failed to close tar part");
                first_error.get_or_insert(err);
            }
        }
        self.context.uploader.await_all();

        if let Some(err) = first_error {
            return Err(err);
        }
        if let Some(err) = self.context.uploader.take_first_error() {
            return Err(err.into());
        }
        info!(
            backup = %self.context.backup_name,
            parts = self.parts_created.load(Ordering::Relaxed),
            "bundle queue drained"
        );
        Ok(())
    }

    /// Drain the queue, then write the backup sentinel. The sentinel only
    /// goes out after every part upload has been acknowledged, so its
    /// presence marks a complete backup. Returns the sentinel's remote
    /// path.
    pub fn finish_with_sentinel(&mut self, sentinel: &BackupSentinel) -> ArchiveResult<String> {
        self.finish()?;
        let body = serde_json::to_vec_pretty(sentinel)
            .map_err(|err| ArchiveError::archive(format!("sentinel serialization: {}", err)))?;
        let path = self
            .context
            .prefix
            .sentinel_path(&self.context.backup_name);
        self.context.uploader.submit(&mut &body[..], &path)?;
        info!(path = %path, "wrote backup sentinel");
        Ok(path)
    }

    /// Shared references parts need when they open lazily.
    pub fn context(&self) -> &BundleContext {
        &self.context
    }

    /// Parts created so far (pool plus every rotation replacement).
    pub fn parts_created(&self) -> u32 {
        self.parts_created.load(Ordering::Relaxed)
    }

    /// The rotation threshold in uncompressed payload bytes.
    pub fn size_threshold(&self) -> u64 {
        self.size_threshold
    }

    /// The pool size fixed by [`Bundle::start_queue`].
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}
