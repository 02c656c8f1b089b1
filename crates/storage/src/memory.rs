//! In-memory storage backend for tests
//!
//! Emulates the collaborating client closely enough to exercise the
//! pipeline: it drains the body stream, honors the retry budget against
//! injected failures, and reports an xxh3 checksum on head requests. A
//! checksum override lets integrity-failure paths be tested.

use crate::{xxh3_hex, RemoteStorage, StorageError, StoredObject, UploadSettings};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Read;

#[derive(Default)]
struct Inner {
    objects: HashMap<String, Vec<u8>>,
    fail_puts: u32,
    checksum_override: Option<String>,
}

/// In-memory [`RemoteStorage`] implementation.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    /// Fresh, empty storage.
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    /// Fail the next `count` put attempts with a transport error. Attempts,
    /// not calls: a single `put_object` with a sufficient retry budget
    /// absorbs the failures.
    pub fn fail_next_puts(&self, count: u32) {
        self.inner.lock().fail_puts = count;
    }

    /// Report this checksum from head requests instead of the real one.
    pub fn override_checksum(&self, checksum: impl Into<String>) {
        self.inner.lock().checksum_override = Some(checksum.into());
    }

    /// Bytes of a stored object.
    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.lock().objects.get(path).cloned()
    }

    /// Number of stored objects.
    pub fn object_count(&self) -> usize {
        self.inner.lock().objects.len()
    }

    /// Paths of all stored objects, sorted.
    pub fn object_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.inner.lock().objects.keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl RemoteStorage for MemoryStorage {
    fn put_object(
        &self,
        path: &str,
        body: &mut dyn Read,
        settings: &UploadSettings,
    ) -> Result<StoredObject, StorageError> {
        // A real client buffers parts and can replay them; here the whole
        // body is drained once up front so injected failures don't lose it.
        let mut bytes = Vec::new();
        body.read_to_end(&mut bytes)
            .map_err(|err| StorageError::Transport {
                path: path.to_string(),
                detail: err.to_string(),
            })?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut inner = self.inner.lock();
            if inner.fail_puts > 0 {
                inner.fail_puts -= 1;
                if attempts > settings.max_retries {
                    return Err(StorageError::Transport {
                        path: path.to_string(),
                        detail: "injected transport failure".to_string(),
                    });
                }
                continue;
            }
            let checksum = xxh3_hex(&bytes);
            inner.objects.insert(path.to_string(), bytes);
            return Ok(StoredObject {
                path: path.to_string(),
                checksum: Some(checksum),
                attempts,
            });
        }
    }

    fn object_checksum(&self, path: &str) -> Result<Option<String>, StorageError> {
        let inner = self.inner.lock();
        if let Some(checksum) = &inner.checksum_override {
            return Ok(Some(checksum.clone()));
        }
        match inner.objects.get(path) {
            Some(bytes) => Ok(Some(xxh3_hex(bytes))),
            None => Err(StorageError::NotFound(path.to_string())),
        }
    }
}
