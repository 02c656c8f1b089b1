//! Upload submission and the outstanding-work join primitive
//!
//! [`Uploader`] is the single funnel every archival code path submits
//! streams through. It invokes the client's retry budget, classifies the
//! outcome (non-fatal retries are logged distinctly from final failures),
//! and tracks outstanding asynchronous submissions so that
//! [`Uploader::await_all`] can guarantee nothing declares a backup done
//! while bytes are still in flight.

use crate::{RemoteStorage, StorageError, StoredObject, UploadSettings};
use parking_lot::{Condvar, Mutex};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// Counter-and-condvar join primitive for outstanding work.
///
/// Completion is signalled by dropping the [`WaitGuard`], so bookkeeping
/// stays correct even if a worker panics.
#[derive(Clone, Default)]
pub struct WaitGroup {
    inner: Arc<WaitGroupInner>,
}

#[derive(Default)]
struct WaitGroupInner {
    count: Mutex<usize>,
    done: Condvar,
}

impl WaitGroup {
    /// New, empty group.
    pub fn new() -> Self {
        WaitGroup::default()
    }

    /// Register one unit of outstanding work. Register *before* handing
    /// the guard to another thread, or a concurrent `wait` can miss it.
    pub fn register(&self) -> WaitGuard {
        *self.inner.count.lock() += 1;
        WaitGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Block until every registered unit of work has completed.
    pub fn wait(&self) {
        let mut count = self.inner.count.lock();
        while *count > 0 {
            self.inner.done.wait(&mut count);
        }
    }

    /// Units of work currently outstanding.
    pub fn outstanding(&self) -> usize {
        *self.inner.count.lock()
    }
}

/// Completion token for one unit of registered work.
pub struct WaitGuard {
    inner: Arc<WaitGroupInner>,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        let mut count = self.inner.count.lock();
        *count -= 1;
        if *count == 0 {
            self.inner.done.notify_all();
        }
    }
}

/// Retry-aware stream submission with join semantics.
pub struct Uploader {
    storage: Arc<dyn RemoteStorage>,
    settings: UploadSettings,
    wait: WaitGroup,
    last_succeeded: AtomicBool,
    first_error: Mutex<Option<StorageError>>,
}

impl Uploader {
    /// New uploader over `storage` with the given per-call settings.
    pub fn new(storage: Arc<dyn RemoteStorage>, settings: UploadSettings) -> Arc<Self> {
        Arc::new(Uploader {
            storage,
            settings,
            wait: WaitGroup::new(),
            last_succeeded: AtomicBool::new(false),
            first_error: Mutex::new(None),
        })
    }

    /// Submit `body` to `path`, blocking until the client accepts or
    /// definitively rejects it.
    ///
    /// Transient failures are retried inside the client up to the settings'
    /// budget; retries that ultimately succeeded are logged at warn level,
    /// exhausted budgets come back as the final error.
    pub fn submit(&self, body: &mut dyn Read, path: &str) -> Result<StoredObject, StorageError> {
        match self.storage.put_object(path, body, &self.settings) {
            Ok(stored) => {
                if stored.attempts > 1 {
                    warn!(
                        path,
                        attempts = stored.attempts,
                        "upload needed retries before succeeding"
                    );
                } else {
                    debug!(path, "upload complete");
                }
                self.last_succeeded.store(true, Ordering::Release);
                Ok(stored)
            }
            Err(err) => {
                error!(path, %err, "upload failed after exhausting retries");
                self.last_succeeded.store(false, Ordering::Release);
                let mut first = self.first_error.lock();
                if first.is_none() {
                    *first = Some(err.clone());
                }
                Err(err)
            }
        }
    }

    /// Submit on a dedicated thread, registered with the join primitive.
    ///
    /// The failure, if any, is recorded in the first-error slot; callers
    /// collect it after [`Uploader::await_all`].
    pub fn spawn_submit<R>(self: &Arc<Self>, mut body: R, path: String) -> JoinHandle<()>
    where
        R: Read + Send + 'static,
    {
        let uploader = Arc::clone(self);
        let guard = self.wait.register();
        thread::Builder::new()
            .name("walvault-upload".to_string())
            .spawn(move || {
                let _guard = guard;
                let _ = uploader.submit(&mut body, &path);
            })
            .expect("failed to spawn upload thread")
    }

    /// Checksum of a stored object, as reported by storage.
    pub fn remote_checksum(&self, path: &str) -> Result<Option<String>, StorageError> {
        self.storage.object_checksum(path)
    }

    /// Block until every upload registered via [`Uploader::spawn_submit`]
    /// (or [`Uploader::register`]) has completed, successfully or not.
    pub fn await_all(&self) {
        self.wait.wait();
    }

    /// Register external work against this uploader's join primitive.
    pub fn register(&self) -> WaitGuard {
        self.wait.register()
    }

    /// Whether the most recent submission on this instance succeeded.
    /// Diagnostic only; concurrent submissions race on it by design.
    pub fn last_succeeded(&self) -> bool {
        self.last_succeeded.load(Ordering::Acquire)
    }

    /// Take the first recorded submission failure, clearing the slot.
    pub fn take_first_error(&self) -> Option<StorageError> {
        self.first_error.lock().take()
    }

    /// The per-call settings this uploader passes to the client.
    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }
}
