//! End-to-end tests for the background segment uploader.

use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use walvault_archive::{BackgroundUploader, DONE_SUFFIX, READY_SUFFIX, STATUS_DIR};
use walvault_core::SegmentName;
use walvault_crypto::{AeadCrypter, Crypter, NoopCrypter};
use walvault_storage::{MemoryStorage, RemoteStorage, StoragePrefix, UploadSettings, Uploader};

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Lay out a WAL directory: `count` sealed segments following `first`,
/// each with a ready marker, plus the trigger segment itself.
fn seed_wal_dir(dir: &Path, first: &str, count: usize) -> Vec<String> {
    fs::create_dir_all(dir.join(STATUS_DIR)).unwrap();
    let mut segments = vec![first.to_string()];
    let mut name: SegmentName = first.parse().unwrap();
    for _ in 0..count {
        name = name.next().unwrap();
        segments.push(name.to_string());
    }
    for segment in &segments {
        // Real segments are fixed-size; a few KiB is enough to stream.
        fs::write(dir.join(segment), segment.as_bytes().repeat(200)).unwrap();
        fs::write(
            dir.join(STATUS_DIR).join(format!("{segment}{READY_SUFFIX}")),
            b"",
        )
        .unwrap();
    }
    segments
}

fn start_daemon(
    dir: &Path,
    trigger: &str,
    max_workers: u32,
    storage: &Arc<MemoryStorage>,
    crypter: Arc<dyn Crypter>,
    verify: bool,
) -> BackgroundUploader {
    let uploader = Uploader::new(
        Arc::clone(storage) as Arc<dyn RemoteStorage>,
        UploadSettings::default(),
    );
    BackgroundUploader::start(
        &dir.join(trigger),
        max_workers,
        uploader,
        crypter,
        StoragePrefix::new("bucket", "server"),
        verify,
    )
}

#[test]
fn test_more_segments_than_workers_all_uploaded_once() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let dir = tempfile::tempdir().unwrap();
    let trigger = "000000010000000000000040";
    let segments = seed_wal_dir(dir.path(), trigger, 20);

    let storage = Arc::new(MemoryStorage::new());
    let mut daemon = start_daemon(dir.path(), trigger, 3, &storage, Arc::new(NoopCrypter), false);

    assert!(wait_until(Duration::from_secs(20), || daemon.uploaded() == 20));
    daemon.stop();
    assert_eq!(daemon.running_workers(), 0);

    // Exactly one object per non-trigger segment, and every marker flipped
    // to done.
    assert_eq!(storage.object_count(), 20);
    let status = dir.path().join(STATUS_DIR);
    for segment in &segments[1..] {
        assert!(storage
            .object(&format!("server/wal_005/{segment}.lz4"))
            .is_some());
        assert!(status.join(format!("{segment}{DONE_SUFFIX}")).exists());
        assert!(!status.join(format!("{segment}{READY_SUFFIX}")).exists());
    }
    // The trigger segment stays untouched.
    assert!(status
        .join(format!("{trigger}{READY_SUFFIX}"))
        .exists());
}

#[test]
fn test_uploaded_bytes_roundtrip_through_verification() {
    let dir = tempfile::tempdir().unwrap();
    let trigger = "000000010000000000000060";
    let segments = seed_wal_dir(dir.path(), trigger, 4);

    let storage = Arc::new(MemoryStorage::new());
    let crypter: Arc<dyn Crypter> = Arc::new(AeadCrypter::from_bytes([3u8; 32]));
    let mut daemon = start_daemon(
        dir.path(),
        trigger,
        2,
        &storage,
        Arc::clone(&crypter),
        true,
    );

    assert!(wait_until(Duration::from_secs(20), || daemon.uploaded() == 4));
    daemon.stop();

    for segment in &segments[1..] {
        let stored = storage
            .object(&format!("server/wal_005/{segment}.lz4"))
            .unwrap();
        let decrypted = crypter
            .decrypt(Box::new(std::io::Cursor::new(stored)))
            .unwrap();
        let mut decoder = lz4::Decoder::new(decrypted).unwrap();
        let mut payload = Vec::new();
        decoder.read_to_end(&mut payload).unwrap();
        assert_eq!(payload, segment.as_bytes().repeat(200));
    }
}

#[test]
fn test_stop_is_a_drain_not_an_abort() {
    let dir = tempfile::tempdir().unwrap();
    let trigger = "000000010000000000000070";
    seed_wal_dir(dir.path(), trigger, 10);

    let storage = Arc::new(MemoryStorage::new());
    let mut daemon = start_daemon(dir.path(), trigger, 2, &storage, Arc::new(NoopCrypter), false);

    // Stop races the first scans; whatever was claimed must have finished
    // completely by the time stop returns.
    thread::sleep(Duration::from_millis(30));
    daemon.stop();

    let status = dir.path().join(STATUS_DIR);
    let done_markers = fs::read_dir(&status)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(DONE_SUFFIX))
        .count();
    assert_eq!(storage.object_count(), done_markers);
}
