//! Streaming compress → encrypt → upload → verify
//!
//! One submission streams a byte source into remote storage as
//! `encrypt(compress(source))` without ever holding the whole object:
//!
//! ```text
//! source ──> lz4 ──> crypter ──> pipe ──> uploader (HTTP body)
//!            producer thread         │
//!                                    └─> running checksum (verify)
//! ```
//!
//! The compression stage runs on its own thread writing into the pipe; the
//! caller's thread hands the read end to the uploader, so upload proceeds
//! concurrently with compression and the pipe's bounded buffer provides the
//! flow control between them.

use crate::error::{ArchiveError, ArchiveResult};
use crate::pipe::{self, PipeWriter};
use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};
use walvault_crypto::{Crypter, StreamWriter};
use walvault_storage::{checksum_hex, StoragePrefix, Uploader};
use xxhash_rust::xxh3::Xxh3;

/// The write half of the streaming chain: lz4 over the (possibly armed)
/// crypter over the pipe.
///
/// Must be closed with [`CompressedSink::finish`] for the stream to be
/// complete; dropping it without finishing still closes the pipe (the
/// consumer unblocks) but leaves the lz4 stream truncated, which the
/// decompressing side will reject.
pub struct CompressedSink {
    encoder: lz4::Encoder<Box<dyn StreamWriter>>,
}

impl CompressedSink {
    /// Build the chain over `sink`. If the crypter is armed its key is
    /// loaded here, so a missing key fails before any bytes move.
    pub fn new(crypter: &dyn Crypter, sink: PipeWriter) -> ArchiveResult<Self> {
        let protected = crypter.encrypt(Box::new(sink))?;
        let encoder = lz4::EncoderBuilder::new()
            .build(protected)
            .map_err(|err| ArchiveError::compression(format!("lz4 encoder: {}", err)))?;
        Ok(CompressedSink { encoder })
    }

    /// Finish the lz4 frame and cascade the close down the chain.
    pub fn finish(self) -> io::Result<()> {
        let (protected, result) = self.encoder.finish();
        result?;
        protected.finish()
    }
}

impl Write for CompressedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}

/// Reader adapter maintaining a running xxh3 over everything read.
pub struct ChecksumReader<R> {
    inner: R,
    hasher: Xxh3,
}

impl<R: Read> ChecksumReader<R> {
    /// Wrap `inner`.
    pub fn new(inner: R) -> Self {
        ChecksumReader {
            inner,
            hasher: Xxh3::new(),
        }
    }

    /// Hex digest of everything read so far.
    pub fn digest_hex(&self) -> String {
        checksum_hex(self.hasher.digest())
    }
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(out)?;
        self.hasher.update(&out[..n]);
        Ok(n)
    }
}

/// Spawn the producer half of a stream pipe: copy `source` through `sink`
/// into the pipe, faulting the pipe before the writer drops on any error.
pub(crate) fn spawn_producer<R>(
    mut source: R,
    mut sink: CompressedSink,
    fault: pipe::PipeFault,
) -> JoinHandle<io::Result<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name("walvault-compress".to_string())
        .spawn(move || {
            if let Err(err) = io::copy(&mut source, &mut sink) {
                warn!(%err, "compression stage failed");
                fault.fail(&err);
                return Err(err);
            }
            if let Err(err) = sink.finish() {
                warn!(%err, "failed to finish compressed stream");
                fault.fail(&err);
                return Err(err);
            }
            Ok(())
        })
        .expect("failed to spawn compression thread")
}

/// Compress, optionally encrypt, upload and optionally verify one WAL
/// segment file. Returns the remote path on success.
pub fn upload_segment_file(
    uploader: &Uploader,
    crypter: &dyn Crypter,
    prefix: &StoragePrefix,
    segment_path: &Path,
    verify: bool,
) -> ArchiveResult<String> {
    let file = File::open(segment_path)?;
    let file_name = segment_path
        .file_name()
        .and_then(OsStr::to_str)
        .ok_or_else(|| {
            ArchiveError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("segment path has no file name: {}", segment_path.display()),
            ))
        })?;
    let remote = prefix.wal_path(file_name);

    let (writer, reader) = pipe::pipe();
    let fault = writer.fault_handle();
    let sink = CompressedSink::new(crypter, writer)?;
    let producer = spawn_producer(file, sink, fault);

    let mut body = ChecksumReader::new(reader);
    let submit_result = uploader.submit(&mut body, &remote);
    let local_checksum = body.digest_hex();
    drop(body);

    let producer_result = producer.join().unwrap_or_else(|_| {
        Err(io::Error::new(
            io::ErrorKind::Other,
            "compression thread panicked",
        ))
    });

    let stored = match (producer_result, submit_result) {
        // A producer that died of a broken pipe was killed by the upload
        // failing first; the transport error is the root cause.
        (Err(perr), Err(serr)) if perr.kind() == io::ErrorKind::BrokenPipe => {
            return Err(serr.into())
        }
        (Err(perr), _) => return Err(ArchiveError::compression(perr.to_string())),
        (Ok(()), Err(serr)) => return Err(serr.into()),
        (Ok(()), Ok(stored)) => stored,
    };

    if verify {
        let remote_checksum = uploader
            .remote_checksum(&remote)?
            .unwrap_or_else(|| "<unreported>".to_string());
        if remote_checksum != local_checksum {
            error!(
                path = %remote,
                local = %local_checksum,
                remote = %remote_checksum,
                "WAL upload verification failed"
            );
            return Err(ArchiveError::Integrity {
                path: remote,
                local: local_checksum,
                remote: remote_checksum,
            });
        }
        debug!(path = %remote, checksum = %local_checksum, "WAL upload verified");
    }

    debug!(path = %stored.path, "archived WAL segment");
    Ok(remote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;
    use walvault_crypto::{AeadCrypter, NoopCrypter};
    use walvault_storage::{MemoryStorage, RemoteStorage, UploadSettings};

    fn test_uploader(storage: &Arc<MemoryStorage>) -> Arc<Uploader> {
        Uploader::new(
            Arc::clone(storage) as Arc<dyn RemoteStorage>,
            UploadSettings::default(),
        )
    }

    fn decode(crypter: &dyn Crypter, stored: &[u8]) -> Vec<u8> {
        let decrypted = crypter
            .decrypt(Box::new(Cursor::new(stored.to_vec())))
            .unwrap();
        let mut decoder = lz4::Decoder::new(decrypted).unwrap();
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        out
    }

    fn write_segment(dir: &Path, name: &str, payload: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, payload).unwrap();
        path
    }

    #[test]
    fn test_upload_segment_roundtrip_plain() {
        let dir = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 241) as u8).collect();
        let segment = write_segment(dir.path(), "000000010000000000000051", &payload);

        let storage = Arc::new(MemoryStorage::new());
        let uploader = test_uploader(&storage);
        let crypter: Arc<dyn Crypter> = Arc::new(NoopCrypter);
        let prefix = StoragePrefix::new("bucket", "server");

        let remote =
            upload_segment_file(&uploader, crypter.as_ref(), &prefix, &segment, true).unwrap();
        assert_eq!(remote, "server/wal_005/000000010000000000000051.lz4");

        let stored = storage.object(&remote).unwrap();
        assert_eq!(decode(crypter.as_ref(), &stored), payload);
    }

    #[test]
    fn test_upload_segment_roundtrip_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let payload = b"encrypted wal segment payload".repeat(1000);
        let segment = write_segment(dir.path(), "000000010000000000000052", &payload);

        let storage = Arc::new(MemoryStorage::new());
        let uploader = test_uploader(&storage);
        let crypter: Arc<dyn Crypter> = Arc::new(AeadCrypter::from_bytes([9u8; 32]));
        let prefix = StoragePrefix::new("bucket", "server");

        let remote =
            upload_segment_file(&uploader, crypter.as_ref(), &prefix, &segment, true).unwrap();

        let stored = storage.object(&remote).unwrap();
        // The wire bytes are encrypt(compress(payload)), so they must not
        // contain the raw payload.
        assert_ne!(stored, payload);
        assert_eq!(decode(crypter.as_ref(), &stored), payload);
    }

    #[test]
    fn test_verification_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let segment = write_segment(dir.path(), "000000010000000000000053", b"payload");

        let storage = Arc::new(MemoryStorage::new());
        storage.override_checksum("0000000000000000");
        let uploader = test_uploader(&storage);
        let crypter: Arc<dyn Crypter> = Arc::new(NoopCrypter);
        let prefix = StoragePrefix::new("bucket", "server");

        let err = upload_segment_file(&uploader, crypter.as_ref(), &prefix, &segment, true).unwrap_err();
        assert!(matches!(err, ArchiveError::Integrity { .. }));
    }

    #[test]
    fn test_missing_key_fails_before_upload() {
        let dir = tempfile::tempdir().unwrap();
        let segment = write_segment(dir.path(), "000000010000000000000054", b"payload");

        let storage = Arc::new(MemoryStorage::new());
        let uploader = test_uploader(&storage);
        let crypter: Arc<dyn Crypter> = Arc::new(AeadCrypter::from_key_file("/missing/key"));
        let prefix = StoragePrefix::new("bucket", "server");

        let err = upload_segment_file(&uploader, crypter.as_ref(), &prefix, &segment, false).unwrap_err();
        assert!(matches!(err, ArchiveError::Crypto(_)));
        assert_eq!(storage.object_count(), 0);
    }

    #[test]
    fn test_transport_failure_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let segment = write_segment(dir.path(), "000000010000000000000055", b"payload");

        let storage = Arc::new(MemoryStorage::new());
        storage.fail_next_puts(100);
        let uploader = test_uploader(&storage);
        let crypter: Arc<dyn Crypter> = Arc::new(NoopCrypter);
        let prefix = StoragePrefix::new("bucket", "server");

        let err = upload_segment_file(&uploader, crypter.as_ref(), &prefix, &segment, false).unwrap_err();
        assert!(matches!(err, ArchiveError::Storage(_)));
    }

    #[test]
    fn test_checksum_reader_digest_matches_whole_read() {
        let payload = b"checksummed bytes".to_vec();
        let mut reader = ChecksumReader::new(Cursor::new(payload.clone()));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
        assert_eq!(reader.digest_hex(), walvault_storage::xxh3_hex(&payload));
    }
}
