//! Encryption capability for the archival pipeline
//!
//! All bytes shipped to remote storage pass through a [`Crypter`]. This
//! provides the seam between the streaming pipeline and the cipher:
//!
//! - [`NoopCrypter`] - pass-through, used when encryption is not configured
//! - [`AeadCrypter`] - framed AES-256-GCM keyed from an external key source
//!
//! Crypter transforms are pure stream transforms: they never block on
//! anything other than the wrapped stream's own I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod aead;

pub use aead::{AeadCrypter, KeySource};

use std::io::{self, Read, Write};
use thiserror::Error;

/// A writer that must be explicitly finished.
///
/// Stream transforms (ciphers, compressors) buffer trailing state that only
/// hits the sink on [`StreamWriter::finish`]. Dropping without finishing
/// still releases the underlying sink, so a failed pipeline never leaves a
/// consumer blocked waiting for end-of-stream.
pub trait StreamWriter: Write + Send {
    /// Flush trailing state and release the underlying sink.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Encryption capability consumed by the streaming pipeline.
pub trait Crypter: Send + Sync {
    /// Whether encryption is armed. Disarmed crypters pass bytes through.
    fn is_armed(&self) -> bool;

    /// Wrap `sink` so that bytes written come out encrypted.
    ///
    /// Armed crypters fail with [`CryptoError::MissingKey`] before any
    /// bytes move if no usable key is configured.
    fn encrypt(&self, sink: Box<dyn Write + Send>) -> Result<Box<dyn StreamWriter>, CryptoError>;

    /// Wrap `source` so that bytes read come out decrypted.
    fn decrypt(&self, source: Box<dyn Read + Send>) -> Result<Box<dyn Read + Send>, CryptoError>;
}

/// Errors raised by crypter configuration and stream transforms.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption is armed but no usable key is configured. Fatal; raised
    /// before any bytes move.
    #[error("encryption key unusable: {0}")]
    MissingKey(String),

    /// The cipher rejected a frame (encrypt side) or failed authentication
    /// (decrypt side).
    #[error("cipher failure on frame {frame}")]
    Cipher {
        /// Index of the frame that failed.
        frame: u64,
    },

    /// The encrypted stream does not follow the expected frame format.
    #[error("malformed encrypted stream: {0}")]
    Malformed(&'static str),

    /// I/O error from the wrapped stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// Crypter writers/readers sit inside `std::io` stream chains, so their
// errors must travel as `io::Error` without losing the original cause.
impl From<CryptoError> for io::Error {
    fn from(err: CryptoError) -> io::Error {
        match err {
            CryptoError::Io(err) => err,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Pass-through crypter used when encryption is not configured.
#[derive(Debug, Default, Clone)]
pub struct NoopCrypter;

impl Crypter for NoopCrypter {
    fn is_armed(&self) -> bool {
        false
    }

    fn encrypt(&self, sink: Box<dyn Write + Send>) -> Result<Box<dyn StreamWriter>, CryptoError> {
        Ok(Box::new(Passthrough { sink }))
    }

    fn decrypt(&self, source: Box<dyn Read + Send>) -> Result<Box<dyn Read + Send>, CryptoError> {
        Ok(source)
    }
}

struct Passthrough {
    sink: Box<dyn Write + Send>,
}

impl Write for Passthrough {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

impl StreamWriter for Passthrough {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.sink.flush()
    }
}
