//! Framed AES-256-GCM stream cipher
//!
//! The armed crypter carves the plaintext stream into fixed-size frames and
//! seals each with AES-256-GCM. Per-frame nonces are derived from a random
//! per-stream salt and the frame index, so a key never sees a repeated
//! nonce within or across streams:
//!
//! ```text
//! header:  magic "WVLT" | version 0x01 | salt (16 bytes)
//! frame:   ciphertext length (u32 LE) | ciphertext + tag
//! nonce:   sha256(salt ‖ frame_index_be)[..12]
//! ```
//!
//! End of stream is the sink's own end of stream; a truncated frame fails
//! authentication or length validation on the read side.

use crate::{CryptoError, StreamWriter};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use tracing::debug;
use zeroize::Zeroize;

const MAGIC: &[u8; 4] = b"WVLT";
const VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Plaintext bytes per frame.
const FRAME_LEN: usize = 64 * 1024;

/// Key length in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// Where the armed crypter obtains its key.
#[derive(Clone)]
pub enum KeySource {
    /// A file holding the key as 64 hex characters.
    File(PathBuf),
    /// Key material supplied directly.
    Bytes([u8; KEY_LEN]),
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::File(path) => f.debug_tuple("File").field(path).finish(),
            KeySource::Bytes(_) => f.write_str("Bytes(<redacted>)"),
        }
    }
}

/// Key material that is wiped from memory on drop.
struct SecretKey([u8; KEY_LEN]);

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Armed crypter: framed AES-256-GCM keyed from an external key source.
///
/// The key is loaded lazily on each `encrypt`/`decrypt` call, so a key file
/// that appears after process start is picked up, and a missing one fails
/// the operation before any bytes move.
#[derive(Debug, Clone)]
pub struct AeadCrypter {
    source: KeySource,
}

impl AeadCrypter {
    /// Crypter keyed from a hex-encoded key file.
    pub fn from_key_file(path: impl Into<PathBuf>) -> Self {
        AeadCrypter {
            source: KeySource::File(path.into()),
        }
    }

    /// Crypter keyed from raw key material.
    pub fn from_bytes(key: [u8; KEY_LEN]) -> Self {
        AeadCrypter {
            source: KeySource::Bytes(key),
        }
    }

    fn load_key(&self) -> Result<SecretKey, CryptoError> {
        match &self.source {
            KeySource::Bytes(key) => Ok(SecretKey(*key)),
            KeySource::File(path) => {
                let text = fs::read_to_string(path).map_err(|err| {
                    CryptoError::MissingKey(format!("{}: {}", path.display(), err))
                })?;
                let mut decoded = hex::decode(text.trim()).map_err(|_| {
                    CryptoError::MissingKey(format!("{}: not valid hex", path.display()))
                })?;
                if decoded.len() != KEY_LEN {
                    decoded.zeroize();
                    return Err(CryptoError::MissingKey(format!(
                        "{}: key must be {} hex characters",
                        path.display(),
                        KEY_LEN * 2
                    )));
                }
                let mut key = [0u8; KEY_LEN];
                key.copy_from_slice(&decoded);
                decoded.zeroize();
                Ok(SecretKey(key))
            }
        }
    }
}

impl crate::Crypter for AeadCrypter {
    fn is_armed(&self) -> bool {
        true
    }

    fn encrypt(
        &self,
        sink: Box<dyn Write + Send>,
    ) -> Result<Box<dyn StreamWriter>, CryptoError> {
        let key = self.load_key()?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        debug!("arming stream encryption");
        Ok(Box::new(AeadWriter::new(cipher, salt, sink)?))
    }

    fn decrypt(
        &self,
        source: Box<dyn Read + Send>,
    ) -> Result<Box<dyn Read + Send>, CryptoError> {
        let key = self.load_key()?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
        Ok(Box::new(AeadReader::new(cipher, source)))
    }
}

fn frame_nonce(salt: &[u8; SALT_LEN], index: u64) -> [u8; NONCE_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(index.to_be_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&digest[..NONCE_LEN]);
    nonce
}

struct AeadWriter {
    cipher: Aes256Gcm,
    salt: [u8; SALT_LEN],
    frame: Vec<u8>,
    index: u64,
    sink: Box<dyn Write + Send>,
}

impl AeadWriter {
    fn new(
        cipher: Aes256Gcm,
        salt: [u8; SALT_LEN],
        mut sink: Box<dyn Write + Send>,
    ) -> Result<Self, CryptoError> {
        sink.write_all(MAGIC)?;
        sink.write_all(&[VERSION])?;
        sink.write_all(&salt)?;
        Ok(AeadWriter {
            cipher,
            salt,
            frame: Vec::with_capacity(FRAME_LEN),
            index: 0,
            sink,
        })
    }

    fn seal_frame(&mut self) -> io::Result<()> {
        let nonce = frame_nonce(&self.salt, self.index);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), self.frame.as_slice())
            .map_err(|_| CryptoError::Cipher { frame: self.index })?;
        self.sink.write_all(&(ciphertext.len() as u32).to_le_bytes())?;
        self.sink.write_all(&ciphertext)?;
        self.frame.clear();
        self.index += 1;
        Ok(())
    }
}

impl Write for AeadWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut consumed = 0;
        while consumed < buf.len() {
            let room = FRAME_LEN - self.frame.len();
            let take = room.min(buf.len() - consumed);
            self.frame.extend_from_slice(&buf[consumed..consumed + take]);
            consumed += take;
            if self.frame.len() == FRAME_LEN {
                self.seal_frame()?;
            }
        }
        Ok(consumed)
    }

    fn flush(&mut self) -> io::Result<()> {
        // Partial frames stay buffered until finish(); sealing them here
        // would change frame boundaries based on flush timing.
        self.sink.flush()
    }
}

impl StreamWriter for AeadWriter {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        if !self.frame.is_empty() {
            self.seal_frame()?;
        }
        self.sink.flush()
    }
}

struct AeadReader {
    cipher: Aes256Gcm,
    salt: [u8; SALT_LEN],
    index: u64,
    source: Box<dyn Read + Send>,
    buf: Vec<u8>,
    pos: usize,
    header_read: bool,
    done: bool,
}

impl AeadReader {
    fn new(cipher: Aes256Gcm, source: Box<dyn Read + Send>) -> Self {
        AeadReader {
            cipher,
            salt: [0u8; SALT_LEN],
            index: 0,
            source,
            buf: Vec::new(),
            pos: 0,
            header_read: false,
            done: false,
        }
    }

    fn read_header(&mut self) -> io::Result<()> {
        let mut header = [0u8; 4 + 1 + SALT_LEN];
        self.source
            .read_exact(&mut header)
            .map_err(|_| CryptoError::Malformed("missing stream header"))?;
        if &header[..4] != MAGIC {
            return Err(CryptoError::Malformed("bad magic").into());
        }
        if header[4] != VERSION {
            return Err(CryptoError::Malformed("unsupported version").into());
        }
        self.salt.copy_from_slice(&header[5..]);
        self.header_read = true;
        Ok(())
    }

    /// Reads and opens the next frame. Returns false on clean end of stream.
    fn next_frame(&mut self) -> io::Result<bool> {
        let mut len_bytes = [0u8; 4];
        if !read_exact_or_eof(&mut self.source, &mut len_bytes)? {
            return Ok(false);
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len < TAG_LEN || len > FRAME_LEN + TAG_LEN {
            return Err(CryptoError::Malformed("frame length out of range").into());
        }
        let mut ciphertext = vec![0u8; len];
        self.source
            .read_exact(&mut ciphertext)
            .map_err(|_| CryptoError::Malformed("truncated frame"))?;

        let nonce = frame_nonce(&self.salt, self.index);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| CryptoError::Cipher { frame: self.index })?;
        self.index += 1;
        self.buf = plaintext;
        self.pos = 0;
        Ok(true)
    }
}

impl Read for AeadReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if !self.header_read {
            self.read_header()?;
        }
        while self.pos == self.buf.len() {
            if self.done {
                return Ok(0);
            }
            if !self.next_frame()? {
                self.done = true;
                return Ok(0);
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Fill `buf` completely, or report a clean end of stream if no bytes were
/// available at all. A partial fill is an error.
fn read_exact_or_eof<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(CryptoError::Malformed("truncated frame header").into());
        }
        filled += n;
    }
    Ok(true)
}
