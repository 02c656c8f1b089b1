//! In-process byte pipe
//!
//! Connects a producing stream stage to a consuming uploader without
//! buffering the whole object: the writer blocks once [`PIPE_CAPACITY`]
//! bytes are unread, so a slow network throttles a fast compressor.
//!
//! Close semantics carry the pipeline's central correctness property:
//!
//! - dropping the [`PipeWriter`] closes the stream; the reader drains the
//!   buffer and then observes end-of-stream. Because close rides on `Drop`,
//!   every exit path of a producer - success, error, panic - releases the
//!   reader.
//! - dropping the [`PipeReader`] breaks the pipe; subsequent writes fail
//!   with `BrokenPipe`.
//! - a producer that fails mid-stream marks the pipe faulted *before* its
//!   writer drops, so the consumer sees an error rather than a clean,
//!   silently-truncated end-of-stream.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;

/// Unread bytes the pipe holds before writers block.
pub const PIPE_CAPACITY: usize = 64 * 1024;

struct PipeState {
    buf: VecDeque<u8>,
    write_closed: bool,
    read_closed: bool,
    fault: Option<(io::ErrorKind, String)>,
}

struct Shared {
    state: Mutex<PipeState>,
    readable: Condvar,
    writable: Condvar,
}

/// Create a connected pipe.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(PipeState {
            buf: VecDeque::with_capacity(PIPE_CAPACITY),
            write_closed: false,
            read_closed: false,
            fault: None,
        }),
        readable: Condvar::new(),
        writable: Condvar::new(),
    });
    (
        PipeWriter {
            shared: Arc::clone(&shared),
        },
        PipeReader { shared },
    )
}

/// Write side of the pipe. Dropping it signals end-of-stream.
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Handle for marking the pipe faulted from wherever the producer's
    /// error surfaces, independent of who owns the writer by then.
    pub fn fault_handle(&self) -> PipeFault {
        PipeFault {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock();
        loop {
            if state.read_closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "pipe reader was dropped",
                ));
            }
            let free = PIPE_CAPACITY - state.buf.len();
            if free > 0 {
                let n = free.min(buf.len());
                state.buf.extend(&buf[..n]);
                self.shared.readable.notify_one();
                return Ok(n);
            }
            self.shared.writable.wait(&mut state);
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.write_closed = true;
        self.shared.readable.notify_all();
    }
}

/// Read side of the pipe.
pub struct PipeReader {
    shared: Arc<Shared>,
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock();
        loop {
            // Faults preempt buffered data so a failed producer aborts the
            // consumer promptly instead of letting it drain stale bytes.
            if let Some((kind, msg)) = &state.fault {
                return Err(io::Error::new(*kind, msg.clone()));
            }
            if !state.buf.is_empty() {
                let n = out.len().min(state.buf.len());
                for (slot, byte) in out[..n].iter_mut().zip(state.buf.drain(..n)) {
                    *slot = byte;
                }
                self.shared.writable.notify_one();
                return Ok(n);
            }
            if state.write_closed {
                return Ok(0);
            }
            self.shared.readable.wait(&mut state);
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.read_closed = true;
        self.shared.writable.notify_all();
    }
}

/// Marks the pipe faulted so the reader fails instead of seeing EOF.
pub struct PipeFault {
    shared: Arc<Shared>,
}

impl PipeFault {
    /// Record `err` as the pipe's terminal state. Must be called before
    /// the writer is dropped for the reader to be guaranteed to see it.
    pub fn fail(&self, err: &io::Error) {
        let mut state = self.shared.state.lock();
        if state.fault.is_none() {
            state.fault = Some((err.kind(), err.to_string()));
        }
        self.shared.readable.notify_all();
        self.shared.writable.notify_all();
    }
}
