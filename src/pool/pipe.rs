//! In-process byte pipes between coordinators and workers
//!
//! Each pipe is a crossbeam channel of byte chunks. The writer implements
//! [`Write`] and sends one chunk per `write` call (callers batch whole
//! frames before writing). The reader implements [`Read`], keeps the
//! unconsumed tail of the last chunk, and can wait for readability with a
//! timeout so a coordinator notices termination requests while a worker is
//! busy. Dropping the writer closes the pipe: the reader sees EOF once the
//! buffered chunks are consumed.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::io::{self, Read, Write};
use std::time::Duration;

/// Outcome of waiting for a pipe to become readable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readable {
    /// Data (or the end of buffered data) is available without blocking
    Ready,
    /// Nothing arrived within the timeout
    Timeout,
    /// The writer is gone and nothing is buffered
    Closed,
}

/// Create a connected writer/reader pair
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = unbounded();
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            buf: Vec::new(),
            pos: 0,
        },
    )
}

/// Sending half of a pipe
#[derive(Debug)]
pub struct PipeWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed"))?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Receiving half of a pipe
#[derive(Debug)]
pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
}

impl PipeReader {
    /// Wait up to `timeout` for data to become available
    pub fn wait_readable(&mut self, timeout: Duration) -> Readable {
        if self.pos < self.buf.len() {
            return Readable::Ready;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(chunk) => {
                self.buf = chunk;
                self.pos = 0;
                Readable::Ready
            }
            Err(RecvTimeoutError::Timeout) => Readable::Timeout,
            Err(RecvTimeoutError::Disconnected) => Readable::Closed,
        }
    }

    /// Unwrap into the underlying channel, for multiplexing with
    /// `crossbeam_channel::Select`. Only valid before anything was read.
    pub(crate) fn into_receiver(self) -> Receiver<Vec<u8>> {
        debug_assert!(self.pos >= self.buf.len());
        self.rx
    }
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.pos >= self.buf.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.buf = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_read_across_chunks() {
        let (mut w, mut r) = pipe();
        w.write_all(b"hello ").unwrap();
        w.write_all(b"world").unwrap();
        drop(w);

        let mut s = String::new();
        r.read_to_string(&mut s).unwrap();
        assert_eq!(s, "hello world");
    }

    #[test]
    fn test_wait_readable_states() {
        let (mut w, mut r) = pipe();
        assert_eq!(r.wait_readable(Duration::from_millis(5)), Readable::Timeout);

        w.write_all(b"ab").unwrap();
        assert_eq!(r.wait_readable(Duration::from_millis(5)), Readable::Ready);
        // buffered data stays ready without touching the channel
        assert_eq!(r.wait_readable(Duration::from_millis(5)), Readable::Ready);

        let mut one = [0u8; 1];
        r.read_exact(&mut one).unwrap();
        assert_eq!(&one, b"a");

        drop(w);
        assert_eq!(r.wait_readable(Duration::from_millis(5)), Readable::Ready);
        r.read_exact(&mut one).unwrap();
        assert_eq!(r.wait_readable(Duration::from_millis(5)), Readable::Closed);
    }

    #[test]
    fn test_write_after_reader_dropped() {
        let (mut w, r) = pipe();
        drop(r);
        let err = w.write(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
