//! Byte-framed duplex I/O (design §4.1).
//!
//! A `WatermarkBuffer` is the pure, socket-free half: a FIFO byte queue with
//! low/high watermarks used for backpressure decisions. `Duplex<S>` pairs
//! one input and one output `WatermarkBuffer` with a real `AsyncRead +
//! AsyncWrite` socket and drives one read/write pass per call to `pump`.
//! The owning connection state machine (see `crate::connection`) calls
//! `pump` in a loop and reacts to the returned `PumpOutcome`.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default low watermark for connection-level framing (16 KiB).
pub const DEFAULT_LOW_WATERMARK: usize = 16 * 1024;
/// Default high watermark for connection-level framing (128 KiB, per the
/// connection state machine's numeric policy in §4.4). The duplex's own
/// default (used where nothing more specific applies) is 64 KiB per §2.
pub const DEFAULT_HIGH_WATERMARK: usize = 64 * 1024;
/// Default chunk granularity for socket reads/writes.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// A FIFO byte queue with watermark bookkeeping. No I/O of its own —
/// exercised directly by unit tests and reused by `Payload` for its body
/// queue semantics.
#[derive(Debug, Default)]
pub struct WatermarkBuffer {
    queue: VecDeque<u8>,
    low_watermark: usize,
    high_watermark: usize,
}

impl WatermarkBuffer {
    pub fn new(low_watermark: usize, high_watermark: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            low_watermark,
            high_watermark,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.queue.extend(bytes.iter().copied());
    }

    /// Remove and return up to `max` bytes from the front.
    pub fn pop(&mut self, max: usize) -> Bytes {
        let n = max.min(self.queue.len());
        let mut out = BytesMut::with_capacity(n);
        for _ in 0..n {
            out.extend_from_slice(&[self.queue.pop_front().unwrap()]);
        }
        out.freeze()
    }

    /// Peek at the first unread line terminator (`\n`), returning the byte
    /// range `[0, idx]` inclusive without consuming it. Used by the header
    /// parser, which needs to see a full line before committing to it.
    pub fn find_newline(&self) -> Option<usize> {
        self.queue.iter().position(|&b| b == b'\n')
    }

    /// Drain and return exactly `n` bytes (caller has already checked
    /// `len() >= n`, typically via `find_newline`).
    pub fn drain(&mut self, n: usize) -> Vec<u8> {
        self.queue.drain(..n).collect()
    }

    pub fn should_pause_reads(&self) -> bool {
        self.queue.len() >= self.high_watermark
    }

    pub fn should_resume_reads(&self) -> bool {
        self.queue.len() <= self.low_watermark
    }
}

/// Outcome of one `pump()` pass, used by the owning state machine to decide
/// whether to keep looping, pause reads, or tear down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpOutcome {
    pub bytes_read: usize,
    pub bytes_written: usize,
    pub peer_closed: bool,
}

/// Pairs a socket with the two `WatermarkBuffer`s described in §4.1.
pub struct Duplex<S> {
    socket: S,
    pub input: WatermarkBuffer,
    pub output: WatermarkBuffer,
    pub close_after_write: bool,
    pub close_after_read: bool,
    peer_closed: bool,
    /// Reentrancy guard — `pump` is not reentrant while already running.
    in_pump: bool,
}

impl<S> Duplex<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(socket: S) -> Self {
        Self::with_watermarks(
            socket,
            DEFAULT_LOW_WATERMARK,
            DEFAULT_HIGH_WATERMARK,
            DEFAULT_LOW_WATERMARK,
            DEFAULT_HIGH_WATERMARK,
        )
    }

    pub fn with_watermarks(
        socket: S,
        in_low: usize,
        in_high: usize,
        out_low: usize,
        out_high: usize,
    ) -> Self {
        Self {
            socket,
            input: WatermarkBuffer::new(in_low, in_high),
            output: WatermarkBuffer::new(out_low, out_high),
            close_after_write: false,
            close_after_read: false,
            peer_closed: false,
            in_pump: false,
        }
    }

    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// True once there's nothing left to do on this socket: either side has
    /// asked to close and both buffers are drained (design §4.1).
    pub fn can_close(&self) -> bool {
        let write_drained = self.output.is_empty();
        let read_drained = self.input.is_empty();
        (self.close_after_write && write_drained) || (self.close_after_read && read_drained)
    }

    /// One read + one write pass. Reads are skipped while the input buffer
    /// is at or above its high watermark (backpressure); writes drain as
    /// much of the output buffer as the socket accepts without blocking.
    pub async fn pump(&mut self) -> std::io::Result<PumpOutcome> {
        if self.in_pump {
            return Ok(PumpOutcome {
                bytes_read: 0,
                bytes_written: 0,
                peer_closed: self.peer_closed,
            });
        }
        self.in_pump = true;
        let result = self.pump_inner().await;
        self.in_pump = false;
        result
    }

    async fn pump_inner(&mut self) -> std::io::Result<PumpOutcome> {
        let mut bytes_read = 0usize;
        let mut bytes_written = 0usize;

        if !self.peer_closed && !self.input.should_pause_reads() {
            let budget = self.input.high_watermark.saturating_sub(self.input.len());
            let want = budget.min(64 * 1024).max(DEFAULT_CHUNK_SIZE);
            let mut buf = vec![0u8; want];
            match self.socket.read(&mut buf).await {
                Ok(0) => self.peer_closed = true,
                Ok(n) => {
                    self.input.push(&buf[..n]);
                    bytes_read = n;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }

        while !self.output.is_empty() {
            let chunk = self.output.pop(DEFAULT_CHUNK_SIZE.max(4096));
            match self.socket.write_all(&chunk).await {
                Ok(()) => bytes_written += chunk.len(),
                Err(e) => return Err(e),
            }
        }
        if bytes_written > 0 {
            let _ = self.socket.flush().await;
        }

        Ok(PumpOutcome {
            bytes_read,
            bytes_written,
            peer_closed: self.peer_closed,
        })
    }

    pub fn into_socket(self) -> S {
        self.socket
    }

    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_buffer_fifo_order() {
        let mut b = WatermarkBuffer::new(4, 8);
        b.push(b"hello");
        b.push(b" world");
        assert_eq!(b.len(), 11);
        let popped = b.pop(5);
        assert_eq!(&popped[..], b"hello");
        assert_eq!(b.len(), 6);
    }

    #[test]
    fn watermark_thresholds() {
        let mut b = WatermarkBuffer::new(4, 8);
        b.push(&[0u8; 8]);
        assert!(b.should_pause_reads());
        b.pop(6);
        assert!(b.should_resume_reads());
    }

    #[test]
    fn find_newline_and_drain() {
        let mut b = WatermarkBuffer::new(4, 8);
        b.push(b"GET / HTTP/1.1\r\n");
        let idx = b.find_newline().unwrap();
        let line = b.drain(idx + 1);
        assert_eq!(line, b"GET / HTTP/1.1\r\n");
        assert!(b.is_empty());
    }

    #[tokio::test]
    async fn pump_reads_and_writes() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut d = Duplex::new(client);
        d.output.push(b"hello");
        let outcome = d.pump().await.unwrap();
        assert_eq!(outcome.bytes_written, 5);

        let mut buf = [0u8; 5];
        use tokio::io::AsyncReadExt;
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        use tokio::io::AsyncWriteExt;
        server.write_all(b"world").await.unwrap();
        let outcome = d.pump().await.unwrap();
        assert_eq!(outcome.bytes_read, 5);
        assert_eq!(&d.input.pop(5)[..], b"world");
    }
}
