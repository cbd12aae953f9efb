//! The `Payload` object (design §4.3): the single producer/consumer-safe
//! byte queue shared by the HTTP connection state machine and the overlay
//! bridge.
//!
//! Mutation (pushing produced bytes, draining consumed bytes, parsing
//! incoming wire bytes) is serialized by a `std::sync::Mutex` around the
//! queue/trailers/bookkeeping (`Inner`); no `.await` is ever held across
//! that lock, so a blocking `Mutex` is correct here the same way the
//! original's `std::mutex` is. `state` is additionally exposed as an
//! `AtomicU8` so a reader can check completion without taking the lock,
//! matching the "state is observed via an atomic load" contract in §3.
//! Edge-triggered watermark callbacks are modeled with a single shared
//! `tokio::sync::Notify`: every mutation that could flip a waiter's
//! condition calls `notify_waiters()`, and each waiter loops
//! check-then-wait, which is observationally equivalent to a discrete list
//! of one-shot callbacks without the bookkeeping of tracking individual
//! subscriptions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

use crate::duplex::WatermarkBuffer;
use crate::error::{ProxyError, ProxyResult};
use crate::http::header::Header;
use crate::http::message::PayloadKind;

pub const DEFAULT_LOW_WATERMARK: usize = 16 * 1024;
pub const DEFAULT_HIGH_WATERMARK: usize = 128 * 1024;
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;
pub const MAX_TRAILER_SIZE: usize = 16 * 1024;
/// Overlay `get_next_part` chunks are clamped to at most this (§4.7/§9).
pub const MIN_TRANSFER_CHUNK: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ParseState {
    ReadingChunkHeader = 0,
    ReadingChunkData = 1,
    ReadingTrailer = 2,
    ReadingCrlf = 3,
    Completed = 4,
}

impl ParseState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ParseState::ReadingChunkHeader,
            1 => ParseState::ReadingChunkData,
            2 => ParseState::ReadingTrailer,
            3 => ParseState::ReadingCrlf,
            _ => ParseState::Completed,
        }
    }
}

struct Inner {
    queue: VecDeque<Bytes>,
    trailers: Vec<Header>,
    trailer_bytes: usize,
    content_length_remaining: u64,
    chunk_data_remaining: u64,
    written_zero_chunk: bool,
    written_trailer: bool,
    parse_error: Option<String>,
}

pub struct Payload {
    kind: Mutex<PayloadKind>,
    inner: Mutex<Inner>,
    state: AtomicU8,
    ready_bytes: AtomicUsize,
    error: AtomicBool,
    notify: Notify,
    pub low_watermark: usize,
    pub high_watermark: usize,
    pub chunk_size: usize,
}

impl Payload {
    pub fn new(kind: PayloadKind) -> Self {
        Self::with_watermarks(kind, DEFAULT_LOW_WATERMARK, DEFAULT_HIGH_WATERMARK, DEFAULT_CHUNK_SIZE)
    }

    /// Tunnel payloads use `low_watermark = 1` so a single buffered byte is
    /// enough to trigger forwarding (§4.2).
    pub fn new_tunnel() -> Self {
        Self::with_watermarks(PayloadKind::Tunnel, 1, DEFAULT_HIGH_WATERMARK, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_watermarks(kind: PayloadKind, low_watermark: usize, high_watermark: usize, chunk_size: usize) -> Self {
        let content_length_remaining = match kind {
            PayloadKind::ContentLength(n) => n,
            _ => 0,
        };
        let initial_state = match kind {
            PayloadKind::Empty => ParseState::Completed,
            _ => ParseState::ReadingChunkHeader,
        };
        Self {
            kind: Mutex::new(kind),
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                trailers: Vec::new(),
                trailer_bytes: 0,
                content_length_remaining,
                chunk_data_remaining: 0,
                written_zero_chunk: false,
                written_trailer: false,
                parse_error: None,
            }),
            state: AtomicU8::new(initial_state as u8),
            ready_bytes: AtomicUsize::new(0),
            error: AtomicBool::new(false),
            notify: Notify::new(),
            low_watermark,
            high_watermark,
            chunk_size,
        }
    }

    pub fn kind(&self) -> PayloadKind {
        *self.kind.lock().unwrap()
    }

    pub fn state(&self) -> ParseState {
        ParseState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_completed(&self) -> bool {
        self.state() == ParseState::Completed
    }

    pub fn is_error(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }

    pub fn ready_bytes(&self) -> usize {
        self.ready_bytes.load(Ordering::Acquire)
    }

    /// §3 "written" predicate, specialized to the non-chunked-HTTP
    /// consumer (the overlay bridge, which transmits decoded bytes plus
    /// explicit trailers rather than re-serializing chunk framing): no
    /// more bytes will ever arrive and everything produced has been
    /// drained.
    pub fn is_written(&self) -> bool {
        self.ready_bytes() == 0 && self.is_completed() && !self.is_error()
    }

    fn set_error(&self, msg: impl Into<String>) {
        self.error.store(true, Ordering::Release);
        self.inner.lock().unwrap().parse_error = Some(msg.into());
        self.notify.notify_waiters();
    }

    pub fn mark_error(&self) {
        self.set_error("marked errored by owner");
    }

    fn recompute_ready_bytes(inner: &Inner) -> usize {
        let body: usize = inner.queue.iter().map(|b| b.len()).sum();
        let trailer: usize = inner.trailer_bytes;
        body + trailer
    }

    fn set_completed(&self) {
        self.state.store(ParseState::Completed as u8, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Caller-driven completion for Eof/Tunnel modes, where there is no
    /// in-band terminator and the owning connection/tunnel observes EOF.
    pub fn complete(&self) {
        if !self.is_completed() {
            self.set_completed();
        }
    }

    /// Producer path for bytes arriving through a channel (overlay bridge)
    /// rather than the raw socket — equivalent to copying into the queue's
    /// write slice directly, bypassing the wire-level chunk/CL parser.
    pub fn push_bytes(&self, buf: &[u8]) {
        if buf.is_empty() || self.is_error() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(Bytes::copy_from_slice(buf));
        self.ready_bytes.store(Self::recompute_ready_bytes(&inner), Ordering::Release);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Consumer path: returns up to `max` ready bytes, FIFO, decrementing
    /// `ready_bytes`.
    pub fn pop_slice(&self, max: usize) -> Bytes {
        if max == 0 {
            return Bytes::new();
        }
        let mut inner = self.inner.lock().unwrap();
        let mut out = BytesMut::with_capacity(max.min(self.chunk_size));
        while out.len() < max {
            let Some(front) = inner.queue.front_mut() else { break };
            let take = (max - out.len()).min(front.len());
            out.extend_from_slice(&front[..take]);
            if take == front.len() {
                inner.queue.pop_front();
            } else {
                *front = front.slice(take..);
            }
        }
        self.ready_bytes.store(Self::recompute_ready_bytes(&inner), Ordering::Release);
        out.freeze()
    }

    /// Returns one trailer header, or an empty sentinel header if none
    /// remain (§4.3 `pop_header`).
    pub fn pop_header(&self) -> Header {
        let mut inner = self.inner.lock().unwrap();
        if inner.trailers.is_empty() {
            return Header::new(Vec::new(), Vec::new());
        }
        let h = inner.trailers.remove(0);
        inner.trailer_bytes = inner.trailer_bytes.saturating_sub(h.size());
        self.ready_bytes.store(Self::recompute_ready_bytes(&inner), Ordering::Release);
        h
    }

    fn push_trailer_locked(&self, inner: &mut Inner, header: Header) -> ProxyResult<()> {
        header.validate()?;
        inner.trailer_bytes += header.size();
        if inner.trailer_bytes > MAX_TRAILER_SIZE {
            return Err(ProxyError::Parse("trailer block too large".into()));
        }
        inner.trailers.push(header);
        Ok(())
    }

    /// Append a trailer header received out-of-band (overlay `last` part).
    pub fn push_trailer(&self, header: Header) -> ProxyResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let result = self.push_trailer_locked(&mut inner, header);
        if result.is_err() {
            drop(inner);
            self.set_error("trailer too large");
            return result;
        }
        self.ready_bytes.store(Self::recompute_ready_bytes(&inner), Ordering::Release);
        drop(inner);
        self.notify.notify_waiters();
        result
    }

    /// Advance the state machine over freshly arrived wire bytes sitting in
    /// `input`. Chunked mode parses hex-size lines, data, and a trailer
    /// block; `ContentLength` reads exactly `n` bytes; `Eof`/`Tunnel` copy
    /// everything through and rely on the caller's `complete()`.
    pub fn parse(&self, input: &mut WatermarkBuffer) -> ProxyResult<()> {
        if self.is_error() {
            return Err(ProxyError::Parse("payload already errored".into()));
        }
        let kind = self.kind();
        let result = match kind {
            PayloadKind::Empty => Ok(()),
            PayloadKind::Eof | PayloadKind::Tunnel => self.parse_passthrough(input),
            PayloadKind::ContentLength(_) => self.parse_content_length(input),
            PayloadKind::Chunked => self.parse_chunked(input),
        };
        if let Err(ref e) = result {
            self.set_error(e.to_string());
        }
        result
    }

    fn parse_passthrough(&self, input: &mut WatermarkBuffer) -> ProxyResult<()> {
        if self.is_completed() {
            return Ok(());
        }
        let n = input.len();
        if n == 0 {
            return Ok(());
        }
        let bytes = input.pop(n);
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(bytes);
        self.ready_bytes.store(Self::recompute_ready_bytes(&inner), Ordering::Release);
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    fn parse_content_length(&self, input: &mut WatermarkBuffer) -> ProxyResult<()> {
        if self.is_completed() {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();
        let want = inner.content_length_remaining.min(input.len() as u64) as usize;
        if want > 0 {
            let bytes = input.pop(want);
            inner.content_length_remaining -= bytes.len() as u64;
            inner.queue.push_back(bytes);
        }
        let remaining = inner.content_length_remaining;
        self.ready_bytes.store(Self::recompute_ready_bytes(&inner), Ordering::Release);
        drop(inner);
        if remaining == 0 {
            self.set_completed();
        } else {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    fn parse_chunked(&self, input: &mut WatermarkBuffer) -> ProxyResult<()> {
        loop {
            let state = self.state();
            match state {
                ParseState::Completed => return Ok(()),
                ParseState::ReadingChunkHeader => {
                    let Some(idx) = input.find_newline() else { return Ok(()) };
                    let mut line = input.drain(idx + 1);
                    if line.last() == Some(&b'\n') {
                        line.pop();
                    }
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    let text = std::str::from_utf8(&line)
                        .map_err(|_| ProxyError::Parse("invalid chunk size line".into()))?;
                    let size_str = text.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(size_str, 16)
                        .map_err(|_| ProxyError::Parse("invalid chunk size".into()))?;
                    if size == 0 {
                        self.state.store(ParseState::ReadingTrailer as u8, Ordering::Release);
                    } else {
                        let mut inner = self.inner.lock().unwrap();
                        inner.chunk_data_remaining = size;
                        drop(inner);
                        self.state.store(ParseState::ReadingChunkData as u8, Ordering::Release);
                    }
                }
                ParseState::ReadingChunkData => {
                    let mut inner = self.inner.lock().unwrap();
                    let want = inner.chunk_data_remaining.min(input.len() as u64) as usize;
                    if want == 0 {
                        return Ok(());
                    }
                    let bytes = input.pop(want);
                    inner.chunk_data_remaining -= bytes.len() as u64;
                    inner.queue.push_back(bytes);
                    let done = inner.chunk_data_remaining == 0;
                    self.ready_bytes.store(Self::recompute_ready_bytes(&inner), Ordering::Release);
                    drop(inner);
                    self.notify.notify_waiters();
                    if done {
                        self.state.store(ParseState::ReadingCrlf as u8, Ordering::Release);
                    } else {
                        return Ok(());
                    }
                }
                ParseState::ReadingCrlf => {
                    let Some(idx) = input.find_newline() else { return Ok(()) };
                    input.drain(idx + 1);
                    self.state.store(ParseState::ReadingChunkHeader as u8, Ordering::Release);
                }
                ParseState::ReadingTrailer => {
                    let Some(idx) = input.find_newline() else { return Ok(()) };
                    let mut line = input.drain(idx + 1);
                    if line.last() == Some(&b'\n') {
                        line.pop();
                    }
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    if line.is_empty() {
                        self.set_completed();
                        return Ok(());
                    }
                    let colon = line
                        .iter()
                        .position(|&b| b == b':')
                        .ok_or_else(|| ProxyError::Parse("invalid trailer line".into()))?;
                    let name = line[..colon].to_vec();
                    let value = line[colon + 1..].iter().skip_while(|&&b| b == b' ').copied().collect();
                    let header = Header::new(name, value);
                    let mut inner = self.inner.lock().unwrap();
                    self.push_trailer_locked(&mut inner, header)?;
                    self.ready_bytes.store(Self::recompute_ready_bytes(&inner), Ordering::Release);
                    drop(inner);
                    self.notify.notify_waiters();
                }
            }
        }
    }

    /// Serialize ready bytes as HTTP wire bytes into `out`. Returns whether
    /// any progress (bytes or a chunk/trailer frame) was made.
    pub fn write_http(&self, out: &mut Vec<u8>, max: usize, emit_kind: PayloadKind) -> bool {
        let mut progressed = false;
        match emit_kind {
            PayloadKind::Chunked => {
                let ready = self.ready_bytes().min(max);
                if ready > 0 {
                    let body = self.pop_slice(ready);
                    out.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
                    out.extend_from_slice(&body);
                    out.extend_from_slice(b"\r\n");
                    progressed = true;
                }
                if self.is_completed() {
                    let mut inner = self.inner.lock().unwrap();
                    if !inner.written_zero_chunk {
                        out.extend_from_slice(b"0\r\n");
                        inner.written_zero_chunk = true;
                        progressed = true;
                    }
                    if !inner.written_trailer {
                        let trailers = std::mem::take(&mut inner.trailers);
                        for h in &trailers {
                            out.extend_from_slice(&h.name);
                            out.extend_from_slice(b": ");
                            out.extend_from_slice(&h.value);
                            out.extend_from_slice(b"\r\n");
                        }
                        out.extend_from_slice(b"\r\n");
                        inner.written_trailer = true;
                        progressed = true;
                    }
                }
            }
            PayloadKind::ContentLength(_) | PayloadKind::Eof | PayloadKind::Tunnel => {
                let ready = self.ready_bytes().min(max);
                if ready > 0 {
                    let body = self.pop_slice(ready);
                    out.extend_from_slice(&body);
                    progressed = true;
                }
            }
            PayloadKind::Empty => {}
        }
        progressed
    }

    /// Build one overlay `http_payload_part` answer: up to
    /// `clamp(max_chunk_size, MIN_TRANSFER_CHUNK)` bytes, any trailers that
    /// still fit in the same answer, and `last` iff nothing more will ever
    /// be produced (§4.7).
    pub fn next_transfer_part(&self, max_chunk_size: usize) -> (Bytes, Vec<Header>, bool) {
        let clamped = max_chunk_size.min(MIN_TRANSFER_CHUNK);
        let take = self.ready_bytes().min(clamped);
        let data = self.pop_slice(take);
        let mut trailers = Vec::new();
        if self.is_completed() {
            loop {
                let h = self.pop_header();
                if h.name.is_empty() {
                    break;
                }
                trailers.push(h);
            }
        }
        let last = self.is_written();
        (data, trailers, last)
    }

    /// Wait until either `ready_bytes >= threshold`, the payload completes,
    /// or it errors — whichever comes first. Used by the egress/overlay
    /// watermark-driven producers and consumers instead of a discrete
    /// per-threshold callback list.
    pub async fn wait_ready_or_done(&self, threshold: usize) {
        loop {
            if self.ready_bytes() >= threshold || self.is_completed() || self.is_error() {
                return;
            }
            let notified = self.notify.notified();
            if self.ready_bytes() >= threshold || self.is_completed() || self.is_error() {
                return;
            }
            notified.await;
        }
    }

    pub async fn wait_completed_or_error(&self) {
        loop {
            if self.is_completed() || self.is_error() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_completed() || self.is_error() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_length_completes_exactly() {
        let p = Payload::new(PayloadKind::ContentLength(5));
        let mut buf = WatermarkBuffer::new(16, 64);
        buf.push(b"hello world");
        p.parse(&mut buf).unwrap();
        assert!(p.is_completed());
        assert_eq!(p.ready_bytes(), 5);
        assert_eq!(&p.pop_slice(5)[..], b"hello");
        assert_eq!(buf.len(), 6, "leftover bytes must stay in the connection buffer");
    }

    #[test]
    fn chunked_round_trip() {
        let p = Payload::new(PayloadKind::Chunked);
        let mut buf = WatermarkBuffer::new(16, 64);
        buf.push(b"2\r\nab\r\n4\r\ncdef\r\n0\r\n\r\n");
        p.parse(&mut buf).unwrap();
        assert!(p.is_completed());
        assert_eq!(p.ready_bytes(), 6);
        let mut out = Vec::new();
        p.write_http(&mut out, 6, PayloadKind::Chunked);
        p.write_http(&mut out, 0, PayloadKind::Chunked);
        assert_eq!(out, b"2\r\nab\r\n4\r\ncdef\r\n0\r\n\r\n".to_vec());
    }

    #[test]
    fn trailer_cap_fails_payload() {
        let p = Payload::new(PayloadKind::Chunked);
        let mut buf = WatermarkBuffer::new(16, 1 << 20);
        buf.push(b"0\r\n");
        let huge_name = vec![b'x'; MAX_TRAILER_SIZE + 1];
        buf.push(&huge_name);
        buf.push(b": v\r\n\r\n");
        assert!(p.parse(&mut buf).is_err());
        assert!(p.is_error());
    }

    #[test]
    fn eof_mode_requires_explicit_complete() {
        let p = Payload::new(PayloadKind::Eof);
        let mut buf = WatermarkBuffer::new(16, 64);
        buf.push(b"partial");
        p.parse(&mut buf).unwrap();
        assert!(!p.is_completed());
        assert_eq!(p.ready_bytes(), 7);
        p.complete();
        assert!(p.is_completed());
    }

    #[tokio::test]
    async fn wait_ready_or_done_wakes_on_push() {
        let p = std::sync::Arc::new(Payload::new(PayloadKind::Eof));
        let p2 = p.clone();
        let handle = tokio::spawn(async move {
            p2.wait_ready_or_done(4).await;
        });
        tokio::task::yield_now().await;
        p.push_bytes(b"data");
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("wait_ready_or_done should resolve")
            .unwrap();
    }

    #[test]
    fn next_transfer_part_marks_last_when_written() {
        let p = Payload::new(PayloadKind::Eof);
        p.push_bytes(b"abc");
        p.complete();
        let (data, trailers, last) = p.next_transfer_part(64 * 1024);
        assert_eq!(&data[..], b"abc");
        assert!(trailers.is_empty());
        assert!(last);
    }
}
