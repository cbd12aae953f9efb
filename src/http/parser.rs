//! Line-oriented incremental header parser (design §4.2).
//!
//! Each parser consumes bytes out of a `WatermarkBuffer` one line at a time
//! so it can be fed by a connection's input buffer across many `pump()`
//! passes without copying the whole backlog up front.

use crate::duplex::WatermarkBuffer;
use crate::error::{ProxyError, ProxyResult};
use crate::http::header::{Header, HeaderList};
use crate::http::message::{Method, Proto, Request, Response};

pub const MAX_LINE_SIZE: usize = 16 * 1024;
pub const MAX_HEADER_TOTAL: usize = 16 * 1024;

/// Either parsing produced nothing yet (need more bytes) or a full message.
pub enum ParseOutcome<T> {
    Pending,
    Done(T),
}

fn take_line(buf: &mut WatermarkBuffer) -> ProxyResult<Option<Vec<u8>>> {
    let Some(idx) = buf.find_newline() else {
        if buf.len() > MAX_LINE_SIZE {
            return Err(ProxyError::Parse("line too long".into()));
        }
        return Ok(None);
    };
    if idx + 1 > MAX_LINE_SIZE {
        return Err(ProxyError::Parse("line too long".into()));
    }
    let mut line = buf.drain(idx + 1);
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(line))
}

fn split_header_line(line: &[u8]) -> ProxyResult<Header> {
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| ProxyError::Parse("header line missing ':'".into()))?;
    let name = line[..colon].to_vec();
    let mut value = &line[colon + 1..];
    while value.first() == Some(&b' ') || value.first() == Some(&b'\t') {
        value = &value[1..];
    }
    while value.last() == Some(&b' ') || value.last() == Some(&b'\t') {
        value = &value[..value.len() - 1];
    }
    let header = Header::new(name, value.to_vec());
    header.validate()?;
    Ok(header)
}

struct HeaderAccumulator {
    headers: HeaderList,
    total: usize,
}

impl HeaderAccumulator {
    fn new() -> Self {
        Self {
            headers: HeaderList::new(),
            total: 0,
        }
    }

    fn push(&mut self, header: Header) -> ProxyResult<()> {
        self.total += header.size();
        if self.total > MAX_HEADER_TOTAL {
            return Err(ProxyError::Parse("header block too large".into()));
        }
        self.headers.push(header);
        Ok(())
    }
}

enum RequestPhase {
    StartLine,
    Headers { start: (Method, Vec<u8>, Proto), acc: HeaderAccumulator },
}

pub struct RequestParser {
    phase: RequestPhase,
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            phase: RequestPhase::StartLine,
        }
    }

    pub fn feed(&mut self, buf: &mut WatermarkBuffer) -> ProxyResult<ParseOutcome<Request>> {
        loop {
            match &mut self.phase {
                RequestPhase::StartLine => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(ParseOutcome::Pending);
                    };
                    let text = String::from_utf8(line)
                        .map_err(|_| ProxyError::Parse("non-UTF8 request line".into()))?;
                    let mut parts = text.splitn(3, ' ');
                    let method = parts
                        .next()
                        .ok_or_else(|| ProxyError::Parse("missing method".into()))?;
                    let url = parts
                        .next()
                        .ok_or_else(|| ProxyError::Parse("missing url".into()))?;
                    let proto = parts
                        .next()
                        .ok_or_else(|| ProxyError::Parse("missing proto".into()))?;
                    let method = Method::parse(method)?;
                    let proto = Proto::parse(proto.trim())?;
                    self.phase = RequestPhase::Headers {
                        start: (method, url.as_bytes().to_vec(), proto),
                        acc: HeaderAccumulator::new(),
                    };
                }
                RequestPhase::Headers { start, acc } => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(ParseOutcome::Pending);
                    };
                    if line.is_empty() {
                        let (method, url, proto) = start.clone();
                        let headers = std::mem::take(&mut acc.headers);
                        return Ok(ParseOutcome::Done(Request::new(method, url, proto, headers)?));
                    }
                    let header = split_header_line(&line)?;
                    acc.push(header)?;
                }
            }
        }
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

enum ResponsePhase {
    StartLine,
    Headers { start: (Proto, u16, String), acc: HeaderAccumulator },
}

pub struct ResponseParser {
    phase: ResponsePhase,
    force_no_payload: bool,
    is_tunnel: bool,
    request_keep_alive: bool,
}

impl ResponseParser {
    pub fn new(force_no_payload: bool, is_tunnel: bool, request_keep_alive: bool) -> Self {
        Self {
            phase: ResponsePhase::StartLine,
            force_no_payload,
            is_tunnel,
            request_keep_alive,
        }
    }

    /// Returns `Ok(ParseOutcome::Done(None))` for an absorbed `100 Continue`
    /// informational response (§4.4: "silently discarded and parsing
    /// resumes").
    pub fn feed(&mut self, buf: &mut WatermarkBuffer) -> ProxyResult<ParseOutcome<Option<Response>>> {
        loop {
            match &mut self.phase {
                ResponsePhase::StartLine => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(ParseOutcome::Pending);
                    };
                    let text = String::from_utf8(line)
                        .map_err(|_| ProxyError::Parse("non-UTF8 status line".into()))?;
                    let mut parts = text.splitn(3, ' ');
                    let proto = parts
                        .next()
                        .ok_or_else(|| ProxyError::Parse("missing proto".into()))?;
                    let code = parts
                        .next()
                        .ok_or_else(|| ProxyError::Parse("missing status code".into()))?;
                    let reason = parts.next().unwrap_or("").to_string();
                    let proto = Proto::parse(proto.trim())?;
                    let code: u16 = code
                        .trim()
                        .parse()
                        .map_err(|_| ProxyError::Parse("invalid status code".into()))?;
                    self.phase = ResponsePhase::Headers {
                        start: (proto, code, reason),
                        acc: HeaderAccumulator::new(),
                    };
                }
                ResponsePhase::Headers { start, acc } => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(ParseOutcome::Pending);
                    };
                    if line.is_empty() {
                        let (proto, code, reason) = start.clone();
                        let headers = std::mem::take(&mut acc.headers);
                        if code == 100 {
                            self.phase = ResponsePhase::StartLine;
                            return Ok(ParseOutcome::Done(None));
                        }
                        let resp = Response::new(
                            proto,
                            code,
                            reason,
                            headers,
                            self.force_no_payload,
                            self.is_tunnel,
                            self.request_keep_alive,
                        )?;
                        return Ok(ParseOutcome::Done(Some(resp)));
                    }
                    let header = split_header_line(&line)?;
                    acc.push(header)?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get() {
        let mut buf = WatermarkBuffer::new(16, 64);
        buf.push(b"GET / HTTP/1.1\r\nHost: example.ton\r\nConnection: close\r\n\r\n");
        let mut parser = RequestParser::new();
        match parser.feed(&mut buf).unwrap() {
            ParseOutcome::Done(req) => {
                assert_eq!(req.method, Method::Get);
                assert_eq!(req.url, b"/");
                assert_eq!(req.host().unwrap(), "example.ton");
                assert!(!req.keep_alive);
            }
            ParseOutcome::Pending => panic!("expected done"),
        }
    }

    #[test]
    fn incremental_feed_across_chunks() {
        let mut buf = WatermarkBuffer::new(16, 64);
        let mut parser = RequestParser::new();
        buf.push(b"GET / HTTP/1.1\r\n");
        assert!(matches!(parser.feed(&mut buf).unwrap(), ParseOutcome::Pending));
        buf.push(b"Host: x\r\n\r\n");
        assert!(matches!(parser.feed(&mut buf).unwrap(), ParseOutcome::Done(_)));
    }

    #[test]
    fn rejects_oversized_line() {
        let mut buf = WatermarkBuffer::new(16, 1 << 20);
        let mut line = vec![b'a'; MAX_LINE_SIZE + 10];
        line.extend_from_slice(b"\r\n");
        buf.push(&line);
        let mut parser = RequestParser::new();
        assert!(parser.feed(&mut buf).is_err());
    }

    #[test]
    fn absorbs_100_continue() {
        let mut buf = WatermarkBuffer::new(16, 64);
        buf.push(b"HTTP/1.1 100 Continue\r\n\r\n");
        buf.push(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        let mut parser = ResponseParser::new(false, false, true);
        match parser.feed(&mut buf).unwrap() {
            ParseOutcome::Done(None) => {}
            _ => panic!("expected absorbed 100 continue"),
        }
        match parser.feed(&mut buf).unwrap() {
            ParseOutcome::Done(Some(resp)) => assert_eq!(resp.code, 200),
            _ => panic!("expected final response"),
        }
    }
}
