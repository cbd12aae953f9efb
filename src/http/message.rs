//! Request/Response value objects and the `PayloadKind` body descriptor
//! (design §3, body presence table).

use crate::error::{ProxyError, ProxyResult};
use crate::http::header::HeaderList;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
        }
    }

    pub fn parse(s: &str) -> ProxyResult<Self> {
        Ok(match s {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "CONNECT" => Method::Connect,
            "OPTIONS" => Method::Options,
            "TRACE" => Method::Trace,
            other => return Err(ProxyError::Parse(format!("unsupported method {other}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Proto {
    Http10,
    Http11,
}

impl Proto {
    pub fn as_str(self) -> &'static str {
        match self {
            Proto::Http10 => "HTTP/1.0",
            Proto::Http11 => "HTTP/1.1",
        }
    }

    pub fn parse(s: &str) -> ProxyResult<Self> {
        Ok(match s {
            "HTTP/1.0" => Proto::Http10,
            "HTTP/1.1" => Proto::Http11,
            other => return Err(ProxyError::Parse(format!("unsupported protocol {other}"))),
        })
    }
}

/// Body descriptor driving how a `Payload` parses and serializes (§3/§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Empty,
    Eof,
    Chunked,
    ContentLength(u64),
    Tunnel,
}

fn connection_keep_alive(headers: &HeaderList, default: bool) -> bool {
    let mut keep_alive = default;
    if let Some(h) = headers.get("Connection") {
        let v = h.value_str().trim().to_ascii_lowercase();
        if v == "keep-alive" {
            keep_alive = true;
        } else if v == "close" {
            keep_alive = false;
        }
    }
    if let Some(h) = headers.get("Proxy-Connection") {
        let v = h.value_str().trim().to_ascii_lowercase();
        if v == "keep-alive" {
            keep_alive = true;
        } else if v == "close" {
            keep_alive = false;
        }
    }
    keep_alive
}

/// Reject duplicate/conflicting framing headers — Content-Length and
/// Transfer-Encoding are coupled per the Open Question in §9: either one
/// repeated, or both present together, is a parse error.
fn framing_headers(headers: &HeaderList) -> ProxyResult<(Option<u64>, bool)> {
    let cl_count = headers.count("Content-Length");
    let te_count = headers.count("Transfer-Encoding");
    if cl_count > 1 || te_count > 1 {
        return Err(ProxyError::Parse("duplicate framing header".into()));
    }
    if cl_count == 1 && te_count == 1 {
        return Err(ProxyError::Parse(
            "both Content-Length and Transfer-Encoding present".into(),
        ));
    }
    let content_length = match headers.get("Content-Length") {
        Some(h) => Some(
            h.value_str()
                .trim()
                .parse::<u64>()
                .map_err(|_| ProxyError::Parse("invalid Content-Length".into()))?,
        ),
        None => None,
    };
    let has_transfer_encoding = te_count == 1;
    Ok((content_length, has_transfer_encoding))
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Vec<u8>,
    pub proto: Proto,
    pub headers: HeaderList,
    pub content_length: Option<u64>,
    pub has_transfer_encoding: bool,
    pub keep_alive: bool,
    pub parse_complete: bool,
}

impl Request {
    pub fn new(method: Method, url: Vec<u8>, proto: Proto, headers: HeaderList) -> ProxyResult<Self> {
        if headers.count("Host") > 1 {
            return Err(ProxyError::Parse("duplicate Host header".into()));
        }
        let (content_length, has_transfer_encoding) = framing_headers(&headers)?;
        let default_keep_alive = proto == Proto::Http11;
        let keep_alive = connection_keep_alive(&headers, default_keep_alive);
        Ok(Self {
            method,
            url,
            proto,
            headers,
            content_length,
            has_transfer_encoding,
            keep_alive,
            parse_complete: true,
        })
    }

    pub fn host(&self) -> Option<String> {
        self.headers.get("Host").map(|h| h.value_str().trim().to_string())
    }

    /// Body presence rule from §3: CONNECT always has a body-shaped
    /// semantics (the tunnel stream); otherwise framing headers decide.
    pub fn need_payload(&self) -> bool {
        self.method == Method::Connect || self.content_length.is_some() || self.has_transfer_encoding
    }

    pub fn payload_kind(&self) -> PayloadKind {
        if self.method == Method::Connect {
            return PayloadKind::Tunnel;
        }
        if self.has_transfer_encoding {
            return PayloadKind::Chunked;
        }
        if let Some(n) = self.content_length {
            return PayloadKind::ContentLength(n);
        }
        PayloadKind::Empty
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub proto: Proto,
    pub code: u16,
    pub reason: String,
    pub headers: HeaderList,
    pub keep_alive: bool,
    pub force_no_payload: bool,
    pub is_tunnel: bool,
    pub content_length: Option<u64>,
    pub has_transfer_encoding: bool,
}

impl Response {
    pub fn new(
        proto: Proto,
        code: u16,
        reason: String,
        headers: HeaderList,
        force_no_payload: bool,
        is_tunnel: bool,
        request_keep_alive: bool,
    ) -> ProxyResult<Self> {
        if !(100..=999).contains(&code) {
            return Err(ProxyError::Parse("status code out of range".into()));
        }
        let (content_length, has_transfer_encoding) = framing_headers(&headers)?;
        let default_keep_alive = request_keep_alive && proto == Proto::Http11;
        let keep_alive = connection_keep_alive(&headers, default_keep_alive);
        Ok(Self {
            proto,
            code,
            reason,
            headers,
            keep_alive,
            force_no_payload,
            is_tunnel,
            content_length,
            has_transfer_encoding,
        })
    }

    /// §3: `need_payload` iff not `force_no_payload` and `code >= 200` and
    /// `code` is not `204`/`304`.
    pub fn need_payload(&self) -> bool {
        !self.force_no_payload && self.code >= 200 && self.code != 204 && self.code != 304
    }

    pub fn payload_kind(&self) -> PayloadKind {
        if self.is_tunnel {
            return PayloadKind::Tunnel;
        }
        if !self.need_payload() {
            return PayloadKind::Empty;
        }
        if self.has_transfer_encoding {
            return PayloadKind::Chunked;
        }
        if let Some(n) = self.content_length {
            return PayloadKind::ContentLength(n);
        }
        PayloadKind::Eof
    }

    /// §4.7 design notes: a response forwarded across the overlay has no
    /// raw-socket close to frame an EOF body, so if the upstream answer
    /// needed a body but supplied neither header, inject `Transfer-Encoding:
    /// chunked` before it's handed back to the downstream client.
    pub fn inject_chunked_if_unframed(&mut self) {
        if self.need_payload() && matches!(self.payload_kind(), PayloadKind::Eof) {
            self.headers.set("Transfer-Encoding", b"chunked".to_vec());
            self.has_transfer_encoding = true;
        }
    }

    pub fn canned(proto: Proto, code: u16, reason: &str, keep_alive: bool) -> Self {
        let mut headers = HeaderList::new();
        headers.set("Content-Length", b"0".to_vec());
        Self {
            proto,
            code,
            reason: reason.to_string(),
            headers,
            keep_alive,
            force_no_payload: true,
            is_tunnel: false,
            content_length: Some(0),
            has_transfer_encoding: false,
        }
    }

    pub fn connect_established() -> Self {
        Self {
            proto: Proto::Http10,
            code: 200,
            reason: "Connection Established".to_string(),
            headers: HeaderList::new(),
            keep_alive: true,
            force_no_payload: true,
            is_tunnel: true,
            content_length: None,
            has_transfer_encoding: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::header::Header;

    #[test]
    fn duplicate_content_length_rejected() {
        let mut headers = HeaderList::new();
        headers.push(Header::new(b"Content-Length".to_vec(), b"1".to_vec()));
        headers.push(Header::new(b"Content-Length".to_vec(), b"2".to_vec()));
        assert!(Request::new(Method::Get, b"/".to_vec(), Proto::Http11, headers).is_err());
    }

    #[test]
    fn content_length_and_transfer_encoding_rejected() {
        let mut headers = HeaderList::new();
        headers.push(Header::new(b"Content-Length".to_vec(), b"1".to_vec()));
        headers.push(Header::new(b"Transfer-Encoding".to_vec(), b"chunked".to_vec()));
        assert!(Request::new(Method::Post, b"/".to_vec(), Proto::Http11, headers).is_err());
    }

    #[test]
    fn keep_alive_defaults_and_overrides() {
        let headers = HeaderList::new();
        let req = Request::new(Method::Get, b"/".to_vec(), Proto::Http11, headers).unwrap();
        assert!(req.keep_alive);

        let mut headers = HeaderList::new();
        headers.push(Header::new(b"Connection".to_vec(), b"close".to_vec()));
        let req = Request::new(Method::Get, b"/".to_vec(), Proto::Http11, headers).unwrap();
        assert!(!req.keep_alive);
    }

    #[test]
    fn response_head_has_no_body() {
        let headers = HeaderList::new();
        let resp = Response::new(Proto::Http11, 200, "OK".into(), headers, true, false, true).unwrap();
        assert!(!resp.need_payload());
    }

    #[test]
    fn response_204_has_no_body() {
        let headers = HeaderList::new();
        let resp = Response::new(Proto::Http11, 204, "No Content".into(), headers, false, false, true).unwrap();
        assert!(!resp.need_payload());
    }
}
