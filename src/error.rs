use std::fmt;

/// Crate-wide error taxonomy (design §7).
///
/// Parse errors surface as a canned `400`; upstream/transport failures as
/// `502`/`504`. Each kind stays local to the component that produced it —
/// see the concurrency notes on `connection`, `payload`, and `overlay` for
/// how far a given kind is allowed to travel.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub enum ProxyError {
    /// Malformed HTTP on the wire (line too long, bad header, duplicate
    /// Content-Length/Transfer-Encoding, oversized trailer, ...).
    Parse(String),
    /// No upstream connection could be established or accepted the query.
    UpstreamUnavailable(String),
    /// A deadline elapsed waiting for a reply.
    Timeout,
    /// The underlying transport (socket or overlay transfer) broke.
    Transport(String),
    /// The operation was abandoned, e.g. the owning connection closed.
    Cancelled,
    /// An invariant was violated; the owning actor is expected to stop.
    Fatal(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Parse(msg) => write!(f, "parse error: {msg}"),
            ProxyError::UpstreamUnavailable(msg) => write!(f, "upstream unavailable: {msg}"),
            ProxyError::Timeout => write!(f, "timeout"),
            ProxyError::Transport(msg) => write!(f, "transport error: {msg}"),
            ProxyError::Cancelled => write!(f, "cancelled"),
            ProxyError::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl std::error::Error for ProxyError {}

impl ProxyError {
    /// Canned status an inbound connection answers with for this error kind.
    pub fn canned_status(&self) -> (u16, &'static str) {
        match self {
            ProxyError::Parse(_) => (400, "Bad Request"),
            ProxyError::Timeout => (504, "Gateway Timeout"),
            ProxyError::UpstreamUnavailable(_) => (502, "Bad Gateway"),
            ProxyError::Transport(_) => (502, "Bad Gateway"),
            ProxyError::Cancelled => (502, "Bad Gateway"),
            ProxyError::Fatal(_) => (502, "Bad Gateway"),
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
