//! `Header` value object (design §3).

use crate::error::{ProxyError, ProxyResult};

/// One `Name: value` pair. Names are kept in their original case for
/// serialization but compared case-insensitively everywhere else.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Header {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl Header {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// `len(name) + len(value) + 2` per the data model's size rule (the
    /// `": "` plus CRLF collapse to the constant `2`: one colon-space and one
    /// line terminator, matching the wire cost used for trailer-cap checks).
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + 2
    }

    pub fn name_eq_ignore_case(&self, other: &str) -> bool {
        self.name.eq_ignore_ascii_case(other.as_bytes())
    }

    pub fn value_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }

    /// Validate the name/value invariant from §3: name excludes SP, HT, CR,
    /// LF, `:`; value excludes CR, LF.
    pub fn validate(&self) -> ProxyResult<()> {
        if self.name.is_empty() {
            return Err(ProxyError::Parse("empty header name".into()));
        }
        for &b in &self.name {
            if matches!(b, b' ' | b'\t' | b'\r' | b'\n' | b':') {
                return Err(ProxyError::Parse("invalid byte in header name".into()));
            }
        }
        for &b in &self.value {
            if matches!(b, b'\r' | b'\n') {
                return Err(ProxyError::Parse("invalid byte in header value".into()));
            }
        }
        Ok(())
    }
}

/// An ordered list of headers with case-insensitive lookup, as described for
/// `Request`/`Response` in §3 ("lookups folded to lowercase").
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct HeaderList(pub Vec<Header>);

impl HeaderList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, header: Header) {
        self.0.push(header);
    }

    pub fn get(&self, name: &str) -> Option<&Header> {
        self.0.iter().find(|h| h.name_eq_ignore_case(name))
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Header> {
        self.0.iter().filter(move |h| h.name_eq_ignore_case(name))
    }

    pub fn count(&self, name: &str) -> usize {
        self.get_all(name).count()
    }

    pub fn remove_all(&mut self, name: &str) {
        self.0.retain(|h| !h.name_eq_ignore_case(name));
    }

    pub fn set(&mut self, name: &str, value: impl Into<Vec<u8>>) {
        self.remove_all(name);
        self.0.push(Header::new(name.as_bytes().to_vec(), value.into()));
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Header> {
        self.0.iter()
    }

    pub fn total_size(&self) -> usize {
        self.0.iter().map(Header::size).sum()
    }
}
