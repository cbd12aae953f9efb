//! Overlay wire messages (design §4.7/§6).
//!
//! The real schema is TL (an external, code-generated serialization the
//! keyring/ADNL/RLDP stack already speaks); this crate only needs stable
//! Rust value types for the five message shapes plus something that can
//! round-trip them across the `OverlayTransport` seam. `bincode` stands in
//! for the TL codec here — swapping it for the generated TL bindings is a
//! boundary change, not a logic change, matching §1's "TL serialization of
//! wire objects ... out of scope" framing.

use serde::{Deserialize, Serialize};

use crate::http::header::{Header, HeaderList};
use crate::overlay::ids::TransferId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireHeader {
    pub name: String,
    pub value: String,
}

impl From<&Header> for WireHeader {
    fn from(h: &Header) -> Self {
        Self {
            name: String::from_utf8_lossy(&h.name).into_owned(),
            value: String::from_utf8_lossy(&h.value).into_owned(),
        }
    }
}

impl WireHeader {
    pub fn into_header(self) -> Header {
        Header::new(self.name.into_bytes(), self.value.into_bytes())
    }
}

pub fn headers_to_wire(headers: &HeaderList) -> Vec<WireHeader> {
    headers.iter().map(WireHeader::from).collect()
}

pub fn wire_to_headers(wire: Vec<WireHeader>) -> HeaderList {
    let mut list = HeaderList::new();
    for h in wire {
        list.push(h.into_header());
    }
    list
}

/// `http_request { transfer_id, method, url, proto, headers[] }` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequestWire {
    pub transfer_id: TransferId,
    pub method: String,
    pub url: String,
    pub proto: String,
    pub headers: Vec<WireHeader>,
}

/// `http_response { proto, code, reason, headers[], no_payload }` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponseWire {
    pub proto: String,
    pub code: u32,
    pub reason: String,
    pub headers: Vec<WireHeader>,
    pub no_payload: bool,
}

/// `http_get_next_payload_part { id, seqno, max_chunk_size }` (§6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GetNextPayloadPart {
    pub id: TransferId,
    pub seqno: i32,
    pub max_chunk_size: i32,
}

/// `http_payload_part { data, trailers[], last }` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadPartWire {
    pub data: Vec<u8>,
    pub trailers: Vec<WireHeader>,
    pub last: bool,
}

/// Opcode prefix used for query routing (§4.7 "prefix-matched query
/// routing" design note): `{opcode || transfer_id}`.
pub const OPCODE_GET_NEXT_PART: u32 = 0x6e_6578_74; // ASCII "next"-ish tag, arbitrary but stable

/// `http_request` queries are not scoped to a transfer yet — they're what
/// allocates one — so they're routed on the opcode alone, against a
/// standing subscription the ingress side installs once at start-up.
pub const OPCODE_HTTP_REQUEST: u32 = 0x68_7474_70; // "http"-ish tag, arbitrary but stable

pub const QUERY_PREFIX_LEN: usize = 4 + 32;

pub fn query_prefix(id: TransferId) -> Vec<u8> {
    let mut out = Vec::with_capacity(QUERY_PREFIX_LEN);
    out.extend_from_slice(&OPCODE_GET_NEXT_PART.to_le_bytes());
    out.extend_from_slice(&id.0);
    out
}

pub fn request_prefix() -> Vec<u8> {
    OPCODE_HTTP_REQUEST.to_le_bytes().to_vec()
}

pub fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("wire types are always serializable")
}

pub fn decode<T: for<'a> Deserialize<'a>>(bytes: &[u8]) -> crate::error::ProxyResult<T> {
    bincode::deserialize(bytes).map_err(|e| crate::error::ProxyError::Parse(format!("bad wire payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_stable_per_transfer() {
        let id = TransferId::random();
        assert_eq!(query_prefix(id), query_prefix(id));
        assert_ne!(query_prefix(id), query_prefix(TransferId::random()));
    }

    #[test]
    fn part_round_trips() {
        let part = PayloadPartWire {
            data: b"hello".to_vec(),
            trailers: vec![WireHeader { name: "X-Trailer".into(), value: "1".into() }],
            last: true,
        };
        let bytes = encode(&part);
        let decoded: PayloadPartWire = decode(&bytes).unwrap();
        assert_eq!(decoded.data, part.data);
        assert!(decoded.last);
    }
}
