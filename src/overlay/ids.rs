//! 256-bit identifiers (design §3): `ShortId` (a node's public-key hash)
//! and `TransferId` (scopes one payload stream between two peers).
//!
//! The real implementations of both come from external collaborators (the
//! keyring and the overlay/ADNL transport); this crate only needs them as
//! opaque, comparable, hashable byte strings it can route on and log.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bits256(pub [u8; 32]);

impl Bits256 {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Parses a 48-character base64url `.adnl` literal short id, as used
    /// by `name_cache::resolve` when the host itself already names a key
    /// rather than a DNS-like alias (§4.9).
    pub fn from_adnl_literal(s: &str) -> Option<Self> {
        let decoded = URL_SAFE_NO_PAD.decode(s).ok()?;
        if decoded.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&decoded);
        Some(Self(bytes))
    }

    pub fn to_adnl_literal(self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }
}

impl fmt::Debug for Bits256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_adnl_literal())
    }
}

impl fmt::Display for Bits256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_adnl_literal())
    }
}

pub type ShortId = Bits256;
pub type TransferId = Bits256;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adnl_literal_round_trips() {
        let id = Bits256::random();
        let literal = id.to_adnl_literal();
        let parsed = Bits256::from_adnl_literal(&literal).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_wrong_length_literal() {
        assert!(Bits256::from_adnl_literal("not-a-valid-key").is_none());
    }
}
