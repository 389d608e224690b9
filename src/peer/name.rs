//! Peer naming.
//!
//! A `PeerName` is the stable 64-bit identity of a router instance. It is
//! normally derived from the MAC address of the bridge interface the router
//! captures on, which makes it survive restarts; the accompanying UID (see
//! [`Peer`](crate::peer::Peer)) is regenerated on every start and tells
//! incarnations of the same name apart.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of a peer name on the wire (big-endian u64).
pub const NAME_SIZE: usize = 8;

/// Errors from parsing a peer name out of user input.
#[derive(Debug, Error)]
pub enum NameError {
    #[error("invalid peer name '{0}': expected colon-separated hex octets")]
    Malformed(String),
}

/// Stable 64-bit peer identity, rendered as colon-separated hex.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerName(u64);

impl PeerName {
    /// The all-zero name, used as a sentinel before identity is known.
    pub const UNKNOWN: PeerName = PeerName(0);

    /// Construct from a raw 64-bit value.
    pub fn from_u64(v: u64) -> Self {
        PeerName(v)
    }

    /// Construct from a 48-bit MAC address.
    pub fn from_mac(mac: [u8; 6]) -> Self {
        let mut bytes = [0u8; 8];
        bytes[2..].copy_from_slice(&mac);
        PeerName(u64::from_be_bytes(bytes))
    }

    /// Parse user input: 2 to 8 colon-separated hex octets, MAC style.
    pub fn from_user_input(s: &str) -> Result<Self, NameError> {
        let octets: Vec<&str> = s.split(':').collect();
        if octets.len() < 2 || octets.len() > 8 {
            return Err(NameError::Malformed(s.to_string()));
        }
        let mut v: u64 = 0;
        for octet in octets {
            let b =
                u8::from_str_radix(octet, 16).map_err(|_| NameError::Malformed(s.to_string()))?;
            v = (v << 8) | u64::from(b);
        }
        Ok(PeerName(v))
    }

    /// Raw 64-bit value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Wire encoding: 8 bytes big-endian, so byte order equals name order.
    pub fn to_bytes(&self) -> [u8; NAME_SIZE] {
        self.0.to_be_bytes()
    }

    /// Decode from wire bytes.
    pub fn from_bytes(bytes: [u8; NAME_SIZE]) -> Self {
        PeerName(u64::from_be_bytes(bytes))
    }

    /// Decode from the front of a buffer, if long enough.
    pub fn from_slice(buf: &[u8]) -> Option<Self> {
        let bytes: [u8; NAME_SIZE] = buf.get(..NAME_SIZE)?.try_into().ok()?;
        Some(Self::from_bytes(bytes))
    }
}

impl fmt::Display for PeerName {
    /// Renders the low 48 bits MAC-style; wider names get all 8 octets.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_be_bytes();
        let start = if bytes[0] == 0 && bytes[1] == 0 { 2 } else { 0 };
        let rendered: Vec<String> = bytes[start..].iter().map(|b| format!("{:02x}", b)).collect();
        write!(f, "{}", rendered.join(":"))
    }
}

impl fmt::Debug for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerName({})", self)
    }
}

impl FromStr for PeerName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_user_input(s)
    }
}
