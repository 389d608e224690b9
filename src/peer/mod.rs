//! Peer records.
//!
//! A [`Peer`] is what the topology gossip moves around: one router's view of
//! itself, stamped with a monotonically increasing version. Two records with
//! the same name but different UIDs belong to different incarnations of the
//! same router; merges always prefer the higher version.

mod name;

pub use name::{NameError, PeerName, NAME_SIZE};

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use serde::Serialize;

use crate::protocol::{wire, ProtocolError};

/// What a peer advertises about one of its connections.
///
/// Outbound connections carry the address that was dialled, so other peers
/// can learn it as a connection target. Inbound connections advertise no
/// address; the remote's own record supplies one if it has it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionSummary {
    /// Address this peer dialled to reach the remote, if it was the initiator.
    pub remote_addr: Option<SocketAddr>,
}

/// One router's gossiped state: identity plus its connection set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Peer {
    pub name: PeerName,
    pub nick_name: String,
    /// Random per-process value; distinguishes restarts of the same name.
    pub uid: u64,
    /// Bumped by the owning router on every connection change.
    pub version: u64,
    /// Peers this router is connected to, keyed by their name.
    /// BTreeMap so re-encoding an unchanged record is byte-identical.
    pub connections: BTreeMap<PeerName, ConnectionSummary>,
}

impl Peer {
    /// Create a fresh local peer record with a random UID and version 0.
    pub fn new(name: PeerName, nick_name: impl Into<String>, uid: u64) -> Self {
        Peer {
            name,
            nick_name: nick_name.into(),
            uid,
            version: 0,
            connections: BTreeMap::new(),
        }
    }

    /// True when this record and `other` describe different incarnations.
    pub fn different_incarnation(&self, other: &Peer) -> bool {
        self.name == other.name && self.uid != other.uid
    }

    /// Names of peers this record claims a connection to.
    pub fn connected_names(&self) -> impl Iterator<Item = &PeerName> {
        self.connections.keys()
    }

    /// Append the wire encoding of this record to `buf`.
    ///
    /// Layout: name(8) uid(8) version(8) nick(u16-len + utf8)
    /// connection count(u16), then per connection: name(8),
    /// addr flag(1) + addr string when present.
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.name.to_bytes());
        buf.extend_from_slice(&self.uid.to_be_bytes());
        buf.extend_from_slice(&self.version.to_be_bytes());
        wire::put_str(buf, &self.nick_name);
        wire::put_u16(buf, self.connections.len() as u16);
        for (name, summary) in &self.connections {
            buf.extend_from_slice(&name.to_bytes());
            match &summary.remote_addr {
                Some(addr) => {
                    buf.push(1);
                    wire::put_str(buf, &addr.to_string());
                }
                None => buf.push(0),
            }
        }
    }

    /// Wire encoding as a standalone buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        self.encode_to(&mut buf);
        buf
    }

    /// Decode one record from the front of `buf`, returning it and the
    /// number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Peer, usize), ProtocolError> {
        let mut r = wire::Reader::new(buf);
        let name = PeerName::from_bytes(r.take_array()?);
        let uid = u64::from_be_bytes(r.take_array()?);
        let version = u64::from_be_bytes(r.take_array()?);
        let nick_name = r.take_str()?;
        let count = r.take_u16()?;
        let mut connections = BTreeMap::new();
        for _ in 0..count {
            let peer = PeerName::from_bytes(r.take_array()?);
            let summary = match r.take_u8()? {
                0 => ConnectionSummary { remote_addr: None },
                1 => {
                    let addr = r.take_str()?;
                    let addr = addr
                        .parse()
                        .map_err(|_| ProtocolError::Malformed("connection address"))?;
                    ConnectionSummary { remote_addr: Some(addr) }
                }
                _ => return Err(ProtocolError::Malformed("address flag")),
            };
            connections.insert(peer, summary);
        }
        let peer = Peer { name, nick_name, uid, version, connections };
        Ok((peer, r.consumed()))
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.nick_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_peer() -> Peer {
        let mut peer = Peer::new(PeerName::from_mac([0, 0, 0, 0, 0, 1]), "alpha", 42);
        peer.version = 3;
        peer.connections.insert(
            PeerName::from_mac([0, 0, 0, 0, 0, 2]),
            ConnectionSummary { remote_addr: Some("10.0.0.2:6783".parse().unwrap()) },
        );
        peer.connections
            .insert(PeerName::from_mac([0, 0, 0, 0, 0, 3]), ConnectionSummary::default());
        peer
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let peer = sample_peer();
        let encoded = peer.encode();
        let (decoded, consumed) = Peer::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, peer);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let peer = sample_peer();
        assert_eq!(peer.encode(), peer.clone().encode());
    }

    #[test]
    fn test_decode_truncated() {
        let encoded = sample_peer().encode();
        for len in [0, 7, 23, encoded.len() - 1] {
            assert!(Peer::decode(&encoded[..len]).is_err(), "len {} should fail", len);
        }
    }

    #[test]
    fn test_different_incarnation() {
        let a = sample_peer();
        let mut b = a.clone();
        assert!(!a.different_incarnation(&b));
        b.uid = 43;
        assert!(a.different_incarnation(&b));
    }
}
