//! Epidemic dissemination framework.
//!
//! Topology and IP allocation both ride the same machinery: named channels
//! of mergeable state. A channel is known on the wire by the 64-bit FNV-1a
//! hash of its name; payloads carry the hash so receivers can dispatch
//! without a name registry handshake.
//!
//! Three delivery modes, mirroring the message tags:
//! - **broadcast**: flooded to neighbours; merges are idempotent so
//!   duplicate delivery is harmless, and a changed merge re-broadcasts the
//!   resulting delta.
//! - **unicast**: addressed to one peer and relayed hop-by-hop along the
//!   unicast route table.
//! - **periodic**: full state pushed to every neighbour on a timer
//!   (default 30s), which heals any loss from dropped deltas.

use thiserror::Error;

use crate::peer::{PeerName, NAME_SIZE};
use crate::protocol::ProtocolError;

/// Channel carrying peer/topology records.
pub const TOPOLOGY_CHANNEL: &str = "topology";

/// Channel carrying IPAM ring and claim summaries.
pub const IPAM_CHANNEL: &str = "IPallocation";

/// Interval between periodic full-state broadcasts.
pub const PERIODIC_INTERVAL_SECS: u64 = 30;

/// Errors surfaced by channel merge callbacks.
///
/// A violation fails the connection that delivered the update; an
/// undecodable payload does the same, since framing guarantees integrity
/// end-to-end and garbage can only mean a broken or hostile peer.
#[derive(Debug, Error)]
pub enum GossipError {
    #[error("gossip violation: {0}")]
    Violation(String),

    #[error("undecodable gossip: {0}")]
    Undecodable(#[from] ProtocolError),
}

/// A named stream of mergeable state.
///
/// Implementations must keep merges commutative and idempotent: the
/// framework delivers updates in any order, possibly more than once.
pub trait Gossiper {
    /// Encode the complete local state for a periodic broadcast.
    fn gossip(&mut self) -> Vec<u8>;

    /// Merge a received broadcast. Returns the encoded delta to
    /// re-broadcast when the merge changed local state, None otherwise.
    fn on_gossip_broadcast(&mut self, update: &[u8]) -> Result<Option<Vec<u8>>, GossipError>;

    /// Handle a unicast payload addressed to this peer.
    fn on_gossip_unicast(&mut self, sender: PeerName, payload: &[u8]) -> Result<(), GossipError>;
}

/// FNV-1a hash of a channel name, the channel's wire identity.
pub fn channel_hash(name: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in name.as_bytes() {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Payload of `Gossip` and `GossipBroadcast` messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelMessage {
    pub channel: u64,
    pub payload: Vec<u8>,
}

impl ChannelMessage {
    pub fn new(channel: u64, payload: Vec<u8>) -> Self {
        ChannelMessage { channel, payload }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.payload.len());
        buf.extend_from_slice(&self.channel.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < 8 {
            return Err(ProtocolError::MessageTooShort { expected: 8, got: buf.len() });
        }
        let channel = u64::from_be_bytes(buf[..8].try_into().expect("checked length"));
        Ok(ChannelMessage { channel, payload: buf[8..].to_vec() })
    }
}

/// Payload of `GossipUnicast` messages: channel, final destination, bytes.
///
/// Intermediate peers relay the whole message unmodified towards `dest`
/// using their own route tables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnicastMessage {
    pub channel: u64,
    pub dest: PeerName,
    pub payload: Vec<u8>,
}

impl UnicastMessage {
    pub fn new(channel: u64, dest: PeerName, payload: Vec<u8>) -> Self {
        UnicastMessage { channel, dest, payload }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + NAME_SIZE + self.payload.len());
        buf.extend_from_slice(&self.channel.to_be_bytes());
        buf.extend_from_slice(&self.dest.to_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < 8 + NAME_SIZE {
            return Err(ProtocolError::MessageTooShort { expected: 8 + NAME_SIZE, got: buf.len() });
        }
        let channel = u64::from_be_bytes(buf[..8].try_into().expect("checked length"));
        let dest = PeerName::from_slice(&buf[8..]).ok_or(ProtocolError::Malformed("dest name"))?;
        Ok(UnicastMessage { channel, dest, payload: buf[8 + NAME_SIZE..].to_vec() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_hash_stable_and_distinct() {
        assert_eq!(channel_hash(TOPOLOGY_CHANNEL), channel_hash("topology"));
        assert_ne!(channel_hash(TOPOLOGY_CHANNEL), channel_hash(IPAM_CHANNEL));
        // FNV-1a reference value for the empty string.
        assert_eq!(channel_hash(""), 0xcbf29ce484222325);
    }

    #[test]
    fn test_channel_message_roundtrip() {
        let msg = ChannelMessage::new(channel_hash(TOPOLOGY_CHANNEL), vec![1, 2, 3]);
        let decoded = ChannelMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
        assert!(ChannelMessage::decode(&[0; 7]).is_err());
    }

    #[test]
    fn test_unicast_message_roundtrip() {
        let dest = PeerName::from_mac([0, 0, 0, 0, 0, 5]);
        let msg = UnicastMessage::new(channel_hash(IPAM_CHANNEL), dest, vec![9, 9]);
        let decoded = UnicastMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
        assert!(UnicastMessage::decode(&[0; 15]).is_err());
    }
}
