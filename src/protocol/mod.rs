//! Wire protocol.
//!
//! TCP carries control traffic as length-prefixed frames: a 4-byte
//! big-endian length, then the frame body. During the handshake the body is
//! a [`Greeting`] or an ephemeral public key; once a connection is
//! established the body is `tag || payload` (AEAD-sealed as a whole when
//! encryption is on). UDP carries data frames and heartbeats with a
//! 1-byte tag plus the 8-byte sender name in front of the body.

use std::fmt;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::peer::{PeerName, NAME_SIZE};

/// Protocol identification string exchanged in the greeting.
pub const PROTOCOL_TAG: &[u8] = b"weave";

/// Protocol version; bumped on incompatible wire changes.
pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound on a single framed message.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024;

/// Errors raised while encoding or decoding protocol messages.
///
/// Any of these on a live connection is a protocol violation: the
/// connection is failed, the router keeps running.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message too short: expected {expected} bytes, got {got}")]
    MessageTooShort { expected: usize, got: usize },

    #[error("malformed field: {0}")]
    Malformed(&'static str),

    #[error("oversize message: {0} bytes")]
    OversizeMessage(usize),

    #[error("unknown message tag: {0}")]
    UnknownTag(u8),

    #[error("remote is not speaking our protocol")]
    BadProtocolTag,

    #[error("protocol version mismatch: remote speaks {0}")]
    VersionMismatch(u8),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Message tags, shared by the TCP frame stream and UDP datagrams.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageTag {
    /// Encapsulated Ethernet frame (UDP only).
    FrameForward = 0,
    /// Liveness probe padded to the current PMTU (UDP only).
    Heartbeat = 1,
    /// Ack that the sender has heard our heartbeat (TCP).
    ConnectionEstablished = 2,
    /// PMTU probe padded to a candidate size (UDP only).
    FragmentationTest = 3,
    /// Ack naming the probe size that arrived intact (TCP).
    PmtuVerified = 4,
    /// Gossip addressed to a single peer, relayed along routes (TCP).
    GossipUnicast = 5,
    /// Gossip flooded to all neighbours (TCP).
    GossipBroadcast = 6,
    /// Periodic full-state gossip to a neighbour (TCP).
    Gossip = 7,
}

impl MessageTag {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(MessageTag::FrameForward),
            1 => Some(MessageTag::Heartbeat),
            2 => Some(MessageTag::ConnectionEstablished),
            3 => Some(MessageTag::FragmentationTest),
            4 => Some(MessageTag::PmtuVerified),
            5 => Some(MessageTag::GossipUnicast),
            6 => Some(MessageTag::GossipBroadcast),
            7 => Some(MessageTag::Gossip),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageTag::FrameForward => "FrameForward",
            MessageTag::Heartbeat => "Heartbeat",
            MessageTag::ConnectionEstablished => "ConnectionEstablished",
            MessageTag::FragmentationTest => "FragmentationTest",
            MessageTag::PmtuVerified => "PmtuVerified",
            MessageTag::GossipUnicast => "GossipUnicast",
            MessageTag::GossipBroadcast => "GossipBroadcast",
            MessageTag::Gossip => "Gossip",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// TCP framing
// ============================================================================

/// Prefix `body` with its 4-byte big-endian length.
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(body);
    buf
}

/// Build a tagged frame body.
pub fn message(tag: MessageTag, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + payload.len());
    body.push(tag.to_byte());
    body.extend_from_slice(payload);
    body
}

/// Split a frame body into tag and payload.
pub fn split_message(body: &[u8]) -> Result<(MessageTag, &[u8]), ProtocolError> {
    let (&tag, payload) = body
        .split_first()
        .ok_or(ProtocolError::MessageTooShort { expected: 1, got: 0 })?;
    let tag = MessageTag::from_byte(tag).ok_or(ProtocolError::UnknownTag(tag))?;
    Ok((tag, payload))
}

/// Read one length-prefixed frame body from `r`.
pub async fn read_frame<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(ProtocolError::OversizeMessage(len));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(body)
}

/// Write one length-prefixed frame body to `w`.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    body: &[u8],
) -> Result<(), ProtocolError> {
    if body.len() > MAX_MESSAGE_LEN {
        return Err(ProtocolError::OversizeMessage(body.len()));
    }
    w.write_all(&(body.len() as u32).to_be_bytes()).await?;
    w.write_all(body).await?;
    Ok(())
}

// ============================================================================
// UDP datagram header
// ============================================================================

/// Fixed UDP header: tag(1) + sender name(8).
pub const UDP_HEADER_SIZE: usize = 1 + NAME_SIZE;

/// Build a UDP datagram: tag, sender name, body.
pub fn udp_datagram(tag: MessageTag, sender: PeerName, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(UDP_HEADER_SIZE + body.len());
    buf.push(tag.to_byte());
    buf.extend_from_slice(&sender.to_bytes());
    buf.extend_from_slice(body);
    buf
}

/// Split a UDP datagram into tag, sender name and body.
pub fn split_udp_datagram(buf: &[u8]) -> Result<(MessageTag, PeerName, &[u8]), ProtocolError> {
    if buf.len() < UDP_HEADER_SIZE {
        return Err(ProtocolError::MessageTooShort { expected: UDP_HEADER_SIZE, got: buf.len() });
    }
    let tag = MessageTag::from_byte(buf[0]).ok_or(ProtocolError::UnknownTag(buf[0]))?;
    let sender = PeerName::from_slice(&buf[1..]).ok_or(ProtocolError::Malformed("sender name"))?;
    Ok((tag, sender, &buf[UDP_HEADER_SIZE..]))
}

// ============================================================================
// Greeting
// ============================================================================

/// First frame each direction sends on a new TCP connection, in plaintext.
///
/// ## Wire Format
///
/// | Offset | Field             | Size    | Notes                        |
/// |--------|-------------------|---------|------------------------------|
/// | 0      | protocol tag      | 5 bytes | `"weave"`                    |
/// | 5      | protocol version  | 1 byte  | currently 1                  |
/// | 6      | password expected | 1 byte  | 0 or 1; must match both ends |
/// | 7      | peer name         | 8 bytes |                              |
/// | 15     | uid               | 8 bytes |                              |
/// | 23     | nickname          | u16-len + utf8                         |
/// | ...    | udp port          | 2 bytes |                              |
///
/// The password flag sits before any authenticated bytes so a mixed
/// cluster is rejected without leaking key material.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Greeting {
    pub password_expected: bool,
    pub name: PeerName,
    pub uid: u64,
    pub nick_name: String,
    pub udp_port: u16,
}

impl Greeting {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + self.nick_name.len());
        buf.extend_from_slice(PROTOCOL_TAG);
        buf.push(PROTOCOL_VERSION);
        buf.push(self.password_expected as u8);
        buf.extend_from_slice(&self.name.to_bytes());
        buf.extend_from_slice(&self.uid.to_be_bytes());
        wire::put_str(&mut buf, &self.nick_name);
        wire::put_u16(&mut buf, self.udp_port);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = wire::Reader::new(buf);
        let tag: [u8; 5] = r.take_array()?;
        if tag != PROTOCOL_TAG {
            return Err(ProtocolError::BadProtocolTag);
        }
        let version = r.take_u8()?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(version));
        }
        let password_expected = match r.take_u8()? {
            0 => false,
            1 => true,
            _ => return Err(ProtocolError::Malformed("password flag")),
        };
        let name = PeerName::from_bytes(r.take_array()?);
        let uid = u64::from_be_bytes(r.take_array()?);
        let nick_name = r.take_str()?;
        let udp_port = r.take_u16()?;
        Ok(Greeting { password_expected, name, uid, nick_name, udp_port })
    }
}

// ============================================================================
// Low-level field helpers
// ============================================================================

/// Byte-level helpers shared by the hand-rolled codecs.
pub mod wire {
    use super::ProtocolError;

    pub fn put_u16(buf: &mut Vec<u8>, v: u16) {
        buf.extend_from_slice(&v.to_be_bytes());
    }

    /// u16 length prefix, then UTF-8 bytes.
    pub fn put_str(buf: &mut Vec<u8>, s: &str) {
        put_u16(buf, s.len() as u16);
        buf.extend_from_slice(s.as_bytes());
    }

    /// Sequential reader over a byte slice, tracking consumption.
    pub struct Reader<'a> {
        buf: &'a [u8],
        pos: usize,
    }

    impl<'a> Reader<'a> {
        pub fn new(buf: &'a [u8]) -> Self {
            Reader { buf, pos: 0 }
        }

        pub fn consumed(&self) -> usize {
            self.pos
        }

        pub fn remaining(&self) -> &'a [u8] {
            &self.buf[self.pos..]
        }

        pub fn is_empty(&self) -> bool {
            self.pos == self.buf.len()
        }

        pub fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
            if self.buf.len() - self.pos < n {
                return Err(ProtocolError::MessageTooShort {
                    expected: self.pos + n,
                    got: self.buf.len(),
                });
            }
            let out = &self.buf[self.pos..self.pos + n];
            self.pos += n;
            Ok(out)
        }

        pub fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
            Ok(self.take(N)?.try_into().expect("take returned N bytes"))
        }

        pub fn take_u8(&mut self) -> Result<u8, ProtocolError> {
            Ok(self.take(1)?[0])
        }

        pub fn take_u16(&mut self) -> Result<u16, ProtocolError> {
            Ok(u16::from_be_bytes(self.take_array()?))
        }

        pub fn take_str(&mut self) -> Result<String, ProtocolError> {
            let len = self.take_u16()? as usize;
            let bytes = self.take(len)?;
            String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::Malformed("utf8 string"))
        }
    }
}
