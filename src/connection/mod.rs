//! Per-connection state.
//!
//! A connection pairs a TCP control stream with a UDP data path to one
//! remote peer. It moves through greeting, optional key exchange, and a
//! heartbeat round-trip before counting as established; from then on it
//! multiplexes tagged messages until either side closes TCP or the
//! heartbeat goes quiet.
//!
//! This module is the state machine only. Socket tasks live with the
//! router, which owns every `Connection` and drives it from its event
//! loop; ordering of sealed frames is guaranteed by that single owner.

pub mod maker;

pub use maker::{normalize_target, ConnectionMaker, TargetState, TargetStatus};

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::crypto::{CryptoError, KeyExchange, SessionKeys};
use crate::forwarder::{DEFAULT_PMTU, MIN_PMTU};
use crate::peer::PeerName;
use crate::protocol::Greeting;

/// Heartbeat send interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// Six missed heartbeats terminate the connection.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Unacknowledged probes at one candidate size before halving.
pub const PMTU_PROBE_RETRIES: u32 = 3;

/// A connection still in greeting or key exchange after this long is
/// reaped; it would otherwise pin a connection-limit slot forever.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound frame queue depth per connection. Gossip sends to a full
/// queue are dropped; the periodic gossip recovers the loss.
pub const WRITER_QUEUE_LEN: usize = 64;

/// Identifies one connection for the lifetime of the router.
pub type ConnId = u64;

/// Errors that fail a single connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("one side expects a password and the other does not")]
    PasswordMismatch,

    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("{0}")]
    Protocol(#[from] crate::protocol::ProtocolError),
}

/// Connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingGreeting,
    AwaitingKeyExchange,
    /// Greeting (and key exchange) done; waiting for the first heartbeat
    /// round-trip.
    Pending,
    Established,
    Terminated,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::AwaitingGreeting => "awaiting-greeting",
            ConnectionState::AwaitingKeyExchange => "awaiting-key-exchange",
            ConnectionState::Pending => "pending",
            ConnectionState::Established => "established",
            ConnectionState::Terminated => "terminated",
        };
        write!(f, "{}", s)
    }
}

/// What the greeting told us about the far end.
#[derive(Clone, Debug)]
pub struct RemoteInfo {
    pub name: PeerName,
    pub uid: u64,
    pub nick_name: String,
    /// Where heartbeats and data go: the TCP source IP plus the
    /// advertised UDP port.
    pub udp_addr: SocketAddr,
}

#[derive(Debug)]
struct HeartbeatState {
    last_heard: Instant,
    heard_any: bool,
    ack_sent: bool,
    ack_received: bool,
}

/// Path MTU discovery state for one connection.
///
/// Probing starts at the seed and only ever moves down: a candidate that
/// goes unverified for [`PMTU_PROBE_RETRIES`] probes is halved (to a
/// floor). A verified candidate becomes the operating PMTU and probing
/// stops; nothing raises it again until the connection is remade.
#[derive(Debug)]
struct PmtuState {
    pmtu: usize,
    candidate: usize,
    probes_sent: u32,
    verified: bool,
}

/// One TCP+UDP association with a remote peer.
pub struct Connection {
    pub id: ConnId,
    pub outbound: bool,
    /// The maker's target key, when this connection came from a dial.
    pub target: Option<String>,
    pub tcp_addr: SocketAddr,
    created: Instant,
    state: ConnectionState,
    remote: Option<RemoteInfo>,
    key_exchange: Option<KeyExchange>,
    session: Option<SessionKeys>,
    writer: mpsc::Sender<Vec<u8>>,
    heartbeat: HeartbeatState,
    pmtu: PmtuState,
}

impl Connection {
    pub fn new(
        id: ConnId,
        outbound: bool,
        target: Option<String>,
        tcp_addr: SocketAddr,
        writer: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Connection {
            id,
            outbound,
            target,
            tcp_addr,
            created: Instant::now(),
            state: ConnectionState::AwaitingGreeting,
            remote: None,
            key_exchange: None,
            session: None,
            writer,
            heartbeat: HeartbeatState {
                last_heard: Instant::now(),
                heard_any: false,
                ack_sent: false,
                ack_received: false,
            },
            pmtu: PmtuState {
                pmtu: DEFAULT_PMTU,
                candidate: DEFAULT_PMTU,
                probes_sent: 0,
                verified: false,
            },
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn remote(&self) -> Option<&RemoteInfo> {
        self.remote.as_ref()
    }

    pub fn remote_name(&self) -> Option<PeerName> {
        self.remote.as_ref().map(|r| r.name)
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }

    // === Handshake ===

    /// Accept the remote greeting; router has already run the checks that
    /// need global state (self-connect, duplicates, password flag).
    ///
    /// Returns our ephemeral public key to send when a password is in use.
    pub fn accept_greeting(
        &mut self,
        greeting: &Greeting,
        use_password: bool,
    ) -> Option<[u8; crate::crypto::PUBKEY_SIZE]> {
        debug_assert_eq!(self.state, ConnectionState::AwaitingGreeting);
        self.remote = Some(RemoteInfo {
            name: greeting.name,
            uid: greeting.uid,
            nick_name: greeting.nick_name.clone(),
            udp_addr: SocketAddr::new(self.tcp_addr.ip(), greeting.udp_port),
        });
        if use_password {
            let kx = KeyExchange::new();
            let public = kx.public_bytes();
            self.key_exchange = Some(kx);
            self.state = ConnectionState::AwaitingKeyExchange;
            Some(public)
        } else {
            self.state = ConnectionState::Pending;
            None
        }
    }

    /// Complete the key exchange with the remote's ephemeral public key.
    pub fn accept_key_exchange(
        &mut self,
        remote_public: &[u8],
        password: &[u8],
    ) -> Result<(), ConnectionError> {
        let kx = self.key_exchange.take().ok_or(ConnectionError::PasswordMismatch)?;
        self.session = Some(kx.establish(remote_public, password, self.outbound)?);
        self.state = ConnectionState::Pending;
        Ok(())
    }

    // === Framing and sealing ===

    /// Seal a frame body for TCP if the session is encrypted.
    pub fn seal(&mut self, body: Vec<u8>) -> Result<Vec<u8>, ConnectionError> {
        match &mut self.session {
            Some(keys) => Ok(keys.send.seal(&body)?),
            None => Ok(body),
        }
    }

    /// Open a received TCP frame body.
    pub fn open(&mut self, body: Vec<u8>) -> Result<Vec<u8>, ConnectionError> {
        match &mut self.session {
            Some(keys) => Ok(keys.recv.open(&body)?),
            None => Ok(body),
        }
    }

    /// Seal a UDP payload (loss-tolerant counter pair).
    pub fn udp_seal(&mut self, payload: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        match &mut self.session {
            Some(keys) => Ok(keys.udp_send.seal(payload)?),
            None => Ok(payload.to_vec()),
        }
    }

    /// Open a UDP payload.
    pub fn udp_open(&mut self, payload: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        match &mut self.session {
            Some(keys) => Ok(keys.udp_recv.open_lossy(payload)?),
            None => Ok(payload.to_vec()),
        }
    }

    /// Whether frames are AEAD-sealed from here on.
    pub fn encrypted(&self) -> bool {
        self.session.is_some()
    }

    /// Queue a frame body for the writer task. Returns false when the
    /// queue is full or the writer is gone; callers for whom delivery is
    /// mandatory treat that as a connection failure, gossip callers just
    /// drop the message.
    pub fn enqueue(&self, body: Vec<u8>) -> bool {
        self.writer.try_send(body).is_ok()
    }

    // === Heartbeat ===

    /// A UDP datagram arrived from the remote.
    ///
    /// Returns true when this is the first one, i.e. we owe the remote a
    /// `ConnectionEstablished` ack over TCP.
    pub fn heard_udp(&mut self, now: Instant) -> bool {
        self.heartbeat.last_heard = now;
        let first = !self.heartbeat.heard_any;
        self.heartbeat.heard_any = true;
        if first && !self.heartbeat.ack_sent {
            self.heartbeat.ack_sent = true;
            return true;
        }
        false
    }

    /// The remote acked our heartbeat. Returns true when this completes
    /// establishment (greeting + key exchange + heartbeat round-trip).
    pub fn established_ack(&mut self) -> bool {
        self.heartbeat.ack_received = true;
        if self.state == ConnectionState::Pending {
            self.state = ConnectionState::Established;
            return true;
        }
        false
    }

    /// Heartbeats should flow in the pending and established states.
    pub fn heartbeats_active(&self) -> bool {
        matches!(self.state, ConnectionState::Pending | ConnectionState::Established)
    }

    /// Still mid-handshake past the allowance.
    pub fn handshake_overdue(&self, now: Instant) -> bool {
        matches!(
            self.state,
            ConnectionState::AwaitingGreeting | ConnectionState::AwaitingKeyExchange
        ) && now.duration_since(self.created) > HANDSHAKE_TIMEOUT
    }

    /// Nothing heard for the timeout window.
    pub fn heartbeat_overdue(&self, now: Instant) -> bool {
        self.heartbeats_active()
            && now.duration_since(self.heartbeat.last_heard) > HEARTBEAT_TIMEOUT
    }

    pub fn terminate(&mut self) {
        self.state = ConnectionState::Terminated;
    }

    // === Path MTU ===

    /// Current operating PMTU for this connection's UDP path.
    pub fn pmtu(&self) -> usize {
        self.pmtu.pmtu
    }

    /// Advance the probe schedule by one heartbeat tick.
    ///
    /// Returns the candidate size to probe now, or None once verified.
    pub fn pmtu_probe_tick(&mut self) -> Option<usize> {
        if self.pmtu.verified || !self.heartbeats_active() {
            return None;
        }
        if self.pmtu.probes_sent >= PMTU_PROBE_RETRIES {
            self.pmtu.candidate = (self.pmtu.candidate / 2).max(MIN_PMTU);
            self.pmtu.probes_sent = 0;
        }
        self.pmtu.probes_sent += 1;
        Some(self.pmtu.candidate)
    }

    /// The remote confirmed a probe of `size` arrived intact.
    pub fn pmtu_verified(&mut self, size: usize) -> bool {
        if size == self.pmtu.candidate && !self.pmtu.verified {
            self.pmtu.pmtu = size;
            self.pmtu.verified = true;
            return true;
        }
        false
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("outbound", &self.outbound)
            .field("state", &self.state)
            .field("remote", &self.remote.as_ref().map(|r| r.name))
            .field("encrypted", &self.encrypted())
            .finish()
    }
}

/// Duplicate-connection tie break.
///
/// When both ends dial each other, both see two active connections to the
/// same peer. Each keeps exactly one: the connection whose initiator has
/// the smaller name. Both ends evaluate the same rule and agree.
pub fn duplicate_winner(ours: PeerName, theirs: PeerName, this_is_outbound: bool) -> bool {
    if ours < theirs {
        this_is_outbound
    } else {
        !this_is_outbound
    }
}
