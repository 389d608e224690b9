//! Topology: the gossiped graph of peers.
//!
//! Holds every peer this router knows about, keyed by name, and applies
//! gossiped updates under the version merge rules. The local peer's record
//! is authoritative here and only changes through [`Topology::update_self`].
//!
//! Merges and route recomputation both happen on the router's event loop,
//! so readers never observe a half-applied update.

mod routes;

pub use routes::Routes;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use thiserror::Error;
use tracing::debug;

use crate::peer::{ConnectionSummary, Peer, PeerName};
use crate::protocol::ProtocolError;

/// Errors from applying a gossiped topology update.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// Same name, same version, different bytes. The connection that
    /// delivered this update is lying or broken and must be dropped.
    #[error("inconsistent update for {0}: equal version, different payload")]
    InconsistentUpdate(PeerName),

    #[error("undecodable update: {0}")]
    Undecodable(#[from] ProtocolError),
}

/// Outcome of a merge: which records changed and which were garbage
/// collected, so the router can re-gossip just the delta.
#[derive(Debug, Default)]
pub struct TopologyDelta {
    pub changed: Vec<PeerName>,
    pub removed: Vec<PeerName>,
}

impl TopologyDelta {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// The set of all known peers, rooted at the local one.
pub struct Topology {
    ourself: PeerName,
    peers: HashMap<PeerName, Peer>,
}

impl Topology {
    /// Create a topology containing only the local peer.
    pub fn new(local: Peer) -> Self {
        let ourself = local.name;
        let mut peers = HashMap::new();
        peers.insert(ourself, local);
        Topology { ourself, peers }
    }

    pub fn ourself_name(&self) -> PeerName {
        self.ourself
    }

    pub fn ourself(&self) -> &Peer {
        &self.peers[&self.ourself]
    }

    pub fn get(&self, name: &PeerName) -> Option<&Peer> {
        self.peers.get(name)
    }

    pub fn contains(&self, name: &PeerName) -> bool {
        self.peers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &PeerName> {
        self.peers.keys()
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Replace the local peer's connection set, bumping its version.
    ///
    /// Called whenever a local connection becomes established or terminates.
    /// Returns a clone of the new record for delta gossip.
    pub fn update_self(&mut self, connections: BTreeMap<PeerName, ConnectionSummary>) -> Peer {
        let local = self.peers.get_mut(&self.ourself).expect("local peer always present");
        local.version += 1;
        local.connections = connections;
        local.clone()
    }

    /// Both directions of the edge are advertised.
    pub fn edge_established(&self, a: &PeerName, b: &PeerName) -> bool {
        let forward = self.peers.get(a).map(|p| p.connections.contains_key(b)).unwrap_or(false);
        let reverse = self.peers.get(b).map(|p| p.connections.contains_key(a)).unwrap_or(false);
        forward && reverse
    }

    /// Neighbours of `name` over established (symmetric) edges, sorted.
    pub fn symmetric_neighbours(&self, name: &PeerName) -> Vec<PeerName> {
        let Some(peer) = self.peers.get(name) else {
            return Vec::new();
        };
        // connections is a BTreeMap, so this comes out sorted by name
        peer.connected_names().filter(|n| self.edge_established(name, n)).copied().collect()
    }

    /// Merge a batch of gossiped peer records.
    ///
    /// Per name: unknown inserts, higher version replaces, lower version is
    /// ignored, equal version must be byte-identical. Updates about the
    /// local name are dropped: we are the only authority on ourselves and
    /// the periodic gossip re-asserts the true record.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<TopologyDelta, TopologyError> {
        let incoming = decode_peers(update)?;
        let mut delta = TopologyDelta::default();

        for peer in incoming {
            if peer.name == self.ourself {
                debug!(peer = %peer.name, "ignoring gossiped update about ourselves");
                continue;
            }
            match self.peers.get(&peer.name) {
                None => {
                    delta.changed.push(peer.name);
                    self.peers.insert(peer.name, peer);
                }
                Some(existing) if peer.version > existing.version => {
                    delta.changed.push(peer.name);
                    self.peers.insert(peer.name, peer);
                }
                Some(existing) if peer.version == existing.version => {
                    if *existing != peer {
                        return Err(TopologyError::InconsistentUpdate(peer.name));
                    }
                }
                Some(_) => {} // stale version
            }
        }

        if !delta.changed.is_empty() {
            delta.removed = self.garbage_collect();
            delta.changed.retain(|name| self.peers.contains_key(name));
        }
        Ok(delta)
    }

    /// Drop peers with no directed path from the local peer.
    ///
    /// Keeps the map from accumulating dead incarnations: when a peer
    /// restarts or leaves, the records pointing at its old self decay as
    /// versions advance, and the orphaned record becomes unreachable.
    fn garbage_collect(&mut self) -> Vec<PeerName> {
        let mut reached = HashSet::new();
        let mut queue = VecDeque::new();
        reached.insert(self.ourself);
        queue.push_back(self.ourself);
        while let Some(name) = queue.pop_front() {
            if let Some(peer) = self.peers.get(&name) {
                for next in peer.connected_names() {
                    if self.peers.contains_key(next) && reached.insert(*next) {
                        queue.push_back(*next);
                    }
                }
            }
        }
        let removed: Vec<PeerName> =
            self.peers.keys().filter(|name| !reached.contains(name)).copied().collect();
        for name in &removed {
            debug!(peer = %name, "garbage collecting unreachable peer");
            self.peers.remove(name);
        }
        removed
    }

    /// Encode the whole peer set, for periodic gossip.
    pub fn encode_all(&self) -> Vec<u8> {
        let mut names: Vec<&PeerName> = self.peers.keys().collect();
        names.sort();
        let mut buf = Vec::new();
        for name in names {
            self.peers[name].encode_to(&mut buf);
        }
        buf
    }

    /// Encode just the named records, for delta gossip.
    pub fn encode_subset(&self, names: &[PeerName]) -> Vec<u8> {
        let mut buf = Vec::new();
        for name in names {
            if let Some(peer) = self.peers.get(name) {
                peer.encode_to(&mut buf);
            }
        }
        buf
    }
}

/// Decode a concatenated sequence of peer records.
pub fn decode_peers(mut buf: &[u8]) -> Result<Vec<Peer>, ProtocolError> {
    let mut peers = Vec::new();
    while !buf.is_empty() {
        let (peer, consumed) = Peer::decode(buf)?;
        buf = &buf[consumed..];
        peers.push(peer);
    }
    Ok(peers)
}
