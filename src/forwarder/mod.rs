//! Frame forwarding between the local capture device and remote peers.
//!
//! Captured frames are resolved against the MAC learning table and either
//! flooded along the broadcast spanning tree, forwarded to the owning
//! peer, or left to the local bridge. Frames travel inside UDP datagrams,
//! split into fragments so that no datagram exceeds the path MTU: the
//! kernel must never fragment our packets. Reassembly happens only at
//! final destinations; transit peers relay fragment bodies verbatim.
//!
//! Every fragment names its origin peer and final destination. A transit
//! peer that cannot make progress towards the destination, or whose only
//! next hop is the peer it heard the fragment from, drops it: frames are
//! never reflected.

mod ethernet;
mod mac_cache;

pub use ethernet::{EthernetHeader, Mac, HEADER_LEN, MAX_FRAME_LEN};
pub use mac_cache::{MacCache, DEFAULT_CAPACITY, DEFAULT_MAX_AGE};

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, trace};

use crate::peer::{PeerName, NAME_SIZE};
use crate::protocol::{wire, ProtocolError};
use crate::topology::Routes;

/// Seed for path MTU discovery; probing only ever lowers it.
pub const DEFAULT_PMTU: usize = 1410;

/// Floor for path MTU halving.
pub const MIN_PMTU: usize = 552;

/// Fragment header: origin(8) + dest(8) + frame id(8) + total(1) + index(1).
pub const FRAGMENT_HEADER_SIZE: usize = 2 * NAME_SIZE + 8 + 2;

/// How long an incomplete frame waits for its missing fragments.
const PARTIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on concurrently reassembling frames.
const MAX_PARTIALS: usize = 1024;

/// Drop and throughput counters, surfaced via the status API.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ForwardStats {
    pub frames_injected: u64,
    pub frames_forwarded: u64,
    pub no_route_drops: u64,
    pub oversize_drops: u64,
    pub capture_drops: u64,
}

/// What to do with a frame captured from the local device.
#[derive(Debug, PartialEq, Eq)]
pub enum CaptureAction {
    /// Unusable frame (runt or jumbo); counter already incremented.
    Drop,
    /// Both endpoints are local; the bridge has already delivered it.
    Local,
    /// Flood along our broadcast spanning tree.
    Flood,
    /// Forward to the peer owning the destination MAC.
    Forward(PeerName),
}

/// What to do with a decapsulated fragment from a remote peer.
#[derive(Debug, PartialEq, Eq)]
pub enum ForwardAction {
    /// A frame completed reassembly; write it to the capture device.
    Inject(Vec<u8>),
    /// Relay this fragment body, unmodified, to these peers.
    Relay { to: Vec<PeerName>, body: Vec<u8> },
}

/// One encapsulated fragment of an Ethernet frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment<'a> {
    pub origin: PeerName,
    /// Final destination; [`PeerName::UNKNOWN`] marks a broadcast.
    pub dest: PeerName,
    pub frame_id: u64,
    pub total: u8,
    pub index: u8,
    pub chunk: &'a [u8],
}

impl<'a> Fragment<'a> {
    pub fn decode(body: &'a [u8]) -> Result<Fragment<'a>, ProtocolError> {
        let mut r = wire::Reader::new(body);
        let origin = PeerName::from_bytes(r.take_array()?);
        let dest = PeerName::from_bytes(r.take_array()?);
        let frame_id = u64::from_be_bytes(r.take_array()?);
        let total = r.take_u8()?;
        let index = r.take_u8()?;
        if total == 0 || index >= total {
            return Err(ProtocolError::Malformed("fragment counts"));
        }
        Ok(Fragment { origin, dest, frame_id, total, index, chunk: r.remaining() })
    }
}

struct PartialFrame {
    total: u8,
    chunks: BTreeMap<u8, Vec<u8>>,
    started: Instant,
}

/// The forwarding engine: MAC learning, resolution, fragmentation and
/// reassembly. Pure state machine; the router performs the actual sends.
pub struct Forwarder {
    ourself: PeerName,
    cache: MacCache,
    next_frame_id: u64,
    partials: HashMap<(PeerName, u64), PartialFrame>,
    stats: ForwardStats,
}

impl Forwarder {
    pub fn new(ourself: PeerName, cache: MacCache) -> Self {
        Forwarder { ourself, cache, next_frame_id: 0, partials: HashMap::new(), stats: ForwardStats::default() }
    }

    pub fn stats(&self) -> &ForwardStats {
        &self.stats
    }

    pub fn cache(&self) -> &MacCache {
        &self.cache
    }

    /// Record a capture-buffer overflow reported by the device.
    pub fn note_capture_drop(&mut self) {
        self.stats.capture_drops += 1;
    }

    /// Record a frame dropped for lack of a route.
    pub fn note_no_route(&mut self) {
        self.stats.no_route_drops += 1;
    }

    /// Classify a frame captured from the local device.
    pub fn handle_captured(&mut self, frame: &[u8]) -> CaptureAction {
        let Some(header) = EthernetHeader::parse(frame) else {
            self.stats.oversize_drops += 1;
            return CaptureAction::Drop;
        };
        if frame.len() > MAX_FRAME_LEN {
            self.stats.oversize_drops += 1;
            debug!(len = frame.len(), "dropping jumbo frame");
            return CaptureAction::Drop;
        }

        self.cache.learn(header.src, self.ourself);

        if header.dst.is_multicast() {
            return CaptureAction::Flood;
        }
        match self.cache.lookup(&header.dst) {
            None => CaptureAction::Flood,
            Some(owner) if owner == self.ourself => CaptureAction::Local,
            Some(owner) => CaptureAction::Forward(owner),
        }
    }

    /// Split a frame into fragment bodies addressed to `dest`.
    ///
    /// `max_body` bounds each returned body (header included); it is the
    /// sending link's PMTU minus the datagram and seal overhead. Frames
    /// that would need more than 255 fragments are dropped.
    pub fn fragment(&mut self, dest: PeerName, frame: &[u8], max_body: usize) -> Vec<Vec<u8>> {
        let chunk_size = max_body.saturating_sub(FRAGMENT_HEADER_SIZE);
        if chunk_size == 0 {
            self.stats.oversize_drops += 1;
            return Vec::new();
        }
        let total = frame.len().div_ceil(chunk_size);
        if total == 0 || total > u8::MAX as usize {
            self.stats.oversize_drops += 1;
            return Vec::new();
        }

        let frame_id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1);

        let mut bodies = Vec::with_capacity(total);
        for (index, chunk) in frame.chunks(chunk_size).enumerate() {
            let mut body = Vec::with_capacity(FRAGMENT_HEADER_SIZE + chunk.len());
            body.extend_from_slice(&self.ourself.to_bytes());
            body.extend_from_slice(&dest.to_bytes());
            body.extend_from_slice(&frame_id.to_be_bytes());
            body.push(total as u8);
            body.push(index as u8);
            body.extend_from_slice(chunk);
            bodies.push(body);
        }
        self.stats.frames_forwarded += 1;
        bodies
    }

    /// Process one fragment body received from `sender`.
    pub fn handle_datagram(
        &mut self,
        sender: PeerName,
        body: &[u8],
        routes: &Routes,
    ) -> Result<Vec<ForwardAction>, ProtocolError> {
        let fragment = Fragment::decode(body)?;
        let mut actions = Vec::new();

        if fragment.dest == PeerName::UNKNOWN {
            // Broadcast: relay down our subtree of the origin's spanning
            // tree, and deliver locally.
            let children: Vec<PeerName> = routes
                .broadcast_children(&fragment.origin)
                .iter()
                .filter(|c| **c != sender && **c != fragment.origin)
                .copied()
                .collect();
            if !children.is_empty() {
                actions.push(ForwardAction::Relay { to: children, body: body.to_vec() });
            }
            if let Some(frame) = self.reassemble(&fragment) {
                actions.push(ForwardAction::Inject(frame));
            }
        } else if fragment.dest == self.ourself {
            if let Some(frame) = self.reassemble(&fragment) {
                actions.push(ForwardAction::Inject(frame));
            }
        } else {
            // Transit: make progress or drop, never reflect.
            match routes.next_hop(&fragment.dest) {
                Some(hop) if hop != sender && hop != fragment.origin => {
                    actions.push(ForwardAction::Relay { to: vec![hop], body: body.to_vec() });
                }
                _ => {
                    self.stats.no_route_drops += 1;
                    trace!(dest = %fragment.dest, "no forward progress, dropping fragment");
                }
            }
        }
        Ok(actions)
    }

    /// Feed a fragment into reassembly; learn the source MAC and return
    /// the frame when it completes.
    fn reassemble(&mut self, fragment: &Fragment<'_>) -> Option<Vec<u8>> {
        let frame = if fragment.total == 1 {
            fragment.chunk.to_vec()
        } else {
            if self.partials.len() >= MAX_PARTIALS {
                self.sweep_partials();
            }
            let key = (fragment.origin, fragment.frame_id);
            let partial = self.partials.entry(key).or_insert_with(|| PartialFrame {
                total: fragment.total,
                chunks: BTreeMap::new(),
                started: Instant::now(),
            });
            if partial.total != fragment.total {
                // Mismatched retransmit; start over with the new claim.
                partial.total = fragment.total;
                partial.chunks.clear();
            }
            partial.chunks.entry(fragment.index).or_insert_with(|| fragment.chunk.to_vec());
            if partial.chunks.len() < partial.total as usize {
                return None;
            }
            let partial = self.partials.remove(&key).expect("entry just inserted");
            partial.chunks.into_values().flatten().collect()
        };

        if let Some(header) = EthernetHeader::parse(&frame) {
            self.cache.learn(header.src, fragment.origin);
        }
        self.stats.frames_injected += 1;
        Some(frame)
    }

    /// Drop reassembly state that has waited too long; router tick calls
    /// this alongside MAC expiry.
    pub fn sweep_partials(&mut self) {
        self.partials.retain(|_, partial| partial.started.elapsed() < PARTIAL_TIMEOUT);
    }

    /// Expire idle MAC entries.
    pub fn expire_cache(&mut self) {
        self.cache.expire();
    }

    /// Drop learned state about a departed peer.
    pub fn forget_peer(&mut self, peer: &PeerName) {
        self.cache.forget_peer(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{ConnectionSummary, Peer};
    use crate::topology::Topology;
    use std::collections::BTreeMap as Map;

    fn name(i: u8) -> PeerName {
        PeerName::from_mac([0, 0, 0, 0, 0, i])
    }

    fn mac(i: u8) -> Mac {
        Mac([0x02, 0, 0, 0, 0, i])
    }

    fn frame(dst: Mac, src: Mac, payload_len: usize) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&dst.0);
        f.extend_from_slice(&src.0);
        f.extend_from_slice(&[0x08, 0x00]);
        f.extend_from_slice(&vec![0xAA; payload_len]);
        f
    }

    /// Line topology 1 - 2 - 3 as seen from `local`.
    fn line_routes(local: u8) -> Routes {
        let edges: Map<u8, Vec<u8>> =
            Map::from([(1, vec![2]), (2, vec![1, 3]), (3, vec![2])]);
        let make = |i: u8| {
            let mut p = Peer::new(name(i), format!("p{}", i), u64::from(i));
            p.version = 1;
            for c in &edges[&i] {
                p.connections.insert(name(*c), ConnectionSummary::default());
            }
            p
        };
        let mut topo = Topology::new(make(local));
        let mut buf = Vec::new();
        for i in [1u8, 2, 3] {
            if i != local {
                make(i).encode_to(&mut buf);
            }
        }
        topo.apply_update(&buf).unwrap();
        Routes::compute(&topo)
    }

    fn forwarder(i: u8) -> Forwarder {
        Forwarder::new(name(i), MacCache::with_defaults())
    }

    #[test]
    fn test_captured_unknown_dst_floods() {
        let mut fwd = forwarder(1);
        let f = frame(mac(9), mac(1), 50);
        assert_eq!(fwd.handle_captured(&f), CaptureAction::Flood);
        // src MAC was learned as ours
        assert_eq!(fwd.cache.lookup(&mac(1)), Some(name(1)));
    }

    #[test]
    fn test_captured_broadcast_floods() {
        let mut fwd = forwarder(1);
        let f = frame(Mac::BROADCAST, mac(1), 50);
        assert_eq!(fwd.handle_captured(&f), CaptureAction::Flood);
    }

    #[test]
    fn test_captured_known_remote_forwards() {
        let mut fwd = forwarder(1);
        fwd.cache.learn(mac(9), name(3));
        let f = frame(mac(9), mac(1), 50);
        assert_eq!(fwd.handle_captured(&f), CaptureAction::Forward(name(3)));
    }

    #[test]
    fn test_captured_local_owner_is_noop() {
        let mut fwd = forwarder(1);
        fwd.cache.learn(mac(9), name(1));
        let f = frame(mac(9), mac(1), 50);
        assert_eq!(fwd.handle_captured(&f), CaptureAction::Local);
    }

    #[test]
    fn test_jumbo_frame_dropped_with_counter() {
        let mut fwd = forwarder(1);
        let f = frame(mac(9), mac(1), 2000);
        assert_eq!(fwd.handle_captured(&f), CaptureAction::Drop);
        assert_eq!(fwd.stats().oversize_drops, 1);
    }

    #[test]
    fn test_fragment_respects_budget() {
        let mut fwd = forwarder(1);
        let f = frame(mac(9), mac(1), 1486); // 1500-byte frame
        let budget = 1385; // PMTU 1410 minus datagram overhead
        let bodies = fwd.fragment(name(3), &f, budget);
        assert!(bodies.len() > 1);
        for body in &bodies {
            assert!(body.len() <= budget);
        }
    }

    #[test]
    fn test_fragment_reassemble_roundtrip() {
        let mut sender = forwarder(1);
        let mut receiver = forwarder(3);
        let routes = line_routes(3);

        let f = frame(mac(9), mac(1), 1400);
        let bodies = sender.fragment(name(3), &f, 600);
        assert!(bodies.len() >= 3);

        let mut injected = None;
        for body in bodies {
            for action in receiver.handle_datagram(name(2), &body, &routes).unwrap() {
                if let ForwardAction::Inject(frame) = action {
                    injected = Some(frame);
                }
            }
        }
        assert_eq!(injected.unwrap(), f);
        // Receiver learned the source MAC against the origin peer.
        assert_eq!(receiver.cache.lookup(&mac(1)), Some(name(1)));
    }

    #[test]
    fn test_transit_relays_toward_destination() {
        let mut origin = forwarder(1);
        let mut transit = forwarder(2);
        let routes = line_routes(2);

        let f = frame(mac(9), mac(1), 100);
        let bodies = origin.fragment(name(3), &f, 1385);
        let actions = transit.handle_datagram(name(1), &bodies[0], &routes).unwrap();
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            ForwardAction::Relay { to, body } => {
                assert_eq!(to, &vec![name(3)]);
                assert_eq!(body, &bodies[0]);
            }
            other => panic!("expected relay, got {:?}", other),
        }
    }

    #[test]
    fn test_transit_drops_without_progress() {
        let mut origin = forwarder(1);
        let mut transit = forwarder(2);
        let routes = line_routes(2);

        // Destination 9 is not in the topology at all.
        let f = frame(mac(9), mac(1), 100);
        let bodies = origin.fragment(name(9), &f, 1385);
        let actions = transit.handle_datagram(name(1), &bodies[0], &routes).unwrap();
        assert!(actions.is_empty());
        assert_eq!(transit.stats().no_route_drops, 1);
    }

    #[test]
    fn test_broadcast_relays_and_injects() {
        // Peer 2 in the middle of the line: a broadcast from 1 is
        // relayed to 3 and injected locally.
        let mut origin = forwarder(1);
        let mut middle = forwarder(2);
        let routes = line_routes(2);

        let f = frame(Mac::BROADCAST, mac(1), 100);
        let bodies = origin.fragment(PeerName::UNKNOWN, &f, 1385);
        let actions = middle.handle_datagram(name(1), &bodies[0], &routes).unwrap();
        let has_relay = actions.iter().any(|a| matches!(a, ForwardAction::Relay { to, .. } if to == &vec![name(3)]));
        let has_inject = actions.iter().any(|a| matches!(a, ForwardAction::Inject(got) if *got == f));
        assert!(has_relay, "middle must relay down the tree");
        assert!(has_inject, "middle must deliver locally");
    }

    #[test]
    fn test_broadcast_leaf_only_injects() {
        let mut origin = forwarder(1);
        let mut leaf = forwarder(3);
        let routes = line_routes(3);

        let f = frame(Mac::BROADCAST, mac(1), 100);
        let bodies = origin.fragment(PeerName::UNKNOWN, &f, 1385);
        let actions = leaf.handle_datagram(name(2), &bodies[0], &routes).unwrap();
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], ForwardAction::Inject(_)));
    }

    #[test]
    fn test_partial_sweep() {
        let mut receiver = forwarder(3);
        let routes = line_routes(3);
        let mut sender = forwarder(1);

        let f = frame(mac(9), mac(1), 1400);
        let bodies = sender.fragment(name(3), &f, 600);
        // Deliver only the first fragment; the partial lingers.
        receiver.handle_datagram(name(2), &bodies[0], &routes).unwrap();
        assert_eq!(receiver.partials.len(), 1);
        receiver.sweep_partials();
        assert_eq!(receiver.partials.len(), 1); // not timed out yet
    }
}
