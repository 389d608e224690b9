//! IP address manager.
//!
//! A gossip-based distributed allocator. Ownership of the configured CIDR
//! lives in a token [`Ring`]; each peer hands out addresses only from
//! ranges it owns, so no coordination is needed on the allocation fast
//! path. Peers that run dry ask the peer advertising the most free space
//! to donate a range; donation is a version-bumped ownership handoff that
//! the requester observes through the merged ring before it allocates.
//!
//! The allocator is an actor owned by the router's event loop: requests
//! carry reply channels and park in a pending queue, and `poll` drives
//! quorum bootstrap, deadline expiry and space requests.

mod ring;

pub use ring::{OwnedRange, Ring, RingError, Token};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use ipnet::Ipv4Net;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::gossip::{GossipError, Gossiper};
use crate::peer::PeerName;
use crate::protocol::{wire, ProtocolError};

/// How long to wait for one peer to answer a space request before asking
/// the next candidate.
pub const SPACE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default overall deadline for an allocation request.
pub const DEFAULT_ALLOCATE_DEADLINE: Duration = Duration::from_secs(30);

const MSG_STATE: u8 = 1;
const MSG_SPACE_REQUEST: u8 = 2;

/// Errors returned to allocation callers.
#[derive(Debug, Error)]
pub enum IpamError {
    #[error("no ip range configured")]
    Disabled,

    #[error("quorum not reached")]
    QuorumNotReached,

    #[error("no free address obtained within the deadline")]
    SpaceExhausted,

    #[error("address {0} is owned by another peer")]
    NotOwnedLocally(Ipv4Addr),

    #[error("address {0} is outside the allocation range")]
    OutsideRange(Ipv4Addr),

    #[error("address {0} is already claimed by container {1}")]
    AlreadyClaimed(Ipv4Addr, String),

    #[error("cannot remove our own peer")]
    RemoveSelf,

    #[error("peer {0} was already removed")]
    AlreadyRemoved(PeerName),

    #[error(transparent)]
    Ring(#[from] RingError),
}

/// A granted address with the range's prefix, rendered `ip/prefix`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AllocatedIp {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl fmt::Display for AllocatedIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// Gossip or unicast the router must perform on the allocator's behalf.
#[derive(Debug, PartialEq, Eq)]
pub enum IpamAction {
    Broadcast(Vec<u8>),
    Unicast { dest: PeerName, payload: Vec<u8> },
}

struct PendingRequest {
    container: String,
    /// Set for specific-address claims, None for any-address allocation.
    specific: Option<Ipv4Addr>,
    deadline: Instant,
    /// Outstanding space request and when we give up on that candidate.
    asked: Option<(PeerName, Instant)>,
    tried: HashSet<PeerName>,
    reply: Option<oneshot::Sender<Result<AllocatedIp, IpamError>>>,
}

/// One peer's allocator state and request queue.
pub struct Allocator {
    ourself: PeerName,
    range: Ipv4Net,
    quorum: usize,
    ring: Ring,
    claims: HashMap<Ipv4Addr, String>,
    free_hints: HashMap<PeerName, u64>,
    observed: BTreeSet<PeerName>,
    removed: HashSet<PeerName>,
    pending: Vec<PendingRequest>,
    dirty: bool,
}

impl Allocator {
    pub fn new(ourself: PeerName, range: Ipv4Net, quorum: usize) -> Self {
        info!(%ourself, %range, quorum, "IP allocator created");
        Allocator {
            ourself,
            range,
            quorum,
            ring: Ring::new(range),
            claims: HashMap::new(),
            free_hints: HashMap::new(),
            observed: BTreeSet::from([ourself]),
            removed: HashSet::new(),
            pending: Vec::new(),
            dirty: false,
        }
    }

    pub fn range(&self) -> Ipv4Net {
        self.range
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    // === Requests ===

    /// Queue an any-address allocation for `container`.
    pub fn allocate(
        &mut self,
        container: String,
        deadline: Duration,
        reply: oneshot::Sender<Result<AllocatedIp, IpamError>>,
    ) {
        self.pending.push(PendingRequest {
            container,
            specific: None,
            deadline: Instant::now() + deadline,
            asked: None,
            tried: HashSet::new(),
            reply: Some(reply),
        });
    }

    /// Queue a claim of a specific address for `container`.
    pub fn claim(
        &mut self,
        container: String,
        addr: Ipv4Addr,
        deadline: Duration,
        reply: oneshot::Sender<Result<AllocatedIp, IpamError>>,
    ) {
        if !self.range.contains(&addr) {
            let _ = reply.send(Err(IpamError::OutsideRange(addr)));
            return;
        }
        self.pending.push(PendingRequest {
            container,
            specific: Some(addr),
            deadline: Instant::now() + deadline,
            asked: None,
            tried: HashSet::new(),
            reply: Some(reply),
        });
    }

    /// Release every claim held by `container`. The addresses become
    /// immediately reusable here; ranges stay where they are.
    pub fn free(&mut self, container: &str) -> Vec<Ipv4Addr> {
        let released: Vec<Ipv4Addr> = self
            .claims
            .iter()
            .filter(|(_, c)| c.as_str() == container)
            .map(|(a, _)| *a)
            .collect();
        for addr in &released {
            self.claims.remove(addr);
        }
        if !released.is_empty() {
            debug!(container, count = released.len(), "released claims");
        }
        released
    }

    /// Take over a dead peer's ranges and keep it out until reset.
    ///
    /// Safe only when the operator knows the peer is gone for good; a
    /// removed peer that comes back finds its ring updates ignored here.
    pub fn admin_remove_peer(&mut self, peer: PeerName) -> Result<usize, IpamError> {
        if peer == self.ourself {
            return Err(IpamError::RemoveSelf);
        }
        if !self.removed.insert(peer) {
            return Err(IpamError::AlreadyRemoved(peer));
        }
        self.observed.remove(&peer);
        self.free_hints.remove(&peer);
        let moved = self.ring.reassign_all(peer, self.ourself);
        if moved > 0 {
            self.dirty = true;
        }
        info!(%peer, tokens = moved, "admin-removed peer from IPAM");
        Ok(moved)
    }

    /// Update the set of peers currently visible in the topology.
    pub fn observe_peers<I: IntoIterator<Item = PeerName>>(&mut self, names: I) {
        self.observed =
            names.into_iter().filter(|n| !self.removed.contains(n)).collect();
        self.observed.insert(self.ourself);
    }

    // === Address accounting ===

    fn reserved(&self, addr: u32) -> bool {
        // Network and broadcast addresses are never handed out.
        addr == u32::from(self.range.network()) || addr == u32::from(self.range.broadcast())
    }

    fn is_free(&self, addr: u32) -> bool {
        !self.reserved(addr) && !self.claims.contains_key(&Ipv4Addr::from(addr))
    }

    /// Lowest free address in our ranges.
    fn lowest_free(&self) -> Option<Ipv4Addr> {
        for range in self.ring.ranges_owned_by(self.ourself) {
            for addr in range.start..range.end {
                if self.is_free(addr) {
                    return Some(Ipv4Addr::from(addr));
                }
            }
        }
        None
    }

    /// Free addresses in our ranges, for the gossiped hint.
    fn local_free_count(&self) -> u64 {
        self.ring
            .ranges_owned_by(self.ourself)
            .iter()
            .map(|r| (r.start..r.end).filter(|a| self.is_free(*a)).count() as u64)
            .sum()
    }

    // === Donation ===

    /// Hand a claim-free tail of one of our ranges to `requester`.
    fn donate(&mut self, requester: PeerName) {
        if requester == self.ourself || self.removed.contains(&requester) {
            return;
        }
        let mut candidates = self.ring.ranges_owned_by(self.ourself);
        // Most free space first.
        candidates.sort_by_key(|r| {
            std::cmp::Reverse((r.start..r.end).filter(|a| self.is_free(*a)).count())
        });

        for range in candidates {
            // Donate the tail past both the midpoint and the highest claim.
            let highest_claim = (range.start..range.end)
                .rev()
                .find(|a| self.claims.contains_key(&Ipv4Addr::from(*a)))
                .map(|a| a + 1);
            let midpoint = range.start + range.len() / 2;
            let donate_from = highest_claim.map_or(midpoint, |h| h.max(midpoint));
            if donate_from >= range.end {
                continue; // claims crowd the tail; try the next range
            }
            let at = Ipv4Addr::from(donate_from);
            match self.ring.split(at, self.ourself, requester) {
                Ok(()) => {
                    info!(
                        %requester,
                        from = %at,
                        count = range.end - donate_from,
                        "donated address range"
                    );
                    self.dirty = true;
                    return;
                }
                Err(e) => {
                    warn!(%requester, error = %e, "donation split failed");
                    return;
                }
            }
        }
        debug!(%requester, "space requested but nothing to donate");
    }

    // === Driving ===

    /// Progress bootstrap and pending requests; returns sends to perform.
    ///
    /// Call after any gossip merge, topology change, request or tick.
    pub fn poll(&mut self, now: Instant) -> Vec<IpamAction> {
        let mut actions = Vec::new();

        // Quorum bootstrap: the smallest name of an observed quorum seeds.
        if !self.ring.is_seeded()
            && self.observed.len() >= self.quorum
            && self.observed.first() == Some(&self.ourself)
        {
            info!(peers = self.observed.len(), quorum = self.quorum, "seeding IPAM ring");
            self.ring.seed(self.ourself);
            self.dirty = true;
        }

        let seeded = self.ring.is_seeded();
        let mut requests = std::mem::take(&mut self.pending);
        for request in &mut requests {
            let outcome = self.progress_request(request, seeded, now, &mut actions);
            if let Some(result) = outcome {
                if let Some(reply) = request.reply.take() {
                    let _ = reply.send(result);
                }
            }
        }
        requests.retain(|r| r.reply.is_some());
        // New requests may have arrived through reentrant calls; keep both.
        requests.append(&mut self.pending);
        self.pending = requests;

        if self.dirty {
            self.dirty = false;
            actions.push(IpamAction::Broadcast(self.state_payload()));
        }
        actions
    }

    fn progress_request(
        &mut self,
        request: &mut PendingRequest,
        seeded: bool,
        now: Instant,
        actions: &mut Vec<IpamAction>,
    ) -> Option<Result<AllocatedIp, IpamError>> {
        if !seeded {
            if now >= request.deadline {
                return Some(Err(IpamError::QuorumNotReached));
            }
            return None;
        }

        if let Some(addr) = request.specific {
            return match self.ring.owner_of(addr) {
                Some(owner) if owner == self.ourself => {
                    let holder = self.claims.get(&addr).cloned();
                    match holder {
                        Some(holder) if holder != request.container => {
                            Some(Err(IpamError::AlreadyClaimed(addr, holder)))
                        }
                        _ => {
                            self.claims.insert(addr, request.container.clone());
                            Some(Ok(self.granted(addr)))
                        }
                    }
                }
                Some(_) => Some(Err(IpamError::NotOwnedLocally(addr))),
                None => Some(Err(IpamError::OutsideRange(addr))),
            };
        }

        if let Some(addr) = self.lowest_free() {
            self.claims.insert(addr, request.container.clone());
            return Some(Ok(self.granted(addr)));
        }

        if now >= request.deadline {
            return Some(Err(IpamError::SpaceExhausted));
        }

        // Out of local space: ask the roomiest peer, one at a time.
        let ask_now = match request.asked {
            None => true,
            Some((_, candidate_deadline)) => now >= candidate_deadline,
        };
        if ask_now {
            match self.pick_donor(&request.tried) {
                Some(donor) => {
                    request.tried.insert(donor);
                    request.asked = Some((donor, now + SPACE_REQUEST_TIMEOUT));
                    debug!(%donor, container = %request.container, "requesting address space");
                    actions.push(IpamAction::Unicast {
                        dest: donor,
                        payload: self.space_request_payload(),
                    });
                }
                None => {
                    // Everyone has been tried; start over so refreshed
                    // hints can be asked again before the deadline.
                    request.tried.clear();
                    request.asked = None;
                }
            }
        }
        None
    }

    fn pick_donor(&self, tried: &HashSet<PeerName>) -> Option<PeerName> {
        self.free_hints
            .iter()
            .filter(|(peer, free)| {
                **peer != self.ourself
                    && **free > 0
                    && !tried.contains(*peer)
                    && !self.removed.contains(*peer)
                    && self.observed.contains(*peer)
            })
            .max_by_key(|(peer, free)| (**free, std::cmp::Reverse(**peer)))
            .map(|(peer, _)| *peer)
    }

    fn granted(&self, addr: Ipv4Addr) -> AllocatedIp {
        AllocatedIp { addr, prefix_len: self.range.prefix_len() }
    }

    // === Wire ===

    fn state_payload(&self) -> Vec<u8> {
        let mut buf = vec![MSG_STATE];
        buf.extend_from_slice(&self.ring.encode());
        let mut hints: Vec<(PeerName, u64)> = self
            .free_hints
            .iter()
            .filter(|(peer, _)| **peer != self.ourself && !self.removed.contains(*peer))
            .map(|(peer, free)| (*peer, *free))
            .collect();
        hints.push((self.ourself, self.local_free_count()));
        hints.sort();
        wire::put_u16(&mut buf, hints.len() as u16);
        for (peer, free) in hints {
            buf.extend_from_slice(&peer.to_bytes());
            buf.extend_from_slice(&free.to_be_bytes());
        }
        buf
    }

    fn space_request_payload(&self) -> Vec<u8> {
        let mut buf = vec![MSG_SPACE_REQUEST];
        buf.extend_from_slice(&self.ourself.to_bytes());
        buf
    }

    fn merge_state(&mut self, payload: &[u8]) -> Result<bool, GossipError> {
        let mut r = wire::Reader::new(payload);
        let ring = Ring::decode(&mut r).map_err(|e| GossipError::Violation(e.to_string()))?;
        let removed = self.removed.clone();
        let changed = self
            .ring
            .merge(&ring, &|p: &PeerName| removed.contains(p))
            .map_err(|e| GossipError::Violation(e.to_string()))?;
        let count = r.take_u16().map_err(GossipError::Undecodable)?;
        for _ in 0..count {
            let peer =
                PeerName::from_bytes(r.take_array().map_err(GossipError::Undecodable)?);
            let free =
                u64::from_be_bytes(r.take_array().map_err(GossipError::Undecodable)?);
            if peer != self.ourself && !self.removed.contains(&peer) {
                self.free_hints.insert(peer, free);
            }
        }
        Ok(changed)
    }

    // === Status ===

    pub fn status(&self) -> IpamStatus {
        let mut claims: Vec<ClaimStatus> = self
            .claims
            .iter()
            .map(|(addr, container)| ClaimStatus { address: *addr, container: container.clone() })
            .collect();
        claims.sort_by_key(|c| c.address);
        IpamStatus {
            range: self.range.to_string(),
            quorum: self.quorum,
            seeded: self.ring.is_seeded(),
            free_local: self.local_free_count(),
            ranges: self
                .ring
                .ranges()
                .into_iter()
                .map(|r| RangeStatus {
                    start: Ipv4Addr::from(r.start),
                    end: Ipv4Addr::from(r.end.wrapping_sub(1)),
                    owner: r.owner.to_string(),
                    size: r.len(),
                })
                .collect(),
            claims,
        }
    }
}

impl Gossiper for Allocator {
    fn gossip(&mut self) -> Vec<u8> {
        self.state_payload()
    }

    fn on_gossip_broadcast(&mut self, update: &[u8]) -> Result<Option<Vec<u8>>, GossipError> {
        match update.split_first() {
            Some((&MSG_STATE, payload)) => {
                let changed = self.merge_state(payload)?;
                Ok(changed.then(|| self.state_payload()))
            }
            Some((&MSG_SPACE_REQUEST, _)) => {
                Err(GossipError::Violation("space request on broadcast channel".into()))
            }
            Some((tag, _)) => Err(GossipError::Undecodable(ProtocolError::UnknownTag(*tag))),
            None => {
                Err(GossipError::Undecodable(ProtocolError::MessageTooShort { expected: 1, got: 0 }))
            }
        }
    }

    fn on_gossip_unicast(&mut self, sender: PeerName, payload: &[u8]) -> Result<(), GossipError> {
        match payload.split_first() {
            Some((&MSG_SPACE_REQUEST, body)) => {
                let requester = PeerName::from_slice(body)
                    .ok_or(ProtocolError::Malformed("requester name"))
                    .map_err(GossipError::Undecodable)?;
                self.donate(requester);
                Ok(())
            }
            Some((&MSG_STATE, body)) => {
                // Direct state push, e.g. a donor answering our request.
                let _ = sender;
                self.merge_state(body)?;
                Ok(())
            }
            Some((tag, _)) => Err(GossipError::Undecodable(ProtocolError::UnknownTag(*tag))),
            None => {
                Err(GossipError::Undecodable(ProtocolError::MessageTooShort { expected: 1, got: 0 }))
            }
        }
    }
}

/// Machine-readable allocator status.
#[derive(Clone, Debug, Serialize)]
pub struct IpamStatus {
    pub range: String,
    pub quorum: usize,
    pub seeded: bool,
    pub free_local: u64,
    pub ranges: Vec<RangeStatus>,
    pub claims: Vec<ClaimStatus>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RangeStatus {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    pub owner: String,
    pub size: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct ClaimStatus {
    pub address: Ipv4Addr,
    pub container: String,
}

impl fmt::Display for IpamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Allocator range {} quorum {}", self.range, self.quorum)?;
        if !self.seeded {
            return writeln!(f, "  awaiting quorum");
        }
        for r in &self.ranges {
            writeln!(f, "  {} - {} owned by {} ({} addrs)", r.start, r.end, r.owner, r.size)?;
        }
        for c in &self.claims {
            writeln!(f, "  {} claimed by {}", c.address, c.container)?;
        }
        writeln!(f, "  {} free locally", self.free_local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(i: u8) -> PeerName {
        PeerName::from_mac([0, 0, 0, 0, 0, i])
    }

    fn allocator(i: u8, quorum: usize) -> Allocator {
        Allocator::new(name(i), "10.2.0.0/16".parse().unwrap(), quorum)
    }

    fn request() -> (oneshot::Sender<Result<AllocatedIp, IpamError>>, oneshot::Receiver<Result<AllocatedIp, IpamError>>) {
        oneshot::channel()
    }

    fn granted(rx: &mut oneshot::Receiver<Result<AllocatedIp, IpamError>>) -> AllocatedIp {
        rx.try_recv().expect("reply pending").expect("allocation failed")
    }

    /// Deliver all gossip actions from one allocator to the others.
    fn deliver(from: &mut Allocator, to: &mut [&mut Allocator]) {
        let actions = from.poll(Instant::now());
        for action in actions {
            for other in to.iter_mut() {
                match &action {
                    IpamAction::Broadcast(payload) => {
                        let _ = other.on_gossip_broadcast(payload);
                    }
                    IpamAction::Unicast { dest, payload } => {
                        if *dest == other.ourself {
                            other.on_gossip_unicast(from.ourself, payload).unwrap();
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_blocks_until_quorum() {
        let mut a = allocator(1, 2);
        let (tx, mut rx) = request();
        a.allocate("cont1".into(), DEFAULT_ALLOCATE_DEADLINE, tx);
        a.poll(Instant::now());
        assert!(rx.try_recv().is_err(), "must block before quorum");

        a.observe_peers([name(1), name(2)]);
        a.poll(Instant::now());
        let ip = granted(&mut rx);
        assert!(a.range().contains(&ip.addr));
        assert_eq!(ip.prefix_len, 16);
    }

    #[test]
    fn test_quorum_timeout() {
        let mut a = allocator(1, 3);
        let (tx, mut rx) = request();
        a.allocate("cont1".into(), Duration::from_secs(0), tx);
        a.poll(Instant::now() + Duration::from_millis(10));
        assert!(matches!(rx.try_recv().unwrap(), Err(IpamError::QuorumNotReached)));
    }

    #[test]
    fn test_only_smallest_seeds() {
        let mut b = allocator(2, 2);
        b.observe_peers([name(1), name(2)]);
        b.poll(Instant::now());
        assert!(!b.ring().is_seeded(), "larger name must wait for the seeder");

        let mut a = allocator(1, 2);
        a.observe_peers([name(1), name(2)]);
        a.poll(Instant::now());
        assert!(a.ring().is_seeded());
    }

    #[test]
    fn test_allocations_are_lowest_free_and_distinct() {
        let mut a = allocator(1, 1);
        a.poll(Instant::now());

        let (tx1, mut rx1) = request();
        let (tx2, mut rx2) = request();
        a.allocate("c1".into(), DEFAULT_ALLOCATE_DEADLINE, tx1);
        a.allocate("c2".into(), DEFAULT_ALLOCATE_DEADLINE, tx2);
        a.poll(Instant::now());

        let ip1 = granted(&mut rx1);
        let ip2 = granted(&mut rx2);
        // .0 is the network address, so allocation starts at .1.
        assert_eq!(ip1.addr, "10.2.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(ip2.addr, "10.2.0.2".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_free_makes_address_reusable() {
        let mut a = allocator(1, 1);
        a.poll(Instant::now());

        let (tx, mut rx) = request();
        a.allocate("c1".into(), DEFAULT_ALLOCATE_DEADLINE, tx);
        a.poll(Instant::now());
        let ip = granted(&mut rx);

        assert_eq!(a.free("c1"), vec![ip.addr]);
        let (tx, mut rx) = request();
        a.allocate("c2".into(), DEFAULT_ALLOCATE_DEADLINE, tx);
        a.poll(Instant::now());
        assert_eq!(granted(&mut rx).addr, ip.addr);
    }

    #[test]
    fn test_specific_claim() {
        let mut a = allocator(1, 1);
        a.poll(Instant::now());
        let addr: Ipv4Addr = "10.2.0.42".parse().unwrap();

        let (tx, mut rx) = request();
        a.claim("c1".into(), addr, DEFAULT_ALLOCATE_DEADLINE, tx);
        a.poll(Instant::now());
        assert_eq!(granted(&mut rx).addr, addr);

        // Someone else claiming the same address is refused.
        let (tx, mut rx) = request();
        a.claim("c2".into(), addr, DEFAULT_ALLOCATE_DEADLINE, tx);
        a.poll(Instant::now());
        assert!(matches!(rx.try_recv().unwrap(), Err(IpamError::AlreadyClaimed(_, _))));
    }

    #[test]
    fn test_claim_outside_range_rejected() {
        let mut a = allocator(1, 1);
        let (tx, mut rx) = request();
        a.claim("c1".into(), "192.168.1.1".parse().unwrap(), DEFAULT_ALLOCATE_DEADLINE, tx);
        assert!(matches!(rx.try_recv().unwrap(), Err(IpamError::OutsideRange(_))));
    }

    #[test]
    fn test_donation_flow() {
        // Seeder owns everything; peer 2 asks and receives a range.
        let mut a = allocator(1, 2);
        let mut b = allocator(2, 2);
        a.observe_peers([name(1), name(2)]);
        b.observe_peers([name(1), name(2)]);

        // a seeds and gossips its state to b.
        deliver(&mut a, &mut [&mut b]);
        assert!(b.ring().is_seeded());

        // b wants an address but owns nothing; it asks a.
        let (tx, mut rx) = request();
        b.allocate("cont1".into(), DEFAULT_ALLOCATE_DEADLINE, tx);
        deliver(&mut b, &mut [&mut a]);

        // a donates (split) and gossips the new ring; b completes.
        deliver(&mut a, &mut [&mut b]);
        deliver(&mut b, &mut [&mut a]);

        let ip = granted(&mut rx);
        assert!(b.range().contains(&ip.addr));
        assert_eq!(b.ring().owner_of(ip.addr), Some(name(2)));
        assert!(a.ring().space_owned_by(name(1)) > 0);
        assert!(b.ring().space_owned_by(name(2)) > 0);
    }

    #[test]
    fn test_concurrent_allocations_on_different_peers_distinct() {
        let mut a = allocator(1, 2);
        let mut b = allocator(2, 2);
        a.observe_peers([name(1), name(2)]);
        b.observe_peers([name(1), name(2)]);
        deliver(&mut a, &mut [&mut b]);

        // b obtains a donated range.
        let (btx, mut brx) = request();
        b.allocate("cb".into(), DEFAULT_ALLOCATE_DEADLINE, btx);
        deliver(&mut b, &mut [&mut a]);
        deliver(&mut a, &mut [&mut b]);
        deliver(&mut b, &mut [&mut a]);
        let ip_b = granted(&mut brx);

        // a allocates from what it kept.
        let (atx, mut arx) = request();
        a.allocate("ca".into(), DEFAULT_ALLOCATE_DEADLINE, atx);
        deliver(&mut a, &mut [&mut b]);
        let ip_a = granted(&mut arx);

        assert_ne!(ip_a.addr, ip_b.addr);
        assert_eq!(a.ring().owner_of(ip_a.addr), Some(name(1)));
        assert_eq!(b.ring().owner_of(ip_b.addr), Some(name(2)));
    }

    #[test]
    fn test_admin_remove_peer_reassigns() {
        let mut a = allocator(1, 1);
        a.poll(Instant::now());
        a.ring.split("10.2.128.0".parse().unwrap(), name(1), name(3)).unwrap();
        assert!(a.ring().space_owned_by(name(3)) > 0);

        let moved = a.admin_remove_peer(name(3)).unwrap();
        assert_eq!(moved, 1);
        assert_eq!(a.ring().space_owned_by(name(3)), 0);
        assert!(matches!(a.admin_remove_peer(name(3)), Err(IpamError::AlreadyRemoved(_))));
        assert!(matches!(a.admin_remove_peer(name(1)), Err(IpamError::RemoveSelf)));
    }

    #[test]
    fn test_removed_peer_cannot_return() {
        let mut a = allocator(1, 1);
        a.poll(Instant::now());
        a.ring.split("10.2.128.0".parse().unwrap(), name(1), name(3)).unwrap();

        // Capture peer 3's view before removal, then advance its version.
        let mut stale = allocator(3, 1);
        let state = a.state_payload();
        stale.on_gossip_broadcast(&state).unwrap();
        a.admin_remove_peer(name(3)).unwrap();
        stale.ring.transfer("10.2.128.0".parse().unwrap(), name(3), name(3)).unwrap();
        stale.ring.transfer("10.2.128.0".parse().unwrap(), name(3), name(3)).unwrap();

        let mut payload = vec![MSG_STATE];
        payload.extend_from_slice(&stale.ring.encode());
        wire::put_u16(&mut payload, 0);
        a.on_gossip_broadcast(&payload).unwrap();
        assert_eq!(a.ring().space_owned_by(name(3)), 0);
    }

    #[test]
    fn test_state_gossip_roundtrip() {
        let mut a = allocator(1, 1);
        a.poll(Instant::now());
        let mut c = Allocator::new(name(3), "10.2.0.0/16".parse().unwrap(), 2);
        let state = a.gossip();
        assert!(c.on_gossip_broadcast(&state).unwrap().is_some());
        assert!(c.ring().is_seeded());
        // Identical state again: no change, no re-broadcast.
        assert!(c.on_gossip_broadcast(&state).unwrap().is_none());
    }
}
