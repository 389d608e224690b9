//! The IPAM token ring.
//!
//! The configured CIDR is divided into half-open ranges by an ordered
//! sequence of tokens; each token names the owner of the addresses from
//! it up to the next token (the last range runs to the end of the CIDR).
//! Every token carries a version, and merging two rings keeps the higher
//! version per token address, which makes merges commutative, idempotent
//! and monotone. Ownership handoff is serialized by that version: only
//! the current owner of a range may move its token or split it.

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::Serialize;
use thiserror::Error;

use crate::peer::PeerName;
use crate::protocol::{wire, ProtocolError};

/// Errors from ring manipulation and merging.
#[derive(Debug, Error)]
pub enum RingError {
    #[error("rings cover different ranges")]
    RangeMismatch,

    #[error("conflicting token at {0}: equal version, different owner")]
    Conflict(Ipv4Addr),

    #[error("token {0} outside the configured range")]
    OutsideRange(Ipv4Addr),

    #[error("no token at {0}")]
    UnknownToken(Ipv4Addr),

    #[error("{owner} does not own the token at {addr}")]
    NotOwner { addr: Ipv4Addr, owner: PeerName },

    #[error("split point {0} does not fall inside the owner's range")]
    BadSplit(Ipv4Addr),

    #[error("undecodable ring: {0}")]
    Undecodable(#[from] ProtocolError),
}

/// One ownership marker on the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Token {
    pub addr: Ipv4Addr,
    pub owner: PeerName,
    pub version: u64,
}

/// A contiguous owned range `[start, end)` in u32 address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct OwnedRange {
    pub token: Ipv4Addr,
    pub owner: PeerName,
    pub start: u32,
    pub end: u32,
}

impl OwnedRange {
    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// The ring itself: a CIDR plus its sorted tokens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ring {
    range: Ipv4Net,
    tokens: Vec<Token>,
}

impl Ring {
    pub fn new(range: Ipv4Net) -> Self {
        Ring { range, tokens: Vec::new() }
    }

    pub fn range(&self) -> Ipv4Net {
        self.range
    }

    /// First address of the range, as u32.
    pub fn start(&self) -> u32 {
        u32::from(self.range.network())
    }

    /// One past the last address of the range, as u32.
    pub fn end(&self) -> u32 {
        u32::from(self.range.broadcast()).wrapping_add(1)
    }

    pub fn is_seeded(&self) -> bool {
        !self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Bootstrap: one token at the range start owning everything.
    pub fn seed(&mut self, owner: PeerName) {
        debug_assert!(self.tokens.is_empty());
        self.tokens.push(Token { addr: self.range.network(), owner, version: 1 });
    }

    fn position(&self, addr: Ipv4Addr) -> Result<usize, usize> {
        self.tokens.binary_search_by_key(&u32::from(addr), |t| u32::from(t.addr))
    }

    /// Owner of `addr`, when the ring is seeded and `addr` is in range.
    pub fn owner_of(&self, addr: Ipv4Addr) -> Option<PeerName> {
        if !self.range.contains(&addr) || self.tokens.is_empty() {
            return None;
        }
        let idx = match self.position(addr) {
            Ok(i) => i,
            Err(0) => return None, // before the first token; cannot happen once seeded at start
            Err(i) => i - 1,
        };
        Some(self.tokens[idx].owner)
    }

    /// All ranges, in address order.
    pub fn ranges(&self) -> Vec<OwnedRange> {
        let mut out = Vec::with_capacity(self.tokens.len());
        for (i, token) in self.tokens.iter().enumerate() {
            let start = u32::from(token.addr);
            let end = match self.tokens.get(i + 1) {
                Some(next) => u32::from(next.addr),
                None => self.end(),
            };
            out.push(OwnedRange { token: token.addr, owner: token.owner, start, end });
        }
        out
    }

    /// Ranges owned by `peer`, in address order.
    pub fn ranges_owned_by(&self, peer: PeerName) -> Vec<OwnedRange> {
        self.ranges().into_iter().filter(|r| r.owner == peer).collect()
    }

    /// Total addresses owned by `peer`.
    pub fn space_owned_by(&self, peer: PeerName) -> u64 {
        self.ranges_owned_by(peer).iter().map(|r| u64::from(r.len())).sum()
    }

    /// Hand the whole range at `token_addr` to `new_owner`.
    ///
    /// Only the current owner calls this; the version bump is what makes
    /// the transfer win the merge everywhere else.
    pub fn transfer(
        &mut self,
        token_addr: Ipv4Addr,
        owner: PeerName,
        new_owner: PeerName,
    ) -> Result<(), RingError> {
        let idx = self.position(token_addr).map_err(|_| RingError::UnknownToken(token_addr))?;
        let token = &mut self.tokens[idx];
        if token.owner != owner {
            return Err(RingError::NotOwner { addr: token_addr, owner });
        }
        token.owner = new_owner;
        token.version += 1;
        Ok(())
    }

    /// Split the range containing `at`, giving `[at, range end)` to
    /// `new_owner`. The splitting peer must own the containing range,
    /// which is what keeps concurrent inserts at one address impossible.
    pub fn split(
        &mut self,
        at: Ipv4Addr,
        owner: PeerName,
        new_owner: PeerName,
    ) -> Result<(), RingError> {
        if !self.range.contains(&at) {
            return Err(RingError::OutsideRange(at));
        }
        let at_u32 = u32::from(at);
        let containing = self
            .ranges()
            .into_iter()
            .find(|r| r.contains(at_u32))
            .ok_or(RingError::BadSplit(at))?;
        if containing.owner != owner {
            return Err(RingError::NotOwner { addr: at, owner });
        }
        if at_u32 == containing.start {
            // Not a split; hand over the whole token.
            return self.transfer(containing.token, owner, new_owner);
        }
        let insert_at = match self.position(at) {
            Ok(_) => return Err(RingError::BadSplit(at)),
            Err(i) => i,
        };
        self.tokens.insert(insert_at, Token { addr: at, owner: new_owner, version: 1 });
        Ok(())
    }

    /// Reassign every token owned by `from` to `to`, bumping versions.
    /// Returns how many tokens moved.
    pub fn reassign_all(&mut self, from: PeerName, to: PeerName) -> usize {
        let mut moved = 0;
        for token in &mut self.tokens {
            if token.owner == from {
                token.owner = to;
                token.version += 1;
                moved += 1;
            }
        }
        moved
    }

    /// Merge another ring into this one.
    ///
    /// Per token address: unknown inserts, higher version replaces, equal
    /// versions must agree. Tokens owned by a peer in `exclude` are
    /// skipped, which is how an admin-removed peer stays out until reset.
    /// Returns true when anything changed.
    pub fn merge(
        &mut self,
        other: &Ring,
        exclude: &dyn Fn(&PeerName) -> bool,
    ) -> Result<bool, RingError> {
        if other.range != self.range {
            return Err(RingError::RangeMismatch);
        }
        let mut changed = false;
        for token in &other.tokens {
            if !self.range.contains(&token.addr) {
                return Err(RingError::OutsideRange(token.addr));
            }
            if exclude(&token.owner) {
                continue;
            }
            match self.position(token.addr) {
                Err(i) => {
                    self.tokens.insert(i, *token);
                    changed = true;
                }
                Ok(i) => {
                    let existing = &mut self.tokens[i];
                    if token.version > existing.version {
                        *existing = *token;
                        changed = true;
                    } else if token.version == existing.version && token.owner != existing.owner {
                        return Err(RingError::Conflict(token.addr));
                    }
                }
            }
        }
        Ok(changed)
    }

    /// Wire encoding: range(4+1), token count(u16), tokens(4+8+8).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + 2 + self.tokens.len() * 20);
        buf.extend_from_slice(&self.range.network().octets());
        buf.push(self.range.prefix_len());
        wire::put_u16(&mut buf, self.tokens.len() as u16);
        for token in &self.tokens {
            buf.extend_from_slice(&token.addr.octets());
            buf.extend_from_slice(&token.owner.to_bytes());
            buf.extend_from_slice(&token.version.to_be_bytes());
        }
        buf
    }

    /// Decode from the front of a reader.
    pub fn decode(r: &mut wire::Reader<'_>) -> Result<Ring, RingError> {
        let net = Ipv4Addr::from(r.take_array::<4>()?);
        let prefix = r.take_u8()?;
        let range =
            Ipv4Net::new(net, prefix).map_err(|_| ProtocolError::Malformed("ring prefix"))?;
        let count = r.take_u16()?;
        let mut tokens = Vec::with_capacity(count as usize);
        let mut last: Option<u32> = None;
        for _ in 0..count {
            let addr = Ipv4Addr::from(r.take_array::<4>()?);
            let owner = PeerName::from_bytes(r.take_array()?);
            let version = u64::from_be_bytes(r.take_array()?);
            if let Some(prev) = last {
                if u32::from(addr) <= prev {
                    return Err(ProtocolError::Malformed("ring token order").into());
                }
            }
            last = Some(u32::from(addr));
            tokens.push(Token { addr, owner, version });
        }
        Ok(Ring { range, tokens })
    }
}

impl fmt::Display for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ring over {}:", self.range)?;
        for r in self.ranges() {
            write!(
                f,
                " [{}, {}) -> {}",
                Ipv4Addr::from(r.start),
                Ipv4Addr::from(r.end),
                r.owner
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(i: u8) -> PeerName {
        PeerName::from_mac([0, 0, 0, 0, 0, i])
    }

    fn ring() -> Ring {
        Ring::new("10.2.0.0/16".parse().unwrap())
    }

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn no_exclusions() -> impl Fn(&PeerName) -> bool {
        |_: &PeerName| false
    }

    #[test]
    fn test_seed_covers_whole_range() {
        let mut r = ring();
        assert!(!r.is_seeded());
        r.seed(name(1));
        let ranges = r.ranges();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start, r.start());
        assert_eq!(ranges[0].end, r.end());
        assert_eq!(r.owner_of(addr("10.2.0.0")), Some(name(1)));
        assert_eq!(r.owner_of(addr("10.2.255.255")), Some(name(1)));
        assert_eq!(r.owner_of(addr("10.3.0.0")), None);
    }

    #[test]
    fn test_split_hands_over_tail() {
        let mut r = ring();
        r.seed(name(1));
        r.split(addr("10.2.128.0"), name(1), name(2)).unwrap();

        assert_eq!(r.owner_of(addr("10.2.0.1")), Some(name(1)));
        assert_eq!(r.owner_of(addr("10.2.128.0")), Some(name(2)));
        assert_eq!(r.owner_of(addr("10.2.200.1")), Some(name(2)));
        assert_eq!(r.space_owned_by(name(1)), 32768);
        assert_eq!(r.space_owned_by(name(2)), 32768);

        // Coverage stays exact: no gaps, no overlaps.
        let ranges = r.ranges();
        assert_eq!(ranges[0].end, ranges[1].start);
        assert_eq!(ranges.last().unwrap().end, r.end());
    }

    #[test]
    fn test_split_requires_ownership() {
        let mut r = ring();
        r.seed(name(1));
        assert!(matches!(
            r.split(addr("10.2.128.0"), name(2), name(3)),
            Err(RingError::NotOwner { .. })
        ));
    }

    #[test]
    fn test_split_at_range_start_transfers() {
        let mut r = ring();
        r.seed(name(1));
        r.split(addr("10.2.0.0"), name(1), name(2)).unwrap();
        assert_eq!(r.tokens().len(), 1);
        assert_eq!(r.tokens()[0].owner, name(2));
        assert_eq!(r.tokens()[0].version, 2);
    }

    #[test]
    fn test_transfer_bumps_version() {
        let mut r = ring();
        r.seed(name(1));
        r.transfer(addr("10.2.0.0"), name(1), name(2)).unwrap();
        assert_eq!(r.tokens()[0].version, 2);
        assert_eq!(r.owner_of(addr("10.2.1.1")), Some(name(2)));
        assert!(matches!(
            r.transfer(addr("10.2.0.0"), name(1), name(3)),
            Err(RingError::NotOwner { .. })
        ));
    }

    #[test]
    fn test_merge_prefers_higher_version() {
        let mut local = ring();
        local.seed(name(1));

        let mut remote = local.clone();
        remote.transfer(addr("10.2.0.0"), name(1), name(2)).unwrap();

        assert!(local.merge(&remote, &no_exclusions()).unwrap());
        assert_eq!(local.owner_of(addr("10.2.0.1")), Some(name(2)));
        // Idempotent: merging again changes nothing.
        assert!(!local.merge(&remote, &no_exclusions()).unwrap());
    }

    #[test]
    fn test_merge_commutative() {
        let mut seeded = ring();
        seeded.seed(name(1));

        let mut version_a = seeded.clone();
        version_a.split(addr("10.2.128.0"), name(1), name(2)).unwrap();
        let mut version_b = seeded.clone();
        version_b.transfer(addr("10.2.0.0"), name(1), name(3)).unwrap();

        let mut ab = version_a.clone();
        ab.merge(&version_b, &no_exclusions()).unwrap();
        let mut ba = version_b.clone();
        ba.merge(&version_a, &no_exclusions()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_merge_conflict_detected() {
        let mut a = ring();
        a.seed(name(1));
        let mut b = ring();
        b.seed(name(2));
        assert!(matches!(a.merge(&b, &no_exclusions()), Err(RingError::Conflict(_))));
    }

    #[test]
    fn test_merge_range_mismatch() {
        let mut a = ring();
        a.seed(name(1));
        let mut b = Ring::new("10.3.0.0/16".parse().unwrap());
        b.seed(name(2));
        assert!(matches!(a.merge(&b, &no_exclusions()), Err(RingError::RangeMismatch)));
    }

    #[test]
    fn test_merge_excludes_removed_owner() {
        let mut local = ring();
        local.seed(name(1));
        local.reassign_all(name(1), name(3));

        // A stale peer claims the range back with a higher version.
        let mut remote = ring();
        remote.seed(name(1));
        remote.transfer(addr("10.2.0.0"), name(1), name(1)).unwrap();
        remote.transfer(addr("10.2.0.0"), name(1), name(1)).unwrap();

        let removed = name(1);
        let changed = local.merge(&remote, &|p: &PeerName| *p == removed).unwrap();
        assert!(!changed);
        assert_eq!(local.owner_of(addr("10.2.0.1")), Some(name(3)));
    }

    #[test]
    fn test_reassign_all() {
        let mut r = ring();
        r.seed(name(1));
        r.split(addr("10.2.64.0"), name(1), name(2)).unwrap();
        r.split(addr("10.2.128.0"), name(2), name(1)).unwrap();
        assert_eq!(r.reassign_all(name(1), name(9)), 2);
        assert_eq!(r.space_owned_by(name(1)), 0);
        assert_eq!(r.space_owned_by(name(9)), 32768 + 16384);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut r = ring();
        r.seed(name(1));
        r.split(addr("10.2.128.0"), name(1), name(2)).unwrap();
        let encoded = r.encode();
        let decoded = Ring::decode(&mut wire::Reader::new(&encoded)).unwrap();
        assert_eq!(decoded, r);
    }

    #[test]
    fn test_decode_rejects_unordered_tokens() {
        let mut r = ring();
        r.seed(name(1));
        r.split(addr("10.2.128.0"), name(1), name(2)).unwrap();
        let mut encoded = r.encode();
        // Swap the two token records (20 bytes each, after the 7-byte head).
        let (head, body) = encoded.split_at_mut(7);
        let _ = head;
        let (first, second) = body.split_at_mut(20);
        let tmp = first.to_vec();
        first.copy_from_slice(&second[..20]);
        second[..20].copy_from_slice(&tmp);
        assert!(Ring::decode(&mut wire::Reader::new(&encoded)).is_err());
    }
}
