//! MAC learning table.
//!
//! Maps MAC addresses to the peer that owns them, learned passively from
//! captured and decapsulated frames. Entries expire after an idle window
//! and the table is capacity bounded, evicting the longest-idle entry.
//! Re-learning an existing MAC under a new owner is normal: containers
//! migrate between hosts.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use super::ethernet::Mac;
use crate::peer::PeerName;

/// Default idle expiry.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// Default capacity bound.
pub const DEFAULT_CAPACITY: usize = 1024;

struct Entry {
    peer: PeerName,
    last_seen: Instant,
}

/// Capacity-bounded, idle-expiring MAC -> peer table.
pub struct MacCache {
    entries: HashMap<Mac, Entry>,
    max_age: Duration,
    capacity: usize,
}

impl MacCache {
    pub fn new(max_age: Duration, capacity: usize) -> Self {
        MacCache { entries: HashMap::new(), max_age, capacity }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_MAX_AGE, DEFAULT_CAPACITY)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record that `mac` was last seen owned by `peer`.
    ///
    /// Returns the previous owner when this changed an existing mapping.
    pub fn learn(&mut self, mac: Mac, peer: PeerName) -> Option<PeerName> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get_mut(&mac) {
            entry.last_seen = now;
            if entry.peer != peer {
                let previous = entry.peer;
                debug!(%mac, from = %previous, to = %peer, "MAC migrated");
                entry.peer = peer;
                return Some(previous);
            }
            return None;
        }

        if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(mac, Entry { peer, last_seen: now });
        None
    }

    /// Owner of `mac`, if known and not expired.
    pub fn lookup(&mut self, mac: &Mac) -> Option<PeerName> {
        let expired = match self.entries.get(mac) {
            None => return None,
            Some(entry) => entry.last_seen.elapsed() > self.max_age,
        };
        if expired {
            self.entries.remove(mac);
            return None;
        }
        self.entries.get(mac).map(|e| e.peer)
    }

    /// Sweep expired entries; called from the router tick.
    pub fn expire(&mut self) -> usize {
        let before = self.entries.len();
        let max_age = self.max_age;
        self.entries.retain(|_, entry| entry.last_seen.elapsed() <= max_age);
        before - self.entries.len()
    }

    /// Drop every entry owned by `peer` (used when a peer leaves).
    pub fn forget_peer(&mut self, peer: &PeerName) {
        self.entries.retain(|_, entry| entry.peer != *peer);
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) =
            self.entries.iter().min_by_key(|(_, e)| e.last_seen).map(|(mac, _)| *mac)
        {
            self.entries.remove(&oldest);
        }
    }

    /// Snapshot for status reporting.
    pub fn snapshot(&self) -> Vec<(Mac, PeerName)> {
        let mut out: Vec<(Mac, PeerName)> =
            self.entries.iter().map(|(mac, e)| (*mac, e.peer)).collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(i: u8) -> Mac {
        Mac([0, 0, 0, 0, 0, i])
    }

    fn peer(i: u8) -> PeerName {
        PeerName::from_mac([0, 0, 0, 0, 1, i])
    }

    #[test]
    fn test_learn_and_lookup() {
        let mut cache = MacCache::with_defaults();
        assert_eq!(cache.learn(mac(1), peer(1)), None);
        assert_eq!(cache.lookup(&mac(1)), Some(peer(1)));
        assert_eq!(cache.lookup(&mac(2)), None);
    }

    #[test]
    fn test_migration_returns_previous_owner() {
        let mut cache = MacCache::with_defaults();
        cache.learn(mac(1), peer(1));
        assert_eq!(cache.learn(mac(1), peer(2)), Some(peer(1)));
        assert_eq!(cache.lookup(&mac(1)), Some(peer(2)));
    }

    #[test]
    fn test_expiry() {
        let mut cache = MacCache::new(Duration::from_millis(0), 16);
        cache.learn(mac(1), peer(1));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.lookup(&mac(1)), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expire_sweep() {
        let mut cache = MacCache::new(Duration::from_millis(0), 16);
        cache.learn(mac(1), peer(1));
        cache.learn(mac(2), peer(2));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.expire(), 2);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut cache = MacCache::new(DEFAULT_MAX_AGE, 2);
        cache.learn(mac(1), peer(1));
        std::thread::sleep(Duration::from_millis(2));
        cache.learn(mac(2), peer(2));
        std::thread::sleep(Duration::from_millis(2));
        cache.learn(mac(3), peer(3));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.lookup(&mac(1)), None);
        assert_eq!(cache.lookup(&mac(3)), Some(peer(3)));
    }

    #[test]
    fn test_forget_peer() {
        let mut cache = MacCache::with_defaults();
        cache.learn(mac(1), peer(1));
        cache.learn(mac(2), peer(1));
        cache.learn(mac(3), peer(2));
        cache.forget_peer(&peer(1));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(&mac(3)), Some(peer(2)));
    }
}
