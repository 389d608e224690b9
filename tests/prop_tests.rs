use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use proptest::prelude::*;

use weave::connection::ConnectionMaker;
use weave::ipam::Ring;
use weave::peer::{ConnectionSummary, Peer, PeerName};
use weave::topology::{Routes, Topology};

fn name(i: u8) -> PeerName {
    PeerName::from_mac([0, 0, 0, 0, 0, i])
}

fn record(i: u8, version: u64, connected: &[u8]) -> Peer {
    let mut peer = Peer::new(name(i), format!("peer-{}", i), u64::from(i));
    peer.version = version;
    for &c in connected {
        peer.connections.insert(name(c), ConnectionSummary::default());
    }
    peer
}

fn encode(records: &[Peer]) -> Vec<u8> {
    let mut buf = Vec::new();
    for record in records {
        record.encode_to(&mut buf);
    }
    buf
}

/// A consistent set of gossip records: one payload per (name, version).
fn record_set() -> impl Strategy<Value = Vec<Peer>> {
    proptest::collection::vec(
        (2u8..7, 1u64..4, proptest::collection::btree_set(1u8..7, 0..4)),
        1..12,
    )
    .prop_map(|entries| {
        let mut seen: BTreeMap<(u8, u64), Peer> = BTreeMap::new();
        for (i, version, connected) in entries {
            let connected: Vec<u8> = connected.into_iter().filter(|c| *c != i).collect();
            seen.entry((i, version)).or_insert_with(|| record(i, version, &connected));
        }
        seen.into_values().collect()
    })
}

proptest! {
    /// Delivering the same records in any per-message order, followed by
    /// one full-state exchange (the periodic gossip), converges every
    /// receiver to the same topology.
    #[test]
    fn topology_merge_order_independent(records in record_set(), seed in 0u64..1000) {
        let mut shuffled = records.clone();
        // Cheap deterministic shuffle driven by the seed.
        let len = shuffled.len();
        let mut state = seed;
        for i in (1..len).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let j = (state >> 33) as usize % (i + 1);
            shuffled.swap(i, j);
        }

        let mut forward = Topology::new(record(1, 1, &[2, 3, 4, 5, 6]));
        for r in &records {
            forward.apply_update(&encode(std::slice::from_ref(r))).unwrap();
        }
        let mut scrambled = Topology::new(record(1, 1, &[2, 3, 4, 5, 6]));
        for r in &shuffled {
            scrambled.apply_update(&encode(std::slice::from_ref(r))).unwrap();
        }

        // Heal transient divergence the way the protocol does: exchange
        // full states both ways.
        let forward_state = forward.encode_all();
        let scrambled_state = scrambled.encode_all();
        forward.apply_update(&scrambled_state).unwrap();
        scrambled.apply_update(&forward_state).unwrap();

        prop_assert_eq!(forward.encode_all(), scrambled.encode_all());
    }

    /// Every next hop makes strict progress: following route tables hop
    /// by hop reaches the destination without revisiting a peer.
    #[test]
    fn routes_reach_without_cycles(
        edges in proptest::collection::btree_set((1u8..8, 1u8..8), 1..16)
    ) {
        let edges: Vec<(u8, u8)> = edges.into_iter().filter(|(a, b)| a != b).collect();
        prop_assume!(!edges.is_empty());

        let mut adjacency: BTreeMap<u8, Vec<u8>> = BTreeMap::new();
        for &(a, b) in &edges {
            adjacency.entry(a).or_default().push(b);
            adjacency.entry(b).or_default().push(a);
        }
        let nodes: Vec<u8> = adjacency.keys().copied().collect();

        let topology_for = |local: u8| {
            let mut topo = Topology::new(record(local, 1, &adjacency[&local]));
            let others: Vec<Peer> = nodes
                .iter()
                .filter(|n| **n != local)
                .map(|n| record(*n, 1, &adjacency[n]))
                .collect();
            topo.apply_update(&encode(&others)).unwrap();
            topo
        };

        for &src in &nodes {
            let routes = Routes::compute(&topology_for(src));
            for &dst in &nodes {
                if src == dst {
                    continue;
                }
                let Some(first) = routes.next_hop(&name(dst)) else {
                    continue; // unreachable: correctly absent
                };
                let mut visited = vec![src];
                let mut at = first.as_u64() as u8;
                while at != dst {
                    prop_assert!(!visited.contains(&at), "cycle via {}", at);
                    visited.push(at);
                    let next_routes = Routes::compute(&topology_for(at));
                    let hop = next_routes.next_hop(&name(dst));
                    prop_assert!(hop.is_some(), "route dead-ends at {}", at);
                    at = hop.unwrap().as_u64() as u8;
                }
            }
        }
    }

    /// After any sequence of splits, transfers and merges with all state
    /// delivered, the ring still covers the CIDR exactly once.
    #[test]
    fn ring_merge_keeps_exact_coverage(
        ops in proptest::collection::vec((0u8..3, 0u32..65536, 1u8..4), 0..12)
    ) {
        let range: ipnet::Ipv4Net = "10.2.0.0/16".parse().unwrap();
        let mut rings = [Ring::new(range), Ring::new(range), Ring::new(range)];
        rings[0].seed(name(1));

        for (op, offset, actor) in ops {
            let idx = (actor - 1) as usize;
            let at = std::net::Ipv4Addr::from(u32::from(range.network()) + offset);
            match op {
                0 => {
                    // Split attempts on ranges the actor does not own
                    // are refused and ignored.
                    let _ = rings[idx].split(at, name(actor), name(actor % 3 + 1));
                }
                1 => {
                    let tokens: Vec<_> = rings[idx].tokens().to_vec();
                    if let Some(token) = tokens.iter().find(|t| t.owner == name(actor)) {
                        let _ = rings[idx].transfer(token.addr, name(actor), name(actor % 3 + 1));
                    }
                }
                _ => {
                    // deliver actor's ring to everyone
                    let snapshot = rings[idx].clone();
                    for ring in rings.iter_mut() {
                        ring.merge(&snapshot, &|_: &PeerName| false).unwrap();
                    }
                }
            }
        }

        // Final full convergence.
        for i in 0..3 {
            let snapshot = rings[i].clone();
            for ring in rings.iter_mut() {
                ring.merge(&snapshot, &|_: &PeerName| false).unwrap();
            }
        }

        for ring in &rings {
            prop_assert_eq!(ring.tokens(), rings[0].tokens());
            let ranges = ring.ranges();
            prop_assert_eq!(u32::from(ranges[0].token), ring.start());
            for window in ranges.windows(2) {
                prop_assert_eq!(window[0].end, window[1].start, "gap or overlap");
            }
            prop_assert_eq!(ranges.last().unwrap().end, ring.end());
        }
    }

    /// Consecutive failures push the next attempt out by at least 80% of
    /// the doubled base delay, up to the cap.
    #[test]
    fn backoff_lower_bound_holds(failures in 1u32..12) {
        let mut maker = ConnectionMaker::new();
        maker.add_target("peer:6783".into());
        let not_connected = |_: &str| false;

        let mut now = Instant::now();
        let due = maker.due_targets(now, &not_connected);
        prop_assert_eq!(due.len(), 1);

        for i in 1..=failures {
            maker.attempt_failed("peer:6783", now);

            let expected = Duration::from_secs(5)
                .saturating_mul(1u32.checked_shl(i - 1).unwrap_or(u32::MAX))
                .min(Duration::from_secs(600));
            let lower = expected.mul_f64(0.8);
            let upper = expected.mul_f64(1.2);

            // Not yet due just before the jittered lower bound.
            let early = now + lower.mul_f64(0.99);
            prop_assert!(maker.due_targets(early, &not_connected).is_empty());

            // Due once past the jittered upper bound; that marks the
            // target trying, ready for the next failure.
            now += upper + Duration::from_millis(1);
            let due = maker.due_targets(now, &not_connected);
            prop_assert_eq!(due.len(), 1);
        }
    }
}
