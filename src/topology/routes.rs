//! Route computation over the symmetric-edge subgraph.
//!
//! Unicast routes come from a breadth-first search rooted at the local
//! peer: each reachable destination maps to the directly connected next
//! hop, ties broken towards the lexicographically smaller neighbour.
//! Destinations with no symmetric path are simply absent, which surfaces
//! as a no-route drop in the forwarder.
//!
//! Broadcast uses per-source spanning trees: for a frame originating at
//! peer S, we forward only to our children in S's BFS tree. Every peer
//! applies the same deterministic construction, so each broadcast crosses
//! each established edge at most once and costs at most N-1 sends total.

use std::collections::{HashMap, VecDeque};

use super::Topology;
use crate::peer::PeerName;

/// Immutable routing tables, rebuilt whenever the topology changes.
#[derive(Debug, Default)]
pub struct Routes {
    /// destination -> directly connected next hop.
    unicast: HashMap<PeerName, PeerName>,
    /// broadcast source -> our children in that source's spanning tree.
    broadcast: HashMap<PeerName, Vec<PeerName>>,
}

impl Routes {
    /// Compute fresh tables from the topology.
    pub fn compute(topology: &Topology) -> Routes {
        let ourself = topology.ourself_name();
        let mut unicast = HashMap::new();

        // BFS from ourselves; neighbours are visited in name order, so the
        // first (and kept) assignment for any destination rides the
        // smallest next hop among shortest paths.
        let mut queue = VecDeque::new();
        for neighbour in topology.symmetric_neighbours(&ourself) {
            if !unicast.contains_key(&neighbour) {
                unicast.insert(neighbour, neighbour);
                queue.push_back(neighbour);
            }
        }
        while let Some(current) = queue.pop_front() {
            let via = unicast[&current];
            for next in topology.symmetric_neighbours(&current) {
                if next != ourself && !unicast.contains_key(&next) {
                    unicast.insert(next, via);
                    queue.push_back(next);
                }
            }
        }

        let mut broadcast = HashMap::new();
        for source in topology.names() {
            broadcast.insert(*source, Self::tree_children(topology, *source, ourself));
        }

        Routes { unicast, broadcast }
    }

    /// Our children in the BFS tree rooted at `source`.
    fn tree_children(topology: &Topology, source: PeerName, ourself: PeerName) -> Vec<PeerName> {
        let mut parent: HashMap<PeerName, PeerName> = HashMap::new();
        let mut queue = VecDeque::new();
        parent.insert(source, source);
        queue.push_back(source);
        while let Some(current) = queue.pop_front() {
            for next in topology.symmetric_neighbours(&current) {
                if !parent.contains_key(&next) {
                    parent.insert(next, current);
                    queue.push_back(next);
                }
            }
        }
        let mut children: Vec<PeerName> = parent
            .iter()
            .filter(|(child, p)| **p == ourself && **child != ourself)
            .map(|(child, _)| *child)
            .collect();
        children.sort();
        children
    }

    /// Next hop towards `dest`, if it is reachable.
    pub fn next_hop(&self, dest: &PeerName) -> Option<PeerName> {
        self.unicast.get(dest).copied()
    }

    /// Peers we must relay a broadcast from `source` to.
    ///
    /// An unknown source yields no children: we cannot place it in any
    /// tree, and the periodic gossip will catch the topology up.
    pub fn broadcast_children(&self, source: &PeerName) -> &[PeerName] {
        self.broadcast.get(source).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The full unicast table, for status reporting.
    pub fn unicast_table(&self) -> &HashMap<PeerName, PeerName> {
        &self.unicast
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{ConnectionSummary, Peer};
    use std::collections::BTreeMap;

    fn name(i: u8) -> PeerName {
        PeerName::from_mac([0, 0, 0, 0, 0, i])
    }

    /// Build a topology from symmetric edges, rooted at `local`.
    fn build(local: u8, edges: &[(u8, u8)]) -> Topology {
        let mut nodes: BTreeMap<u8, Vec<u8>> = BTreeMap::new();
        for &(a, b) in edges {
            nodes.entry(a).or_default().push(b);
            nodes.entry(b).or_default().push(a);
        }
        let make = |i: u8, connected: &[u8]| {
            let mut p = Peer::new(name(i), format!("peer-{}", i), u64::from(i));
            p.version = 1;
            for &c in connected {
                p.connections.insert(name(c), ConnectionSummary::default());
            }
            p
        };
        let mut topo = Topology::new(make(local, nodes.get(&local).cloned().unwrap_or_default().as_slice()));
        let mut buf = Vec::new();
        for (&i, connected) in &nodes {
            if i != local {
                make(i, connected).encode_to(&mut buf);
            }
        }
        topo.apply_update(&buf).unwrap();
        topo
    }

    #[test]
    fn test_direct_neighbour_routes_to_itself() {
        let topo = build(1, &[(1, 2)]);
        let routes = Routes::compute(&topo);
        assert_eq!(routes.next_hop(&name(2)), Some(name(2)));
    }

    #[test]
    fn test_multi_hop_route() {
        let topo = build(1, &[(1, 2), (2, 3)]);
        let routes = Routes::compute(&topo);
        assert_eq!(routes.next_hop(&name(3)), Some(name(2)));
    }

    #[test]
    fn test_no_route_for_asymmetric_edge() {
        // 3 claims an edge to 2 but 2 does not reciprocate.
        let mut topo = build(1, &[(1, 2)]);
        let mut p3 = Peer::new(name(3), "peer-3", 3);
        p3.version = 1;
        p3.connections.insert(name(2), ConnectionSummary::default());
        // Make 3 reachable in the directed graph so it survives GC.
        let mut p2 = topo.get(&name(2)).unwrap().clone();
        p2.version += 1;
        p2.connections.insert(name(3), ConnectionSummary::default());
        let mut buf = Vec::new();
        p2.encode_to(&mut buf);
        p3.encode_to(&mut buf);
        topo.apply_update(&buf).unwrap();

        let routes = Routes::compute(&topo);
        // Edge 2<->3 is established (both advertise it) only if symmetric;
        // here 2 advertises 3 and 3 advertises 2, so it routes.
        assert_eq!(routes.next_hop(&name(3)), Some(name(2)));

        // But a peer nobody reciprocates gets no route.
        let topo2 = build(1, &[(1, 2)]);
        let routes2 = Routes::compute(&topo2);
        assert_eq!(routes2.next_hop(&name(9)), None);
    }

    #[test]
    fn test_tie_break_prefers_smaller_next_hop() {
        // Two equal-length paths to 4: via 2 and via 3.
        let topo = build(1, &[(1, 2), (1, 3), (2, 4), (3, 4)]);
        let routes = Routes::compute(&topo);
        assert_eq!(routes.next_hop(&name(4)), Some(name(2)));
    }

    #[test]
    fn test_routes_continue_toward_destination() {
        // Triangle with a tail: verify next hops chain without cycles.
        let edges = [(1, 2), (2, 3), (1, 3), (3, 4)];
        for local in [1u8, 2, 3, 4] {
            for dest in [1u8, 2, 3, 4] {
                if dest == local {
                    continue;
                }
                let mut at = local;
                let mut hops = 0;
                while at != dest {
                    let routes_at = Routes::compute(&build(at, &edges));
                    at = routes_at.next_hop(&name(dest)).unwrap().as_u64() as u8;
                    hops += 1;
                    assert!(hops <= 4, "route cycles from {} to {}", local, dest);
                }
            }
        }
    }

    #[test]
    fn test_broadcast_children_line() {
        // Line 1-2-3: from source 1, peer 2's child is 3.
        let topo = build(2, &[(1, 2), (2, 3)]);
        let routes = Routes::compute(&topo);
        assert_eq!(routes.broadcast_children(&name(1)), &[name(3)]);
        // From source 3, peer 2 forwards to 1.
        assert_eq!(routes.broadcast_children(&name(3)), &[name(1)]);
    }

    #[test]
    fn test_broadcast_no_echo_in_triangle() {
        // Full triangle: each broadcast crosses each edge at most once.
        let topo_a = build(1, &[(1, 2), (1, 3), (2, 3)]);
        let routes_a = Routes::compute(&topo_a);
        // As the source we send to our tree children: both neighbours.
        assert_eq!(routes_a.broadcast_children(&name(1)), &[name(2), name(3)]);

        // Peer 2 receiving a broadcast from 1 must not relay to 3
        // (3 is 1's child, not 2's).
        let topo_b = build(2, &[(1, 2), (1, 3), (2, 3)]);
        let routes_b = Routes::compute(&topo_b);
        assert_eq!(routes_b.broadcast_children(&name(1)), &[] as &[PeerName]);
    }

    #[test]
    fn test_unknown_broadcast_source() {
        let topo = build(1, &[(1, 2)]);
        let routes = Routes::compute(&topo);
        assert_eq!(routes.broadcast_children(&name(77)), &[] as &[PeerName]);
    }
}
