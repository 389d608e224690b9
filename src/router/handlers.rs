//! Event dispatch: frames, datagrams, captured frames, ticks, control.
//!
//! Everything here runs on the router's event loop and is synchronous;
//! sends go through per-connection writer queues or non-blocking UDP, so
//! the packet path never suspends on gossip work.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

use super::{
    ConnectionStatus, ControlRequest, PeerStatus, RouteStatus, Router, RouterEvent, StatusReport,
    VERSION,
};
use crate::connection::{duplicate_winner, ConnId, ConnectionState};
use crate::crypto::TAG_SIZE;
use crate::forwarder::{CaptureAction, ForwardAction};
use crate::gossip::{
    channel_hash, ChannelMessage, Gossiper, UnicastMessage, IPAM_CHANNEL, TOPOLOGY_CHANNEL,
};
use crate::ipam::{IpamAction, IpamError, DEFAULT_ALLOCATE_DEADLINE};
use crate::peer::{ConnectionSummary, PeerName};
use crate::protocol::{self, Greeting, MessageTag, UDP_HEADER_SIZE};
use crate::topology::Routes;

impl Router {
    pub(super) fn handle_event(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::Inbound(stream, addr) => self.handle_inbound(stream, addr),
            RouterEvent::DialDone { target, result } => self.handle_dial_done(target, result),
            RouterEvent::Frame { conn, body } => self.handle_frame(conn, body),
            RouterEvent::Closed { conn, reason } => {
                self.drop_connection(conn, reason.as_deref())
            }
            RouterEvent::Datagram { from, data } => self.handle_datagram(from, &data),
            RouterEvent::Control(request) => self.handle_control(request),
        }
    }

    // === TCP connection events ===

    fn handle_inbound(&mut self, stream: TcpStream, addr: SocketAddr) {
        debug!(%addr, "inbound connection");
        self.adopt_socket(stream, false, None);
    }

    fn handle_dial_done(&mut self, target: String, result: Result<TcpStream, String>) {
        match result {
            Ok(stream) => {
                if self.maker.is_target(&target) {
                    self.adopt_socket(stream, true, Some(target));
                } else {
                    // Forgotten while the dial was in flight.
                    debug!(%target, "dropping dial result for forgotten target");
                }
            }
            Err(e) => {
                debug!(%target, error = %e, "dial failed");
                self.maker.attempt_failed(&target, Instant::now());
            }
        }
    }

    fn handle_frame(&mut self, conn_id: ConnId, body: Vec<u8>) {
        let Some(conn) = self.connections.get(&conn_id) else {
            return;
        };
        match conn.state() {
            ConnectionState::AwaitingGreeting => match Greeting::decode(&body) {
                Ok(greeting) => self.handle_greeting(conn_id, greeting),
                Err(e) => self.drop_connection(conn_id, Some(&e.to_string())),
            },
            ConnectionState::AwaitingKeyExchange => {
                let password = self.config.password.clone().unwrap_or_default();
                let conn = self.connections.get_mut(&conn_id).expect("checked above");
                if let Err(e) = conn.accept_key_exchange(&body, &password) {
                    self.drop_connection(conn_id, Some(&e.to_string()));
                }
            }
            ConnectionState::Pending | ConnectionState::Established => {
                let conn = self.connections.get_mut(&conn_id).expect("checked above");
                let plain = match conn.open(body) {
                    Ok(plain) => plain,
                    Err(e) => {
                        self.drop_connection(conn_id, Some(&e.to_string()));
                        return;
                    }
                };
                match protocol::split_message(&plain) {
                    Ok((tag, payload)) => {
                        let payload = payload.to_vec();
                        self.handle_message(conn_id, tag, payload);
                    }
                    Err(e) => self.drop_connection(conn_id, Some(&e.to_string())),
                }
            }
            ConnectionState::Terminated => {}
        }
    }

    fn handle_greeting(&mut self, conn_id: ConnId, greeting: Greeting) {
        let ourself = self.topology.ourself_name();
        let conn = self.connections.get(&conn_id).expect("caller checked");
        let outbound = conn.outbound;
        let target = conn.target.clone();

        if greeting.password_expected != self.config.encrypted() {
            self.drop_connection(conn_id, Some("password expectation mismatch"));
            return;
        }

        if greeting.name == ourself {
            // Dialled ourselves; stop trying that address for good.
            if let Some(target) = target {
                self.maker.forget(&target);
            }
            self.release_target(conn_id);
            self.drop_connection(conn_id, Some("connection to ourself"));
            return;
        }

        if self.config.conn_limit > 0 && self.connections.len() > self.config.conn_limit {
            self.drop_connection(conn_id, Some("connection limit reached"));
            return;
        }

        // Both ends dialling each other produces two connections to the
        // same peer; both ends keep the one whose initiator has the
        // smaller name.
        if let Some(&existing_id) = self.by_name.get(&greeting.name) {
            if existing_id != conn_id && self.connections.contains_key(&existing_id) {
                if duplicate_winner(ourself, greeting.name, outbound) {
                    self.drop_connection(existing_id, Some("superseded by duplicate"));
                } else {
                    // The peer is reachable; losing the tie is not a
                    // dial failure.
                    if let Some(target) = &target {
                        self.maker.attempt_succeeded(target);
                    }
                    self.release_target(conn_id);
                    self.drop_connection(conn_id, Some("duplicate connection"));
                    return;
                }
            }
        }

        let use_password = self.config.encrypted();
        let (pubkey, remote) = {
            let conn = self.connections.get_mut(&conn_id).expect("caller checked");
            let pubkey = conn.accept_greeting(&greeting, use_password);
            (pubkey, conn.remote().expect("just accepted").clone())
        };
        if let Some(pubkey) = pubkey {
            let queued = self
                .connections
                .get(&conn_id)
                .map(|conn| conn.enqueue(pubkey.to_vec()))
                .unwrap_or(false);
            if !queued {
                self.drop_connection(conn_id, Some("writer stalled during key exchange"));
                return;
            }
        }
        self.by_name.insert(greeting.name, conn_id);
        info!(
            peer = %remote.name,
            nick = %remote.nick_name,
            udp = %remote.udp_addr,
            outbound,
            "greeting accepted"
        );
    }

    /// Detach a connection from its maker target so teardown does not
    /// count it as a dial failure.
    fn release_target(&mut self, conn_id: ConnId) {
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.target = None;
        }
    }

    /// Common teardown: closes the socket (via writer drop), updates the
    /// maker, and re-gossips our shrunken connection set if needed.
    pub(super) fn drop_connection(&mut self, conn_id: ConnId, reason: Option<&str>) {
        let Some(mut conn) = self.connections.remove(&conn_id) else {
            return;
        };
        let was_established = conn.is_established();
        conn.terminate();
        if let Some(name) = conn.remote_name() {
            if self.by_name.get(&name) == Some(&conn_id) {
                self.by_name.remove(&name);
            }
        }
        if let Some(reason) = reason {
            info!(
                conn = conn_id,
                peer = ?conn.remote_name(),
                reason,
                "connection closed"
            );
        }
        if let Some(target) = &conn.target {
            if was_established {
                self.maker.connection_terminated(target);
            } else {
                self.maker.attempt_failed(target, Instant::now());
            }
        }
        if was_established {
            self.self_update();
        }
    }

    // === Established message dispatch ===

    fn handle_message(&mut self, conn_id: ConnId, tag: MessageTag, payload: Vec<u8>) {
        match tag {
            MessageTag::ConnectionEstablished => {
                let conn = match self.connections.get_mut(&conn_id) {
                    Some(conn) => conn,
                    None => return,
                };
                if conn.established_ack() {
                    self.on_established(conn_id);
                }
            }
            MessageTag::PmtuVerified => {
                if payload.len() < 2 {
                    self.drop_connection(conn_id, Some("short pmtu ack"));
                    return;
                }
                let size = u16::from_be_bytes([payload[0], payload[1]]) as usize;
                if let Some(conn) = self.connections.get_mut(&conn_id) {
                    if conn.pmtu_verified(size) {
                        debug!(conn = conn_id, pmtu = size, "path MTU verified");
                    }
                }
            }
            MessageTag::Gossip | MessageTag::GossipBroadcast => {
                match ChannelMessage::decode(&payload) {
                    Ok(msg) => self.dispatch_gossip(conn_id, msg),
                    Err(e) => self.drop_connection(conn_id, Some(&e.to_string())),
                }
            }
            MessageTag::GossipUnicast => match UnicastMessage::decode(&payload) {
                Ok(msg) => self.handle_gossip_unicast(conn_id, msg),
                Err(e) => self.drop_connection(conn_id, Some(&e.to_string())),
            },
            MessageTag::Heartbeat | MessageTag::FragmentationTest | MessageTag::FrameForward => {
                // UDP-only tags have no business on the TCP stream.
                debug!(conn = conn_id, %tag, "ignoring udp-only tag on tcp");
            }
        }
    }

    fn on_established(&mut self, conn_id: ConnId) {
        let Some(conn) = self.connections.get(&conn_id) else {
            return;
        };
        let remote = conn.remote().expect("established implies greeting").clone();
        if let Some(target) = conn.target.clone() {
            self.maker.attempt_succeeded(&target);
        }
        info!(peer = %remote.name, nick = %remote.nick_name, "connection established");
        self.self_update();
        self.send_full_gossip_to(conn_id);
    }

    /// Bump our version, recompute routes, and gossip the delta.
    fn self_update(&mut self) {
        let mut connections = BTreeMap::new();
        for (name, conn_id) in &self.by_name {
            if let Some(conn) = self.connections.get(conn_id) {
                if conn.is_established() {
                    let remote_addr = conn.outbound.then_some(conn.tcp_addr);
                    connections.insert(*name, ConnectionSummary { remote_addr });
                }
            }
        }
        let record = self.topology.update_self(connections);
        self.routes = Routes::compute(&self.topology);
        self.sync_allocator();
        let payload = record.encode();
        self.broadcast_gossip(MessageTag::GossipBroadcast, TOPOLOGY_CHANNEL, payload, None);
    }

    // === Gossip ===

    fn dispatch_gossip(&mut self, from_conn: ConnId, msg: ChannelMessage) {
        if msg.channel == channel_hash(TOPOLOGY_CHANNEL) {
            match self.topology.apply_update(&msg.payload) {
                Ok(delta) if !delta.is_empty() => {
                    self.routes = Routes::compute(&self.topology);
                    for name in &delta.removed {
                        self.forwarder.forget_peer(name);
                    }
                    self.learn_targets_from_topology();
                    self.sync_allocator();
                    let payload = self.topology.encode_subset(&delta.changed);
                    if !payload.is_empty() {
                        self.broadcast_gossip(
                            MessageTag::GossipBroadcast,
                            TOPOLOGY_CHANNEL,
                            payload,
                            Some(from_conn),
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(conn = from_conn, error = %e, "bad topology gossip");
                    self.drop_connection(from_conn, Some(&e.to_string()));
                }
            }
        } else if msg.channel == channel_hash(IPAM_CHANNEL) {
            let Some(allocator) = self.allocator.as_mut() else {
                trace!("ignoring IPAM gossip, allocation disabled here");
                return;
            };
            match allocator.on_gossip_broadcast(&msg.payload) {
                Ok(changed) => {
                    if let Some(delta) = changed {
                        self.broadcast_gossip(
                            MessageTag::GossipBroadcast,
                            IPAM_CHANNEL,
                            delta,
                            Some(from_conn),
                        );
                    }
                    self.sync_allocator();
                }
                Err(e) => {
                    warn!(conn = from_conn, error = %e, "bad IPAM gossip");
                    self.drop_connection(from_conn, Some(&e.to_string()));
                }
            }
        } else {
            debug!(channel = msg.channel, "gossip for unknown channel");
        }
    }

    fn handle_gossip_unicast(&mut self, from_conn: ConnId, msg: UnicastMessage) {
        if msg.dest == self.topology.ourself_name() {
            let sender = self
                .connections
                .get(&from_conn)
                .and_then(|c| c.remote_name())
                .unwrap_or(PeerName::UNKNOWN);
            if msg.channel == channel_hash(IPAM_CHANNEL) {
                let Some(allocator) = self.allocator.as_mut() else {
                    return;
                };
                if let Err(e) = allocator.on_gossip_unicast(sender, &msg.payload) {
                    warn!(conn = from_conn, error = %e, "bad IPAM unicast");
                    self.drop_connection(from_conn, Some(&e.to_string()));
                    return;
                }
                self.sync_allocator();
            } else {
                debug!(channel = msg.channel, "unicast for channel without a handler");
            }
        } else {
            // Relay towards the destination on our own route table.
            match self.routes.next_hop(&msg.dest) {
                Some(hop) => {
                    let body =
                        protocol::message(MessageTag::GossipUnicast, &msg.encode());
                    self.enqueue_to_peer(hop, body);
                }
                None => debug!(dest = %msg.dest, "dropping unroutable gossip unicast"),
            }
        }
    }

    /// Send a tagged gossip message to every established connection,
    /// optionally excluding the one it came from. Full writer queues
    /// drop the message; the periodic gossip heals the gap.
    fn broadcast_gossip(
        &mut self,
        tag: MessageTag,
        channel: &str,
        payload: Vec<u8>,
        except: Option<ConnId>,
    ) {
        let body = protocol::message(tag, &ChannelMessage::new(channel_hash(channel), payload).encode());
        let ids: Vec<ConnId> = self
            .by_name
            .values()
            .copied()
            .filter(|id| Some(*id) != except)
            .collect();
        for conn_id in ids {
            let Some(conn) = self.connections.get_mut(&conn_id) else {
                continue;
            };
            if !conn.is_established() {
                continue;
            }
            match conn.seal(body.clone()) {
                Ok(sealed) => {
                    if !conn.enqueue(sealed) {
                        trace!(conn = conn_id, "gossip dropped, writer queue full");
                    }
                }
                Err(e) => debug!(conn = conn_id, error = %e, "gossip seal failed"),
            }
        }
    }

    /// Route a unicast gossip payload towards `dest`.
    fn send_gossip_unicast(&mut self, dest: PeerName, channel: &str, payload: Vec<u8>) {
        let msg = UnicastMessage::new(channel_hash(channel), dest, payload);
        let hop = if self.by_name.contains_key(&dest) {
            Some(dest)
        } else {
            self.routes.next_hop(&dest)
        };
        match hop {
            Some(hop) => {
                let body = protocol::message(MessageTag::GossipUnicast, &msg.encode());
                self.enqueue_to_peer(hop, body);
            }
            None => debug!(%dest, "no route for gossip unicast"),
        }
    }

    /// Full state push to one connection, right after establishment.
    fn send_full_gossip_to(&mut self, conn_id: ConnId) {
        let mut bodies = vec![protocol::message(
            MessageTag::Gossip,
            &ChannelMessage::new(channel_hash(TOPOLOGY_CHANNEL), self.topology.encode_all())
                .encode(),
        )];
        if let Some(allocator) = self.allocator.as_mut() {
            bodies.push(protocol::message(
                MessageTag::Gossip,
                &ChannelMessage::new(channel_hash(IPAM_CHANNEL), allocator.gossip()).encode(),
            ));
        }
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            for body in bodies {
                match conn.seal(body) {
                    Ok(sealed) => {
                        let _ = conn.enqueue(sealed);
                    }
                    Err(e) => debug!(conn = conn_id, error = %e, "gossip seal failed"),
                }
            }
        }
    }

    fn enqueue_to_peer(&mut self, peer: PeerName, body: Vec<u8>) {
        let Some(&conn_id) = self.by_name.get(&peer) else {
            return;
        };
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return;
        };
        if !conn.is_established() {
            return;
        }
        match conn.seal(body) {
            Ok(sealed) => {
                let _ = conn.enqueue(sealed);
            }
            Err(e) => debug!(peer = %peer, error = %e, "seal failed"),
        }
    }

    /// Addresses advertised in gossiped records become dial targets.
    fn learn_targets_from_topology(&mut self) {
        let ourself = self.topology.ourself_name();
        let addrs: Vec<SocketAddr> = self
            .topology
            .peers()
            .filter(|p| p.name != ourself)
            .flat_map(|p| p.connections.values())
            .filter_map(|summary| summary.remote_addr)
            .collect();
        for addr in addrs {
            self.maker.add_target(addr.to_string());
        }
    }

    fn sync_allocator(&mut self) {
        let Some(allocator) = self.allocator.as_mut() else {
            return;
        };
        let names: Vec<PeerName> = self.topology.names().copied().collect();
        allocator.observe_peers(names);
        let actions = allocator.poll(Instant::now());
        self.apply_ipam_actions(actions);
    }

    fn apply_ipam_actions(&mut self, actions: Vec<IpamAction>) {
        for action in actions {
            match action {
                IpamAction::Broadcast(payload) => {
                    self.broadcast_gossip(MessageTag::GossipBroadcast, IPAM_CHANNEL, payload, None)
                }
                IpamAction::Unicast { dest, payload } => {
                    self.send_gossip_unicast(dest, IPAM_CHANNEL, payload)
                }
            }
        }
    }

    // === UDP ===

    fn handle_datagram(&mut self, _from: SocketAddr, data: &[u8]) {
        let (tag, sender, body) = match protocol::split_udp_datagram(data) {
            Ok(parts) => parts,
            Err(e) => {
                trace!(error = %e, "undecodable datagram");
                return;
            }
        };
        let Some(&conn_id) = self.by_name.get(&sender) else {
            trace!(%sender, "datagram from unknown peer");
            return;
        };
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return;
        };
        let payload = match conn.udp_open(body) {
            Ok(payload) => payload,
            Err(_) => {
                // Stale keys from a dead incarnation; not worth failing
                // the connection over a lossy datagram.
                trace!(%sender, "datagram failed to open");
                return;
            }
        };
        if conn.heard_udp(Instant::now()) {
            // First datagram from this peer: ack over TCP so they can
            // count the round-trip.
            let ack = protocol::message(MessageTag::ConnectionEstablished, &[]);
            match conn.seal(ack) {
                Ok(sealed) => {
                    if !conn.enqueue(sealed) {
                        self.drop_connection(conn_id, Some("writer stalled during establishment"));
                        return;
                    }
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.drop_connection(conn_id, Some(&reason));
                    return;
                }
            }
        }

        match tag {
            MessageTag::Heartbeat => {} // liveness was the payload
            MessageTag::FragmentationTest => {
                if payload.len() >= 2 {
                    let probed = [payload[0], payload[1]];
                    let ack = protocol::message(MessageTag::PmtuVerified, &probed);
                    self.enqueue_to_peer(sender, ack);
                }
            }
            MessageTag::FrameForward => {
                match self.forwarder.handle_datagram(sender, &payload, &self.routes) {
                    Ok(actions) => {
                        for action in actions {
                            match action {
                                ForwardAction::Inject(frame) => self.inject_frame(frame),
                                ForwardAction::Relay { to, body } => {
                                    for peer in to {
                                        self.send_frame_body(peer, &body);
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => trace!(%sender, error = %e, "undecodable frame fragment"),
                }
            }
            _ => trace!(%tag, "unexpected tag on udp"),
        }
    }

    fn inject_frame(&mut self, frame: Vec<u8>) {
        if let Some(inject) = &self.inject {
            if inject.send(frame).is_err() {
                debug!("inject channel closed");
            }
        }
    }

    /// UDP payload budget for a connection: PMTU minus header and seal.
    fn frame_budget(&self, conn_id: ConnId) -> Option<usize> {
        let conn = self.connections.get(&conn_id)?;
        let seal = if conn.encrypted() { TAG_SIZE } else { 0 };
        Some(conn.pmtu().saturating_sub(UDP_HEADER_SIZE + seal))
    }

    /// Seal and send one fragment body to a directly connected peer.
    fn send_frame_body(&mut self, peer: PeerName, body: &[u8]) {
        let ourself = self.topology.ourself_name();
        let Some(&conn_id) = self.by_name.get(&peer) else {
            self.forwarder.note_no_route();
            return;
        };
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return;
        };
        if !conn.is_established() {
            return;
        }
        let Some(remote) = conn.remote() else {
            return;
        };
        let udp_addr = remote.udp_addr;
        match conn.udp_seal(body) {
            Ok(sealed) => {
                let dgram = protocol::udp_datagram(MessageTag::FrameForward, ourself, &sealed);
                if let Err(e) = self.udp.try_send_to(&dgram, udp_addr) {
                    trace!(%peer, error = %e, "udp send failed");
                }
            }
            Err(e) => debug!(%peer, error = %e, "udp seal failed"),
        }
    }

    // === Capture path ===

    pub(super) fn handle_captured(&mut self, frame: &[u8]) {
        let ourself = self.topology.ourself_name();
        match self.forwarder.handle_captured(frame) {
            CaptureAction::Drop | CaptureAction::Local => {}
            CaptureAction::Flood => {
                let children: Vec<PeerName> = self
                    .routes
                    .broadcast_children(&ourself)
                    .iter()
                    .copied()
                    .filter(|peer| self.by_name.contains_key(peer))
                    .collect();
                if children.is_empty() {
                    return;
                }
                let budget = children
                    .iter()
                    .filter_map(|peer| {
                        self.by_name.get(peer).and_then(|id| self.frame_budget(*id))
                    })
                    .min()
                    .unwrap_or(0);
                let bodies = self.forwarder.fragment(PeerName::UNKNOWN, frame, budget);
                for body in bodies {
                    for peer in &children {
                        self.send_frame_body(*peer, &body);
                    }
                }
            }
            CaptureAction::Forward(owner) => {
                let hop = if self.by_name.contains_key(&owner) {
                    owner
                } else {
                    match self.routes.next_hop(&owner) {
                        Some(hop) => hop,
                        None => {
                            self.forwarder.note_no_route();
                            return;
                        }
                    }
                };
                let Some(&conn_id) = self.by_name.get(&hop) else {
                    self.forwarder.note_no_route();
                    return;
                };
                let Some(budget) = self.frame_budget(conn_id) else {
                    return;
                };
                let bodies = self.forwarder.fragment(owner, frame, budget);
                for body in bodies {
                    self.send_frame_body(hop, &body);
                }
            }
        }
    }

    // === Ticks ===

    pub(super) fn heartbeat_tick(&mut self) {
        let now = Instant::now();
        let ourself = self.topology.ourself_name();
        let ids: Vec<ConnId> = self.connections.keys().copied().collect();
        let mut dead: Vec<(ConnId, &'static str)> = Vec::new();

        for conn_id in ids {
            let Some(conn) = self.connections.get_mut(&conn_id) else {
                continue;
            };
            if conn.handshake_overdue(now) {
                dead.push((conn_id, "handshake timed out"));
                continue;
            }
            if !conn.heartbeats_active() {
                continue;
            }
            if conn.heartbeat_overdue(now) {
                dead.push((conn_id, "heartbeat timed out"));
                continue;
            }

            let udp_addr = conn.remote().expect("active implies greeting").udp_addr;
            let seal = if conn.encrypted() { TAG_SIZE } else { 0 };

            // Heartbeat padded to the negotiated PMTU.
            let pad = conn.pmtu().saturating_sub(UDP_HEADER_SIZE + seal);
            if let Ok(sealed) = conn.udp_seal(&vec![0u8; pad]) {
                let dgram = protocol::udp_datagram(MessageTag::Heartbeat, ourself, &sealed);
                let _ = self.udp.try_send_to(&dgram, udp_addr);
            }

            // PMTU probe, while unverified.
            if let Some(candidate) = conn.pmtu_probe_tick() {
                let pad = candidate.saturating_sub(UDP_HEADER_SIZE + seal);
                let mut probe = vec![0u8; pad.max(2)];
                probe[..2].copy_from_slice(&(candidate as u16).to_be_bytes());
                if let Ok(sealed) = conn.udp_seal(&probe) {
                    let dgram =
                        protocol::udp_datagram(MessageTag::FragmentationTest, ourself, &sealed);
                    let _ = self.udp.try_send_to(&dgram, udp_addr);
                }
            }
        }

        for (conn_id, reason) in dead {
            self.drop_connection(conn_id, Some(reason));
        }
    }

    pub(super) fn maker_tick(&mut self) {
        self.forwarder.expire_cache();
        self.forwarder.sweep_partials();
        self.sync_allocator();
        self.maker_pass();
    }

    /// Dial every due target. Runs on the tick and immediately after a
    /// target is added through the control API.
    fn maker_pass(&mut self) {
        let now = Instant::now();
        let connected: HashSet<String> =
            self.connections.values().filter_map(|c| c.target.clone()).collect();
        let due = self.maker.due_targets(now, &|addr: &str| connected.contains(addr));
        for target in due {
            debug!(%target, "dialling");
            self.spawn_dial(target);
        }
    }

    pub(super) fn periodic_gossip(&mut self) {
        let topology = self.topology.encode_all();
        self.broadcast_gossip(MessageTag::Gossip, TOPOLOGY_CHANNEL, topology, None);
        if let Some(allocator) = self.allocator.as_mut() {
            let state = allocator.gossip();
            self.broadcast_gossip(MessageTag::Gossip, IPAM_CHANNEL, state, None);
        }
    }

    // === Control ===

    fn handle_control(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::Status(reply) => {
                let _ = reply.send(self.status_report());
            }
            ControlRequest::Connect { peer, reply } => {
                match crate::connection::normalize_target(&peer, self.config.port) {
                    Ok(address) => {
                        self.maker.add_target(address);
                        self.maker_pass();
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.to_string()));
                    }
                }
            }
            ControlRequest::Forget { peer, reply } => {
                if let Ok(address) = crate::connection::normalize_target(&peer, self.config.port) {
                    self.maker.forget(&address);
                }
                let _ = reply.send(());
            }
            ControlRequest::Allocate { container, reply } => match self.allocator.as_mut() {
                Some(allocator) => {
                    allocator.allocate(container, DEFAULT_ALLOCATE_DEADLINE, reply);
                    self.sync_allocator();
                }
                None => {
                    let _ = reply.send(Err(IpamError::Disabled));
                }
            },
            ControlRequest::Claim { container, addr, reply } => match self.allocator.as_mut() {
                Some(allocator) => {
                    allocator.claim(container, addr, DEFAULT_ALLOCATE_DEADLINE, reply);
                    self.sync_allocator();
                }
                None => {
                    let _ = reply.send(Err(IpamError::Disabled));
                }
            },
            ControlRequest::Free { container, reply } => {
                let released = match self.allocator.as_mut() {
                    Some(allocator) => allocator.free(&container),
                    None => Vec::new(),
                };
                let _ = reply.send(released);
            }
            ControlRequest::RemovePeer { peer, reply } => {
                let result = match PeerName::from_user_input(&peer) {
                    Ok(name) => match self.allocator.as_mut() {
                        Some(allocator) => {
                            allocator.admin_remove_peer(name).map_err(|e| e.to_string())
                        }
                        None => Err(IpamError::Disabled.to_string()),
                    },
                    Err(e) => Err(e.to_string()),
                };
                if result.is_ok() {
                    self.sync_allocator();
                }
                let _ = reply.send(result);
            }
            ControlRequest::DropConnection { peer, reply } => {
                let dropped = match PeerName::from_user_input(&peer) {
                    Ok(name) => match self.by_name.get(&name).copied() {
                        Some(conn_id) => {
                            self.drop_connection(conn_id, Some("closed by operator"));
                            true
                        }
                        None => false,
                    },
                    Err(_) => false,
                };
                let _ = reply.send(dropped);
            }
            ControlRequest::Shutdown => self.stop(),
        }
    }

    fn status_report(&self) -> StatusReport {
        let mut peers: Vec<PeerStatus> = self
            .topology
            .peers()
            .map(|peer| PeerStatus {
                name: peer.name.to_string(),
                nick_name: peer.nick_name.clone(),
                version: peer.version,
                connections: peer.connected_names().map(|n| n.to_string()).collect(),
            })
            .collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));

        let mut routes: Vec<RouteStatus> = self
            .routes
            .unicast_table()
            .iter()
            .map(|(dest, via)| RouteStatus { dest: dest.to_string(), via: via.to_string() })
            .collect();
        routes.sort_by(|a, b| a.dest.cmp(&b.dest));

        let mut connections: Vec<ConnectionStatus> = self
            .connections
            .values()
            .map(|conn| ConnectionStatus {
                peer: conn.remote_name().map(|n| n.to_string()),
                address: conn.tcp_addr.to_string(),
                state: conn.state().to_string(),
                outbound: conn.outbound,
                pmtu: conn.pmtu(),
            })
            .collect();
        connections.sort_by(|a, b| a.address.cmp(&b.address));

        StatusReport {
            version: VERSION.to_string(),
            encryption: self.config.encrypted(),
            name: self.topology.ourself_name().to_string(),
            nick_name: self.config.nick_name.clone(),
            peers,
            routes,
            connections,
            targets: self.maker.status(),
            forwarding: self.forwarder.stats().clone(),
            ipam: self.allocator.as_ref().map(|a| a.status()),
        }
    }
}
