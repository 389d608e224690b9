//! The router: one actor owning all mutable state.
//!
//! Topology, routes, connections, the MAC cache, the connection maker
//! and the allocator all live inside this one task and are driven
//! serially from its inbox. Socket tasks (TCP accept, per-connection
//! reader/writer pairs, the UDP receive loop) and the capture device
//! threads only move bytes; every decision funnels through
//! [`Router::run`]. That single ownership is what makes topology merges
//! atomic with route recomputation and spares every structure a lock.

mod handlers;

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::RouterConfig;
use crate::connection::{
    maker::TICK_INTERVAL, ConnId, Connection, ConnectionMaker, HEARTBEAT_INTERVAL,
    TargetStatus, WRITER_QUEUE_LEN,
};
use crate::device::{DeviceEvent, DeviceHandle, InjectTx};
use crate::forwarder::{ForwardStats, Forwarder, MacCache};
use crate::gossip::PERIODIC_INTERVAL_SECS;
use crate::ipam::{AllocatedIp, Allocator, IpamError, IpamStatus};
use crate::peer::{Peer, PeerName};
use crate::protocol;
use crate::topology::{Routes, Topology};

/// Crate version reported in status output.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Dial timeout for outbound connection attempts.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Router inbox depth.
const EVENT_QUEUE_LEN: usize = 1024;

/// Errors that prevent the router from starting or keep it from running.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("failed to bind {what} on port {port}: {source}")]
    Bind { what: &'static str, port: u16, source: std::io::Error },

    #[error("router inbox closed")]
    InboxClosed,
}

/// Everything that can land in the router's inbox.
#[derive(Debug)]
pub enum RouterEvent {
    /// A peer connected to our listener.
    Inbound(TcpStream, SocketAddr),
    /// An outbound dial finished.
    DialDone { target: String, result: Result<TcpStream, String> },
    /// A framed message arrived on a connection.
    Frame { conn: ConnId, body: Vec<u8> },
    /// A connection's reader or writer ended.
    Closed { conn: ConnId, reason: Option<String> },
    /// A UDP datagram arrived.
    Datagram { from: SocketAddr, data: Vec<u8> },
    /// A request from the control surface.
    Control(ControlRequest),
}

/// Control API requests; replies travel on the enclosed channels.
#[derive(Debug)]
pub enum ControlRequest {
    Status(oneshot::Sender<StatusReport>),
    Connect { peer: String, reply: oneshot::Sender<Result<(), String>> },
    Forget { peer: String, reply: oneshot::Sender<()> },
    Allocate { container: String, reply: oneshot::Sender<Result<AllocatedIp, IpamError>> },
    Claim {
        container: String,
        addr: Ipv4Addr,
        reply: oneshot::Sender<Result<AllocatedIp, IpamError>>,
    },
    Free { container: String, reply: oneshot::Sender<Vec<Ipv4Addr>> },
    RemovePeer { peer: String, reply: oneshot::Sender<Result<usize, String>> },
    /// Force-close the live connection to a named peer. The maker is not
    /// touched: whether the link comes back depends on the remaining
    /// targets and gossip hints.
    DropConnection { peer: String, reply: oneshot::Sender<bool> },
    Shutdown,
}

/// Cheap handle for feeding the router's inbox from other tasks.
#[derive(Clone)]
pub struct RouterHandle {
    events: mpsc::Sender<RouterEvent>,
    pub tcp_addr: SocketAddr,
    pub udp_addr: SocketAddr,
}

impl RouterHandle {
    pub async fn control(&self, request: ControlRequest) -> Result<(), RouterError> {
        self.events
            .send(RouterEvent::Control(request))
            .await
            .map_err(|_| RouterError::InboxClosed)
    }

    pub async fn status(&self) -> Result<StatusReport, RouterError> {
        let (tx, rx) = oneshot::channel();
        self.control(ControlRequest::Status(tx)).await?;
        rx.await.map_err(|_| RouterError::InboxClosed)
    }

    pub async fn shutdown(&self) {
        let _ = self.events.send(RouterEvent::Control(ControlRequest::Shutdown)).await;
    }
}

/// The router actor. Create with [`Router::start`], then drive with
/// [`Router::run`] until shutdown.
pub struct Router {
    pub(crate) config: RouterConfig,
    pub(crate) topology: Topology,
    pub(crate) routes: Routes,
    pub(crate) forwarder: Forwarder,
    pub(crate) maker: ConnectionMaker,
    pub(crate) allocator: Option<Allocator>,
    pub(crate) connections: HashMap<ConnId, Connection>,
    /// Connections past greeting, by remote name.
    pub(crate) by_name: HashMap<PeerName, ConnId>,
    next_conn_id: ConnId,
    pub(crate) udp: Arc<UdpSocket>,
    udp_port: u16,
    events_tx: mpsc::Sender<RouterEvent>,
    events_rx: Option<mpsc::Receiver<RouterEvent>>,
    device_events: Option<mpsc::Receiver<DeviceEvent>>,
    pub(crate) inject: Option<InjectTx>,
    running: bool,
}

impl Router {
    /// Bind sockets, spawn the accept and UDP receive tasks, and return
    /// the actor plus a control handle.
    ///
    /// `initial_targets` are the command-line peers; the maker starts
    /// dialling them on its first tick.
    pub async fn start(
        config: RouterConfig,
        device: Option<DeviceHandle>,
        allocator: Option<Allocator>,
        initial_targets: Vec<String>,
    ) -> Result<(Router, RouterHandle), RouterError> {
        let listener = TcpListener::bind(("0.0.0.0", config.port))
            .await
            .map_err(|source| RouterError::Bind { what: "tcp", port: config.port, source })?;
        let tcp_addr =
            listener.local_addr().map_err(|source| RouterError::Bind {
                what: "tcp",
                port: config.port,
                source,
            })?;
        let udp = UdpSocket::bind(("0.0.0.0", config.port))
            .await
            .map_err(|source| RouterError::Bind { what: "udp", port: config.port, source })?;
        let udp_addr = udp.local_addr().map_err(|source| RouterError::Bind {
            what: "udp",
            port: config.port,
            source,
        })?;
        let udp = Arc::new(udp);

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_LEN);

        // Accept loop.
        let accept_tx = events_tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if accept_tx.send(RouterEvent::Inbound(stream, addr)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });

        // UDP receive loop.
        let udp_rx = udp.clone();
        let datagram_tx = events_tx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match udp_rx.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        let event = RouterEvent::Datagram { from, data: buf[..len].to_vec() };
                        if datagram_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "udp receive error");
                    }
                }
            }
        });

        let uid = rand::random::<u64>();
        let local = Peer::new(config.name, config.nick_name.clone(), uid);
        let topology = Topology::new(local);
        let routes = Routes::compute(&topology);
        let forwarder = Forwarder::new(config.name, MacCache::with_defaults());

        let mut maker = ConnectionMaker::new();
        for target in initial_targets {
            maker.add_target(target);
        }

        let (device_events, inject) = match device {
            Some(handle) => {
                let (events, inject) = handle.into_parts();
                (Some(events), Some(inject))
            }
            None => (None, None),
        };

        let handle =
            RouterHandle { events: events_tx.clone(), tcp_addr, udp_addr };
        let router = Router {
            config,
            topology,
            routes,
            forwarder,
            maker,
            allocator,
            connections: HashMap::new(),
            by_name: HashMap::new(),
            next_conn_id: 1,
            udp,
            udp_port: udp_addr.port(),
            events_tx,
            events_rx: Some(events_rx),
            device_events,
            inject,
            running: true,
        };
        info!(name = %router.topology.ourself_name(), %tcp_addr, "router started");
        Ok((router, handle))
    }

    pub fn ourself(&self) -> &Peer {
        self.topology.ourself()
    }

    /// The UDP port we advertise in greetings.
    pub(crate) fn udp_port(&self) -> u16 {
        self.udp_port
    }

    /// Drive the router until shutdown.
    pub async fn run(mut self) {
        // The inbox and device channel leave self so the select borrows
        // stay disjoint from the handlers.
        let mut events_rx = self.events_rx.take().expect("run called once");
        let mut device_events = self.device_events.take();

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        let mut maker_tick = tokio::time::interval(TICK_INTERVAL);
        let mut gossip_tick =
            tokio::time::interval(Duration::from_secs(PERIODIC_INTERVAL_SECS));
        // The first interval tick fires immediately; skip the initial
        // full-state gossip to nobody.
        gossip_tick.reset();

        while self.running {
            tokio::select! {
                event = events_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => break,
                    }
                }
                event = Self::next_device_event(&mut device_events) => {
                    match event {
                        DeviceEvent::Frame(frame) => self.handle_captured(&frame),
                        DeviceEvent::Dropped(n) => {
                            for _ in 0..n {
                                self.forwarder.note_capture_drop();
                            }
                        }
                    }
                }
                _ = heartbeat.tick() => self.heartbeat_tick(),
                _ = maker_tick.tick() => self.maker_tick(),
                _ = gossip_tick.tick() => self.periodic_gossip(),
            }
        }

        info!("router shutting down");
        let ids: Vec<ConnId> = self.connections.keys().copied().collect();
        for id in ids {
            self.drop_connection(id, None);
        }
    }

    async fn next_device_event(events: &mut Option<mpsc::Receiver<DeviceEvent>>) -> DeviceEvent {
        match events {
            Some(rx) => match rx.recv().await {
                Some(event) => event,
                None => std::future::pending().await,
            },
            None => std::future::pending().await,
        }
    }

    pub(crate) fn stop(&mut self) {
        self.running = false;
    }

    // === Connection plumbing ===

    /// Adopt a TCP socket: spawn its reader and writer tasks, register
    /// the connection, and send our greeting.
    pub(crate) fn adopt_socket(
        &mut self,
        stream: TcpStream,
        outbound: bool,
        target: Option<String>,
    ) {
        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                debug!(error = %e, "socket died before adoption");
                return;
            }
        };
        let _ = stream.set_nodelay(true);

        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;

        let (read_half, write_half) = stream.into_split();
        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(WRITER_QUEUE_LEN);

        // Writer task: drains sealed frame bodies.
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let mut write_half = write_half;
            while let Some(body) = writer_rx.recv().await {
                if let Err(e) = protocol::write_frame(&mut write_half, &body).await {
                    let _ = events
                        .send(RouterEvent::Closed { conn: conn_id, reason: Some(e.to_string()) })
                        .await;
                    return;
                }
            }
            // Channel closed: the router dropped the connection.
        });

        // Reader task: frames in, events out.
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let mut read_half = read_half;
            loop {
                match protocol::read_frame(&mut read_half).await {
                    Ok(body) => {
                        if events.send(RouterEvent::Frame { conn: conn_id, body }).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = events
                            .send(RouterEvent::Closed {
                                conn: conn_id,
                                reason: Some(e.to_string()),
                            })
                            .await;
                        return;
                    }
                }
            }
        });

        let conn = Connection::new(conn_id, outbound, target, peer_addr, writer_tx);
        let greeting = protocol::Greeting {
            password_expected: self.config.encrypted(),
            name: self.topology.ourself_name(),
            uid: self.topology.ourself().uid,
            nick_name: self.config.nick_name.clone(),
            udp_port: self.udp_port(),
        };
        if !conn.enqueue(greeting.encode()) {
            debug!(conn = conn_id, "greeting enqueue failed, dropping socket");
            return;
        }
        debug!(conn = conn_id, %peer_addr, outbound, "connection adopted");
        self.connections.insert(conn_id, conn);
    }

    /// Spawn a dial attempt; its outcome comes back as an event.
    pub(crate) fn spawn_dial(&self, target: String) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result =
                match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target)).await {
                    Ok(Ok(stream)) => Ok(stream),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("dial timed out".to_string()),
                };
            let _ = events.send(RouterEvent::DialDone { target, result }).await;
        });
    }
}

// ============================================================================
// Status reporting
// ============================================================================

/// Snapshot of the router for `/status` and `/status-json`.
#[derive(Clone, Debug, Serialize)]
pub struct StatusReport {
    pub version: String,
    pub encryption: bool,
    pub name: String,
    pub nick_name: String,
    pub peers: Vec<PeerStatus>,
    pub routes: Vec<RouteStatus>,
    pub connections: Vec<ConnectionStatus>,
    pub targets: Vec<TargetStatus>,
    pub forwarding: ForwardStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipam: Option<IpamStatus>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PeerStatus {
    pub name: String,
    pub nick_name: String,
    pub version: u64,
    pub connections: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RouteStatus {
    pub dest: String,
    pub via: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ConnectionStatus {
    pub peer: Option<String>,
    pub address: String,
    pub state: String,
    pub outbound: bool,
    pub pmtu: usize,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "weave router {}", self.version)?;
        writeln!(f, "Encryption {}", if self.encryption { "on" } else { "off" })?;
        writeln!(f, "Our name is {} ({})", self.name, self.nick_name)?;
        writeln!(f, "Peers:")?;
        for peer in &self.peers {
            writeln!(
                f,
                "  {} ({}) v{} -> [{}]",
                peer.name,
                peer.nick_name,
                peer.version,
                peer.connections.join(", ")
            )?;
        }
        writeln!(f, "Routes:")?;
        for route in &self.routes {
            writeln!(f, "  {} via {}", route.dest, route.via)?;
        }
        writeln!(f, "Connections:")?;
        for conn in &self.connections {
            writeln!(
                f,
                "  {} {} [{}{}] pmtu {}",
                conn.peer.as_deref().unwrap_or("(pending)"),
                conn.address,
                if conn.outbound { "out, " } else { "in, " },
                conn.state,
                conn.pmtu
            )?;
        }
        writeln!(f, "Targets:")?;
        for target in &self.targets {
            writeln!(f, "  {} {} ({} attempts)", target.address, target.state, target.attempts)?;
        }
        writeln!(
            f,
            "Forwarding: {} in, {} out, {} no-route, {} oversize, {} capture drops",
            self.forwarding.frames_injected,
            self.forwarding.frames_forwarded,
            self.forwarding.no_route_drops,
            self.forwarding.oversize_drops,
            self.forwarding.capture_drops
        )?;
        if let Some(ipam) = &self.ipam {
            write!(f, "{}", ipam)?;
        }
        Ok(())
    }
}
