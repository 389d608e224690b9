//! weave: a user-space overlay network router.
//!
//! Peers form a mesh over TCP+UDP port 6783, gossip their topology and
//! (optionally) IP allocation state, and bridge Ethernet frames between
//! local containers and remote peers through authenticated, optionally
//! encrypted tunnels.

pub mod config;
pub mod connection;
pub mod crypto;
pub mod device;
pub mod forwarder;
pub mod gossip;
pub mod http;
pub mod ipam;
pub mod peer;
pub mod protocol;
pub mod router;
pub mod topology;

// Re-export the types the binary and tests reach for most.
pub use config::{determine_quorum, ConfigError, RouterConfig, DEFAULT_PORT};
pub use connection::{ConnectionMaker, ConnectionState};
pub use device::{memory_device, DeviceHandle, TapDevice};
pub use forwarder::{Forwarder, MacCache};
pub use gossip::Gossiper;
pub use ipam::{AllocatedIp, Allocator, IpamError};
pub use peer::{Peer, PeerName};
pub use router::{ControlRequest, Router, RouterHandle, StatusReport};
pub use topology::{Routes, Topology};
