//! weaver daemon binary.
//!
//! Flag parsing and wiring only; everything interesting happens in the
//! router core. The launcher script is expected to have created the
//! bridge and the capture interface before starting us.

use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

use weave::config::{determine_quorum, ConfigError, RouterConfig, DEFAULT_PORT};
use weave::connection::normalize_target;
use weave::device::TapDevice;
use weave::forwarder::MAX_FRAME_LEN;
use weave::ipam::Allocator;
use weave::peer::PeerName;
use weave::router::Router;

/// Overlay network router
#[derive(Parser, Debug)]
#[command(name = "weaver", version, about)]
struct Args {
    /// Router port (TCP and UDP)
    #[arg(long, default_value_t = DEFAULT_PORT, env = "WEAVE_PORT")]
    port: u16,

    /// Name of interface to capture/inject from (disabled if blank)
    #[arg(long, default_value = "")]
    iface: String,

    /// Name of router (defaults to MAC of interface)
    #[arg(long, default_value = "")]
    name: String,

    /// Nickname of peer (defaults to hostname)
    #[arg(long, default_value = "")]
    nickname: String,

    /// Network password
    #[arg(long, default_value = "", env = "WEAVE_PASSWORD", hide_env_values = true)]
    password: String,

    /// Connection limit (0 for unlimited)
    #[arg(long, default_value_t = 30)]
    connlimit: usize,

    /// Capture buffer size in MB
    #[arg(long, default_value_t = 8)]
    bufsz: usize,

    /// Address to bind the HTTP interface to (disabled if blank,
    /// absolute path indicates a Unix socket)
    #[arg(long, default_value = "127.0.0.1:6784")]
    httpaddr: String,

    /// IP address range to allocate within, in CIDR notation
    #[arg(long, default_value = "")]
    iprange: String,

    /// Number of peers in network (for IP address allocation)
    #[arg(long, default_value_t = 0)]
    initpeercount: usize,

    /// Initial peers to connect to
    peers: Vec<String>,
}

fn router_name(args: &Args) -> Result<PeerName, ConfigError> {
    if !args.name.is_empty() {
        return Ok(PeerName::from_user_input(&args.name)?);
    }
    if args.iface.is_empty() {
        return Err(ConfigError::NoIdentity);
    }
    let path = format!("/sys/class/net/{}/address", args.iface);
    let mac = std::fs::read_to_string(&path).map_err(|_| ConfigError::NoIdentity)?;
    Ok(PeerName::from_user_input(mac.trim())?)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname").ok().map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "peer".to_string())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    let name = match router_name(&args) {
        Ok(name) => name,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    let nick = if args.nickname.is_empty() { hostname() } else { args.nickname.clone() };

    let mut config = RouterConfig::new(name, nick);
    config.port = args.port;
    config.conn_limit = args.connlimit;
    config.capture_buffer_frames = (args.bufsz.max(1) * 1024 * 1024) / MAX_FRAME_LEN;
    if args.password.is_empty() {
        info!("communication between peers is unencrypted");
    } else {
        config.password = Some(args.password.clone().into_bytes());
        info!("communication between peers is encrypted");
    }

    let mut targets = Vec::with_capacity(args.peers.len());
    for peer in &args.peers {
        match normalize_target(peer, config.port) {
            Ok(target) => targets.push(target),
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        }
    }

    let allocator = if !args.iprange.is_empty() {
        let range = match args.iprange.parse() {
            Ok(range) => range,
            Err(_) => {
                error!("{}", ConfigError::BadRange(args.iprange.clone()));
                std::process::exit(1);
            }
        };
        let quorum = determine_quorum(args.initpeercount, args.peers.len());
        info!(%range, quorum, "IP allocation enabled");
        Some(Allocator::new(name, range, quorum))
    } else if args.initpeercount > 0 {
        error!("{}", ConfigError::PeerCountWithoutRange);
        std::process::exit(1);
    } else {
        None
    };

    let device = if args.iface.is_empty() {
        warn!("no capture interface; running control plane only");
        None
    } else {
        let tap = match TapDevice::open(&args.iface) {
            Ok(tap) => tap,
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        };
        match tap.start(config.capture_buffer_frames) {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        }
    };

    let (router, handle) = match Router::start(config, device, allocator, targets).await {
        Ok(pair) => pair,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    info!("our name is {}", router.ourself());

    if !args.httpaddr.is_empty() {
        let http_handle = handle.clone();
        let httpaddr = args.httpaddr.clone();
        tokio::spawn(async move {
            if let Err(e) = weave::http::serve(http_handle, httpaddr).await {
                error!(error = %e, "control API failed");
            }
        });
    }

    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sig) => sig,
        Err(e) => {
            error!(error = %e, "failed to install signal handler");
            std::process::exit(1);
        }
    };

    let mut router_task = tokio::spawn(router.run());
    tokio::select! {
        _ = &mut router_task => {
            info!("router stopped");
            return;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        _ = sigterm.recv() => {
            info!("terminated, shutting down");
        }
    }
    handle.shutdown().await;
    let _ = router_task.await;
}
