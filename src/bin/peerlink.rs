/// PeerLink daemon binary
///
/// Runs one end of the link over UDP. Every line read from stdin is sent to
/// the peer as a command and waits for its acknowledgment.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use peerlink_core::transport::UdpTransport;
use peerlink_core::{
    event_queue, spawn_link, AckMode, DaemonConfig, DeviceId, LinkHooks, MonotonicClock, PeerLink,
    Role,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Handle;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Two-peer discovery and command link
#[derive(Parser, Debug)]
#[command(name = "peerlink", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Device role, overrides the configuration (`remote` or `sign`)
    #[arg(short, long)]
    role: Option<String>,

    /// Hardware address used for the device id, overrides the configuration
    #[arg(long, value_name = "MAC")]
    mac: Option<String>,

    /// Interval between scheduling passes
    #[arg(long, default_value_t = 10)]
    tick_ms: u64,
}

/// First non-loopback, non-zero interface address, by interface name
fn system_mac() -> Option<String> {
    let mut names: Vec<_> = std::fs::read_dir("/sys/class/net")
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name())
        .filter(|name| name != "lo")
        .collect();
    names.sort();

    names.into_iter().find_map(|name| {
        let path = Path::new("/sys/class/net").join(name).join("address");
        let mac = std::fs::read_to_string(path).ok()?;
        let mac = mac.trim();
        let all_zero = mac.chars().all(|c| c == '0' || c == ':');
        (!mac.is_empty() && !all_zero).then(|| mac.to_string())
    })
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    info!("PeerLink starting");

    let mut config = match &args.config {
        Some(path) => match DaemonConfig::load_file(path) {
            Ok(config) => {
                info!(path = %path.display(), "Loaded config file");
                config
            }
            Err(e) => {
                error!("Failed to load configuration from {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => {
            info!("No config file given, using defaults");
            DaemonConfig::default()
        }
    };

    if let Some(role) = &args.role {
        match Role::new(role.as_str()) {
            Ok(role) => config.role = role,
            Err(e) => {
                error!("Invalid role {:?}: {}", role, e);
                std::process::exit(1);
            }
        }
    }
    if args.mac.is_some() {
        config.mac = args.mac.clone();
    }

    let Some(mac) = config.mac.clone().or_else(system_mac) else {
        error!("No hardware address found, pass --mac");
        std::process::exit(1);
    };
    let device_id = match DeviceId::from_mac_str(&mac) {
        Ok(id) => id,
        Err(e) => {
            error!("Invalid hardware address {}: {}", mac, e);
            std::process::exit(1);
        }
    };

    info!(
        role = %config.role,
        device_id = %device_id,
        peer_host = ?config.udp.peer_host,
        "Creating link"
    );

    let (sink, queue) = event_queue();
    let transport = UdpTransport::new(config.udp.clone(), sink, Handle::current());
    let hooks = LinkHooks::new()
        .on_command(|payload| info!(payload, "Command received"))
        .on_link_state(|known| {
            if known {
                info!("Peer link up");
            } else {
                warn!("Peer link down");
            }
        });
    let link = PeerLink::new(
        config.role.clone(),
        device_id,
        config.link.clone(),
        transport,
        queue,
        Arc::new(MonotonicClock::new()),
    )
    .with_hooks(hooks);

    let (handle, task) = spawn_link(link, Duration::from_millis(args.tick_ms.max(1)));
    let mode = AckMode::Wait {
        timeout_ms: config.link.ack_timeout_ms,
    };

    info!("PeerLink running, one command per stdin line");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match handle.send_command(line, mode).await {
                    Ok(()) => info!(command = line, "Acknowledged"),
                    Err(e) => warn!(command = line, error = %e, "Command failed"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read stdin: {}", e);
                break;
            }
        }
    }

    info!("PeerLink shutting down");
    handle.shutdown();
    if let Err(e) = task.await {
        warn!("Link service ended abnormally: {}", e);
    }
    info!("PeerLink shutdown complete");
}
