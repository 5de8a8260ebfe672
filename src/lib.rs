/// PeerLink Core - Two-peer rendezvous and command link
///
/// Lets a "remote" controller and a "sign" receiver find each other on an
/// ad-hoc network, keep verifying liveness, and exchange short commands with
/// optional acknowledgment, with no server or fixed addressing.
///
/// # Design Principles
/// - One `PeerLink` owns all link state; a single scheduling pass
///   (`PeerLink::poll`) runs backoff, discovery, heartbeat and inbound
///   handling in that order
/// - Transports hand inbound datagrams to the link through a queue, so the
///   state has exactly one writer
/// - Transports are swappable: in-memory for tests, UDP multicast or
///   named-host UDP on real networks
/// - Nothing is fatal: every failure is retried on a timer or reported

pub mod errors;
pub mod contracts;
pub mod config;
pub mod clock;
pub mod transport;
pub mod transmitter;
pub mod receiver;
pub mod link;
pub mod backoff;
pub mod discovery;
pub mod heartbeat;
pub mod command;
pub mod service;

use std::net::Ipv4Addr;

pub use clock::{LinkClock, ManualClock, MonotonicClock};
pub use command::AckMode;
pub use config::{ConfigError, DaemonConfig, LinkConfig, UdpConfig};
pub use contracts::{DeviceId, Frame, Hello, PeerInfo, Role};
pub use errors::{LinkError, Result};
pub use link::{LinkHooks, PeerLink, PeerLinkState};
pub use service::{spawn_link, LinkHandle, LinkStatus};
pub use transport::{event_queue, LinkEvent, Transport};

/// Maximum datagram size (in bytes)
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Interval between HELLO announcements
pub const HELLO_PERIOD_MS: u64 = 1000;

/// Interval between heartbeat probes to a known peer
pub const HEARTBEAT_PERIOD_MS: u64 = 1500;

/// Extra silence tolerated before a probe window counts as missed
pub const HEARTBEAT_GRACE_MS: u64 = 500;

/// Consecutive missed probe windows before the peer is forgotten
pub const MISS_THRESHOLD: u8 = 3;

/// Initial (and post-success) association retry delay
pub const BACKOFF_FLOOR_MS: u32 = 1000;

/// Cap on the association retry delay
pub const BACKOFF_CEILING_MS: u32 = 10000;

/// Default ack-wait window
pub const ACK_TIMEOUT_MS: u64 = 400;

/// Discovery multicast group
pub const DISCOVERY_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 0, 1);

/// Discovery (HELLO) port
pub const DISCOVERY_PORT: u16 = 40000;

/// Unicast messaging port (PING/PONG/CMD/ACK)
pub const MESSAGE_PORT: u16 = 40001;
