/// UDP transport
///
/// Two sockets per device:
///
/// - discovery: bound to the discovery port, joined to the multicast group,
///   broadcast-enabled. HELLO goes to the group, falling back to the
///   limited broadcast address when the multicast send fails, or is sent
///   unicast to a resolved peer host name when one is configured.
/// - message: bound to the message port, carries PING/PONG/CMD/ACK.
///
/// On a host there is no Wi-Fi driver to ask, so "association" means having
/// a routable IPv4 address. Losing it shows up as network-level send errors,
/// which are reported as `AssociationLost`.
///
/// Peer host names are resolved on the runtime's blocking pool, never on the
/// scheduling pass; announcements use the last resolved address.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::config::UdpConfig;
use crate::errors::{LinkError, Result};
use crate::receiver::Listener;
use crate::transmitter::Transmitter;
use crate::transport::{EventSink, LinkEvent, NameResolver, SystemResolver, Transport};

/// Last resolved address of the configured peer host
#[derive(Debug, Clone, Default)]
struct HostLookup {
    resolved: Arc<Mutex<Option<IpAddr>>>,
    in_flight: Arc<AtomicBool>,
}

pub struct UdpTransport {
    config: UdpConfig,
    runtime: Handle,
    events: EventSink,
    resolver: Arc<dyn NameResolver>,
    peer_host: HostLookup,
    local_ip: Option<Ipv4Addr>,
    discovery: Option<Listener>,
    message: Option<Listener>,
}

impl UdpTransport {
    /// Create an unassociated transport; sockets are bound on demand
    pub fn new(config: UdpConfig, events: EventSink, runtime: Handle) -> Self {
        Self {
            config,
            runtime,
            events,
            resolver: Arc::new(SystemResolver),
            peer_host: HostLookup::default(),
            local_ip: None,
            discovery: None,
            message: None,
        }
    }

    /// Replace the resolver used for `peer_host`
    pub fn with_resolver(mut self, resolver: impl NameResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Find the interface address the OS would route discovery traffic from
    fn detect_local_ip(&self) -> Option<Ipv4Addr> {
        let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
        // connect() on UDP only selects a route; nothing is sent
        let routed = probe
            .connect((self.config.discovery_group, self.config.discovery_port))
            .or_else(|_| {
                probe.set_broadcast(true)?;
                probe.connect((Ipv4Addr::BROADCAST, self.config.discovery_port))
            });
        routed.ok()?;
        match probe.local_addr().ok()?.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
            _ => None,
        }
    }

    fn bind(&self, port: u16) -> Result<UdpSocket> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    /// Start a background lookup of `host` unless one is already running
    fn refresh_peer_host(&self, host: &str) {
        if self.peer_host.in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        let resolver = Arc::clone(&self.resolver);
        let lookup = self.peer_host.clone();
        let host = host.to_string();
        self.runtime.spawn_blocking(move || {
            match resolver.resolve(&host) {
                Some(addr) => {
                    let previous = lookup.resolved.lock().replace(addr);
                    if previous != Some(addr) {
                        info!(%host, %addr, "Peer host resolved");
                    }
                }
                // Keep the last known address
                None => debug!(%host, "Peer host lookup failed"),
            }
            lookup.in_flight.store(false, Ordering::SeqCst);
        });
    }

    fn lose_association(&mut self) {
        if self.local_ip.take().is_some() {
            warn!("Network unreachable, dropping association");
            self.discovery = None;
            self.message = None;
            let _ = self.events.send(LinkEvent::AssociationLost);
        }
    }

    fn send(&mut self, socket: &UdpSocket, bytes: &[u8], destination: SocketAddr) -> Result<()> {
        match Transmitter::send_raw(socket, bytes, destination) {
            Ok(_) => Ok(()),
            Err(LinkError::Io(e)) => {
                if Transmitter::is_association_error(&e) {
                    self.lose_association();
                }
                Err(LinkError::SendFailed(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

impl Transport for UdpTransport {
    fn associate(&mut self) -> Result<()> {
        match self.detect_local_ip() {
            Some(ip) => {
                info!(local_ip = %ip, "Network associated");
                self.local_ip = Some(ip);
                let _ = self.events.send(LinkEvent::Associated);
                Ok(())
            }
            None => Err(LinkError::AssociationFailed("no routable IPv4 address".to_string())),
        }
    }

    fn local_address(&self) -> Option<IpAddr> {
        self.local_ip.map(IpAddr::V4)
    }

    fn open_discovery(&mut self) -> Result<()> {
        self.discovery = None;
        let socket = self.bind(self.config.discovery_port)?;

        if self.config.peer_host.is_none() {
            let interface = self.local_ip.unwrap_or(Ipv4Addr::UNSPECIFIED);
            if let Err(e) = socket.join_multicast_v4(&self.config.discovery_group, &interface) {
                warn!(
                    group = %self.config.discovery_group,
                    error = %e,
                    "Multicast join failed, relying on broadcast"
                );
            }
        }

        self.discovery = Some(Listener::bind(&self.runtime, socket, self.events.clone(), "discovery")?);
        info!(
            group = %self.config.discovery_group,
            port = self.config.discovery_port,
            "Discovery listener bound"
        );
        Ok(())
    }

    fn close_discovery(&mut self) {
        self.discovery = None;
    }

    fn open_peer_channel(&mut self) -> Result<()> {
        self.message = None;
        let socket = self.bind(self.config.message_port)?;
        self.message = Some(Listener::bind(&self.runtime, socket, self.events.clone(), "message")?);
        info!(port = self.config.message_port, "Message listener bound");
        Ok(())
    }

    fn close_peer_channel(&mut self) {
        self.message = None;
    }

    fn peer_channel_open(&self) -> bool {
        self.message.is_some()
    }

    fn announce(&mut self, payload: &[u8]) -> Result<()> {
        let socket = match &self.discovery {
            Some(listener) => Arc::clone(&listener.sender),
            None => return Err(LinkError::SendFailed("discovery socket closed".to_string())),
        };
        let port = self.config.discovery_port;

        if let Some(host) = self.config.peer_host.clone() {
            self.refresh_peer_host(&host);
            let target = (*self.peer_host.resolved.lock())
                .ok_or_else(|| LinkError::SendFailed(format!("{} not resolved yet", host)))?;
            return self.send(&socket, payload, SocketAddr::new(target, port));
        }

        let group = SocketAddr::new(IpAddr::V4(self.config.discovery_group), port);
        match self.send(&socket, payload, group) {
            Ok(()) => Ok(()),
            Err(e) if self.config.broadcast_fallback && self.local_ip.is_some() => {
                debug!(error = %e, "Multicast send failed, using broadcast");
                let broadcast = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port);
                self.send(&socket, payload, broadcast)
            }
            Err(e) => Err(e),
        }
    }

    fn send_to(&mut self, addr: IpAddr, payload: &[u8]) -> Result<()> {
        let socket = match &self.message {
            Some(listener) => Arc::clone(&listener.sender),
            None => return Err(LinkError::SendFailed("peer channel closed".to_string())),
        };
        let destination = SocketAddr::new(addr, self.config.message_port);
        self.send(&socket, payload, destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{event_queue, StaticResolver};

    #[tokio::test]
    async fn test_closed_channels_reject_sends() {
        let (sink, _queue) = event_queue();
        let mut transport = UdpTransport::new(UdpConfig::default(), sink, Handle::current());

        assert!(!transport.peer_channel_open());
        assert_eq!(transport.local_address(), None);
        assert!(matches!(
            transport.send_to(IpAddr::V4(Ipv4Addr::LOCALHOST), b"PING 1"),
            Err(LinkError::SendFailed(_))
        ));
        assert!(matches!(transport.announce(b"HELLO remote 1"), Err(LinkError::SendFailed(_))));
    }

    #[tokio::test]
    async fn test_message_channel_loopback() {
        let (sink, mut queue) = event_queue();
        let config = UdpConfig {
            // ephemeral-ish ports to avoid clashing with a running daemon
            discovery_port: 47110,
            message_port: 47111,
            ..UdpConfig::default()
        };
        let mut transport = UdpTransport::new(config, sink, Handle::current());
        transport.open_peer_channel().unwrap();
        assert!(transport.peer_channel_open());

        transport
            .send_to(IpAddr::V4(Ipv4Addr::LOCALHOST), b"CMD LIGHT 2")
            .unwrap();
        let event = tokio::time::timeout(std::time::Duration::from_secs(2), queue.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            LinkEvent::Datagram {
                from: IpAddr::V4(Ipv4Addr::LOCALHOST),
                bytes: b"CMD LIGHT 2".to_vec(),
            }
        );

        transport.close_peer_channel();
        assert!(!transport.peer_channel_open());
    }

    #[tokio::test]
    async fn test_named_host_rendezvous() {
        let (sink, mut queue) = event_queue();
        let config = UdpConfig {
            discovery_port: 47120,
            message_port: 47121,
            peer_host: Some("peer.local".to_string()),
            ..UdpConfig::default()
        };
        let mut transport = UdpTransport::new(config, sink, Handle::current())
            .with_resolver(StaticResolver::new().with_entry("peer.local", IpAddr::V4(Ipv4Addr::LOCALHOST)));
        transport.open_discovery().unwrap();

        // The first announcements only start the lookup
        let mut sent = false;
        for _ in 0..100 {
            if transport.announce(b"HELLO remote 000001").is_ok() {
                sent = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(sent, "peer host never resolved");

        // Loopback: the HELLO lands on our own discovery socket
        let event = tokio::time::timeout(std::time::Duration::from_secs(2), queue.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            LinkEvent::Datagram {
                from: IpAddr::V4(Ipv4Addr::LOCALHOST),
                bytes: b"HELLO remote 000001".to_vec(),
            }
        );
    }

    #[tokio::test]
    async fn test_unresolvable_host_fails_without_blocking() {
        let (sink, _queue) = event_queue();
        let config = UdpConfig {
            discovery_port: 47122,
            message_port: 47123,
            peer_host: Some("missing.local".to_string()),
            ..UdpConfig::default()
        };
        let mut transport =
            UdpTransport::new(config, sink, Handle::current()).with_resolver(StaticResolver::new());
        transport.open_discovery().unwrap();

        for _ in 0..5 {
            assert!(matches!(
                transport.announce(b"HELLO remote 000001"),
                Err(LinkError::SendFailed(_))
            ));
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}
