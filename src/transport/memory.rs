/// In-memory transport.
///
/// A [`MemoryNetwork`] is a shared fake LAN. Each attached
/// [`MemoryTransport`] is one device on it. Announcements reach every
/// associated endpoint with discovery open, the sender included, like
/// multicast loopback does. Unicast reaches the endpoint at the destination
/// address if its peer channel is open. Optional seeded loss drops each
/// delivery independently.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::errors::{LinkError, Result};
use crate::transport::{EventSink, LinkEvent, Transport};

#[derive(Debug)]
struct Endpoint {
    events: EventSink,
    /// Whether an association attempt would succeed
    available: bool,
    associated: bool,
    discovery_open: bool,
    peer_open: bool,
    association_attempts: u32,
    peer_channel_binds: u32,
}

#[derive(Debug)]
struct NetworkInner {
    endpoints: HashMap<IpAddr, Endpoint>,
    loss_rate: f64,
    rng: StdRng,
    /// Every datagram handed to the network: (source, destination, bytes).
    /// Destination is `None` for announcements.
    sent: Vec<(IpAddr, Option<IpAddr>, Vec<u8>)>,
}

impl NetworkInner {
    fn lost(&mut self) -> bool {
        self.loss_rate > 0.0 && self.rng.gen_bool(self.loss_rate)
    }
}

/// Shared fake network
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    /// Lossless network
    pub fn new() -> Self {
        Self::with_loss(0.0, 0)
    }

    /// Network dropping each delivery with probability `loss_rate`
    pub fn with_loss(loss_rate: f64, seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetworkInner {
                endpoints: HashMap::new(),
                loss_rate: loss_rate.clamp(0.0, 1.0),
                rng: StdRng::seed_from_u64(seed),
                sent: Vec::new(),
            })),
        }
    }

    /// Attach a device at `address`; it starts unassociated but available
    pub fn attach(&self, address: IpAddr, events: EventSink) -> MemoryTransport {
        self.inner.lock().endpoints.insert(
            address,
            Endpoint {
                events,
                available: true,
                associated: false,
                discovery_open: false,
                peer_open: false,
                association_attempts: 0,
                peer_channel_binds: 0,
            },
        );
        MemoryTransport {
            network: self.clone(),
            address,
        }
    }

    /// Bring a device's network up or down.
    ///
    /// Taking an associated device down drops its association, closes its
    /// channels and reports `AssociationLost` to it.
    pub fn set_available(&self, address: IpAddr, available: bool) {
        let mut inner = self.inner.lock();
        if let Some(ep) = inner.endpoints.get_mut(&address) {
            ep.available = available;
            if !available && ep.associated {
                ep.associated = false;
                ep.discovery_open = false;
                ep.peer_open = false;
                let _ = ep.events.send(LinkEvent::AssociationLost);
            }
        }
    }

    pub fn association_attempts(&self, address: IpAddr) -> u32 {
        self.inner
            .lock()
            .endpoints
            .get(&address)
            .map_or(0, |ep| ep.association_attempts)
    }

    /// How many times the device bound its peer channel
    pub fn peer_channel_binds(&self, address: IpAddr) -> u32 {
        self.inner
            .lock()
            .endpoints
            .get(&address)
            .map_or(0, |ep| ep.peer_channel_binds)
    }

    /// Datagrams sent by `source`, in order
    pub fn sent_by(&self, source: IpAddr) -> Vec<(Option<IpAddr>, Vec<u8>)> {
        self.inner
            .lock()
            .sent
            .iter()
            .filter(|(src, _, _)| *src == source)
            .map(|(_, dst, bytes)| (*dst, bytes.clone()))
            .collect()
    }

    fn with_endpoint<R>(&self, address: IpAddr, f: impl FnOnce(&mut Endpoint) -> R) -> Option<R> {
        self.inner.lock().endpoints.get_mut(&address).map(f)
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One device's view of a [`MemoryNetwork`]
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    address: IpAddr,
}

impl MemoryTransport {
    pub fn address(&self) -> IpAddr {
        self.address
    }

    fn associated(&self) -> bool {
        self.network
            .with_endpoint(self.address, |ep| ep.associated)
            .unwrap_or(false)
    }
}

impl Transport for MemoryTransport {
    fn associate(&mut self) -> Result<()> {
        self.network
            .with_endpoint(self.address, |ep| {
                ep.association_attempts += 1;
                if !ep.available {
                    return Err(LinkError::AssociationFailed("network unavailable".to_string()));
                }
                ep.associated = true;
                let _ = ep.events.send(LinkEvent::Associated);
                Ok(())
            })
            .unwrap_or_else(|| Err(LinkError::AssociationFailed("detached".to_string())))
    }

    fn local_address(&self) -> Option<IpAddr> {
        self.associated().then_some(self.address)
    }

    fn open_discovery(&mut self) -> Result<()> {
        self.network
            .with_endpoint(self.address, |ep| {
                if !ep.associated {
                    return Err(LinkError::SendFailed("not associated".to_string()));
                }
                ep.discovery_open = true;
                Ok(())
            })
            .unwrap_or_else(|| Err(LinkError::SendFailed("detached".to_string())))
    }

    fn close_discovery(&mut self) {
        self.network.with_endpoint(self.address, |ep| ep.discovery_open = false);
    }

    fn open_peer_channel(&mut self) -> Result<()> {
        self.network
            .with_endpoint(self.address, |ep| {
                if !ep.associated {
                    return Err(LinkError::SendFailed("not associated".to_string()));
                }
                ep.peer_open = true;
                ep.peer_channel_binds += 1;
                Ok(())
            })
            .unwrap_or_else(|| Err(LinkError::SendFailed("detached".to_string())))
    }

    fn close_peer_channel(&mut self) {
        self.network.with_endpoint(self.address, |ep| ep.peer_open = false);
    }

    fn peer_channel_open(&self) -> bool {
        self.network
            .with_endpoint(self.address, |ep| ep.peer_open)
            .unwrap_or(false)
    }

    fn announce(&mut self, payload: &[u8]) -> Result<()> {
        let mut inner = self.network.inner.lock();
        if !inner.endpoints.get(&self.address).is_some_and(|ep| ep.associated) {
            return Err(LinkError::SendFailed("not associated".to_string()));
        }
        inner.sent.push((self.address, None, payload.to_vec()));

        let receivers: Vec<IpAddr> = inner
            .endpoints
            .iter()
            .filter(|(_, ep)| ep.associated && ep.discovery_open)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in receivers {
            if inner.lost() {
                continue;
            }
            if let Some(ep) = inner.endpoints.get(&addr) {
                let _ = ep.events.send(LinkEvent::Datagram {
                    from: self.address,
                    bytes: payload.to_vec(),
                });
            }
        }
        Ok(())
    }

    fn send_to(&mut self, addr: IpAddr, payload: &[u8]) -> Result<()> {
        let mut inner = self.network.inner.lock();
        let ready = inner
            .endpoints
            .get(&self.address)
            .is_some_and(|ep| ep.associated && ep.peer_open);
        if !ready {
            return Err(LinkError::SendFailed("peer channel closed".to_string()));
        }
        inner.sent.push((self.address, Some(addr), payload.to_vec()));

        if inner.lost() {
            return Ok(());
        }
        // Like UDP, a datagram to a closed port vanishes without error
        if let Some(ep) = inner.endpoints.get(&addr) {
            if ep.associated && ep.peer_open {
                let _ = ep.events.send(LinkEvent::Datagram {
                    from: self.address,
                    bytes: payload.to_vec(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::event_queue;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_announce_loops_back_to_sender() {
        let net = MemoryNetwork::new();
        let (sink_a, mut queue_a) = event_queue();
        let (sink_b, mut queue_b) = event_queue();
        let mut a = net.attach(ip(1), sink_a);
        let mut b = net.attach(ip(2), sink_b);

        a.associate().unwrap();
        b.associate().unwrap();
        assert_eq!(queue_a.try_recv().unwrap(), LinkEvent::Associated);
        assert_eq!(queue_b.try_recv().unwrap(), LinkEvent::Associated);
        a.open_discovery().unwrap();
        b.open_discovery().unwrap();

        a.announce(b"HELLO remote 1").unwrap();
        for queue in [&mut queue_a, &mut queue_b] {
            assert_eq!(
                queue.try_recv().unwrap(),
                LinkEvent::Datagram { from: ip(1), bytes: b"HELLO remote 1".to_vec() }
            );
        }
    }

    #[test]
    fn test_unicast_needs_open_channels() {
        let net = MemoryNetwork::new();
        let (sink_a, _queue_a) = event_queue();
        let (sink_b, mut queue_b) = event_queue();
        let mut a = net.attach(ip(1), sink_a);
        let mut b = net.attach(ip(2), sink_b);
        a.associate().unwrap();
        b.associate().unwrap();
        let _ = queue_b.try_recv();

        assert!(a.send_to(ip(2), b"PING 1").is_err());
        a.open_peer_channel().unwrap();
        a.send_to(ip(2), b"PING 1").unwrap();
        assert!(queue_b.try_recv().is_err());

        b.open_peer_channel().unwrap();
        a.send_to(ip(2), b"PING 2").unwrap();
        assert_eq!(
            queue_b.try_recv().unwrap(),
            LinkEvent::Datagram { from: ip(1), bytes: b"PING 2".to_vec() }
        );
        assert_eq!(net.sent_by(ip(1)).len(), 2);
    }

    #[test]
    fn test_unavailable_network() {
        let net = MemoryNetwork::new();
        let (sink, mut queue) = event_queue();
        let mut t = net.attach(ip(1), sink);
        t.associate().unwrap();
        t.open_peer_channel().unwrap();
        let _ = queue.try_recv();

        net.set_available(ip(1), false);
        assert_eq!(queue.try_recv().unwrap(), LinkEvent::AssociationLost);
        assert!(!t.peer_channel_open());
        assert_eq!(t.local_address(), None);
        assert!(matches!(t.associate(), Err(LinkError::AssociationFailed(_))));
        assert_eq!(net.association_attempts(ip(1)), 2);
    }

    #[test]
    fn test_total_loss_drops_everything() {
        let net = MemoryNetwork::with_loss(1.0, 7);
        let (sink_a, _queue_a) = event_queue();
        let (sink_b, mut queue_b) = event_queue();
        let mut a = net.attach(ip(1), sink_a);
        let mut b = net.attach(ip(2), sink_b);
        a.associate().unwrap();
        b.associate().unwrap();
        let _ = queue_b.try_recv();
        b.open_discovery().unwrap();

        a.announce(b"HELLO remote 1").unwrap();
        assert!(queue_b.try_recv().is_err());
    }
}
