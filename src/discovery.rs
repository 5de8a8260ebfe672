/// Discovery engine.
///
/// Periodically announces this device (`HELLO <role> <id> <ip>`) on the
/// rendezvous channel and adopts the first announcement carrying the other
/// role as the peer. Same-role announcements, including this device's own
/// multicast echo, are ignored.

use std::net::IpAddr;

use tracing::{debug, info, trace, warn};

use crate::contracts::{Frame, Hello, PeerInfo};
use crate::link::PeerLink;
use crate::transport::Transport;

impl<T: Transport> PeerLink<T> {
    /// Broadcast our presence if the hello period has elapsed
    pub(crate) fn announce(&mut self, now: u64) {
        if !self.state.associated {
            return;
        }
        if let Some(last) = self.state.last_announce_at {
            if now.saturating_sub(last) < self.config.hello_period_ms {
                return;
            }
        }
        self.state.last_announce_at = Some(now);

        let hello = Frame::Hello(Hello {
            role: self.state.role.clone(),
            device_id: self.state.device_id.clone(),
            address: self.transport.local_address(),
        });
        if let Err(e) = self.transport.announce(&hello.encode()) {
            debug!(error = %e, "Announcement not sent");
        }
    }

    /// Handle an incoming announcement from `sender`
    pub(crate) fn on_announce(&mut self, hello: Hello, sender: IpAddr, now: u64) {
        if hello.role == self.state.role {
            trace!(%sender, role = %hello.role, "Ignoring same-role announcement");
            return;
        }
        // Stale datagrams can still be queued behind an association loss
        if !self.state.associated {
            return;
        }

        let address = hello.address.unwrap_or(sender);
        let previous = self.state.peer_address();

        match self.state.peer.as_mut() {
            Some(peer) if peer.address == address => peer.touch(now),
            _ => self.state.peer = Some(PeerInfo::new(address, now)),
        }

        if previous != Some(address) {
            info!(
                role = %hello.role,
                device_id = %hello.device_id,
                %address,
                "Peer found"
            );
        }

        if !self.transport.peer_channel_open() {
            if let Err(e) = self.transport.open_peer_channel() {
                warn!(error = %e, "Failed to bind message listener");
            }
        }

        if previous.is_none() {
            self.notify_link_state(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::contracts::Role;
    use crate::link::tests::{run_pair, Harness, REMOTE_IP, SIGN_IP};
    use crate::transport::MemoryNetwork;
    use std::net::Ipv4Addr;

    fn associated_sign(net: &MemoryNetwork, clock: &ManualClock) -> Harness {
        let mut sign = Harness::new(net, clock, Role::sign(), SIGN_IP);
        sign.link.poll();
        assert!(sign.link.is_associated());
        sign
    }

    #[test]
    fn test_same_role_never_sets_peer() {
        let net = MemoryNetwork::new();
        let clock = ManualClock::new(0);
        let mut sign = associated_sign(&net, &clock);

        for raw in [
            &b"HELLO sign 111111 10.0.0.5"[..],
            b"HELLO sign 000009 10.0.0.9",
            b"HELLO sign 222222",
        ] {
            sign.inject(REMOTE_IP, raw);
            sign.link.poll();
            assert_eq!(sign.link.peer(), None);
        }
        assert!(sign.link_states.lock().is_empty());
    }

    #[test]
    fn test_own_echo_is_ignored() {
        let net = MemoryNetwork::new();
        let clock = ManualClock::new(0);
        let mut sign = associated_sign(&net, &clock);

        // Announcements loop back to the sender on the memory network
        for _ in 0..3000 {
            sign.link.poll();
            clock.advance(1);
        }
        assert_eq!(sign.link.peer(), None);
        assert!(net.sent_by(SIGN_IP).len() >= 3);
    }

    #[test]
    fn test_other_role_sets_declared_address() {
        let net = MemoryNetwork::new();
        let clock = ManualClock::new(0);
        let mut sign = associated_sign(&net, &clock);

        // Declared address wins over the datagram source
        sign.inject(IpAddr::V4(Ipv4Addr::new(192, 168, 4, 2)), b"HELLO remote id1 10.0.0.5");
        sign.link.poll();

        let peer = sign.link.peer().unwrap();
        assert_eq!(peer.address, REMOTE_IP);
        assert_eq!(peer.missed_probes, 0);
        assert_eq!(peer.last_seen_at, 0);
        assert!(sign.link.transport().peer_channel_open());
        assert_eq!(*sign.link_states.lock(), vec![true]);
    }

    #[test]
    fn test_missing_address_falls_back_to_sender() {
        let net = MemoryNetwork::new();
        let clock = ManualClock::new(0);
        let mut sign = associated_sign(&net, &clock);

        sign.inject(REMOTE_IP, b"HELLO remote id1 garbage");
        sign.link.poll();
        assert_eq!(sign.link.state().peer_address(), Some(REMOTE_IP));
    }

    #[test]
    fn test_rediscovery_is_idempotent() {
        let net = MemoryNetwork::new();
        let clock = ManualClock::new(0);
        let mut sign = associated_sign(&net, &clock);

        sign.inject(REMOTE_IP, b"HELLO remote id1 10.0.0.5");
        sign.link.poll();
        clock.advance(700);
        sign.inject(REMOTE_IP, b"HELLO remote id1 10.0.0.5");
        sign.link.poll();

        let peer = sign.link.peer().unwrap();
        assert_eq!(peer.address, REMOTE_IP);
        assert_eq!(peer.missed_probes, 0);
        assert_eq!(peer.last_seen_at, 700);
        assert_eq!(net.peer_channel_binds(SIGN_IP), 1);
        assert_eq!(*sign.link_states.lock(), vec![true]);
    }

    #[test]
    fn test_address_change_replaces_peer() {
        let net = MemoryNetwork::new();
        let clock = ManualClock::new(0);
        let mut sign = associated_sign(&net, &clock);

        sign.inject(REMOTE_IP, b"HELLO remote id1 10.0.0.5");
        sign.link.poll();
        sign.inject(REMOTE_IP, b"HELLO remote id1 10.0.0.6");
        sign.link.poll();

        assert_eq!(
            sign.link.state().peer_address(),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 6)))
        );
        // Still the same link from the application's point of view
        assert_eq!(*sign.link_states.lock(), vec![true]);
    }

    #[test]
    fn test_hello_period() {
        let net = MemoryNetwork::new();
        let clock = ManualClock::new(0);
        let mut sign = associated_sign(&net, &clock);

        for _ in 0..=5000 {
            sign.link.poll();
            clock.advance(1);
        }
        let hellos: Vec<_> = net
            .sent_by(SIGN_IP)
            .into_iter()
            .filter(|(dst, _)| dst.is_none())
            .collect();
        // t = 0, 1000, 2000, 3000, 4000, 5000
        assert_eq!(hellos.len(), 6);
        assert_eq!(hellos[0].1, b"HELLO sign 000009 10.0.0.9".to_vec());
    }

    #[test]
    fn test_scenario_a_sign_learns_remote_address() {
        let net = MemoryNetwork::new();
        let clock = ManualClock::new(0);
        let mut remote = Harness::new(&net, &clock, Role::remote(), REMOTE_IP);
        let mut sign = Harness::new(&net, &clock, Role::sign(), SIGN_IP);

        run_pair(&clock, &mut remote, &mut sign, 10);
        assert_eq!(sign.link.peer().map(|p| p.address), Some(REMOTE_IP));
    }
}
