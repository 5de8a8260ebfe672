/// Heartbeat supervisor.
///
/// Dormant while no peer is known. With a peer, two timers run:
///
/// - every heartbeat period a `PING <seq>` goes to the peer;
/// - whenever a full period plus grace passes with no liveness signal, one
///   probe counts as missed and the window is re-armed from now, so misses
///   accrue at most once per window. At the miss threshold the peer is
///   forgotten and discovery takes over again.

use std::net::IpAddr;

use tracing::{debug, info};

use crate::contracts::Frame;
use crate::link::PeerLink;
use crate::transport::Transport;

impl<T: Transport> PeerLink<T> {
    pub(crate) fn heartbeat_tick(&mut self, now: u64) {
        let Some(peer) = self.state.peer else {
            return;
        };

        let probe_due = self
            .state
            .last_probe_sent_at
            .map_or(true, |sent| now.saturating_sub(sent) >= self.config.heartbeat_period_ms);
        if probe_due {
            self.state.last_probe_sent_at = Some(now);
            let seq = self.state.next_probe_seq;
            self.state.next_probe_seq = seq.wrapping_add(1);
            debug!(address = %peer.address, seq, "Probing peer");
            // Failure already logged; the miss timer handles the consequence
            let _ = self.transmit(peer.address, &Frame::Ping(seq));
        }

        let window = self.config.probe_window_ms();
        let threshold = self.config.miss_threshold;
        let Some(peer) = self.state.peer.as_mut() else {
            return;
        };
        if now <= peer.last_seen_at + window {
            return;
        }

        peer.last_seen_at = now;
        peer.missed_probes = peer.missed_probes.saturating_add(1);
        debug!(address = %peer.address, missed = peer.missed_probes, "Probe window missed");

        if peer.missed_probes >= threshold {
            info!(address = %peer.address, missed = peer.missed_probes, "Peer timeout, rediscovering");
            self.forget_peer();
        }
    }

    /// Answer a probe from anyone who knows our message port
    pub(crate) fn on_probe(&mut self, seq: u32, sender: IpAddr) {
        let _ = self.transmit(sender, &Frame::Pong(seq));
    }

    /// Any probe reply counts; the echoed sequence is informational only
    pub(crate) fn on_probe_reply(&mut self, seq: u32, now: u64) {
        if let Some(peer) = self.state.peer.as_mut() {
            debug!(seq, "Probe reply");
            peer.touch(now);
        }
    }
}
