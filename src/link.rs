/// Peer link driver.
///
/// [`PeerLink`] owns the whole protocol state of one device together with
/// its transport, clock and inbound queue. One call to [`PeerLink::poll`] is
/// one scheduling pass:
///
/// 1. backoff tick (keep the network association alive)
/// 2. discovery announce
/// 3. heartbeat tick
/// 4. drain inbound events
///
/// The protocol components themselves live in `backoff`, `discovery`,
/// `heartbeat` and `command`, each as an `impl PeerLink` block.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::backoff::BackoffState;
use crate::clock::LinkClock;
use crate::command::PendingAcks;
use crate::config::LinkConfig;
use crate::contracts::{DeviceId, Frame, PeerInfo, Role};
use crate::errors::Result;
use crate::transport::{EventQueue, LinkEvent, Transport};

type PayloadHook = Box<dyn FnMut(&str) + Send>;
type StateHook = Box<dyn FnMut(bool) + Send>;

/// Application callbacks
///
/// Hooks only ever receive values, never the link, so they cannot touch
/// link state while it is being updated.
#[derive(Default)]
pub struct LinkHooks {
    pub(crate) on_command: Option<PayloadHook>,
    pub(crate) on_ack: Option<PayloadHook>,
    pub(crate) on_link_state: Option<StateHook>,
}

impl LinkHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoked with the payload of every received `CMD`
    pub fn on_command(mut self, hook: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_command = Some(Box::new(hook));
        self
    }

    /// Invoked when an `AckMode::Async` command is acknowledged
    pub fn on_ack(mut self, hook: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_ack = Some(Box::new(hook));
        self
    }

    /// Invoked with `true` on peer acquisition and `false` on peer loss
    pub fn on_link_state(mut self, hook: impl FnMut(bool) + Send + 'static) -> Self {
        self.on_link_state = Some(Box::new(hook));
        self
    }
}

/// Protocol state of one device
#[derive(Debug, Clone)]
pub struct PeerLinkState {
    pub role: Role,
    pub device_id: DeviceId,
    /// Present iff a live peer is known
    pub peer: Option<PeerInfo>,
    /// `None` until the first announcement
    pub last_announce_at: Option<u64>,
    /// `None` until the first probe to the current peer
    pub last_probe_sent_at: Option<u64>,
    pub next_probe_seq: u32,
    pub reconnect: BackoffState,
    pub associated: bool,
}

impl PeerLinkState {
    pub fn new(role: Role, device_id: DeviceId, config: &LinkConfig) -> Self {
        Self {
            role,
            device_id,
            peer: None,
            last_announce_at: None,
            last_probe_sent_at: None,
            next_probe_seq: 1,
            reconnect: BackoffState::new(config.backoff_floor_ms, config.backoff_ceiling_ms),
            associated: false,
        }
    }

    pub fn peer_address(&self) -> Option<IpAddr> {
        self.peer.map(|p| p.address)
    }
}

/// One device's end of the peer link
pub struct PeerLink<T: Transport> {
    pub(crate) state: PeerLinkState,
    pub(crate) config: LinkConfig,
    pub(crate) transport: T,
    pub(crate) clock: Arc<dyn LinkClock>,
    pub(crate) events: EventQueue,
    pub(crate) hooks: LinkHooks,
    pub(crate) pending: PendingAcks,
}

impl<T: Transport> PeerLink<T> {
    /// Create a link; `events` must be the queue whose sink the transport holds
    pub fn new(
        role: Role,
        device_id: DeviceId,
        config: LinkConfig,
        transport: T,
        events: EventQueue,
        clock: Arc<dyn LinkClock>,
    ) -> Self {
        info!(role = %role, device_id = %device_id, "Peer link created");
        Self {
            state: PeerLinkState::new(role, device_id, &config),
            config,
            transport,
            clock,
            events,
            hooks: LinkHooks::default(),
            pending: PendingAcks::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: LinkHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Run one scheduling pass
    pub fn poll(&mut self) {
        let now = self.clock.now_ms();
        self.backoff_tick(now);
        self.announce(now);
        self.heartbeat_tick(now);
        self.drain_inbound();
    }

    pub fn state(&self) -> &PeerLinkState {
        &self.state
    }

    pub fn peer(&self) -> Option<PeerInfo> {
        self.state.peer
    }

    pub fn is_associated(&self) -> bool {
        self.state.associated
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub(crate) fn drain_inbound(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Associated => self.on_associated(),
            LinkEvent::AssociationLost => self.on_association_lost(),
            LinkEvent::Datagram { from, bytes } => self.on_datagram(from, &bytes),
        }
    }

    fn on_datagram(&mut self, from: IpAddr, bytes: &[u8]) {
        let Some(frame) = Frame::parse(bytes) else {
            trace!(%from, len = bytes.len(), "Dropping malformed frame");
            return;
        };
        let now = self.clock.now_ms();

        // Any valid frame from the known peer proves it is alive
        if let Some(peer) = self.state.peer.as_mut() {
            if peer.address == from {
                peer.touch(now);
            }
        }

        match frame {
            Frame::Hello(hello) => self.on_announce(hello, from, now),
            Frame::Ping(seq) => self.on_probe(seq, from),
            Frame::Pong(seq) => self.on_probe_reply(seq, now),
            Frame::Cmd(payload) => self.on_command_frame(payload, from),
            Frame::Ack(payload) => self.on_ack_frame(payload),
        }
    }

    /// Send one frame on the peer channel
    pub(crate) fn transmit(&mut self, to: IpAddr, frame: &Frame) -> Result<()> {
        let result = self.transport.send_to(to, &frame.encode());
        if let Err(e) = &result {
            warn!(%to, kind = frame.kind(), error = %e, "Send failed");
        }
        result
    }

    /// Drop the current peer, returning whether there was one.
    ///
    /// Closes the peer channel, abandons outstanding acks and reports the
    /// loss to the application.
    pub(crate) fn forget_peer(&mut self) -> bool {
        let Some(peer) = self.state.peer.take() else {
            return false;
        };
        debug!(address = %peer.address, "Forgetting peer");
        self.state.last_probe_sent_at = None;
        self.pending.clear_outstanding();
        self.transport.close_peer_channel();
        self.notify_link_state(false);
        true
    }

    pub(crate) fn notify_link_state(&mut self, known: bool) {
        if let Some(hook) = self.hooks.on_link_state.as_mut() {
            hook(known);
        }
    }
}
