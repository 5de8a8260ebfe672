/// Command channel - operator commands and their acknowledgments
///
/// Outbound commands are framed as `CMD <payload>` and sent to the known
/// peer. Every received `CMD` is handed to the application and answered with
/// `ACK <payload>`, whatever the application did with it. Three ack modes
/// are supported:
/// - fire-and-forget: transmission success is the result
/// - async: the ack is reported later through the `on_ack` hook
/// - wait: poll for the exact ack until a caller-supplied deadline

use std::collections::VecDeque;
use std::net::IpAddr;

use tracing::{debug, trace};

use crate::contracts::{validate_payload, Frame};
use crate::errors::{LinkError, Result};
use crate::link::PeerLink;
use crate::transport::Transport;

/// How `send_command` treats the acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Return once the frame is sent; a later ack is ignored
    FireAndForget,
    /// Return once sent; the ack is delivered to `LinkHooks::on_ack`
    Async,
    /// Return only once the matching ack arrives, or fail after the timeout
    Wait { timeout_ms: u64 },
}

impl AckMode {
    /// Wait mode with the default 400 ms window
    pub fn wait() -> Self {
        Self::Wait {
            timeout_ms: crate::ACK_TIMEOUT_MS,
        }
    }
}

/// Which waiter, if any, an incoming ack satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckMatch {
    Wait,
    Async,
    Unmatched,
}

/// Acks this device is still expecting
#[derive(Debug, Default)]
pub(crate) struct PendingAcks {
    /// Payload of the command currently in `AckMode::Wait`, and whether its
    /// ack has arrived
    waiting: Option<(String, bool)>,
    /// `AckMode::Async` payloads, oldest first
    outstanding: VecDeque<String>,
}

impl PendingAcks {
    fn begin_wait(&mut self, payload: &str) {
        self.waiting = Some((payload.to_string(), false));
    }

    fn wait_acked(&self) -> bool {
        matches!(self.waiting, Some((_, true)))
    }

    fn end_wait(&mut self) {
        self.waiting = None;
    }

    fn track(&mut self, payload: &str, limit: usize) {
        if limit == 0 {
            return;
        }
        while self.outstanding.len() >= limit {
            self.outstanding.pop_front();
        }
        self.outstanding.push_back(payload.to_string());
    }

    pub(crate) fn resolve(&mut self, payload: &str) -> AckMatch {
        if let Some((expected, acked)) = self.waiting.as_mut() {
            if expected == payload {
                *acked = true;
                return AckMatch::Wait;
            }
        }
        if let Some(pos) = self.outstanding.iter().position(|p| p == payload) {
            self.outstanding.remove(pos);
            return AckMatch::Async;
        }
        AckMatch::Unmatched
    }

    pub(crate) fn clear_outstanding(&mut self) {
        self.outstanding.clear();
    }

    pub(crate) fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }
}

impl<T: Transport> PeerLink<T> {
    /// Send a command to the known peer
    ///
    /// # Errors
    /// - `InvalidPayload` / `PayloadTooLarge` before anything is sent
    /// - `NoPeer` if no peer is known, or it is lost while waiting
    /// - `SendFailed` if the transport refuses the datagram
    /// - `Timeout` if `AckMode::Wait` sees no matching ack in time
    pub fn send_command(&mut self, payload: &str, mode: AckMode) -> Result<()> {
        validate_payload(payload, crate::MAX_PAYLOAD_SIZE)?;
        if let AckMode::Wait { .. } = mode {
            // Acks already queued answer earlier sends, not this one
            self.drain_inbound();
        }
        let peer = self.state.peer.ok_or(LinkError::NoPeer)?;

        debug!(address = %peer.address, payload, ?mode, "Sending command");
        self.transmit(peer.address, &Frame::Cmd(payload.to_string()))?;

        match mode {
            AckMode::FireAndForget => Ok(()),
            AckMode::Async => {
                self.pending.track(payload, self.config.max_outstanding_acks);
                Ok(())
            }
            AckMode::Wait { timeout_ms } => self.wait_for_ack(payload, timeout_ms),
        }
    }

    /// Keep scheduling passes running until the ack arrives or time is up
    fn wait_for_ack(&mut self, payload: &str, timeout_ms: u64) -> Result<()> {
        let deadline = self.clock.now_ms().saturating_add(timeout_ms);
        self.pending.begin_wait(payload);

        let result = loop {
            self.poll();
            if self.pending.wait_acked() {
                break Ok(());
            }
            if self.state.peer.is_none() {
                break Err(LinkError::NoPeer);
            }
            let now = self.clock.now_ms();
            if now >= deadline {
                break Err(LinkError::Timeout { timeout_ms });
            }
            let nap = self.config.wait_poll_ms.clamp(1, deadline - now);
            self.clock.sleep_ms(nap);
        };

        self.pending.end_wait();
        debug!(payload, ok = result.is_ok(), "Ack wait finished");
        result
    }

    /// Execute a received command, then acknowledge it to the sender
    pub(crate) fn on_command_frame(&mut self, payload: String, sender: IpAddr) {
        debug!(%sender, payload = %payload, "Command received");
        if let Some(hook) = self.hooks.on_command.as_mut() {
            hook(&payload);
        }
        let _ = self.transmit(sender, &Frame::Ack(payload));
    }

    pub(crate) fn on_ack_frame(&mut self, payload: String) {
        match self.pending.resolve(&payload) {
            AckMatch::Wait => debug!(payload = %payload, "Ack received"),
            AckMatch::Async => {
                debug!(payload = %payload, "Async ack received");
                if let Some(hook) = self.hooks.on_ack.as_mut() {
                    hook(&payload);
                }
            }
            AckMatch::Unmatched => trace!(payload = %payload, "Dropping unexpected ack"),
        }
    }
}
