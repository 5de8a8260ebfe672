/// Reconnection / backoff controller
///
/// Keeps the network association alive. While unassociated, one association
/// attempt is issued whenever the retry timer is due; every attempt doubles
/// the delay before the next one, up to the ceiling. The delay returns to
/// its floor only when the transport reports a successful association.

use tracing::{debug, info, warn};

use crate::link::PeerLink;
use crate::transport::Transport;

/// Calculate the delay that follows `attempt` failed attempts
///
/// Truncated exponential backoff:
/// `delay = min(base_ms * 2^attempt, max_delay_ms)`
pub fn backoff_delay_ms(attempt: u32, base_ms: u64, max_delay_ms: u64) -> u64 {
    let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    base_ms.saturating_mul(multiplier).min(max_delay_ms)
}

/// Association retry timer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffState {
    /// Earliest time of the next association attempt
    pub next_attempt_at: u64,
    /// Delay that will follow the next attempt
    pub current_delay_ms: u32,
    floor_ms: u32,
    ceiling_ms: u32,
}

impl BackoffState {
    /// First attempt is due immediately
    pub fn new(floor_ms: u32, ceiling_ms: u32) -> Self {
        Self {
            next_attempt_at: 0,
            current_delay_ms: floor_ms,
            floor_ms,
            ceiling_ms,
        }
    }

    pub fn is_due(&self, now: u64) -> bool {
        now >= self.next_attempt_at
    }

    /// Schedule the next attempt and grow the delay
    ///
    /// Returns the delay until that next attempt.
    pub fn record_attempt(&mut self, now: u64) -> u32 {
        let delay = self.current_delay_ms;
        self.next_attempt_at = now + u64::from(delay);
        self.current_delay_ms = delay.saturating_mul(2).min(self.ceiling_ms);
        delay
    }

    /// Association succeeded
    pub fn reset(&mut self) {
        self.current_delay_ms = self.floor_ms;
    }

    pub fn floor_ms(&self) -> u32 {
        self.floor_ms
    }
}

impl<T: Transport> PeerLink<T> {
    /// Issue an association attempt if unassociated and the timer is due
    pub(crate) fn backoff_tick(&mut self, now: u64) {
        if self.state.associated || !self.state.reconnect.is_due(now) {
            return;
        }

        let retry_in_ms = self.state.reconnect.record_attempt(now);
        debug!(retry_in_ms, "Attempting network association");
        if let Err(e) = self.transport.associate() {
            warn!(error = %e, retry_in_ms, "Association attempt failed");
        }
    }

    /// The transport reports a working association
    pub(crate) fn on_associated(&mut self) {
        info!("Association up, restarting discovery");
        self.state.associated = true;
        self.state.reconnect.reset();

        // Any previous peer address may be stale on the new network
        self.forget_peer();
        self.state.last_announce_at = None;

        if let Err(e) = self.transport.open_discovery() {
            warn!(error = %e, "Failed to bind discovery listener");
        }
    }

    /// The transport reports the association dropped
    pub(crate) fn on_association_lost(&mut self) {
        info!("Association lost, will retry");
        self.state.associated = false;
        // Closes the peer channel along with the peer
        self.forget_peer();
        self.transport.close_discovery();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{LinkClock, ManualClock};
    use crate::contracts::Role;
    use crate::link::tests::{run_pair, Harness, REMOTE_IP, SIGN_IP};
    use crate::transport::MemoryNetwork;

    #[test]
    fn test_exponential_backoff() {
        assert_eq!(backoff_delay_ms(0, 1000, 10000), 1000);
        assert_eq!(backoff_delay_ms(1, 1000, 10000), 2000);
        assert_eq!(backoff_delay_ms(2, 1000, 10000), 4000);
        assert_eq!(backoff_delay_ms(3, 1000, 10000), 8000);
        assert_eq!(backoff_delay_ms(4, 1000, 10000), 10000); // Capped
        assert_eq!(backoff_delay_ms(200, 1000, 10000), 10000);
    }

    #[test]
    fn test_state_matches_closed_form() {
        let mut state = BackoffState::new(1000, 10000);
        for attempt in 0..8 {
            assert_eq!(
                u64::from(state.current_delay_ms),
                backoff_delay_ms(attempt, 1000, 10000)
            );
            state.record_attempt(0);
        }
    }

    #[test]
    fn test_growth_and_single_reset() {
        let mut state = BackoffState::new(1000, 10000);
        assert!(state.is_due(0));

        assert_eq!(state.record_attempt(0), 1000);
        assert_eq!(state.next_attempt_at, 1000);
        assert!(!state.is_due(999));
        assert!(state.is_due(1000));

        assert_eq!(state.record_attempt(1000), 2000);
        assert_eq!(state.record_attempt(3000), 4000);
        assert_eq!(state.record_attempt(7000), 8000);
        assert_eq!(state.record_attempt(15000), 10000);
        assert_eq!(state.record_attempt(25000), 10000);
        assert_eq!(state.current_delay_ms, 10000);

        state.reset();
        assert_eq!(state.current_delay_ms, state.floor_ms());
    }

    #[test]
    fn test_no_attempts_while_associated() {
        let net = MemoryNetwork::new();
        let clock = ManualClock::new(0);
        let mut sign = Harness::new(&net, &clock, Role::sign(), SIGN_IP);

        for _ in 0..30_000 {
            sign.link.poll();
            clock.advance(1);
        }
        assert_eq!(net.association_attempts(SIGN_IP), 1);
        assert!(sign.link.is_associated());
        assert_eq!(sign.link.state().reconnect.current_delay_ms, 1000);
    }

    #[test]
    fn test_retry_schedule_while_network_down() {
        let net = MemoryNetwork::new();
        let clock = ManualClock::new(0);
        let mut sign = Harness::new(&net, &clock, Role::sign(), SIGN_IP);
        net.set_available(SIGN_IP, false);

        let mut attempt_times = Vec::new();
        let mut seen = 0;
        while clock.now_ms() <= 40_000 {
            sign.link.poll();
            let attempts = net.association_attempts(SIGN_IP);
            if attempts != seen {
                seen = attempts;
                attempt_times.push(clock.now_ms());
            }
            clock.advance(1);
        }
        assert_eq!(attempt_times, vec![0, 1000, 3000, 7000, 15000, 25000, 35000]);

        // Coming back resets the delay exactly once
        net.set_available(SIGN_IP, true);
        while clock.now_ms() <= 46_000 {
            sign.link.poll();
            clock.advance(1);
        }
        assert!(sign.link.is_associated());
        assert_eq!(net.association_attempts(SIGN_IP), 8);
        assert_eq!(sign.link.state().reconnect.current_delay_ms, 1000);
    }

    #[test]
    fn test_association_loss_clears_peer_immediately() {
        let net = MemoryNetwork::new();
        let clock = ManualClock::new(0);
        let mut remote = Harness::new(&net, &clock, Role::remote(), REMOTE_IP);
        let mut sign = Harness::new(&net, &clock, Role::sign(), SIGN_IP);
        run_pair(&clock, &mut remote, &mut sign, 2000);
        assert!(sign.link.peer().is_some());

        net.set_available(SIGN_IP, false);
        sign.link.poll();

        assert_eq!(sign.link.peer(), None);
        assert!(!sign.link.is_associated());
        assert!(!sign.link.transport().peer_channel_open());
        assert_eq!(*sign.link_states.lock(), vec![true, false]);
    }

    #[test]
    fn test_reassociation_forces_rediscovery() {
        let net = MemoryNetwork::new();
        let clock = ManualClock::new(0);
        let mut remote = Harness::new(&net, &clock, Role::remote(), REMOTE_IP);
        let mut sign = Harness::new(&net, &clock, Role::sign(), SIGN_IP);
        run_pair(&clock, &mut remote, &mut sign, 2000);

        // A duplicate association report still drops the known peer
        sign.sink.send(crate::transport::LinkEvent::Associated).unwrap();
        sign.link.poll();
        assert_eq!(sign.link.peer(), None);

        let until = clock.now_ms() + 1500;
        run_pair(&clock, &mut remote, &mut sign, until);
        assert_eq!(sign.link.state().peer_address(), Some(REMOTE_IP));
        assert_eq!(*sign.link_states.lock(), vec![true, false, true]);
    }
}
