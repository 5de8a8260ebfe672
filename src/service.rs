/// Background link service.
///
/// [`spawn_link`] moves a [`PeerLink`] onto a blocking worker that runs a
/// scheduling pass every tick and serves command requests between passes.
/// Callers talk to it through a cloneable [`LinkHandle`].
///
/// Only one `AckMode::Wait` command may be in flight at a time; a second one
/// issued while the first is still waiting is rejected with
/// [`LinkError::Busy`] instead of queueing behind it.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::command::AckMode;
use crate::errors::{LinkError, Result};
use crate::link::PeerLink;
use crate::transport::Transport;

/// Snapshot of the link published after every pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStatus {
    pub associated: bool,
    pub peer: Option<IpAddr>,
}

impl LinkStatus {
    fn of<T: Transport>(link: &PeerLink<T>) -> Self {
        Self {
            associated: link.is_associated(),
            peer: link.state().peer_address(),
        }
    }
}

enum Request {
    Send {
        payload: String,
        mode: AckMode,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// Clears the in-flight wait flag however the request ends
struct WaitGuard(Arc<AtomicBool>);

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Client side of a running link service
#[derive(Clone)]
pub struct LinkHandle {
    requests: mpsc::UnboundedSender<Request>,
    waiting: Arc<AtomicBool>,
    status: watch::Receiver<LinkStatus>,
}

impl LinkHandle {
    /// Send a command through the service
    ///
    /// # Errors
    /// - `Busy` if `mode` is `Wait` and another wait is still in flight
    /// - `ServiceStopped` if the service has exited
    /// - anything `PeerLink::send_command` returns
    pub async fn send_command(&self, payload: impl Into<String>, mode: AckMode) -> Result<()> {
        let _guard = match mode {
            AckMode::Wait { .. } => {
                if self
                    .waiting
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    return Err(LinkError::Busy);
                }
                Some(WaitGuard(Arc::clone(&self.waiting)))
            }
            _ => None,
        };

        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request::Send {
                payload: payload.into(),
                mode,
                reply,
            })
            .map_err(|_| LinkError::ServiceStopped)?;
        response.await.map_err(|_| LinkError::ServiceStopped)?
    }

    /// Latest published status
    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    /// Wait until a peer is known, up to `timeout`
    pub async fn wait_for_peer(&self, timeout: Duration) -> Option<IpAddr> {
        let mut status = self.status.clone();
        let peer = match tokio::time::timeout(timeout, status.wait_for(|s| s.peer.is_some())).await {
            Ok(Ok(current)) => current.peer,
            _ => None,
        };
        peer
    }

    /// Ask the service to stop after the current pass
    pub fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown);
    }
}

/// Run `link` on a blocking worker, one scheduling pass per `tick`
///
/// Must be called from within a tokio runtime. The worker exits on
/// [`LinkHandle::shutdown`] or once every handle is dropped.
pub fn spawn_link<T: Transport + 'static>(
    mut link: PeerLink<T>,
    tick: Duration,
) -> (LinkHandle, JoinHandle<()>) {
    let (requests, mut inbox) = mpsc::unbounded_channel();
    let (status_tx, status) = watch::channel(LinkStatus::of(&link));

    let task = tokio::task::spawn_blocking(move || {
        info!(role = %link.state().role, tick_ms = tick.as_millis() as u64, "Link service started");
        'service: loop {
            link.poll();
            publish(&status_tx, &link);

            loop {
                match inbox.try_recv() {
                    Ok(Request::Send { payload, mode, reply }) => {
                        let result = link.send_command(&payload, mode);
                        debug!(payload = %payload, ok = result.is_ok(), "Command request served");
                        let _ = reply.send(result);
                        publish(&status_tx, &link);
                    }
                    Ok(Request::Shutdown) | Err(TryRecvError::Disconnected) => break 'service,
                    Err(TryRecvError::Empty) => break,
                }
            }

            std::thread::sleep(tick);
        }
        info!("Link service stopped");
    });

    let handle = LinkHandle {
        requests,
        waiting: Arc::new(AtomicBool::new(false)),
        status,
    };
    (handle, task)
}

fn publish<T: Transport>(status: &watch::Sender<LinkStatus>, link: &PeerLink<T>) {
    let current = LinkStatus::of(link);
    status.send_if_modified(|published| {
        if *published == current {
            return false;
        }
        *published = current;
        true
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{LinkClock, MonotonicClock};
    use crate::config::LinkConfig;
    use crate::contracts::{DeviceId, Role};
    use crate::link::tests::{REMOTE_IP, SIGN_IP};
    use crate::link::LinkHooks;
    use crate::transport::{event_queue, MemoryNetwork, MemoryTransport};
    use parking_lot::Mutex;

    const TICK: Duration = Duration::from_millis(2);

    fn link_on(
        net: &MemoryNetwork,
        clock: &Arc<dyn LinkClock>,
        role: Role,
        ip: IpAddr,
        hooks: LinkHooks,
    ) -> PeerLink<MemoryTransport> {
        let (sink, queue) = event_queue();
        let transport = net.attach(ip, sink);
        PeerLink::new(
            role,
            DeviceId::from_mac([0; 6]),
            LinkConfig::default(),
            transport,
            queue,
            Arc::clone(clock),
        )
        .with_hooks(hooks)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scenario_b_through_services() {
        let net = MemoryNetwork::new();
        let clock: Arc<dyn LinkClock> = Arc::new(MonotonicClock::new());
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);

        let remote = link_on(
            &net,
            &clock,
            Role::remote(),
            REMOTE_IP,
            LinkHooks::new().on_command(move |p| sink.lock().push(p.to_string())),
        );
        let sign = link_on(&net, &clock, Role::sign(), SIGN_IP, LinkHooks::new());
        let (remote, remote_task) = spawn_link(remote, TICK);
        let (sign, sign_task) = spawn_link(sign, TICK);

        assert_eq!(sign.wait_for_peer(Duration::from_secs(5)).await, Some(REMOTE_IP));
        assert_eq!(remote.wait_for_peer(Duration::from_secs(5)).await, Some(SIGN_IP));
        assert!(sign.status().associated);

        sign.send_command("LIGHT 2", AckMode::wait()).await.unwrap();
        assert_eq!(*received.lock(), vec!["LIGHT 2".to_string()]);

        remote.shutdown();
        sign.shutdown();
        remote_task.await.unwrap();
        sign_task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_second_wait_is_busy() {
        let net = MemoryNetwork::new();
        let clock: Arc<dyn LinkClock> = Arc::new(MonotonicClock::new());
        let sign = link_on(&net, &clock, Role::sign(), SIGN_IP, LinkHooks::new());
        let (handle, task) = spawn_link(sign, TICK);

        // A bare endpoint that announces itself but never acknowledges
        let (raw_sink, _raw_queue) = event_queue();
        let mut raw = net.attach(REMOTE_IP, raw_sink);
        raw.associate().unwrap();
        raw.open_peer_channel().unwrap();

        let mut peer = None;
        for _ in 0..100 {
            raw.announce(b"HELLO remote 000005 10.0.0.5").unwrap();
            peer = handle.wait_for_peer(Duration::from_millis(50)).await;
            if peer.is_some() {
                break;
            }
        }
        assert_eq!(peer, Some(REMOTE_IP));

        let first = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .send_command("LIGHT 2", AckMode::Wait { timeout_ms: 500 })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = handle
            .send_command("LIGHT 3", AckMode::Wait { timeout_ms: 500 })
            .await;
        assert!(matches!(second, Err(LinkError::Busy)));

        let first = first.await.unwrap();
        assert!(matches!(first, Err(LinkError::Timeout { timeout_ms: 500 })));

        // The flag is released once the first wait ends
        let third = handle
            .send_command("LIGHT 4", AckMode::Wait { timeout_ms: 50 })
            .await;
        assert!(matches!(third, Err(LinkError::Timeout { .. })));

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stopped_service() {
        let net = MemoryNetwork::new();
        let clock: Arc<dyn LinkClock> = Arc::new(MonotonicClock::new());
        let sign = link_on(&net, &clock, Role::sign(), SIGN_IP, LinkHooks::new());
        let (handle, task) = spawn_link(sign, TICK);

        handle.shutdown();
        task.await.unwrap();

        let result = handle.send_command("LIGHT 2", AckMode::FireAndForget).await;
        assert!(matches!(result, Err(LinkError::ServiceStopped)));
        assert!(!LinkError::ServiceStopped.is_recoverable());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_peer_through_service() {
        let net = MemoryNetwork::new();
        let clock: Arc<dyn LinkClock> = Arc::new(MonotonicClock::new());
        let sign = link_on(&net, &clock, Role::sign(), SIGN_IP, LinkHooks::new());
        let (handle, task) = spawn_link(sign, TICK);

        let result = handle.send_command("LIGHT 2", AckMode::Async).await;
        assert!(matches!(result, Err(LinkError::NoPeer)));
        assert_eq!(handle.wait_for_peer(Duration::from_millis(20)).await, None);

        drop(handle);
        task.await.unwrap();
    }
}
