/// Receiver module - inbound UDP datagrams
///
/// One reader task per bound socket forwards every datagram into the link
/// queue as a `LinkEvent::Datagram`. Datagrams longer than
/// `MAX_PAYLOAD_SIZE` are dropped here instead of being cut to size.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::errors::Result;
use crate::transport::{EventSink, LinkEvent};

/// Pause after a receive error before reading again
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct Receiver;

impl Receiver {
    /// Spawn a task forwarding every datagram on `socket` into the link queue
    ///
    /// The task ends when the link drops its queue or the handle is aborted.
    pub fn spawn(
        runtime: &Handle,
        socket: Arc<UdpSocket>,
        events: EventSink,
        channel: &'static str,
    ) -> JoinHandle<()> {
        runtime.spawn(async move {
            // One spare byte tells an oversized datagram from a full one
            let mut buffer = vec![0u8; crate::MAX_PAYLOAD_SIZE + 1];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((bytes_received, sender)) => {
                        if let Some(event) = Self::datagram_event(&buffer[..bytes_received], sender) {
                            trace!(channel, %sender, len = bytes_received, "UDP RX");
                            if events.send(event).is_err() {
                                debug!(channel, "Link queue closed, stopping receiver");
                                break;
                            }
                        } else {
                            trace!(channel, %sender, len = bytes_received, "Dropping oversized datagram");
                        }
                    }
                    Err(e) => {
                        // ICMP errors from earlier sends surface here on some
                        // platforms; the socket stays usable.
                        warn!(channel, error = %e, "UDP receive failed");
                        tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                    }
                }
            }
        })
    }

    /// Wrap a received datagram, or `None` if it exceeds the size limit
    pub fn datagram_event(bytes: &[u8], sender: SocketAddr) -> Option<LinkEvent> {
        if bytes.len() > crate::MAX_PAYLOAD_SIZE {
            return None;
        }
        Some(LinkEvent::Datagram {
            from: Self::source_ip(sender),
            bytes: bytes.to_vec(),
        })
    }

    /// Sender address with IPv4-mapped IPv6 folded back to IPv4
    pub fn source_ip(sender: SocketAddr) -> IpAddr {
        sender.ip().to_canonical()
    }
}

/// A bound socket plus the task draining it
///
/// Sends go through a cloned std handle of the same socket, which does not
/// depend on the reactor having seen the socket as writable yet.
pub struct Listener {
    pub sender: Arc<std::net::UdpSocket>,
    task: JoinHandle<()>,
}

impl Listener {
    /// Register a bound, non-blocking std socket with `runtime` and start reading
    pub fn bind(
        runtime: &Handle,
        socket: std::net::UdpSocket,
        events: EventSink,
        channel: &'static str,
    ) -> Result<Self> {
        let sender = Arc::new(socket.try_clone()?);
        let socket = {
            let _guard = runtime.enter();
            UdpSocket::from_std(socket)?
        };
        let task = Receiver::spawn(runtime, Arc::new(socket), events, channel);
        Ok(Self { sender, task })
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.task.abort();
    }
}
