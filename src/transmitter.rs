/// Transmitter module - outbound UDP datagrams
///
/// Every frame the UDP transport sends goes through here, so the size limit
/// and error mapping are enforced in one place. Sends go straight to the
/// socket: the core runs on a single cooperative scheduling pass and a full
/// socket buffer is reported as a failed send rather than waited out.

use std::io;
use std::net::{SocketAddr, UdpSocket};

use tracing::trace;

use crate::errors::{LinkError, Result};

/// Transmitter - size-checked datagram send
pub struct Transmitter;

impl Transmitter {
    /// Send an encoded frame to `destination`
    ///
    /// # Returns
    /// Number of bytes transmitted, or `LinkError` on failure
    pub fn send_raw(socket: &UdpSocket, bytes: &[u8], destination: SocketAddr) -> Result<usize> {
        Self::check_size(bytes)?;

        trace!(%destination, len = bytes.len(), "UDP TX");
        socket
            .send_to(bytes, destination)
            .map_err(|e| Self::map_send_error(e, destination))
    }

    /// Reject frames that would not fit the receive buffer on the other end
    pub fn check_size(bytes: &[u8]) -> Result<()> {
        if bytes.len() > crate::MAX_PAYLOAD_SIZE {
            return Err(LinkError::PayloadTooLarge {
                size: bytes.len(),
                max: crate::MAX_PAYLOAD_SIZE,
            });
        }
        Ok(())
    }

    /// Whether a send error means the network association itself is gone
    pub fn is_association_error(err: &io::Error) -> bool {
        matches!(
            err.kind(),
            io::ErrorKind::NetworkUnreachable
                | io::ErrorKind::NetworkDown
                | io::ErrorKind::AddrNotAvailable
        )
    }

    fn map_send_error(err: io::Error, destination: SocketAddr) -> LinkError {
        match err.kind() {
            io::ErrorKind::WouldBlock => {
                LinkError::SendFailed(format!("socket buffer full sending to {}", destination))
            }
            _ if Self::is_association_error(&err) => LinkError::Io(err),
            _ => LinkError::SendFailed(format!("{} ({})", err, destination)),
        }
    }
}
