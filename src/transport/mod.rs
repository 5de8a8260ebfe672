/// Transport abstraction.
///
/// A transport owns the sockets (or radio) of one device. It exposes two
/// channels: a rendezvous channel for HELLO announcements and a
/// peer-addressed channel for everything else. Inbound traffic and network
/// association changes are never handled inside the transport; they are
/// pushed as [`LinkEvent`]s into the link's queue, from whatever thread or
/// task the transport receives on.

pub mod memory;
pub mod resolver;
pub mod udp;

use std::net::IpAddr;

use tokio::sync::mpsc;

use crate::errors::Result;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use resolver::{NameResolver, StaticResolver, SystemResolver};
pub use udp::UdpTransport;

/// Something that happened below the protocol core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The network association came up (the device has an address)
    Associated,
    /// The network association dropped
    AssociationLost,
    /// A datagram arrived on either channel
    Datagram { from: IpAddr, bytes: Vec<u8> },
}

/// Producer side of the link's inbound queue, handed to transports
pub type EventSink = mpsc::UnboundedSender<LinkEvent>;

/// Consumer side of the inbound queue, owned by the link
pub type EventQueue = mpsc::UnboundedReceiver<LinkEvent>;

/// Create the single-consumer inbound queue for one link
pub fn event_queue() -> (EventSink, EventQueue) {
    mpsc::unbounded_channel()
}

/// Capability interface every transport variant implements
pub trait Transport: Send {
    /// Issue one network association attempt.
    ///
    /// Success is reported later through [`LinkEvent::Associated`]; an `Err`
    /// means the attempt could not even be started.
    fn associate(&mut self) -> Result<()>;

    /// This device's address on the associated network, if known
    fn local_address(&self) -> Option<IpAddr>;

    /// (Re)bind the rendezvous listener
    fn open_discovery(&mut self) -> Result<()>;

    fn close_discovery(&mut self);

    /// Bind the peer-addressed listener
    fn open_peer_channel(&mut self) -> Result<()>;

    fn close_peer_channel(&mut self);

    fn peer_channel_open(&self) -> bool;

    /// Send an announcement on the rendezvous channel
    fn announce(&mut self, payload: &[u8]) -> Result<()>;

    /// Send a datagram to the peer channel at `addr`
    fn send_to(&mut self, addr: IpAddr, payload: &[u8]) -> Result<()>;
}
