/// Core data structures and wire framing for the peer link protocol
///
/// Every datagram is a single UTF-8 line, space-delimited, with the message
/// kind as the first token:
///
/// ```text
/// HELLO <role> <deviceId> [<ip>]
/// PING <seq>
/// PONG <seq>
/// CMD <payload...>
/// ACK <payload...>
/// ```
///
/// Command payloads are "rest of line" and may contain spaces. Parsing never
/// fails loudly: anything that does not match one of these shapes yields
/// `None` and is dropped by the caller, since the channel is unauthenticated.
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::errors::{LinkError, Result};

/// Role name of the handheld controller
pub const ROLE_REMOTE: &str = "remote";

/// Role name of the receiving sign
pub const ROLE_SIGN: &str = "sign";

/// Declared role of a device
///
/// The protocol pairs exactly two distinct roles; announcements carrying this
/// device's own role (including its own multicast echo) are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Role(String);

impl Role {
    /// Create a role, rejecting names that cannot be carried as one token
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !is_token(&name) {
            return Err(LinkError::InvalidPayload(format!("invalid role name: {:?}", name)));
        }
        Ok(Self(name))
    }

    pub fn remote() -> Self {
        Self(ROLE_REMOTE.to_string())
    }

    pub fn sign() -> Self {
        Self(ROLE_SIGN.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Role {
    type Error = LinkError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.0
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Short stable device identifier
///
/// Derived from the hardware address at boot: the last three MAC bytes as
/// six uppercase hex digits. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    /// Derive the identifier from a 6-byte hardware address
    pub fn from_mac(mac: [u8; 6]) -> Self {
        Self(format!("{:02X}{:02X}{:02X}", mac[3], mac[4], mac[5]))
    }

    /// Parse a textual MAC address (`AA:BB:CC:DD:EE:FF` or `-` separated)
    pub fn from_mac_str(text: &str) -> Result<Self> {
        let mut mac = [0u8; 6];
        let mut parts = text.trim().split(|c| c == ':' || c == '-');
        for byte in mac.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| LinkError::InvalidPayload(format!("short MAC address: {}", text)))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| LinkError::InvalidPayload(format!("bad MAC octet: {}", part)))?;
        }
        if parts.next().is_some() {
            return Err(LinkError::InvalidPayload(format!("long MAC address: {}", text)));
        }
        Ok(Self::from_mac(mac))
    }

    /// Wrap an identifier received on the wire
    fn from_wire(token: &str) -> Self {
        Self(token.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Announcement carried by a `HELLO` frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub role: Role,
    pub device_id: DeviceId,
    /// Self-declared address; absent when the sender did not know its own IP
    pub address: Option<IpAddr>,
}

/// One decoded datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hello(Hello),
    Ping(u32),
    Pong(u32),
    Cmd(String),
    Ack(String),
}

impl Frame {
    /// Wire name of the frame kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "HELLO",
            Self::Ping(_) => "PING",
            Self::Pong(_) => "PONG",
            Self::Cmd(_) => "CMD",
            Self::Ack(_) => "ACK",
        }
    }

    /// Encode the frame as one wire line (no trailing newline)
    pub fn encode(&self) -> Vec<u8> {
        let line = match self {
            Self::Hello(hello) => match hello.address {
                Some(ip) => format!("HELLO {} {} {}", hello.role, hello.device_id, ip),
                None => format!("HELLO {} {}", hello.role, hello.device_id),
            },
            Self::Ping(seq) => format!("PING {}", seq),
            Self::Pong(seq) => format!("PONG {}", seq),
            Self::Cmd(payload) => format!("CMD {}", payload),
            Self::Ack(payload) => format!("ACK {}", payload),
        };
        line.into_bytes()
    }

    /// Decode one datagram, returning `None` for anything malformed
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let line = std::str::from_utf8(bytes).ok()?;
        let line = line.trim_end_matches(['\r', '\n']);
        let (kind, rest) = line.split_once(' ')?;

        match kind {
            "HELLO" => parse_hello(rest).map(Self::Hello),
            "PING" => rest.trim().parse().ok().map(Self::Ping),
            "PONG" => rest.trim().parse().ok().map(Self::Pong),
            "CMD" if !rest.is_empty() => Some(Self::Cmd(rest.to_string())),
            "ACK" if !rest.is_empty() => Some(Self::Ack(rest.to_string())),
            _ => None,
        }
    }
}

fn parse_hello(rest: &str) -> Option<Hello> {
    let mut fields = rest.split(' ');
    let role = fields.next().filter(|t| is_token(t))?;
    let device_id = fields.next().filter(|t| is_token(t))?;
    // An unparseable address is treated like an absent one; the receiver
    // falls back to the datagram's source address.
    let address = fields
        .next()
        .and_then(|t| t.trim().parse::<IpAddr>().ok())
        .filter(|ip| !ip.is_unspecified());

    Some(Hello {
        role: Role(role.to_string()),
        device_id: DeviceId::from_wire(device_id),
        address,
    })
}

fn is_token(text: &str) -> bool {
    !text.is_empty() && !text.chars().any(char::is_whitespace)
}

/// Check that a command payload fits on one wire line within `max` bytes
pub fn validate_payload(payload: &str, max: usize) -> Result<()> {
    if payload.is_empty() {
        return Err(LinkError::InvalidPayload("empty payload".to_string()));
    }
    if payload.contains(['\r', '\n']) {
        return Err(LinkError::InvalidPayload("payload contains a line break".to_string()));
    }
    // "CMD " prefix
    let framed = payload.len() + 4;
    if framed > max {
        return Err(LinkError::PayloadTooLarge { size: framed, max });
    }
    Ok(())
}

/// The currently known counterpart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: IpAddr,
    /// Last liveness signal, advanced by one window on each missed probe
    pub last_seen_at: u64,
    pub missed_probes: u8,
}

impl PeerInfo {
    pub fn new(address: IpAddr, now: u64) -> Self {
        Self {
            address,
            last_seen_at: now,
            missed_probes: 0,
        }
    }

    /// Record a liveness signal
    pub fn touch(&mut self, now: u64) {
        self.last_seen_at = now;
        self.missed_probes = 0;
    }
}
