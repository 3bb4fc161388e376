//! Identifier types for hosts and channels.
//!
//! A host is identified by 4 bytes, a channel between two hosts by 2 bytes.
//! The 6-byte concatenation `peer host id ∥ channel id` identifies a
//! connection and doubles as the routing prefix of every datagram.

use std::fmt::{Debug, Formatter};

use crate::error::{Error, Result};

pub const HOST_ID_LEN: usize = 4;
pub const CHANNEL_ID_LEN: usize = 2;
pub const CONNECTION_ID_LEN: usize = HOST_ID_LEN + CHANNEL_ID_LEN;

fn hex_value(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(Error::Config(format!("'{}' is not a hex digit", c as char))),
    }
}

fn parse_hex_array<const N: usize>(s: &str) -> Result<[u8; N]> {
    if s.len() != 2 * N {
        return Err(Error::Config(format!(
            "hex string has length {}, expected {}",
            s.len(),
            2 * N
        )));
    }
    let raw = s.as_bytes();
    let mut out = [0u8; N];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = (hex_value(raw[2 * i])? << 4) | hex_value(raw[2 * i + 1])?;
    }
    Ok(out)
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostId([u8; HOST_ID_LEN]);

impl HostId {
    pub fn from_bytes(bytes: [u8; HOST_ID_LEN]) -> HostId {
        HostId(bytes)
    }

    /// Parses the 8-hex-digit form used in config files.
    pub fn from_hex(s: &str) -> Result<HostId> {
        Ok(HostId(parse_hex_array(s)?))
    }

    pub fn as_bytes(&self) -> &[u8; HOST_ID_LEN] {
        &self.0
    }
}

impl Debug for HostId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId([u8; CHANNEL_ID_LEN]);

impl ChannelId {
    pub fn from_bytes(bytes: [u8; CHANNEL_ID_LEN]) -> ChannelId {
        ChannelId(bytes)
    }

    /// Parses the 4-hex-digit form used in config files.
    pub fn from_hex(s: &str) -> Result<ChannelId> {
        Ok(ChannelId(parse_hex_array(s)?))
    }

    pub fn as_bytes(&self) -> &[u8; CHANNEL_ID_LEN] {
        &self.0
    }
}

impl Debug for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}{:02x}", self.0[0], self.0[1])
    }
}

/// Routing key of a connection: the peer's host id followed by the channel id.
///
/// Every datagram starts with the *sender's* host id and the channel id, so on
/// the receiving side this prefix is exactly the connection id to dispatch to.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId([u8; CONNECTION_ID_LEN]);

impl ConnectionId {
    pub fn new(peer: HostId, channel: ChannelId) -> ConnectionId {
        let mut bytes = [0u8; CONNECTION_ID_LEN];
        bytes[..HOST_ID_LEN].copy_from_slice(peer.as_bytes());
        bytes[HOST_ID_LEN..].copy_from_slice(channel.as_bytes());
        ConnectionId(bytes)
    }

    /// Extracts the connection id from the start of a datagram. Returns `None`
    /// if the datagram is too short to even carry the prefix.
    pub fn from_datagram_prefix(data: &[u8]) -> Option<ConnectionId> {
        if data.len() < CONNECTION_ID_LEN {
            return None;
        }
        let mut bytes = [0u8; CONNECTION_ID_LEN];
        bytes.copy_from_slice(&data[..CONNECTION_ID_LEN]);
        Some(ConnectionId(bytes))
    }
}

impl Debug for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}
