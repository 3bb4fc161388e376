//! The 24-byte packet header.
//!
//! ```ascii
//! offset  0: sender host id           4 B
//! offset  4: channel id               2 B
//! offset  6: receiver segment number  6 B  (recipient's current or previous local segnum)
//! offset 12: sender segment number    6 B  (sender's current local segnum)
//! offset 18: message number           6 B
//! offset 24: ciphertext ...
//! offset 24 + |ct|: AEAD tag         16 B
//! ```
//!
//! All integers little-endian. The AEAD IV is the raw bytes at offsets 12..24
//! (sender segnum ∥ message number, exactly the GCM IV length), and the
//! additional data is the bytes at offsets 6..12 (receiver segnum), so both
//! header fields that drive the cryptography are authenticated by
//! construction.

use bytes::{Buf, BufMut};

use crate::crypto::{IV_LEN, TAG_LEN};
use crate::ids::{ChannelId, HostId, CHANNEL_ID_LEN, HOST_ID_LEN};

/// Segment numbers are 48-bit; 0 is the "unknown/unset" sentinel.
pub const SEGNUM_MAX: u64 = (1 << 48) - 1;
/// Message numbers are 48-bit; 0 is reserved.
pub const MSGNUM_MAX: u64 = (1 << 48) - 1;

const SEGNUM_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub sender_id: HostId,
    pub channel_id: ChannelId,
    /// The sender's view of the *recipient's* segment number (0 in a hello).
    pub receiver_segnum: u64,
    /// The sender's own current segment number.
    pub sender_segnum: u64,
    pub msgnum: u64,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = HOST_ID_LEN + CHANNEL_ID_LEN + 3 * SEGNUM_LEN;
    /// Header plus tag: nothing shorter can be a valid packet.
    pub const MIN_PACKET_LEN: usize = Self::SERIALIZED_LEN + TAG_LEN;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.sender_id.as_bytes());
        buf.put_slice(self.channel_id.as_bytes());
        buf.put_uint_le(self.receiver_segnum, SEGNUM_LEN);
        buf.put_uint_le(self.sender_segnum, SEGNUM_LEN);
        buf.put_uint_le(self.msgnum, SEGNUM_LEN);
    }

    /// Parses a header from the front of a datagram. `None` means the input
    /// is too short to carry one; the caller drops such packets silently.
    pub fn deser(buf: &mut impl Buf) -> Option<PacketHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return None;
        }

        let mut sender_id = [0u8; HOST_ID_LEN];
        buf.copy_to_slice(&mut sender_id);
        let mut channel_id = [0u8; CHANNEL_ID_LEN];
        buf.copy_to_slice(&mut channel_id);

        Some(PacketHeader {
            sender_id: HostId::from_bytes(sender_id),
            channel_id: ChannelId::from_bytes(channel_id),
            receiver_segnum: buf.get_uint_le(SEGNUM_LEN),
            sender_segnum: buf.get_uint_le(SEGNUM_LEN),
            msgnum: buf.get_uint_le(SEGNUM_LEN),
        })
    }

    /// The GCM IV: sender segnum ∥ message number, as they appear on the wire.
    pub fn iv(&self) -> [u8; IV_LEN] {
        let mut iv = [0u8; IV_LEN];
        iv[..SEGNUM_LEN].copy_from_slice(&self.sender_segnum.to_le_bytes()[..SEGNUM_LEN]);
        iv[SEGNUM_LEN..].copy_from_slice(&self.msgnum.to_le_bytes()[..SEGNUM_LEN]);
        iv
    }

    /// The additional data: the receiver segnum, as it appears on the wire.
    pub fn additional_data(&self) -> [u8; SEGNUM_LEN] {
        let mut ad = [0u8; SEGNUM_LEN];
        ad.copy_from_slice(&self.receiver_segnum.to_le_bytes()[..SEGNUM_LEN]);
        ad
    }
}
