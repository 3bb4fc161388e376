//! An authenticated, encrypted datagram transport between pairs of hosts over
//! UDP.
//!
//! Each host keeps any number of independent logical channels open with each
//! of its peers, all multiplexed over a single local UDP socket. Local
//! programs talk to the transport through per-channel named pipes; whatever
//! bytes they write into a channel's `_OUTWARD` pipe arrive, encrypted and
//! replay-protected on the wire, in the peer's matching
//! `_INWARD` pipe.
//!
//! ## Wire format
//!
//! Every datagram is one packet (all integers little-endian):
//!
//! ```ascii
//!  0: sender host id (4 bytes) + channel id (2 bytes) - the routing prefix
//!  6: receiver segment number (6 bytes)
//! 12: sender segment number (6 bytes)
//! 18: message number (6 bytes)
//! 24: ciphertext, followed by the 16-byte AES-256-GCM tag
//! ```
//!
//! The bytes at offsets 12..24 double as the GCM IV and the bytes at 6..12 as
//! the additional data, so the fields that drive acceptance are all covered
//! by the authentication tag. The minimum valid packet is 40 bytes; a
//! 40-byte packet (empty ciphertext) is a "hello", used to discover the
//! peer's current segment number.
//!
//! ## Segment numbers
//!
//! AES-GCM nonce uniqueness rests entirely on the `(segment number, message
//! number)` pair never repeating for a given key. Message numbers count up
//! within a segment; segment numbers come from a persistent reservation
//! allocator ([`segnum_generator`]) that combines the wall clock with an
//! on-disk ceiling, doubly stored so that no crash or clock rollback can
//! reissue a number. A peer restart simply shows up as a new, larger segment
//! number and is absorbed by the connection state machine ([`connection`])
//! without losing the packets still in flight under the previous one.
//!
//! ## Keys
//!
//! Each peer pair shares one pre-configured 32-byte secret. Per channel and
//! direction, working keys are derived with HKDF-Expand ([`kdf`]); key
//! material lives in scrubbed-on-drop containers ([`secret_key`]) and is
//! retained only inside the per-connection cipher contexts ([`crypto`]).

pub mod config;
pub mod connection;
pub mod crypto;
pub mod epoch;
pub mod error;
pub mod fifo;
pub mod ids;
pub mod kdf;
pub mod message_tracker;
pub mod packet_header;
pub mod rtt;
pub mod secret_key;
pub mod segnum_generator;
pub mod send_socket;
pub mod session;
