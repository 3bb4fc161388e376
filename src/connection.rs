//! The per-channel protocol engine.
//!
//! A [`Connection`] moves bytes in both directions for one channel to one
//! peer: outward bytes are read from the channel's `_OUTWARD` FIFO, framed,
//! encrypted under the connection's send key and the current local segment
//! number, and sent as a datagram; inbound datagrams are authenticated,
//! checked against the replay trackers and written to the `_INWARD` FIFO.
//!
//! # Segment number states
//!
//! The engine tracks the peer's segment number in three states, moved through
//! only on packet reception:
//!
//! * *closed*: `current_peer_segnum == 0`, the peer's segnum is unknown.
//!   Outbound data is held back; an empty hello packet (receiver segnum 0)
//!   solicits a response that reveals the peer's segnum.
//! * *open*: the peer's segnum is known and packets under it are accepted.
//! * *two-segment*: the peer has moved to a newer segnum (restart or
//!   message-number rollover on their side); the previous segnum stays
//!   accepted with its own replay tracker so in-flight packets are not lost.
//!
//! A new peer segnum is only confirmed when it arrives in a packet that both
//! authenticates *and* addresses our current (or previous) local segnum, and
//! only when it is strictly greater than the segnum it replaces. Replaying an
//! old packet can therefore neither roll the peer segnum back nor pin us to a
//! stale one.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace};

use crate::crypto::CipherPair;
use crate::epoch::epoch_millis;
use crate::error::{Error, Result};
use crate::fifo::{FromUserFifo, ToUserFifo};
use crate::ids::{ChannelId, ConnectionId, HostId};
use crate::kdf::derive_direction_keys;
use crate::message_tracker::MessageTracker;
use crate::packet_header::{PacketHeader, MSGNUM_MAX};
use crate::rtt::RttTracker;
use crate::secret_key::SecretKey;
use crate::segnum_generator::SegnumGenerator;
use crate::send_socket::SendSocket;

/// Engine state touched by packet handling and emission. Owned by whichever
/// worker is currently servicing the connection; the dispatcher never invokes
/// one connection concurrently with itself.
struct EngineState {
    /// Never 0 after construction.
    current_local_segnum: u64,
    /// 0 while no message-number rollover has happened.
    old_local_segnum: u64,
    /// 0 until the peer's segnum has been confirmed.
    current_peer_segnum: u64,
    /// 0 while no previous peer segnum is accepted; otherwise strictly less
    /// than `current_peer_segnum`.
    old_peer_segnum: u64,
    /// Next message number to emit under `current_local_segnum`, >= 1.
    local_next_msgnum: u64,
    /// When the most recent hello went out (epoch millis, 0 = never).
    last_hello_sent_at: u64,
    /// Replay tracker scoped to `current_peer_segnum`.
    current_tracker: MessageTracker,
    /// Replay tracker scoped to `old_peer_segnum`.
    old_tracker: MessageTracker,
}

pub struct Connection {
    self_id: HostId,
    peer_name: String,
    peer_id: HostId,
    channel_id: ChannelId,
    peer_addr: SocketAddr,
    max_packet_size: usize,
    socket: Arc<dyn SendSocket>,
    segnum_generator: Arc<SegnumGenerator>,
    cipher: CipherPair,
    rtt_tracker: Arc<RttTracker>,
    from_user: FromUserFifo,
    to_user: ToUserFifo,
    incoming: std::sync::Mutex<VecDeque<Vec<u8>>>,
    state: AsyncMutex<EngineState>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: HostId,
        peer_name: String,
        peer_id: HostId,
        channel_id: ChannelId,
        fifo_base_path: &str,
        shared_key: &SecretKey,
        peer_addr: SocketAddr,
        max_packet_size: usize,
        socket: Arc<dyn SendSocket>,
        segnum_generator: Arc<SegnumGenerator>,
    ) -> Result<Connection> {
        if max_packet_size <= PacketHeader::MIN_PACKET_LEN {
            return Err(Error::Config(format!(
                "max packet size {} leaves no room for payload (need more than {})",
                max_packet_size,
                PacketHeader::MIN_PACKET_LEN
            )));
        }

        let (send_key, recv_key) =
            derive_direction_keys(shared_key, self_id, peer_id, channel_id);
        let cipher = CipherPair::new(&send_key, &recv_key);

        let rtt_tracker = Arc::new(RttTracker::new());
        let current_local_segnum = segnum_generator.next()?;

        Ok(Connection {
            self_id,
            peer_name,
            peer_id,
            channel_id,
            peer_addr,
            max_packet_size,
            socket,
            segnum_generator,
            cipher,
            rtt_tracker: rtt_tracker.clone(),
            from_user: FromUserFifo::open(fifo_base_path)?,
            to_user: ToUserFifo::open(fifo_base_path)?,
            incoming: std::sync::Mutex::new(VecDeque::new()),
            state: AsyncMutex::new(EngineState {
                current_local_segnum,
                old_local_segnum: 0,
                current_peer_segnum: 0,
                old_peer_segnum: 0,
                local_next_msgnum: 1,
                last_hello_sent_at: 0,
                current_tracker: MessageTracker::new(rtt_tracker.clone()),
                old_tracker: MessageTracker::new(rtt_tracker),
            }),
        })
    }

    pub fn conn_id(&self) -> ConnectionId {
        ConnectionId::new(self.peer_id, self.channel_id)
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    /// Enqueues a received datagram for processing by the next `move_data`.
    pub fn add_message(&self, datagram: Vec<u8>) {
        self.incoming
            .lock()
            .expect("incoming queue lock poisoned")
            .push_back(datagram);
    }

    pub fn has_incoming(&self) -> bool {
        !self
            .incoming
            .lock()
            .expect("incoming queue lock poisoned")
            .is_empty()
    }

    /// Resolves when the outward FIFO becomes readable; the endpoint monitor
    /// uses this to reschedule idle connections.
    pub async fn from_user_readable(&self) -> std::io::Result<()> {
        self.from_user.readable().await
    }

    /// Runs up to `budget` round-trip iterations, each pairing one inbound
    /// datagram with one outbound push. Returns whether anything moved.
    ///
    /// While the peer segnum is unknown, pending outward bytes trigger at
    /// most one hello per invocation (not per iteration); the bytes stay in
    /// the FIFO until the handshake completes. The loop ends early on the
    /// first iteration that moves nothing.
    pub async fn move_data(&self, budget: u32) -> Result<bool> {
        let mut state = self.state.lock().await;

        let mut moved_any = false;
        let mut hello_sent = false;

        for _ in 0..budget {
            let mut idle = true;

            let datagram = self
                .incoming
                .lock()
                .expect("incoming queue lock poisoned")
                .pop_front();
            if let Some(datagram) = datagram {
                idle = false;
                moved_any = true;
                self.handle_message(&mut state, &datagram).await?;
            }

            if state.current_peer_segnum == 0 {
                if !hello_sent && self.from_user.has_pending() {
                    let hello = self.create_packet(&mut state, &[], 0)?;
                    self.socket.send_packet(self.peer_addr, &hello).await;
                    state.last_hello_sent_at = epoch_millis();
                    hello_sent = true;
                    idle = false;
                    moved_any = true;
                    trace!("sent hello to {} ({:?})", self.peer_name, self.conn_id());
                }
            } else {
                let payload = self
                    .from_user
                    .read_up_to(self.max_packet_size - PacketHeader::MIN_PACKET_LEN)?;
                if !payload.is_empty() {
                    let packet = self.create_packet(&mut state, &payload, 0)?;
                    self.socket.send_packet(self.peer_addr, &packet).await;
                    idle = false;
                    moved_any = true;
                }
            }

            if idle {
                break;
            }
        }

        Ok(moved_any)
    }

    /// Builds one encrypted packet around `payload`.
    ///
    /// The receiver segnum field is `peer_segnum_override` if non-zero, else
    /// the confirmed peer segnum. When the message number space under the
    /// current local segnum is used up, a fresh segnum is taken from the
    /// generator first and the previous one is kept for packets still
    /// addressed to it.
    fn create_packet(
        &self,
        state: &mut EngineState,
        payload: &[u8],
        peer_segnum_override: u64,
    ) -> Result<Vec<u8>> {
        if state.local_next_msgnum >= MSGNUM_MAX {
            state.old_local_segnum = state.current_local_segnum;
            state.current_local_segnum = self.segnum_generator.next()?;
            state.local_next_msgnum = 1;
            debug!(
                "local segnum rolled over to {} for {} ({:?})",
                state.current_local_segnum, self.peer_name, self.conn_id()
            );
        }

        let header = PacketHeader {
            sender_id: self.self_id,
            channel_id: self.channel_id,
            receiver_segnum: if peer_segnum_override != 0 {
                peer_segnum_override
            } else {
                state.current_peer_segnum
            },
            sender_segnum: state.current_local_segnum,
            msgnum: state.local_next_msgnum,
        };

        let mut packet = Vec::with_capacity(PacketHeader::MIN_PACKET_LEN + payload.len());
        header.ser(&mut packet);
        packet.resize(PacketHeader::MIN_PACKET_LEN + payload.len(), 0);
        self.cipher.encrypt(
            payload,
            &header.additional_data(),
            &header.iv(),
            &mut packet,
            PacketHeader::SERIALIZED_LEN,
        )?;

        state.local_next_msgnum += 1;
        Ok(packet)
    }

    /// Applies the acceptance rules to one received datagram. Everything
    /// adversarial or stale is dropped without a trace on the wire.
    async fn handle_message(&self, state: &mut EngineState, datagram: &[u8]) -> Result<()> {
        if datagram.len() < PacketHeader::MIN_PACKET_LEN {
            trace!("dropping runt datagram ({} bytes)", datagram.len());
            return Ok(());
        }
        let Some(header) = PacketHeader::deser(&mut &datagram[..]) else {
            return Ok(());
        };

        let peer_segnum = header.sender_segnum;
        let claimed_local = header.receiver_segnum;

        // a sender segnum of 0 is never valid
        if peer_segnum == 0 {
            trace!("dropping packet with zero sender segnum");
            return Ok(());
        }

        let local_segnum_ok = claimed_local != 0
            && (claimed_local == state.current_local_segnum
                || claimed_local == state.old_local_segnum);

        if !local_segnum_ok {
            // The packet addresses a local segnum we no longer use. If it
            // authenticates under a peer segnum newer than anything confirmed,
            // answer with an empty packet under the claimed segnum so the peer
            // learns our current one; the claimed segnum itself stays
            // unconfirmed until it shows up paired with our current segnum.
            if peer_segnum <= state.current_peer_segnum {
                trace!(
                    "dropping stale packet (peer segnum {}, unknown local segnum {})",
                    peer_segnum,
                    claimed_local
                );
                return Ok(());
            }

            let (_, tag_ok) = self.decrypt_payload(&header, datagram);
            if tag_ok {
                debug!(
                    "responding to unconfirmed peer segnum {} from {}",
                    peer_segnum, self.peer_name
                );
                let response = self.create_packet(state, &[], peer_segnum)?;
                self.socket.send_packet(self.peer_addr, &response).await;
            }
            return Ok(());
        }

        if peer_segnum == state.current_peer_segnum || peer_segnum == state.old_peer_segnum {
            // packet under a confirmed segnum: replay check, then deliver
            let use_current = peer_segnum == state.current_peer_segnum;
            let tracker = if use_current {
                &state.current_tracker
            } else {
                &state.old_tracker
            };
            if tracker.seen(header.msgnum) {
                trace!(
                    "dropping replayed msgnum {} under peer segnum {}",
                    header.msgnum,
                    peer_segnum
                );
                return Ok(());
            }

            let (plaintext, tag_ok) = self.decrypt_payload(&header, datagram);
            if !tag_ok {
                debug!("dropping packet with bad tag from {}", self.peer_name);
                return Ok(());
            }

            let tracker = if use_current {
                &mut state.current_tracker
            } else {
                &mut state.old_tracker
            };
            tracker.log(header.msgnum);
            self.deliver(&plaintext)?;
            return Ok(());
        }

        if peer_segnum > state.current_peer_segnum {
            // a newer peer segnum, paired with our current local segnum:
            // authenticate, then promote
            let (plaintext, tag_ok) = self.decrypt_payload(&header, datagram);
            if !tag_ok {
                debug!("dropping unauthenticated segnum promotion attempt");
                return Ok(());
            }

            if state.current_peer_segnum == 0 && state.last_hello_sent_at != 0 {
                // first confirmation after a hello doubles as an RTT sample
                let elapsed = epoch_millis().saturating_sub(state.last_hello_sent_at);
                self.rtt_tracker.update_rtt(elapsed.min(u32::MAX as u64) as u32);
            }

            debug!(
                "peer {} moved to segnum {} (was {})",
                self.peer_name, peer_segnum, state.current_peer_segnum
            );
            state.old_peer_segnum = state.current_peer_segnum;
            std::mem::swap(&mut state.current_tracker, &mut state.old_tracker);
            state.current_peer_segnum = peer_segnum;
            state.current_tracker.reset();
            state.current_tracker.log(header.msgnum);
            self.deliver(&plaintext)?;
            return Ok(());
        }

        trace!(
            "dropping packet under unaccepted peer segnum {} (current {}, old {})",
            peer_segnum,
            state.current_peer_segnum,
            state.old_peer_segnum
        );
        Ok(())
    }

    fn decrypt_payload(&self, header: &PacketHeader, datagram: &[u8]) -> (Vec<u8>, bool) {
        self.cipher.decrypt(
            datagram,
            &header.additional_data(),
            &header.iv(),
            PacketHeader::SERIALIZED_LEN,
            datagram.len() - PacketHeader::SERIALIZED_LEN,
        )
    }

    fn deliver(&self, plaintext: &[u8]) -> Result<()> {
        if !plaintext.is_empty() {
            self.to_user.write_best_effort(plaintext)?;
        }
        Ok(())
    }
}
