//! The session dispatcher: one socket-reader task, one endpoint-monitor task
//! and a pool of worker tasks, cooperating over a shared ready queue.
//!
//! The reader pulls datagrams off the UDP socket, routes them by their 6-byte
//! connection-id prefix and marks the target connection ready. The monitor
//! watches the outward FIFOs of all currently idle connections and marks a
//! connection ready as soon as its local producer writes bytes. Workers pull
//! ready connections and drive [`Connection::move_data`] with an adaptive
//! work budget.
//!
//! A per-connection `scheduled` flag guarantees that a connection is never
//! queued twice and never serviced by two workers at once; a worker that
//! finds more work pending after its budget re-queues the connection itself.

use std::cmp::{max, min};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::stream::{FuturesUnordered, StreamExt};
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::config::Config;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::ids::ConnectionId;
use crate::segnum_generator::SegnumGenerator;

/// Bounds for the per-invocation work budget handed to `move_data`.
const DWELL_MIN: u32 = 5;
const DWELL_MAX: u32 = 50;

/// Falls back to a single full-MTU Ethernet frame when neither the self block
/// nor the peer configures a maximum packet size.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1472;

struct ConnectionEntry {
    conn: Arc<Connection>,
    /// True while the connection is queued or being serviced.
    scheduled: AtomicBool,
}

/// State shared between the reader, the monitor and the workers.
struct Shared {
    connections: FxHashMap<ConnectionId, ConnectionEntry>,
    ready: StdMutex<VecDeque<ConnectionId>>,
    work_available: Notify,
    /// Pinged whenever the idle set changes so the monitor re-arms its waits.
    monitor_wake: Notify,
    idle_workers: AtomicUsize,
    dwell: AtomicU32,
    worker_count: usize,
}

impl Shared {
    /// Queues a connection for servicing unless it is already queued or being
    /// worked on.
    fn mark_ready(&self, conn_id: ConnectionId) {
        let Some(entry) = self.connections.get(&conn_id) else {
            return;
        };
        if !entry.scheduled.swap(true, Ordering::AcqRel) {
            self.ready
                .lock()
                .expect("ready queue lock poisoned")
                .push_back(conn_id);
            self.work_available.notify_one();
            self.monitor_wake.notify_waiters();
        }
    }

    fn pop_ready(&self) -> Option<ConnectionId> {
        self.ready
            .lock()
            .expect("ready queue lock poisoned")
            .pop_front()
    }

    /// Adapts the work budget to the current load and returns it: bigger
    /// budgets while workers sit idle, smaller ones while connections queue
    /// up faster than the pool drains them.
    fn adapt_dwell(&self) -> u32 {
        let idle = self.idle_workers.load(Ordering::Acquire);
        let backlog = self
            .ready
            .lock()
            .expect("ready queue lock poisoned")
            .len();

        let current = self.dwell.load(Ordering::Acquire);
        let adapted = adapted_dwell(current, backlog, idle);
        self.dwell.store(adapted, Ordering::Release);
        adapted
    }
}

fn adapted_dwell(current: u32, backlog: usize, idle_workers: usize) -> u32 {
    if idle_workers > 0 {
        min(current + 1, DWELL_MAX)
    } else if backlog > 0 {
        max(current - 1, DWELL_MIN)
    } else {
        current
    }
}

pub struct Session {
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    /// Shared by every connection; kept so the generator outlives them all.
    _segnum_generator: Arc<SegnumGenerator>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Builds the socket, the shared segment number generator and one
    /// [`Connection`] per configured peer channel. `start` must be called
    /// before any data moves.
    pub async fn new(
        config: &Config,
        segnum_base_path: &str,
        worker_count: usize,
    ) -> Result<Session> {
        if worker_count == 0 {
            return Err(Error::Config("worker count must be at least 1".to_string()));
        }

        let self_addr = SocketAddr::from((config.self_config.ip, config.self_config.port));
        let socket = Arc::new(UdpSocket::bind(self_addr).await?);
        info!("bound UDP socket to {:?}", socket.local_addr()?);

        // two reserved segment numbers per peer cover construction plus the
        // occasional rollover between generator restarts
        let segnum_generator = Arc::new(SegnumGenerator::new(
            segnum_base_path,
            2 * config.peers.len() as u64,
        )?);

        let default_max_packet_size = config
            .self_config
            .max_packet_size
            .unwrap_or(DEFAULT_MAX_PACKET_SIZE);

        let mut connections = FxHashMap::default();
        for peer in &config.peers {
            let peer_addr = SocketAddr::from((peer.ip, peer.port));
            let max_packet_size = peer.max_packet_size.unwrap_or(default_max_packet_size);

            for channel in &peer.channels {
                let conn = Arc::new(Connection::new(
                    config.self_config.id,
                    peer.name.clone(),
                    peer.id,
                    channel.id,
                    &channel.fifo_base_path,
                    &peer.key,
                    peer_addr,
                    max_packet_size,
                    Arc::new(socket.clone()),
                    segnum_generator.clone(),
                )?);

                let previous = connections.insert(
                    conn.conn_id(),
                    ConnectionEntry {
                        conn,
                        scheduled: AtomicBool::new(false),
                    },
                );
                if previous.is_some() {
                    return Err(Error::Config(format!(
                        "channel {:?} of peer \"{}\" duplicates another connection",
                        channel.id, peer.name
                    )));
                }
            }
        }
        debug!("created {} connections", connections.len());

        let (shutdown, _) = watch::channel(false);
        Ok(Session {
            shared: Arc::new(Shared {
                connections,
                ready: StdMutex::new(VecDeque::new()),
                work_available: Notify::new(),
                monitor_wake: Notify::new(),
                idle_workers: AtomicUsize::new(0),
                dwell: AtomicU32::new(DWELL_MAX),
                worker_count,
            }),
            socket,
            _segnum_generator: segnum_generator,
            shutdown,
            tasks: Vec::new(),
        })
    }

    /// The actual bound address (useful when configured with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Spawns the reader, the monitor and the worker pool. Calling `start`
    /// twice is an error.
    pub fn start(&mut self) -> Result<()> {
        if !self.tasks.is_empty() {
            return Err(Error::Config("session already started".to_string()));
        }

        self.tasks.push(tokio::spawn(recv_loop(
            self.shared.clone(),
            self.socket.clone(),
            self.shutdown.subscribe(),
        )));
        self.tasks.push(tokio::spawn(monitor_loop(
            self.shared.clone(),
            self.shutdown.subscribe(),
        )));
        for _ in 0..self.shared.worker_count {
            self.tasks.push(tokio::spawn(worker_loop(
                self.shared.clone(),
                self.shutdown.subscribe(),
            )));
        }

        // everything with buffered outward bytes gets serviced right away
        for &conn_id in self.shared.connections.keys() {
            self.shared.mark_ready(conn_id);
        }
        Ok(())
    }

    /// Signals all tasks to stop and waits for them to finish. Idempotent.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        self.shared.work_available.notify_waiters();
        self.shared.monitor_wake.notify_waiters();

        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // best effort for a session dropped without stop(): tell the tasks to
        // wind down and detach
        let _ = self.shutdown.send(true);
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Reads datagrams off the socket and routes them by connection-id prefix.
async fn recv_loop(
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("starting receive loop");
    let mut buf = vec![0u8; 65536];

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    let Some(conn_id) = ConnectionId::from_datagram_prefix(&buf[..len]) else {
                        trace!("dropping {} byte datagram from {:?}", len, from);
                        continue;
                    };
                    match shared.connections.get(&conn_id) {
                        Some(entry) => {
                            entry.conn.add_message(buf[..len].to_vec());
                            shared.mark_ready(conn_id);
                        }
                        None => {
                            debug!(
                                "dropping datagram for unknown connection {:?} from {:?}",
                                conn_id, from
                            );
                        }
                    }
                }
                Err(e) => error!("socket receive error: {}", e),
            }
        }
    }
}

/// Waits for readability on the outward FIFOs of all idle connections and
/// reschedules them. Re-arms whenever the idle set changes.
async fn monitor_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        // created before the idle set is sampled: a connection going idle
        // between the sampling and the select below still wakes us
        let wake = shared.monitor_wake.notified();
        tokio::pin!(wake);

        let mut readable: FuturesUnordered<_> = shared
            .connections
            .iter()
            .filter(|(_, entry)| !entry.scheduled.load(Ordering::Acquire))
            .map(|(&conn_id, entry)| {
                let conn = entry.conn.clone();
                async move {
                    let _ = conn.from_user_readable().await;
                    conn_id
                }
            })
            .collect();

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = &mut wake => {}
            Some(conn_id) = readable.next() => {
                trace!("outward endpoint of {:?} became readable", conn_id);
                shared.mark_ready(conn_id);
            }
        }
    }
}

/// Pulls ready connections off the queue and drives them with the adaptive
/// budget. A fatal connection error takes that connection out of rotation;
/// the rest of the session keeps running.
async fn worker_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let conn_id = loop {
            if *shutdown.borrow() {
                return;
            }
            if let Some(conn_id) = shared.pop_ready() {
                break conn_id;
            }

            shared.idle_workers.fetch_add(1, Ordering::AcqRel);
            tokio::select! {
                _ = shared.work_available.notified() => {}
                _ = shutdown.changed() => {}
            }
            shared.idle_workers.fetch_sub(1, Ordering::AcqRel);
        };

        let budget = shared.adapt_dwell();
        let entry = shared
            .connections
            .get(&conn_id)
            .expect("ready queue only holds known connections");

        match entry.conn.move_data(budget).await {
            Ok(moved) => {
                entry.scheduled.store(false, Ordering::Release);
                if moved || entry.conn.has_incoming() {
                    shared.mark_ready(conn_id);
                } else {
                    // back to idle: hand the connection to the monitor
                    shared.monitor_wake.notify_waiters();
                }
            }
            Err(e) => {
                // scheduled stays true, so the connection is never queued again
                error!(
                    "connection {:?} to {} failed and is taken out of service: {}",
                    conn_id,
                    entry.conn.peer_name(),
                    e
                );
            }
        }
    }
}
