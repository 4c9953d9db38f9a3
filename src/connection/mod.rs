//! TCP data connections.
//!
//! A connection slot goes through AVAILABLE -> READY -> ERROR -> (closed) -> AVAILABLE and is
//!  then reused by the next handshake. Each (re)use is an 'incarnation'; tasks working on a
//!  connection remember their incarnation and stop when it is over.
//!
//! Locks per connection:
//! * `sqlock` guards the private send queue and the 'pump is running' flag
//! * `rolock` / `wolock` guard the read and write halves of the socket, so reading and writing
//!    can proceed independently
//! * `fdlock` is the availability gate: every task doing I/O holds it shared, and closing the
//!    socket requires it exclusively, so a socket is never closed under a task that uses it

pub mod handshake;
pub mod pool;
pub mod pump;
pub mod reader;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, span, Instrument, Level};
use uuid::Uuid;
use crate::directory::rank;
use crate::directory::Node;
use crate::error::TransportError;
use crate::path::{self, Path};
use crate::reliability;
use crate::reliability::send_entry::{Outgoing, SendEntry};
use crate::transport::Shared;

#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ConnectionState {
    Available = 0,
    Ready = 1,
    Error = 2,
}

struct Lifecycle {
    state: ConnectionState,
    incarnation: u64,
    /// dropping the sender signals tasks of the current incarnation to stop
    closed: Option<watch::Sender<bool>>,
    path: Option<Arc<Path>>,
    established_at: Instant,
    peer_addr: Option<SocketAddr>,
}

pub(crate) struct SendQueue {
    items: VecDeque<Outgoing>,
    pumping: bool,
}

pub struct Connection {
    pub slot: usize,
    claimed: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    sqlock: Mutex<SendQueue>,
    rolock: tokio::sync::Mutex<Option<OwnedReadHalf>>,
    wolock: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    fdlock: tokio::sync::RwLock<()>,
}

impl Connection {
    pub(crate) fn new(slot: usize) -> Connection {
        Connection {
            slot,
            claimed: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Available,
                incarnation: 0,
                closed: None,
                path: None,
                established_at: Instant::now(),
                peer_addr: None,
            }),
            sqlock: Mutex::new(SendQueue {
                items: VecDeque::new(),
                pumping: false,
            }),
            rolock: Default::default(),
            wolock: Default::default(),
            fdlock: Default::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.lock().state
    }

    pub fn incarnation(&self) -> u64 {
        self.lifecycle.lock().incarnation
    }

    /// true if the connection is READY in the given incarnation
    pub fn is_current(&self, incarnation: u64) -> bool {
        let lifecycle = self.lifecycle.lock();
        lifecycle.state == ConnectionState::Ready && lifecycle.incarnation == incarnation
    }

    pub fn path(&self) -> Option<Arc<Path>> {
        self.lifecycle.lock().path.clone()
    }

    pub fn is_on_path(&self, path: &Arc<Path>) -> bool {
        self.lifecycle.lock().path
            .as_ref()
            .is_some_and(|p| Arc::ptr_eq(p, path))
    }

    pub fn priority(&self) -> u32 {
        self.lifecycle.lock().path
            .as_ref()
            .map(|p| p.priority)
            .unwrap_or(u32::MAX)
    }

    pub fn established_at(&self) -> Instant {
        self.lifecycle.lock().established_at
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.lock().peer_addr
    }

    pub fn queue_len(&self) -> usize {
        self.sqlock.lock().items.len()
    }

    /// Reserves an AVAILABLE slot for a new incarnation
    pub(crate) fn try_claim(&self) -> bool {
        self.state() == ConnectionState::Available
            && self.claimed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Starts a new incarnation on a claimed slot whose socket halves are in place
    fn activate(&self, path: &Arc<Path>, peer_addr: Option<SocketAddr>) -> (u64, watch::Receiver<bool>) {
        let (closed_send, closed_recv) = watch::channel(false);

        {
            let mut queue = self.sqlock.lock();
            queue.items.clear();
            queue.pumping = false;
        }

        let mut lifecycle = self.lifecycle.lock();
        lifecycle.incarnation += 1;
        lifecycle.state = ConnectionState::Ready;
        lifecycle.closed = Some(closed_send);
        lifecycle.path = Some(path.clone());
        lifecycle.established_at = Instant::now();
        lifecycle.peer_addr = peer_addr;
        (lifecycle.incarnation, closed_recv)
    }

    /// READY -> ERROR for the given incarnation. Returns false if the connection was not
    ///  READY in that incarnation, i.e. someone else handles its failure.
    fn mark_error(&self, incarnation: u64) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != ConnectionState::Ready || lifecycle.incarnation != incarnation {
            return false;
        }
        lifecycle.state = ConnectionState::Error;
        lifecycle.closed = None;
        true
    }

    fn closed_receiver(&self, incarnation: u64) -> Option<watch::Receiver<bool>> {
        let lifecycle = self.lifecycle.lock();
        if lifecycle.incarnation != incarnation {
            return None;
        }
        lifecycle.closed.as_ref().map(|s| s.subscribe())
    }

    fn take_queue(&self) -> Vec<Outgoing> {
        let mut queue = self.sqlock.lock();
        queue.pumping = false;
        queue.items.drain(..).collect()
    }

    pub(crate) fn take_expired(&self, now: Instant) -> Vec<SendEntry> {
        let mut queue = self.sqlock.lock();
        let mut expired = Vec::new();
        let mut keep = VecDeque::with_capacity(queue.items.len());
        for item in queue.items.drain(..) {
            match item {
                Outgoing::Fresh(entry) if entry.is_expired(now) => expired.push(entry),
                other => keep.push_back(other),
            }
        }
        queue.items = keep;
        expired
    }

    /// Takes the connection out of service without requeueing anything, returning the entries
    ///  that were still queued
    pub(crate) async fn shut_down(&self) -> Vec<SendEntry> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == ConnectionState::Ready {
                lifecycle.state = ConnectionState::Error;
            }
            lifecycle.closed = None;
        }

        let entries = self.take_queue()
            .into_iter()
            .filter_map(|item| match item {
                Outgoing::Fresh(entry) => Some(entry),
                Outgoing::Resend(_) => None,
            })
            .collect();
        self.close().await;
        entries
    }

    /// Closes the socket once no task does I/O on it anymore, and makes the slot available
    async fn close(&self) {
        let _exclusive = self.fdlock.write().await;
        self.rolock.lock().await.take();
        self.wolock.lock().await.take();

        let mut lifecycle = self.lifecycle.lock();
        lifecycle.state = ConnectionState::Available;
        lifecycle.path = None;
        lifecycle.peer_addr = None;
        drop(lifecycle);
        self.claimed.store(false, Ordering::Release);
    }
}

/// Appends an item to a connection's send queue, starting a pump if none is running. Items for
///  a connection that is no longer READY are requeued on the node.
pub(crate) fn enqueue(shared: &Arc<Shared>, node: &Arc<Node>, conn: &Arc<Connection>, item: Outgoing) {
    let incarnation = conn.incarnation();
    let start_pump = {
        let mut queue = conn.sqlock.lock();
        if !conn.is_current(incarnation) {
            drop(queue);
            requeue(shared, node, vec![item]);
            return;
        }
        queue.items.push_back(item);
        !std::mem::replace(&mut queue.pumping, true)
    };

    if start_pump {
        let Some(closed) = conn.closed_receiver(incarnation) else {
            return;
        };
        let span = span!(Level::TRACE, "pump", node = %node.id, slot = conn.slot);
        shared.spawn(pump::pump(shared.clone(), node.clone(), conn.clone(), incarnation, closed).instrument(span));
    }
}

/// Puts items taken from a failed connection back into circulation. Fresh entries go to another
///  READY connection or the node's pending queue; re-send frames are dropped because the
///  entries they copy are still on the sent list.
pub(crate) fn requeue(shared: &Arc<Shared>, node: &Arc<Node>, items: Vec<Outgoing>) {
    let mut to_pending = Vec::new();
    for item in items {
        let Outgoing::Fresh(entry) = item else {
            continue;
        };

        if shared.is_shutting_down() {
            entry.fail(TransportError::ShutDown, &shared.events);
        }
        else if !node.is_live() {
            entry.fail(TransportError::NodeDead(node.number), &shared.events);
        }
        else if !to_pending.is_empty() {
            to_pending.push(entry);
        }
        else {
            match node.connections.pick_connection_for_send() {
                Some(conn) => enqueue(shared, node, &conn, Outgoing::Fresh(entry)),
                None => to_pending.push(entry),
            }
        }
    }

    if !to_pending.is_empty() {
        debug!("requeueing {} messages on node {}", to_pending.len(), node.id);
        node.seq.push_pending_front(to_pending);
    }
}

/// Takes a connection out of service: READY -> ERROR, requeue its unsent items, trigger a
///  re-send of everything unacknowledged, and close the socket in the background
pub(crate) fn on_connection_error(shared: &Arc<Shared>, node: &Arc<Node>, conn: &Arc<Connection>, reason: &str) {
    on_incarnation_error(shared, node, conn, conn.incarnation(), reason);
}

pub(crate) fn on_incarnation_error(shared: &Arc<Shared>, node: &Arc<Node>, conn: &Arc<Connection>, incarnation: u64, reason: &str) {
    if !conn.mark_error(incarnation) {
        return;
    }
    info!("closing connection {} ({:?}) to node {}: {}", conn.slot, conn.peer_addr(), node.id, reason);

    let items = conn.take_queue();
    requeue(shared, node, items);

    if node.is_live() {
        reliability::resend_unacked(shared, node);
    }

    let conn = conn.clone();
    shared.spawn(async move {
        conn.close().await;
    });
}

/// Establishes a connection on a path in the background, bounded by `connect_timeout`
pub(crate) fn dial(shared: &Arc<Shared>, node: &Arc<Node>, path: &Arc<Path>) {
    path.start_dial();

    let correlation_id = Uuid::new_v4();
    let span = span!(Level::DEBUG, "dial", ?correlation_id, node = %node.id);

    let spawned = {
        let shared = shared.clone();
        let node = node.clone();
        let path = path.clone();
        shared.clone().spawn(async move {
            debug!("connecting {} -> {}:{}", path.local_ip, path.remote_ip, node.id.port);
            match tokio::time::timeout(shared.config.connect_timeout, handshake::connect(&shared, &node, &path)).await {
                Ok(Ok(stream)) => install(&shared, &node, &path, stream).await,
                Ok(Err(e)) => debug!("connecting to node {} failed: {}", node.id, e),
                Err(_) => debug!("connecting to node {} timed out", node.id),
            }
            path.end_dial();
        }.instrument(span))
    };

    if !spawned {
        path.end_dial();
    }
}

/// Puts a handshaken stream into service on a free slot of the node's pool
pub(crate) async fn install(shared: &Arc<Shared>, node: &Arc<Node>, path: &Arc<Path>, stream: TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("could not set TCP_NODELAY: {}", e);
    }
    let peer_addr = stream.peer_addr().ok();
    let (read_half, write_half) = stream.into_split();

    let conn = node.connections.acquire_slot();
    *conn.rolock.lock().await = Some(read_half);
    *conn.wolock.lock().await = Some(write_half);
    let (incarnation, closed) = conn.activate(path, peer_addr);
    path.touch(Instant::now());

    info!("connection {} to node {} is ready ({} -> {:?})", conn.slot, node.id, path.local_ip, peer_addr);

    let correlation_id = Uuid::new_v4();
    let span = span!(Level::TRACE, "reader", ?correlation_id, node = %node.id, slot = conn.slot);
    shared.spawn(reader::read_loop(shared.clone(), node.clone(), conn.clone(), incarnation, closed).instrument(span));

    reliability::drain_pending(shared, node);
    if node.seq.num_unacked() > 0 {
        reliability::resend_unacked(shared, node);
    }
    rank::send_talk(shared, node);
    path::reconcile(shared, node, path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use crate::path::LocalEnd;

    fn path() -> Arc<Path> {
        Arc::new(Path::new(LocalEnd { ip: Ipv4Addr::LOCALHOST, ifname: "lo".to_string(), priority: 3 }, Ipv4Addr::LOCALHOST, 1, 1, true))
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let conn = Connection::new(0);
        assert_eq!(conn.state(), ConnectionState::Available);
        assert_eq!(conn.priority(), u32::MAX);

        assert!(conn.try_claim());
        assert!(!conn.try_claim());

        let p = path();
        let (incarnation, mut closed) = conn.activate(&p, None);
        assert_eq!(incarnation, 1);
        assert!(conn.is_current(1));
        assert!(conn.is_on_path(&p));
        assert_eq!(conn.priority(), 3);

        assert!(conn.mark_error(1));
        assert!(!conn.mark_error(1));
        assert_eq!(conn.state(), ConnectionState::Error);
        // dropping the sender ends the tasks of this incarnation
        assert!(closed.changed().await.is_err());
        assert!(conn.closed_receiver(1).is_none());

        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Available);
        assert!(conn.path().is_none());
        assert!(conn.try_claim());

        let (incarnation, _closed) = conn.activate(&p, None);
        assert_eq!(incarnation, 2);
        assert!(!conn.mark_error(1));
        assert!(conn.is_current(2));
    }
}
