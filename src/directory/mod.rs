pub mod rank;

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;
use crate::connection::pool::ConnectionPool;
use crate::connection::ConnectionState;
use crate::directory::rank::{NodeId, RankInfo, RankState};
use crate::path::Path;
use crate::reliability::SeqState;
use crate::wire::data_header::CURRENT_PROTOCOL_VERSION;

/// Number of the local node in the directory. Remote nodes are numbered from 1 in the order
///  they become known.
pub const SELF_NODE: u32 = 0;

/// What a peer announced about its message state for us: a new generation means it restarted,
///  a new epoch means it discarded the state while staying up.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PeerSession {
    pub generation: u64,
    pub epoch: u64,
}

/// A participant of the cluster, identified by its unique ip and TCP port. Nodes are never
///  removed from the directory: a node that goes away is marked dead, keeping its number and
///  rank.
pub struct Node {
    pub number: u32,
    pub id: NodeId,
    name: Mutex<String>,
    version: AtomicU16,
    peer_session: Mutex<Option<PeerSession>>,
    own_epoch: AtomicU64,
    rank_info: Mutex<RankInfo>,
    live: AtomicBool,
    wake_time: Mutex<Option<Instant>>,
    paths: RwLock<Vec<Arc<Path>>>,
    pub connections: ConnectionPool,
    pub seq: SeqState,
}

impl Node {
    fn new(number: u32, id: NodeId, name: &str, version: u16, state: RankState, hold_size: usize) -> Node {
        Node {
            number,
            id,
            name: Mutex::new(name.to_string()),
            version: AtomicU16::new(version),
            peer_session: Mutex::new(None),
            own_epoch: AtomicU64::new(0),
            rank_info: Mutex::new(RankInfo::new(state)),
            live: AtomicBool::new(true),
            wake_time: Mutex::new(None),
            paths: Default::default(),
            connections: ConnectionPool::default(),
            seq: SeqState::new(hold_size),
        }
    }

    pub fn is_self(&self) -> bool {
        self.number == SELF_NODE
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        let mut current = self.name.lock();
        if *current != name {
            debug!("node {} is now called {:?}", self.id, name);
            *current = name.to_string();
        }
    }

    /// the protocol version negotiated with this node
    pub fn version(&self) -> u16 {
        self.version.load(Ordering::Acquire)
    }

    pub fn set_supported_version(&self, remote_supported: u16) {
        self.version.store(negotiate_version(remote_supported), Ordering::Release);
    }

    /// The peer's session as announced in the last handshake
    pub fn peer_session(&self) -> Option<PeerSession> {
        *self.peer_session.lock()
    }

    /// Records the peer's session, returning the previous one
    pub fn swap_peer_session(&self, session: PeerSession) -> Option<PeerSession> {
        self.peer_session.lock().replace(session)
    }

    /// Our session epoch towards this node, announced in every handshake with it
    pub fn own_epoch(&self) -> u64 {
        self.own_epoch.load(Ordering::Acquire)
    }

    /// Starts a new epoch after our message state for this node was discarded, so that the
    ///  node discards its state for us on the next handshake as well
    pub fn start_new_epoch(&self) -> u64 {
        self.own_epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn rank_info(&self) -> RankInfo {
        self.rank_info.lock().clone()
    }

    pub fn rank(&self) -> i32 {
        self.rank_info.lock().rank
    }

    pub fn update_rank_info(&self, f: impl FnOnce(&mut RankInfo)) {
        f(&mut self.rank_info.lock());
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Returns the previous value
    pub fn set_live(&self, live: bool) -> bool {
        self.live.swap(live, Ordering::AcqRel)
    }

    /// true while hellos and connections from this node are refused after it was declared dead
    pub fn is_refusing(&self, now: Instant) -> bool {
        self.wake_time.lock().is_some_and(|t| t > now)
    }

    pub fn set_wake_time(&self, wake_time: Instant) {
        *self.wake_time.lock() = Some(wake_time);
    }

    pub fn paths(&self) -> Vec<Arc<Path>> {
        self.paths.read().clone()
    }

    pub(crate) fn paths_lock(&self) -> &RwLock<Vec<Arc<Path>>> {
        &self.paths
    }

    pub fn info(&self) -> NodeInfo {
        let rank_info = self.rank_info();
        NodeInfo {
            number: self.number,
            name: self.name(),
            id: self.id,
            version: self.version(),
            rank: rank_info.rank,
            state: rank_info.state,
            live: self.is_live(),
            connections: self.connections.count_in_state(ConnectionState::Ready),
        }
    }
}

/// A snapshot of a node's state for application code
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeInfo {
    pub number: u32,
    pub name: String,
    pub id: NodeId,
    pub version: u16,
    pub rank: i32,
    pub state: RankState,
    pub live: bool,
    /// number of READY connections
    pub connections: usize,
}

pub fn negotiate_version(remote_supported: u16) -> u16 {
    CURRENT_PROTOCOL_VERSION.min(remote_supported)
}

pub struct NodeDirectory {
    nodes: RwLock<Vec<Arc<Node>>>,
    last_new_node: Mutex<Instant>,
    hold_size: usize,
}

impl NodeDirectory {
    pub fn new(self_id: NodeId, alias: &str, hold_size: usize) -> NodeDirectory {
        let self_node = Node::new(SELF_NODE, self_id, alias, CURRENT_PROTOCOL_VERSION, RankState::WaitId, hold_size);

        NodeDirectory {
            nodes: RwLock::new(vec![Arc::new(self_node)]),
            last_new_node: Mutex::new(Instant::now()),
            hold_size,
        }
    }

    pub fn self_node(&self) -> Arc<Node> {
        self.nodes.read()[0].clone()
    }

    pub fn all(&self) -> Vec<Arc<Node>> {
        self.nodes.read().clone()
    }

    pub fn remote_nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read()[1..].to_vec()
    }

    pub fn lookup_by_identity(&self, id: NodeId) -> Option<Arc<Node>> {
        self.nodes.read()
            .iter()
            .find(|n| n.id == id)
            .cloned()
    }

    pub fn lookup_by_number(&self, number: u32) -> Option<Arc<Node>> {
        self.nodes.read()
            .iter()
            .find(|n| n.number == number)
            .cloned()
    }

    pub fn lookup_by_rank(&self, rank: i32) -> Option<Arc<Node>> {
        if rank < 0 {
            return None;
        }
        self.nodes.read()
            .iter()
            .find(|n| n.rank() == rank)
            .cloned()
    }

    /// the node holding a given rank, ignoring the node with number `except`
    pub fn lookup_by_rank_except(&self, rank: i32, except: u32) -> Option<Arc<Node>> {
        if rank < 0 {
            return None;
        }
        self.nodes.read()
            .iter()
            .find(|n| n.number != except && n.rank() == rank)
            .cloned()
    }

    /// Returns the node with the given identity, creating it if it is not known yet. The
    ///  boolean is true if the node was created.
    pub fn create_node(&self, remote_supported_version: u16, id: NodeId, name: &str) -> (Arc<Node>, bool) {
        let mut nodes = self.nodes.write();
        if let Some(existing) = nodes.iter().find(|n| n.id == id) {
            return (existing.clone(), false);
        }

        let number = nodes.len() as u32;
        let node = Arc::new(Node::new(number, id, name, negotiate_version(remote_supported_version), RankState::WaitId, self.hold_size));
        debug!("new node #{} {} ({:?}), protocol version {}", number, id, name, node.version());

        nodes.push(node.clone());
        *self.last_new_node.lock() = Instant::now();
        (node, true)
    }

    /// time at which the most recent node was added, starting with the directory's creation
    pub fn last_new_node(&self) -> Instant {
        *self.last_new_node.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn id(last_octet: u8, port: u16) -> NodeId {
        NodeId { unique_ip: Ipv4Addr::new(10, 0, 0, last_octet), port }
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let directory = NodeDirectory::new(id(1, 1000), "self", 16);
        assert_eq!(directory.self_node().number, SELF_NODE);
        assert!(directory.remote_nodes().is_empty());

        let (a, created) = directory.create_node(2, id(2, 1000), "a");
        assert!(created);
        assert_eq!(a.number, 1);
        let (b, _) = directory.create_node(1, id(3, 1000), "b");
        assert_eq!(b.number, 2);
        assert_eq!(b.version(), 1);

        let (a2, created) = directory.create_node(2, id(2, 1000), "other name");
        assert!(!created);
        assert!(Arc::ptr_eq(&a, &a2));
        assert_eq!(a2.name(), "a");

        assert_eq!(directory.lookup_by_identity(id(3, 1000)).map(|n| n.number), Some(2));
        assert!(directory.lookup_by_identity(id(3, 1001)).is_none());
        assert_eq!(directory.lookup_by_number(1).map(|n| n.id), Some(id(2, 1000)));
        assert!(directory.lookup_by_number(3).is_none());
        assert_eq!(directory.all().len(), 3);
    }

    #[tokio::test]
    async fn test_lookup_by_rank() {
        let directory = NodeDirectory::new(id(1, 1000), "self", 16);
        let (a, _) = directory.create_node(2, id(2, 1000), "a");

        assert!(directory.lookup_by_rank(0).is_none());
        assert!(directory.lookup_by_rank(-1).is_none());

        a.update_rank_info(|info| info.rank = 4);
        assert_eq!(directory.lookup_by_rank(4).map(|n| n.number), Some(1));
        assert!(directory.lookup_by_rank_except(4, 1).is_none());
        assert_eq!(directory.lookup_by_rank_except(4, 0).map(|n| n.number), Some(1));
    }

    #[test]
    fn test_negotiate_version() {
        assert_eq!(negotiate_version(1), 1);
        assert_eq!(negotiate_version(2), 2);
        assert_eq!(negotiate_version(7), CURRENT_PROTOCOL_VERSION);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_time() {
        let directory = NodeDirectory::new(id(1, 1000), "self", 16);
        let (a, _) = directory.create_node(2, id(2, 1000), "a");
        let now = Instant::now();
        assert!(!a.is_refusing(now));

        a.set_wake_time(now + std::time::Duration::from_secs(5));
        assert!(a.is_refusing(now));
        assert!(!a.is_refusing(now + std::time::Duration::from_secs(5)));
    }
}
