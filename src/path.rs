use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::config::TransportConfig;
use crate::connection;
use crate::directory::rank::NodeId;
use crate::directory::Node;
use crate::discovery::interfaces::LocalInterface;
use crate::transport::Shared;

/// The local side of a path
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LocalEnd {
    pub ip: Ipv4Addr,
    pub ifname: String,
    pub priority: u32,
}

/// One route between a local interface and an address of a remote node. A node has one path
///  per (local ip, remote ip) combination it was heard on; paths are never removed.
pub struct Path {
    pub local_ip: Ipv4Addr,
    pub remote_ip: Ipv4Addr,
    pub ifname: String,
    /// lower is preferred for sending
    pub priority: u32,
    pub nconn_local: u16,
    nconn_remote: AtomicU16,
    /// true if this side establishes the path's connections
    pub initiator: bool,
    last_heard: Mutex<Instant>,
    dialing: AtomicU16,
}

impl Path {
    pub fn new(local: LocalEnd, remote_ip: Ipv4Addr, nconn_local: u16, nconn_remote: u16, initiator: bool) -> Path {
        Path {
            local_ip: local.ip,
            remote_ip,
            ifname: local.ifname,
            priority: local.priority,
            nconn_local,
            nconn_remote: AtomicU16::new(nconn_remote),
            initiator,
            last_heard: Mutex::new(Instant::now()),
            dialing: AtomicU16::new(0),
        }
    }

    pub fn nconn_remote(&self) -> u16 {
        self.nconn_remote.load(Ordering::Acquire)
    }

    pub fn set_nconn_remote(&self, nconn: u16) {
        self.nconn_remote.store(nconn, Ordering::Release);
    }

    pub fn desired_connection_count(&self) -> u16 {
        self.nconn_local.min(self.nconn_remote())
    }

    pub fn touch(&self, now: Instant) {
        let mut last_heard = self.last_heard.lock();
        if now > *last_heard {
            *last_heard = now;
        }
    }

    pub fn last_heard(&self) -> Instant {
        *self.last_heard.lock()
    }

    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heard())
    }

    pub fn dialing(&self) -> u16 {
        self.dialing.load(Ordering::Acquire)
    }

    pub(crate) fn start_dial(&self) {
        self.dialing.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end_dial(&self) {
        self.dialing.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Exactly one side of a pair of nodes dials: the one with the larger identity
pub fn should_initiate(local: NodeId, remote: NodeId) -> bool {
    local > remote
}

/// Finds the path for a (local ip, remote ip) combination, creating it if necessary. The
///  boolean is true if the path is new.
pub fn path_for(node: &Node, local: LocalEnd, remote_ip: Ipv4Addr, nconn_local: u16, nconn_remote: u16, initiator: bool) -> (Arc<Path>, bool) {
    let mut paths = node.paths_lock().write();
    if let Some(path) = paths.iter().find(|p| p.local_ip == local.ip && p.remote_ip == remote_ip) {
        if path.nconn_remote() != nconn_remote {
            debug!("node {} now asks for {} connections on path {} -> {}", node.id, nconn_remote, path.local_ip, remote_ip);
            path.set_nconn_remote(nconn_remote);
        }
        return (path.clone(), false);
    }

    debug!("new path {} ({}) -> {} for node {}, initiator: {}", local.ip, local.ifname, remote_ip, node.id, initiator);
    let path = Arc::new(Path::new(local, remote_ip, nconn_local, nconn_remote, initiator));
    paths.push(path.clone());
    (path, true)
}

/// Picks the local end for talking to `remote_ip`: an allowed interface whose subnet contains
///  the remote address, else the interface that owns the address the peer was sending to, else
///  our unique ip.
pub fn select_local_end(config: &TransportConfig, interfaces: &[LocalInterface], remote_ip: Ipv4Addr, dest_ip: Ipv4Addr, unique_ip: Ipv4Addr) -> LocalEnd {
    let allowed = |iface: &&LocalInterface| config.interface_priority(&iface.name).is_some();
    let to_local_end = |iface: &LocalInterface| LocalEnd {
        ip: iface.ip,
        ifname: iface.name.clone(),
        priority: config.interface_priority(&iface.name).unwrap_or(u32::MAX),
    };

    if let Some(iface) = interfaces.iter().filter(allowed).find(|i| i.contains(remote_ip)) {
        return to_local_end(iface);
    }
    if let Some(iface) = interfaces.iter().filter(allowed).find(|i| i.ip == dest_ip) {
        return to_local_end(iface);
    }

    match interfaces.iter().find(|i| i.ip == unique_ip) {
        Some(iface) => to_local_end(iface),
        None => LocalEnd {
            ip: unique_ip,
            ifname: String::new(),
            priority: 0,
        },
    }
}

/// The local end for a connection that arrived on a known local address
pub fn local_end_for_ip(config: &TransportConfig, interfaces: &[LocalInterface], local_ip: Ipv4Addr) -> LocalEnd {
    match interfaces.iter().find(|i| i.ip == local_ip) {
        Some(iface) => LocalEnd {
            ip: local_ip,
            ifname: iface.name.clone(),
            priority: config.interface_priority(&iface.name).unwrap_or(u32::MAX),
        },
        None => LocalEnd {
            ip: local_ip,
            ifname: String::new(),
            priority: 0,
        },
    }
}

/// Brings the number of READY connections on a path towards its desired count: the initiator
///  dials missing connections, either side closes excess ones (those with nothing queued
///  first, then the oldest).
pub(crate) fn reconcile(shared: &Arc<Shared>, node: &Arc<Node>, path: &Arc<Path>) {
    if !node.is_live() || shared.is_shutting_down() {
        return;
    }

    let desired = usize::from(path.desired_connection_count());
    let mut ready = node.connections.ready_on_path(path);
    let have = ready.len() + usize::from(path.dialing());
    trace!("reconciling path {} -> {} of node {}: {} ready, {} dialing, {} desired", path.local_ip, path.remote_ip, node.id, ready.len(), path.dialing(), desired);

    if path.initiator && have < desired {
        for _ in have..desired {
            connection::dial(shared, node, path);
        }
    }

    if ready.len() > desired {
        ready.sort_by_key(|c| (c.queue_len() > 0, c.established_at()));
        for conn in &ready[..ready.len() - desired] {
            connection::on_connection_error(shared, node, conn, "excess connection on path");
        }
    }
}
