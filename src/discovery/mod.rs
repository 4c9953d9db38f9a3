//! UDP based discovery: JOIN hellos announce a node and double as liveness pings, a DROP hello
//!  announces a node leaving. Every hello that is heard refreshes the path it arrived on.

pub mod interfaces;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::connection::handshake::peer_identity;
use crate::directory::rank;
use crate::discovery::interfaces::broadcast_addresses;
use crate::event_queue::{Event, InterfaceData};
use crate::liveness;
use crate::path;
use crate::transport::Shared;
use crate::wire::data_header::PROTOCOL_VERSION_1;
use crate::wire::hello::{Hello, HelloKind};

/// Binds the discovery socket, allowing several processes on a host to share the port and
///  sending to broadcast addresses
pub(crate) fn bind_udp_socket(addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    let socket = UdpSocket::from_std(socket.into())?;
    info!("bound discovery socket to {:?}", socket.local_addr()?);
    Ok(socket)
}

pub(crate) async fn recv_loop(shared: Arc<Shared>) {
    info!("starting discovery receive loop");

    let mut buf = vec![0u8; 2 * Hello::SERIALIZED_LEN_V2];
    loop {
        match shared.udp_socket.recv_from(&mut buf).await {
            Ok((len, SocketAddr::V4(from))) => {
                match Hello::deser(&mut &buf[..len]) {
                    Ok(hello) => on_hello(&shared, hello, *from.ip(), Instant::now()),
                    Err(e) => debug!("dropping malformed hello from {}: {}", from, e),
                }
            }
            Ok((_, from)) => trace!("ignoring datagram from {}", from),
            Err(e) => {
                if shared.is_shutting_down() {
                    return;
                }
                warn!("error receiving on discovery socket: {}", e);
            }
        }
    }
}

pub(crate) fn on_hello(shared: &Arc<Shared>, hello: Hello, source_ip: Ipv4Addr, now: Instant) {
    if hello.class != shared.config.class {
        trace!("ignoring hello of class {} from {}", hello.class, source_ip);
        return;
    }

    let peer_id = peer_identity(&hello, source_ip);
    if peer_id == shared.self_id {
        return;
    }

    if hello.kind == HelloKind::Drop {
        if let Some(node) = shared.directory.lookup_by_identity(peer_id) {
            if node.is_live() {
                info!("node {} ({}) is leaving", node.id, node.name());
                liveness::declare_dead(shared, &node, now);
            }
        }
        return;
    }

    let (node, created) = shared.directory.create_node(hello.supported_version, peer_id, &hello.name);
    if node.is_refusing(now) {
        trace!("ignoring hello from node {} until its grace period is over", node.id);
        return;
    }
    if created {
        info!("discovered node #{} {} ({:?})", node.number, node.id, hello.name);
    }
    node.set_name(&hello.name);
    liveness::revive(shared, &node);

    let local_end = path::select_local_end(&shared.config, &shared.local_interfaces(), source_ip, hello.dest_ip, shared.self_id.unique_ip);
    let (path, _) = path::path_for(
        &node,
        local_end,
        source_ip,
        shared.config.connections_per_path,
        hello.nconn,
        path::should_initiate(shared.self_id, peer_id),
    );
    path.touch(now);
    path::reconcile(shared, &node, &path);

    if created {
        rank::progress_self_rank(shared);
    }
}

/// Sends a JOIN hello to every contact and, unless suppressed, to the broadcast addresses of
///  the local interfaces
pub(crate) async fn send_pings(shared: &Arc<Shared>) {
    for target in ping_targets(shared) {
        send_hello(shared, HelloKind::Join, target).await;
    }
}

/// Announces our departure to every contact
pub(crate) async fn send_drop(shared: &Arc<Shared>) {
    for target in ping_targets(shared) {
        send_hello(shared, HelloKind::Drop, target).await;
    }
}

fn ping_targets(shared: &Shared) -> Vec<SocketAddrV4> {
    let mut targets = shared.contacts()
        .into_iter()
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .collect::<Vec<_>>();

    if !shared.config.no_broadcast {
        let port = shared.local_udp_port();
        let interfaces = shared.local_interfaces();
        targets.extend(broadcast_addresses(&interfaces, |name| shared.config.interface_priority(name).is_some())
            .into_iter()
            .map(|ip| SocketAddrV4::new(ip, port)));
    }

    targets.sort();
    targets.dedup();
    targets
}

/// Peers known to speak only version 1 get a version 1 hello
fn hello_version_for(shared: &Shared, ip: Ipv4Addr) -> u16 {
    let v1_only = shared.directory.remote_nodes()
        .iter()
        .any(|n| n.id.unique_ip == ip && n.version() == PROTOCOL_VERSION_1);
    if v1_only {
        PROTOCOL_VERSION_1
    }
    else {
        crate::wire::data_header::CURRENT_PROTOCOL_VERSION
    }
}

async fn send_hello(shared: &Arc<Shared>, kind: HelloKind, target: SocketAddrV4) {
    let hello = shared.own_hello(kind, *target.ip(), hello_version_for(shared, *target.ip()));
    let mut buf = BytesMut::with_capacity(Hello::serialized_len(hello.version));
    hello.ser(&mut buf);

    trace!("sending {:?} hello to {}", kind, target);
    if let Err(e) = shared.udp_socket.send_to(&buf, SocketAddr::V4(target)).await {
        debug!("error sending hello to {}: {}", target, e);
    }
}

/// Re-reads the local interfaces, emitting events for addresses that appeared or disappeared
pub(crate) fn scan_interfaces(shared: &Arc<Shared>) {
    let current = match shared.interfaces.interfaces() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            warn!("could not enumerate network interfaces: {}", e);
            return;
        }
    };

    let (added, removed) = {
        let mut known = shared.local_interfaces_lock().write();
        let diff = interfaces::diff(&known, &current);
        *known = current;
        diff
    };

    for iface in removed {
        info!("interface {} ({}) went away", iface.name, iface.ip);
        shared.events.push(Event::InterfaceRemoved(InterfaceData { name: iface.name, ip: iface.ip }));
    }
    for iface in added {
        info!("interface {} ({}) is available", iface.name, iface.ip);
        shared.events.push(Event::InterfaceAdded(InterfaceData { name: iface.name, ip: iface.ip }));
    }
}
