//! The hello exchange at the start of every TCP data connection. The dialing side writes its
//!  hello first and waits for the answer; the accepting side validates the peer's hello, finds
//!  or creates the node and answers with its own.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use anyhow::{anyhow, bail};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::Instant;
use tracing::{debug, info};
use crate::connection::{self, on_connection_error};
use crate::directory::rank::{self, NodeId};
use crate::directory::{Node, PeerSession};
use crate::error::TransportError;
use crate::liveness;
use crate::path::{self, Path};
use crate::reliability;
use crate::transport::Shared;
use crate::wire::hello::{ConnectHello, Hello, HelloKind};

/// A peer's identity: its announced unique ip (or the address it was heard from) and TCP port
pub(crate) fn peer_identity(hello: &Hello, source_ip: Ipv4Addr) -> NodeId {
    NodeId {
        unique_ip: hello.unique_ip.unwrap_or(source_ip),
        port: hello.port,
    }
}

/// Dials a path's remote end from its local address and performs the initiator's side of the
///  exchange
pub(crate) async fn connect(shared: &Arc<Shared>, node: &Arc<Node>, path: &Path) -> anyhow::Result<TcpStream> {
    let socket = TcpSocket::new_v4()?;
    socket.bind(SocketAddr::new(IpAddr::V4(path.local_ip), 0))?;
    let mut stream = socket.connect(SocketAddr::new(IpAddr::V4(path.remote_ip), node.id.port)).await?;

    write_connect_hello(&mut stream, &shared.connect_hello(node.version(), path.remote_ip, node.own_epoch())).await?;
    let answer = read_connect_hello(&mut stream).await?;

    let peer_id = peer_identity(&answer.hello, path.remote_ip);
    if peer_id != node.id {
        bail!("expected node {} at {}, but {} answered", node.id, path.remote_ip, peer_id);
    }
    node.set_supported_version(answer.hello.supported_version);
    check_session(shared, node, &answer);
    Ok(stream)
}

/// Runs the acceptor's side of the exchange for an incoming connection and puts the connection
///  into service
pub(crate) async fn accept(shared: Arc<Shared>, mut stream: TcpStream, remote: SocketAddr) {
    match tokio::time::timeout(shared.config.connect_timeout, do_accept(&shared, &mut stream, remote)).await {
        Ok(Ok((node, path))) => connection::install(&shared, &node, &path, stream).await,
        Ok(Err(e)) => debug!("refusing connection from {}: {}", remote, e),
        Err(_) => debug!("connection from {} timed out during hello exchange", remote),
    }
}

async fn do_accept(shared: &Arc<Shared>, stream: &mut TcpStream, remote: SocketAddr) -> anyhow::Result<(Arc<Node>, Arc<Path>)> {
    let IpAddr::V4(remote_ip) = remote.ip() else {
        bail!("not an IPv4 peer");
    };

    let peer = read_connect_hello(stream).await?;
    let hello = &peer.hello;
    if hello.class != shared.config.class {
        bail!("foreign class {}", hello.class);
    }
    if hello.kind != HelloKind::Join {
        bail!("unexpected hello kind {:?}", hello.kind);
    }

    let peer_id = peer_identity(hello, remote_ip);
    if peer_id == shared.self_id {
        bail!("connection from ourselves");
    }

    let (node, _) = shared.directory.create_node(hello.supported_version, peer_id, &hello.name);
    if node.is_refusing(Instant::now()) {
        bail!("node {} was declared dead recently", node.id);
    }
    node.set_name(&hello.name);
    node.set_supported_version(hello.supported_version);
    check_session(shared, &node, &peer);
    liveness::revive(shared, &node);

    let local_ip = match stream.local_addr()?.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(ip) => return Err(anyhow!("unexpected local address {}", ip)),
    };
    let local_end = path::local_end_for_ip(&shared.config, &shared.local_interfaces(), local_ip);
    let (path, _) = path::path_for(
        &node,
        local_end,
        remote_ip,
        shared.config.connections_per_path,
        hello.nconn,
        path::should_initiate(shared.self_id, peer_id),
    );

    write_connect_hello(stream, &shared.connect_hello(node.version(), remote_ip, node.own_epoch())).await?;
    Ok((node, path))
}

/// A changed generation means the peer restarted, a changed epoch means it discarded its
///  message state for us. Either way everything in flight belongs to the previous session, and
///  both directions start over with sequence numbers.
pub(crate) fn check_session(shared: &Arc<Shared>, node: &Arc<Node>, connect_hello: &ConnectHello) {
    if connect_hello.generation == 0 {
        return;
    }
    let session = PeerSession { generation: connect_hello.generation, epoch: connect_hello.epoch };
    match node.swap_peer_session(session) {
        Some(previous) if previous.generation != session.generation => {
            info!("node {} restarted - starting a new session", node.id);
            reset_session(shared, node);
        }
        Some(previous) if previous.epoch != session.epoch => {
            info!("node {} discarded its session with us - starting a new session", node.id);
            reset_session(shared, node);
        }
        _ => {}
    }
}

fn reset_session(shared: &Arc<Shared>, node: &Arc<Node>) {
    for conn in node.connections.ready_connections() {
        on_connection_error(shared, node, &conn, "peer started a new session");
    }

    // we discarded our state ourselves when we declared the node dead, and nothing was
    //  sequenced since: queued messages can go out in the new session
    if node.seq.is_pristine() {
        debug!("session state for node {} is fresh already", node.id);
        return;
    }
    reliability::fail_all(shared, node, TransportError::NodeDead(node.number));
    rank::on_node_dead(shared, node);
}

async fn write_connect_hello(stream: &mut TcpStream, connect_hello: &ConnectHello) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(ConnectHello::serialized_len(connect_hello.hello.version));
    connect_hello.ser(&mut buf);
    stream.write_all(&buf).await?;
    Ok(())
}

async fn read_connect_hello(stream: &mut TcpStream) -> anyhow::Result<ConnectHello> {
    let mut version = [0u8; 2];
    stream.read_exact(&mut version).await?;

    let len = ConnectHello::serialized_len(u16::from_be_bytes(version));
    let mut buf = vec![0u8; len];
    buf[..2].copy_from_slice(&version);
    stream.read_exact(&mut buf[2..]).await?;

    Ok(ConnectHello::deser(&mut buf.as_slice())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::net::TcpListener;
    use crate::config::TransportConfig;
    use crate::directory::rank::RankState;
    use crate::discovery::interfaces::MockInterfaceSource;
    use crate::reliability::send_entry::{SendEntry, SendOptions};

    async fn shared() -> Arc<Shared> {
        let mut config = TransportConfig::default_for("self");
        config.unique_ip = Some(Ipv4Addr::LOCALHOST.into());
        config.udp_addr = "127.0.0.1:0".parse().unwrap();
        config.tcp_addr = "127.0.0.1:0".parse().unwrap();
        config.no_broadcast = true;

        let mut source = MockInterfaceSource::new();
        source.expect_interfaces().returning(|| Ok(vec![]));
        let (shared, _listener) = Shared::new(config, Box::new(source)).await.unwrap();
        shared
    }

    fn session(generation: u64, epoch: u64) -> ConnectHello {
        ConnectHello { hello: hello(Some(Ipv4Addr::new(10, 0, 0, 9))), generation, epoch }
    }

    /// queues a message that reports its outcome to the returned receiver
    fn queue_message(shared: &Arc<Shared>, node: &Arc<Node>) -> tokio::sync::mpsc::UnboundedReceiver<crate::reliability::send_entry::SendCompletion> {
        let (ack_send, ack_recv) = tokio::sync::mpsc::unbounded_channel();
        let entry = SendEntry::new(&shared.counters, node.number, 1, 2, 5, vec![Bytes::from_static(b"x")], SendOptions { ack_target: Some(ack_send), ..Default::default() });
        reliability::submit(shared, node, entry).unwrap();
        ack_recv
    }

    fn hello(unique_ip: Option<Ipv4Addr>) -> Hello {
        Hello {
            version: 2,
            supported_version: 2,
            class: 1,
            kind: HelloKind::Join,
            port: 7000,
            dest_ip: Ipv4Addr::LOCALHOST,
            unique_ip,
            nconn: 1,
            name: "a".to_string(),
        }
    }

    #[test]
    fn test_peer_identity() {
        let source = Ipv4Addr::new(10, 0, 0, 9);
        assert_eq!(peer_identity(&hello(None), source), NodeId { unique_ip: source, port: 7000 });
        assert_eq!(peer_identity(&hello(Some(Ipv4Addr::new(10, 1, 1, 1))), source), NodeId { unique_ip: Ipv4Addr::new(10, 1, 1, 1), port: 7000 });
    }

    #[tokio::test]
    async fn test_connect_hello_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sent = ConnectHello { hello: hello(Some(Ipv4Addr::LOCALHOST)), generation: 42, epoch: 3 };

        let expected = sent.clone();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_connect_hello(&mut stream).await.unwrap()
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        write_connect_hello(&mut client, &sent).await.unwrap();
        assert_eq!(server.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_read_connect_hello_rejects_garbage() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_connect_hello(&mut stream).await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0u8; 200]).await.unwrap();
        assert!(server.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_new_epoch_discards_session() {
        let shared = shared().await;
        let (node, _) = shared.directory.create_node(2, NodeId { unique_ip: Ipv4Addr::new(10, 0, 0, 9), port: 7000 }, "a");
        node.update_rank_info(|info| {
            info.state = RankState::Active;
            info.rank = 1;
            info.joined = true;
        });

        check_session(&shared, &node, &session(100, 0));
        node.seq.assign_seq();
        let mut outcome = queue_message(&shared, &node);

        // same session, nothing happens
        check_session(&shared, &node, &session(100, 0));
        assert_eq!(node.seq.num_pending(), 1);

        check_session(&shared, &node, &session(100, 1));
        assert_eq!(outcome.recv().await.unwrap().result, Err(TransportError::NodeDead(node.number)));
        assert!(node.seq.is_pristine());
        assert_eq!(node.seq.num_pending(), 0);
        assert_eq!(node.rank_info().state, RankState::Unused);
        assert_eq!(node.peer_session(), Some(PeerSession { generation: 100, epoch: 1 }));
        shared.abort_tasks();
    }

    #[tokio::test]
    async fn test_restart_discards_session() {
        let shared = shared().await;
        let (node, _) = shared.directory.create_node(2, NodeId { unique_ip: Ipv4Addr::new(10, 0, 0, 9), port: 7000 }, "a");

        check_session(&shared, &node, &session(100, 4));
        node.seq.assign_seq();
        let mut outcome = queue_message(&shared, &node);

        check_session(&shared, &node, &session(200, 0));
        assert_eq!(outcome.recv().await.unwrap().result, Err(TransportError::NodeDead(node.number)));
        assert!(node.seq.is_pristine());
        shared.abort_tasks();
    }

    #[tokio::test]
    async fn test_fresh_session_keeps_queued_messages() {
        let shared = shared().await;
        let (node, _) = shared.directory.create_node(2, NodeId { unique_ip: Ipv4Addr::new(10, 0, 0, 9), port: 7000 }, "a");

        check_session(&shared, &node, &session(100, 0));
        let mut outcome = queue_message(&shared, &node);

        // both sides dropped the session, our queued message belongs to the new one
        check_session(&shared, &node, &session(100, 1));
        assert_eq!(node.seq.num_pending(), 1);
        assert!(outcome.try_recv().is_err());
        shared.abort_tasks();
    }

    #[tokio::test]
    async fn test_unknown_generation_is_ignored() {
        let shared = shared().await;
        let (node, _) = shared.directory.create_node(1, NodeId { unique_ip: Ipv4Addr::new(10, 0, 0, 9), port: 7000 }, "a");

        check_session(&shared, &node, &session(0, 0));
        assert_eq!(node.peer_session(), None);
        shared.abort_tasks();
    }
}
