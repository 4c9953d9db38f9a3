use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, span, warn, Instrument, Level};
use uuid::Uuid;
use crate::config::TransportConfig;
use crate::connection::handshake;
use crate::directory::rank::{self, NodeId};
use crate::directory::{NodeDirectory, NodeInfo, SELF_NODE};
use crate::discovery;
use crate::discovery::interfaces::{default_unique_ip, InterfaceSource, LocalInterface, SystemInterfaces};
use crate::error::TransportError;
use crate::event_queue::{Event, EventQueue};
use crate::liveness;
use crate::path;
use crate::reliability;
use crate::reliability::send_entry::{EntryCounters, SendEntry, SendOptions};
use crate::util::random::jittered;
use crate::wire::data_header::{CURRENT_PROTOCOL_VERSION, META_TAG};
use crate::wire::hello::{ConnectHello, Hello, HelloKind};

pub type MessageId = u64;

const PING_JITTER: f64 = 0.1;

/// State shared by a transport's public handle and all of its background tasks
pub(crate) struct Shared {
    pub config: TransportConfig,
    /// process start in millis since the epoch, announced in handshakes to detect restarts
    pub generation: u64,
    pub self_id: NodeId,
    pub udp_socket: UdpSocket,
    pub directory: NodeDirectory,
    pub events: EventQueue,
    pub counters: Arc<EntryCounters>,
    pub interfaces: Box<dyn InterfaceSource>,
    local_interfaces: RwLock<Vec<LocalInterface>>,
    contacts: RwLock<Vec<SocketAddr>>,
    tcp_addr: SocketAddr,
    next_msg_id: AtomicU64,
    shutting_down: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
}

impl Shared {
    /// Binds the sockets and sets up the directory. Returns the TCP listener for the caller
    ///  to start accepting on.
    pub async fn new(config: TransportConfig, interfaces: Box<dyn InterfaceSource>) -> anyhow::Result<(Arc<Shared>, TcpListener)> {
        config.validate()?;

        let local_interfaces = match interfaces.interfaces() {
            Ok(i) => i,
            Err(e) => {
                warn!("could not enumerate network interfaces: {}", e);
                Vec::new()
            }
        };
        let unique_ip = match config.unique_ip {
            Some(IpAddr::V4(ip)) => ip,
            _ => default_unique_ip(&local_interfaces, |name| config.interface_priority(name).is_some()),
        };

        let listener = TcpListener::bind(config.tcp_addr).await?;
        let tcp_addr = listener.local_addr()?;
        info!("bound data listener to {:?}", tcp_addr);
        let udp_socket = discovery::bind_udp_socket(config.udp_addr)?;

        let self_id = NodeId { unique_ip, port: tcp_addr.port() };
        info!("node identity is {} ({:?})", self_id, config.alias);

        let shared = Shared {
            generation: generation_from_timestamp()?,
            self_id,
            udp_socket,
            directory: NodeDirectory::new(self_id, &config.alias, config.hold_size),
            events: EventQueue::new(),
            counters: Default::default(),
            interfaces,
            local_interfaces: RwLock::new(local_interfaces),
            contacts: RwLock::new(config.contacts.clone()),
            tcp_addr,
            next_msg_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            tasks: Default::default(),
            config,
        };
        Ok((Arc::new(shared), listener))
    }

    /// Spawns a background task owned by this transport. Returns false once shutdown started.
    pub fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) -> bool {
        let mut tasks = self.tasks.lock();
        if self.is_shutting_down() {
            return false;
        }
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
        true
    }

    pub fn abort_tasks(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.tasks.lock().abort_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn next_msg_id(&self) -> MessageId {
        self.next_msg_id.fetch_add(1, Ordering::AcqRel)
    }

    pub fn local_interfaces(&self) -> Vec<LocalInterface> {
        self.local_interfaces.read().clone()
    }

    pub fn local_interfaces_lock(&self) -> &RwLock<Vec<LocalInterface>> {
        &self.local_interfaces
    }

    pub fn contacts(&self) -> Vec<SocketAddr> {
        self.contacts.read().clone()
    }

    pub fn add_contact(&self, addr: SocketAddr) {
        let mut contacts = self.contacts.write();
        if !contacts.contains(&addr) {
            debug!("adding contact {}", addr);
            contacts.push(addr);
        }
    }

    pub fn local_udp_port(&self) -> u16 {
        self.udp_socket.local_addr()
            .map(|a| a.port())
            .unwrap_or(0)
    }

    pub fn own_hello(&self, kind: HelloKind, dest_ip: Ipv4Addr, version: u16) -> Hello {
        Hello {
            version,
            supported_version: CURRENT_PROTOCOL_VERSION,
            class: self.config.class,
            kind,
            port: self.self_id.port,
            dest_ip,
            unique_ip: Some(self.self_id.unique_ip),
            nconn: self.config.connections_per_path,
            name: self.config.alias.clone(),
        }
    }

    pub fn connect_hello(&self, version: u16, dest_ip: Ipv4Addr, epoch: u64) -> ConnectHello {
        ConnectHello {
            hello: self.own_hello(HelloKind::Join, dest_ip, version),
            generation: self.generation,
            epoch,
        }
    }
}

fn generation_from_timestamp() -> anyhow::Result<u64> {
    let raw = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)?
        .as_millis();

    if raw > 0xffff_ffff_ffff {
        anyhow::bail!("system clock is in the future");
    }
    Ok(raw as u64)
}

/// A node's endpoint in the cluster: discovers peers, keeps connections to them, and sends and
///  receives messages reliably and in order per peer.
///
/// All background work runs as tasks on the tokio runtime that [Transport::new] is called on,
///  see [TransportConfig::build_runtime].
pub struct Transport {
    shared: Arc<Shared>,
}

impl Transport {
    pub async fn new(config: TransportConfig) -> anyhow::Result<Transport> {
        Self::with_interfaces(config, Box::new(SystemInterfaces)).await
    }

    /// Creates a transport with a custom source of local network interfaces
    pub async fn with_interfaces(config: TransportConfig, interfaces: Box<dyn InterfaceSource>) -> anyhow::Result<Transport> {
        let (shared, listener) = Shared::new(config, interfaces).await?;

        shared.spawn(accept_loop(shared.clone(), listener));
        shared.spawn(discovery::recv_loop(shared.clone()));
        shared.spawn(ticker(shared.clone()));

        info!("transport {:?} started", shared.config.alias);
        Ok(Transport { shared })
    }

    /// Sends a message to a node, returning its message id. Completion is reported through
    ///  `options` and a [Event::Sent] event.
    pub fn send(&self, node: u32, src_tag: i16, dst_tag: i16, payload: Bytes, options: SendOptions) -> Result<MessageId, TransportError> {
        self.send_gather(node, src_tag, dst_tag, vec![payload], options)
    }

    /// Sends a message whose payload is the concatenation of `segments`, without copying them
    pub fn send_gather(&self, node: u32, src_tag: i16, dst_tag: i16, segments: Vec<Bytes>, options: SendOptions) -> Result<MessageId, TransportError> {
        if self.shared.is_shutting_down() {
            return Err(TransportError::ShutDown);
        }
        if src_tag == META_TAG || dst_tag == META_TAG {
            return Err(TransportError::Protocol(format!("tag {} is reserved", META_TAG)));
        }

        let size = segments.iter().map(|s| s.len()).sum::<usize>();
        if size > self.shared.config.max_message_size {
            return Err(TransportError::PayloadTooLarge { size, max_size: self.shared.config.max_message_size });
        }

        let node = self.shared.directory.lookup_by_number(node)
            .ok_or(TransportError::UnknownNode(node))?;

        let msg_id = self.shared.next_msg_id();
        let entry = SendEntry::new(&self.shared.counters, node.number, src_tag, dst_tag, msg_id, segments, options);
        reliability::submit(&self.shared, &node, entry)?;
        Ok(msg_id)
    }

    /// The next event, waiting up to `deadline` (indefinitely for `None`)
    pub async fn poll(&self, deadline: Option<Duration>) -> Option<Event> {
        self.shared.events.poll(deadline).await
    }

    /// Makes a blocked [Transport::poll] return
    pub fn wake(&self) {
        self.shared.events.wake();
    }

    pub fn self_node(&self) -> u32 {
        SELF_NODE
    }

    pub fn self_rank(&self) -> i32 {
        self.shared.directory.self_node().rank()
    }

    pub fn get_nodes(&self) -> Vec<NodeInfo> {
        self.shared.directory.all()
            .iter()
            .map(|n| n.info())
            .collect()
    }

    /// -1 if the node has no rank yet or is unknown
    pub fn node_rank(&self, node: u32) -> i32 {
        self.shared.directory.lookup_by_number(node)
            .map(|n| n.rank())
            .unwrap_or(-1)
    }

    pub fn node_by_rank(&self, rank: i32) -> Option<u32> {
        self.shared.directory.lookup_by_rank(rank)
            .map(|n| n.number)
    }

    /// true if the node holding `rank` is alive
    pub fn is_live(&self, rank: i32) -> bool {
        self.shared.directory.lookup_by_rank(rank)
            .is_some_and(|n| n.is_live())
    }

    pub fn add_contact(&self, addr: SocketAddr) {
        self.shared.add_contact(addr);
    }

    pub fn local_udp_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.shared.udp_socket.local_addr()?)
    }

    pub fn local_tcp_addr(&self) -> SocketAddr {
        self.shared.tcp_addr
    }

    pub fn self_id(&self) -> NodeId {
        self.shared.self_id
    }

    /// Send entries that were created but not released yet
    pub fn outstanding_send_entries(&self) -> u64 {
        self.shared.counters.outstanding()
    }

    /// Announces our departure, stops all background work, fails everything that is still in
    ///  flight with [TransportError::ShutDown] and closes all sockets. A blocked
    ///  [Transport::poll] returns; queued events can still be polled.
    pub async fn shutdown(&self) {
        if self.shared.is_shutting_down() {
            return;
        }
        info!("shutting down transport {:?}", self.shared.config.alias);

        discovery::send_drop(&self.shared).await;

        let mut tasks = {
            let mut tasks = self.shared.tasks.lock();
            self.shared.shutting_down.store(true, Ordering::Release);
            std::mem::take(&mut *tasks)
        };
        tasks.shutdown().await;

        for node in self.shared.directory.remote_nodes() {
            for conn in node.connections.all() {
                for entry in conn.shut_down().await {
                    entry.fail(TransportError::ShutDown, &self.shared.events);
                }
            }
            reliability::fail_all(&self.shared, &node, TransportError::ShutDown);
        }

        self.shared.events.close();
        info!("transport {:?} is shut down", self.shared.config.alias);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shared.abort_tasks();
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    info!("accepting data connections on {:?}", shared.tcp_addr);
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let correlation_id = Uuid::new_v4();
                let span = span!(Level::DEBUG, "accept", ?correlation_id, %remote);
                shared.spawn(handshake::accept(shared.clone(), stream, remote).instrument(span));
            }
            Err(e) => {
                warn!("error accepting a connection: {}", e);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// The single periodic task: pings, liveness, rank progress, retransmission and interface scans
async fn ticker(shared: Arc<Shared>) {
    let mut retransmit = interval(shared.config.retransmit_interval);
    retransmit.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut scan = interval(shared.config.interface_scan_interval);
    scan.set_missed_tick_behavior(MissedTickBehavior::Delay);
    scan.tick().await;

    let mut next_ping = Instant::now();
    loop {
        tokio::select! {
            _ = sleep_until(next_ping) => {
                discovery::send_pings(&shared).await;

                let now = Instant::now();
                liveness::check(&shared, now);
                for node in shared.directory.remote_nodes() {
                    if node.is_live() {
                        for p in node.paths() {
                            path::reconcile(&shared, &node, &p);
                        }
                    }
                }
                rank::progress_self_rank(&shared);
                rank::refresh_talk(&shared);

                next_ping = Instant::now() + jittered(shared.config.ping_interval, PING_JITTER);
            }
            _ = retransmit.tick() => {
                let now = Instant::now();
                for node in shared.directory.remote_nodes() {
                    if node.is_live() {
                        reliability::on_retransmit_tick(&shared, &node, now);
                    }
                }
            }
            _ = scan.tick() => {
                discovery::scan_interfaces(&shared);
            }
        }
    }
}
