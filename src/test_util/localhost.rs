use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::time::Instant;
use crate::config::TransportConfig;
use crate::discovery::interfaces::{InterfaceSource, LocalInterface};
use crate::event_queue::{Event, ReceivedData, SentData};
use crate::transport::Transport;

/// An [InterfaceSource] that always returns the same interfaces
pub struct StaticInterfaces(pub Vec<LocalInterface>);

impl InterfaceSource for StaticInterfaces {
    fn interfaces(&self) -> anyhow::Result<Vec<LocalInterface>> {
        Ok(self.0.clone())
    }
}

pub fn loopback_interface() -> LocalInterface {
    LocalInterface {
        name: "lo".to_string(),
        ip: Ipv4Addr::LOCALHOST,
        netmask: Ipv4Addr::new(255, 0, 0, 0),
        broadcast: None,
    }
}

/// A configuration for a node on localhost with OS assigned ports and timers that are short
///  enough for tests
pub fn localhost_config(alias: &str) -> TransportConfig {
    let mut config = TransportConfig::default_for(alias);
    config.unique_ip = Some(Ipv4Addr::LOCALHOST.into());
    config.udp_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
    config.tcp_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
    config.no_broadcast = true;
    config.ping_interval = Duration::from_millis(100);
    config.retransmit_interval = Duration::from_millis(50);
    config.live_threshold = Duration::from_secs(3);
    config.link_live_threshold = Duration::from_secs(2);
    config.rank_settle_time = Duration::from_millis(300);
    config.connect_timeout = Duration::from_secs(1);
    config.wake_grace = Duration::from_secs(1);
    config
}

/// Starts transports on localhost, each of them having all others as discovery contacts
pub async fn start_localhost(configs: Vec<TransportConfig>) -> anyhow::Result<Vec<Transport>> {
    start_with_interfaces(configs, vec![loopback_interface()]).await
}

/// Like [start_localhost], with every transport seeing `interfaces` as its local interfaces
pub async fn start_with_interfaces(configs: Vec<TransportConfig>, interfaces: Vec<LocalInterface>) -> anyhow::Result<Vec<Transport>> {
    let mut transports = Vec::new();
    for config in configs {
        transports.push(Transport::with_interfaces(config, Box::new(StaticInterfaces(interfaces.clone()))).await?);
    }

    let addrs = transports.iter()
        .map(|t| t.local_udp_addr())
        .collect::<anyhow::Result<Vec<_>>>()?;
    for (i, t) in transports.iter().enumerate() {
        for (j, addr) in addrs.iter().enumerate() {
            if i != j {
                t.add_contact(*addr);
            }
        }
    }
    Ok(transports)
}

/// Waits until `condition` holds, checking every few milliseconds. Returns false on timeout.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// The node number under which `transport` knows `other`, once `other` was discovered
pub async fn wait_for_node(transport: &Transport, other: &Transport, timeout: Duration) -> Option<u32> {
    let other_id = other.self_id();
    let found = wait_until(timeout, || transport.get_nodes().iter().any(|n| n.id == other_id && n.live && n.connections > 0)).await;
    if !found {
        return None;
    }
    transport.get_nodes()
        .into_iter()
        .find(|n| n.id == other_id)
        .map(|n| n.number)
}

/// Polls until `n` application messages were received, ignoring other events
pub async fn collect_received(transport: &Transport, n: usize, timeout: Duration) -> Vec<ReceivedData> {
    collect(transport, n, timeout, |e| match e {
        Event::Received(data) => Some(data),
        _ => None,
    }).await
}

/// Polls until `n` `Sent` events were seen, ignoring other events
pub async fn collect_sent(transport: &Transport, n: usize, timeout: Duration) -> Vec<SentData> {
    collect(transport, n, timeout, |e| match e {
        Event::Sent(data) => Some(data),
        _ => None,
    }).await
}

async fn collect<T>(transport: &Transport, n: usize, timeout: Duration, f: impl Fn(Event) -> Option<T>) -> Vec<T> {
    let deadline = Instant::now() + timeout;
    let mut result = Vec::with_capacity(n);
    while result.len() < n {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match transport.poll(Some(remaining)).await {
            Some(event) => result.extend(f(event)),
            None => break,
        }
    }
    result
}
