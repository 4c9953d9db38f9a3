use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use crate::error::TransportError;

pub struct TransportConfig {
    /// The symbolic name of this node. It is announced in hello messages and matched against
    ///  `static_ranks` to determine a statically configured rank.
    pub alias: String,

    /// Peers with a different class ignore each other's hello messages. This allows several
    ///  independent clusters to share a network without interfering.
    pub class: u16,

    /// Names of the network interfaces that may be used for paths to other nodes. If empty, all
    ///  interfaces are used. The order of this list defines path priority (lower index is
    ///  preferred).
    pub interfaces: Vec<String>,

    /// The IP address that identifies this node across all of its interfaces. If not set, the
    ///  first non-loopback IPv4 address of an allowed interface is used (falling back to
    ///  loopback if there is none).
    pub unique_ip: Option<IpAddr>,

    /// Address the UDP discovery socket is bound to. Port 0 lets the OS pick a port, which is
    ///  mostly useful for tests: peers need to know this port to send hellos.
    pub udp_addr: SocketAddr,

    /// Address the TCP data listener is bound to, 0 for 'any port'. The actual port is part of
    ///  this node's identity and is announced in hellos.
    pub tcp_addr: SocketAddr,

    /// Explicit discovery contacts (IP and UDP port). Hellos are sent to these addresses in
    ///  every ping interval, in addition to broadcast addresses (see `no_broadcast`).
    pub contacts: Vec<SocketAddr>,

    /// If true, hellos are sent only to `contacts` and never to subnet broadcast addresses
    pub no_broadcast: bool,

    /// Static rank assignment: a node whose alias is at index `i` of this list has rank `i`.
    ///  Nodes that are not listed negotiate their ranks dynamically.
    pub static_ranks: Vec<String>,

    /// Time without hearing from a path after which it is considered dead. A node is dead if
    ///  all of its paths are dead.
    pub live_threshold: Duration,

    /// Time without hearing from a path after which its connections are dropped in favour
    ///  of connections on livelier paths. Must not be greater than `live_threshold`.
    pub link_live_threshold: Duration,

    /// Interval for sending JOIN hellos to all contacts. Hellos double as liveness pings.
    pub ping_interval: Duration,

    /// Interval at which the reliability engine checks for lack of progress and re-sends
    ///  unacknowledged messages or requests re-sends
    pub retransmit_interval: Duration,

    /// After a node was declared dead, hellos and connections from it are refused for this
    ///  period to avoid flapping
    pub wake_grace: Duration,

    /// Time a node waits after seeing the last new peer before picking a rank dynamically
    pub rank_settle_time: Duration,

    /// Upper bound for establishing a TCP connection including the hello exchange
    pub connect_timeout: Duration,

    pub interface_scan_interval: Duration,

    /// Number of OS worker threads for [TransportConfig::build_runtime]
    pub num_threads: usize,

    /// Maximum number of TCP connections per path that this node wants. The actual number is
    ///  the minimum of both sides' values.
    pub connections_per_path: u16,

    /// Number of slots in the per-node receive window for out-of-order messages. Messages
    ///  beyond this window go to an (unbounded) overflow list.
    pub hold_size: usize,

    pub max_message_size: usize,
}

impl TransportConfig {
    pub fn default_for(alias: &str) -> TransportConfig {
        TransportConfig {
            alias: alias.to_string(),
            class: 1,
            interfaces: Vec::new(),
            unique_ip: None,
            udp_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            tcp_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            contacts: Vec::new(),
            no_broadcast: false,
            static_ranks: Vec::new(),
            live_threshold: Duration::from_secs(10),
            link_live_threshold: Duration::from_secs(5),
            ping_interval: Duration::from_secs(1),
            retransmit_interval: Duration::from_millis(500),
            wake_grace: Duration::from_secs(5),
            rank_settle_time: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
            interface_scan_interval: Duration::from_secs(10),
            num_threads: 2,
            connections_per_path: 1,
            hold_size: 4096,
            max_message_size: 64 * 1024 * 1024,
        }
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if self.alias.is_empty() {
            return Err(TransportError::Config("alias must not be empty".to_string()));
        }
        if self.alias.len() >= crate::wire::hello::NAME_LEN_V2 {
            return Err(TransportError::Config(format!("alias {:?} is too long", self.alias)));
        }
        if self.link_live_threshold > self.live_threshold {
            return Err(TransportError::Config("link_live_threshold must not exceed live_threshold".to_string()));
        }
        if self.ping_interval >= self.live_threshold {
            return Err(TransportError::Config("ping_interval must be shorter than live_threshold".to_string()));
        }
        if self.num_threads == 0 {
            return Err(TransportError::Config("at least one worker thread is required".to_string()));
        }
        if self.connections_per_path == 0 {
            return Err(TransportError::Config("connections_per_path must be at least 1".to_string()));
        }
        if self.hold_size == 0 {
            return Err(TransportError::Config("hold_size must be at least 1".to_string()));
        }
        if self.udp_addr.is_ipv6() || self.tcp_addr.is_ipv6() {
            return Err(TransportError::Config("only IPv4 addresses are supported".to_string()));
        }
        if let Some(IpAddr::V6(ip)) = self.unique_ip {
            return Err(TransportError::Config(format!("unique ip {} is not IPv4", ip)));
        }
        Ok(())
    }

    /// The rank of a node with the given alias if it is configured statically
    pub fn static_rank_of(&self, alias: &str) -> Option<i32> {
        self.static_ranks.iter()
            .position(|n| n == alias)
            .and_then(|idx| idx.try_into().ok())
    }

    /// Path priority for an interface: its position in the list of allowed interfaces
    pub fn interface_priority(&self, name: &str) -> Option<u32> {
        if self.interfaces.is_empty() {
            return Some(0);
        }
        self.interfaces.iter()
            .position(|n| n == name)
            .and_then(|idx| idx.try_into().ok())
    }

    /// A multi-threaded runtime with `num_threads` workers. All socket readiness is multiplexed
    ///  across these workers.
    pub fn build_runtime(&self) -> anyhow::Result<tokio::runtime::Runtime> {
        Ok(tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.num_threads)
            .thread_name(format!("nodelink-{}", self.alias))
            .enable_all()
            .build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(TransportConfig::default_for("a").validate().is_ok());
    }

    #[rstest]
    #[case::empty_alias(|c: &mut TransportConfig| c.alias.clear())]
    #[case::link_threshold(|c: &mut TransportConfig| c.link_live_threshold = c.live_threshold + Duration::from_millis(1))]
    #[case::ping_interval(|c: &mut TransportConfig| c.ping_interval = c.live_threshold)]
    #[case::no_threads(|c: &mut TransportConfig| c.num_threads = 0)]
    #[case::no_connections(|c: &mut TransportConfig| c.connections_per_path = 0)]
    #[case::no_hold(|c: &mut TransportConfig| c.hold_size = 0)]
    #[case::ipv6(|c: &mut TransportConfig| c.tcp_addr = "[::1]:0".parse().unwrap())]
    fn test_validate_rejects(#[case] modify: fn(&mut TransportConfig)) {
        let mut config = TransportConfig::default_for("a");
        modify(&mut config);
        assert!(matches!(config.validate(), Err(TransportError::Config(_))));
    }

    #[rstest]
    #[case("a", Some(0))]
    #[case("c", Some(2))]
    #[case("x", None)]
    fn test_static_rank_of(#[case] alias: &str, #[case] expected: Option<i32>) {
        let mut config = TransportConfig::default_for("a");
        config.static_ranks = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(config.static_rank_of(alias), expected);
    }

    #[test]
    fn test_interface_priority() {
        let mut config = TransportConfig::default_for("a");
        assert_eq!(config.interface_priority("eth7"), Some(0));

        config.interfaces = vec!["eth1".to_string(), "eth0".to_string()];
        assert_eq!(config.interface_priority("eth0"), Some(1));
        assert_eq!(config.interface_priority("eth1"), Some(0));
        assert_eq!(config.interface_priority("lo"), None);
    }
}
