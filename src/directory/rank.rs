//! Rank negotiation.
//!
//! Every node goes through the states UNUSED -> WAITID -> NORANK -> ALMOST -> ACTIVE. A node
//!  waits in WAITID until it either has a statically configured rank, or no new node showed up
//!  for `rank_settle_time`. It then picks a rank (NORANK -> ALMOST) and announces it in 'talk'
//!  messages. Once every connected peer has confirmed seeing that rank, it becomes ACTIVE.
//!
//! Dynamic picking is deterministic over the set of known nodes, so nodes with the same view
//!  arrive at the same assignment without coordination. Collisions (different views) are
//!  resolved when talk messages meet: a rank that is already held by another node is rejected.
//!  If the collision is with ourselves, an ACTIVE claim beats an ALMOST one and the lower
//!  identity breaks ties; the losing side drops its rank and picks again.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::sync::Arc;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rustc_hash::FxHashSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use crate::connection::ConnectionState;
use crate::directory::Node;
use crate::event_queue::{DroppedData, Event, JoinedData};
use crate::reliability;
use crate::transport::Shared;
use crate::wire::meta::MetaMessage;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum RankState {
    Unused = 0,
    WaitId = 1,
    NoRank = 2,
    Almost = 3,
    Active = 4,
}

/// Identity of a node across all its interfaces. The derived order (unique ip first, then
///  port) is the total order that decides which side of a path dials.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId {
    pub unique_ip: Ipv4Addr,
    pub port: u16,
}
impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.unique_ip, self.port)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RankInfo {
    pub state: RankState,
    /// -1 until assigned
    pub rank: i32,
    /// the rank this (remote) node recorded for us, as reported in its last talk message
    pub seen_rank: i32,
    /// true while a `Joined` event for this node is in effect
    pub joined: bool,
}
impl RankInfo {
    pub fn new(state: RankState) -> RankInfo {
        RankInfo {
            state,
            rank: -1,
            seen_rank: -1,
            joined: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RankCandidate {
    pub id: NodeId,
    pub state: RankState,
    pub rank: i32,
    pub static_rank: Option<i32>,
}
impl RankCandidate {
    fn claimed_rank(&self) -> Option<i32> {
        self.static_rank
            .or(if self.rank >= 0 { Some(self.rank) } else { None })
    }
}

/// Assigns a rank to every candidate. Claimed ranks (static or already chosen) are kept, the
///  remaining candidates get the smallest free ranks in order of (state desc, rank asc, port
///  asc, unique ip asc).
///
/// Unclaimed candidates all sort as NORANK, regardless of how far along we believe they are:
///  every node sees itself further along than its peers, and sorting by the raw state would
///  make the views disagree.
pub fn pick_rank(candidates: &[RankCandidate]) -> BTreeMap<NodeId, i32> {
    let sort_state = |c: &RankCandidate| {
        if c.claimed_rank().is_some() {
            c.state
        }
        else {
            RankState::NoRank
        }
    };

    let mut sorted = candidates.iter().collect::<Vec<_>>();
    sorted.sort_by(|a, b| {
        sort_state(b).cmp(&sort_state(a))
            .then(a.rank.cmp(&b.rank))
            .then(a.id.port.cmp(&b.id.port))
            .then(a.id.unique_ip.cmp(&b.id.unique_ip))
    });

    let mut result = BTreeMap::new();
    let mut used = FxHashSet::default();
    for c in &sorted {
        if let Some(rank) = c.claimed_rank() {
            used.insert(rank);
            result.insert(c.id, rank);
        }
    }

    let mut next_free = 0;
    for c in sorted {
        if result.contains_key(&c.id) {
            continue;
        }
        while used.contains(&next_free) {
            next_free += 1;
        }
        used.insert(next_free);
        result.insert(c.id, next_free);
    }
    result
}

/// Decides between our claim on a rank and a peer's claim on the same rank: the further
///  advanced claim wins (ACTIVE over ALMOST), between equal ones the lower identity
fn peer_wins_collision(own_state: RankState, own_id: NodeId, peer_state: RankState, peer_id: NodeId) -> bool {
    if peer_state < RankState::Almost {
        return false;
    }
    if own_state < RankState::Almost {
        return true;
    }
    match peer_state.cmp(&own_state) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => peer_id < own_id,
    }
}

fn is_connected(node: &Node) -> bool {
    node.connections.count_in_state(ConnectionState::Ready) > 0
}

/// Advances our own rank state as far as currently possible, announcing every change
pub(crate) fn progress_self_rank(shared: &Arc<Shared>) {
    let self_node = shared.directory.self_node();
    let mut changed = false;

    loop {
        let current = self_node.rank_info();
        let next = match current.state {
            RankState::Unused | RankState::WaitId => {
                let is_static = shared.config.static_rank_of(&shared.config.alias).is_some();
                let settled = Instant::now().duration_since(shared.directory.last_new_node()) >= shared.config.rank_settle_time;
                if is_static || settled {
                    Some((RankState::NoRank, current.rank))
                }
                else {
                    None
                }
            }
            RankState::NoRank => {
                let rank = pick_own_rank(shared, &self_node);
                info!("picked rank {}", rank);
                Some((RankState::Almost, rank))
            }
            RankState::Almost => {
                if is_rank_confirmed(shared, current.rank) {
                    info!("rank {} is confirmed - this node is active", current.rank);
                    Some((RankState::Active, current.rank))
                }
                else {
                    None
                }
            }
            RankState::Active => None,
        };

        match next {
            Some((state, rank)) => {
                debug!("own rank state {:?} -> {:?}", current.state, state);
                self_node.update_rank_info(|info| {
                    info.state = state;
                    info.rank = rank;
                });
                changed = true;
            }
            None => break,
        }
    }

    if changed {
        broadcast_talk(shared);
    }
}

fn pick_own_rank(shared: &Arc<Shared>, self_node: &Arc<Node>) -> i32 {
    if let Some(rank) = shared.config.static_rank_of(&shared.config.alias) {
        return rank;
    }

    let candidates = shared.directory.all()
        .into_iter()
        .filter(|n| n.number == 0 || n.is_live() || n.rank() >= 0)
        .map(|n| {
            let info = n.rank_info();
            RankCandidate {
                id: n.id,
                state: info.state,
                rank: info.rank,
                static_rank: shared.config.static_rank_of(&n.name()),
            }
        })
        .collect::<Vec<_>>();

    pick_rank(&candidates)
        .get(&self_node.id)
        .copied()
        .unwrap_or(-1)
}

/// true if every live peer we are connected to has seen our rank. Live peers without any
///  connection yet block confirmation, being alone does not.
fn is_rank_confirmed(shared: &Arc<Shared>, own_rank: i32) -> bool {
    if own_rank < 0 {
        return false;
    }
    shared.directory.remote_nodes()
        .iter()
        .filter(|n| n.is_live())
        .all(|n| is_connected(n) && n.rank_info().seen_rank == own_rank)
}

pub(crate) fn send_talk(shared: &Arc<Shared>, node: &Arc<Node>) {
    let own = shared.directory.self_node().rank_info();
    let msg = MetaMessage::Talk {
        state: own.state,
        rank: own.rank,
        seen_rank: node.rank(),
    };
    reliability::send_meta(shared, node, msg);
}

pub(crate) fn broadcast_talk(shared: &Arc<Shared>) {
    for node in shared.directory.remote_nodes() {
        if node.is_live() && is_connected(&node) {
            send_talk(shared, &node);
        }
    }
}

/// Re-sends talk messages to connected peers whose view of us is not settled yet, covering
///  talks that were lost with a failed connection
pub(crate) fn refresh_talk(shared: &Arc<Shared>) {
    let own = shared.directory.self_node().rank_info();
    for node in shared.directory.remote_nodes() {
        if !node.is_live() || !is_connected(&node) {
            continue;
        }
        let info = node.rank_info();
        if own.state != RankState::Active || info.seen_rank != own.rank || !info.joined {
            send_talk(shared, &node);
        }
    }
}

pub(crate) fn on_talk(shared: &Arc<Shared>, node: &Arc<Node>, state: RankState, rank: i32, seen_rank: i32) {
    let self_node = shared.directory.self_node();

    if rank >= 0 {
        if let Some(holder) = shared.directory.lookup_by_rank_except(rank, node.number) {
            if !holder.is_self() {
                // the sender learns about the holder from the holder itself
                warn!("node {} claims rank {} which is held by node {} - rejecting", node.id, rank, holder.id);
                return;
            }

            let own = self_node.rank_info();
            if peer_wins_collision(own.state, shared.self_id, state, node.id) {
                info!("node {} claims rank {} as {:?} while we are {:?} on it - yielding", node.id, rank, state, own.state);
                self_node.update_rank_info(|info| {
                    info.state = RankState::NoRank;
                    info.rank = -1;
                });
            }
            else {
                warn!("node {} claims rank {} as {:?}, which we hold as {:?} - rejecting", node.id, rank, state, own.state);
                // our claim makes the sender yield, so this is answered once per claim
                if state >= RankState::Almost {
                    send_talk(shared, node);
                }
                return;
            }
        }

        let recorded = node.rank_info();
        if recorded.joined && recorded.rank >= 0 && recorded.rank != rank {
            warn!("node {} claims rank {} but joined with rank {} - rejecting", node.id, rank, recorded.rank);
            return;
        }
    }

    let mut joined_change = None;
    let mut rank_is_new = false;
    node.update_rank_info(|info| {
        info.state = state;
        if rank >= 0 {
            rank_is_new = info.rank != rank;
            info.rank = rank;
        }
        else if state < RankState::Almost && !info.joined {
            // it gave up its claim, e.g. after losing a collision
            info.rank = -1;
        }
        info.seen_rank = seen_rank;

        if state == RankState::Active && info.rank >= 0 && !info.joined {
            info.joined = true;
            joined_change = Some(true);
        }
        else if state != RankState::Active && info.joined {
            info.joined = false;
            joined_change = Some(false);
        }
    });

    match joined_change {
        Some(true) => {
            info!("node {} joined with rank {}", node.id, node.rank());
            shared.events.push(Event::Joined(JoinedData { node: node.number, rank: node.rank() }));
        }
        Some(false) => {
            info!("node {} left the active state", node.id);
            shared.events.push(Event::Dropped(DroppedData { node: node.number, rank: node.rank() }));
        }
        None => {}
    }

    let own_rank = self_node.rank();
    if rank_is_new || (own_rank >= 0 && seen_rank != own_rank) {
        send_talk(shared, node);
    }

    progress_self_rank(shared);
}

/// Rank bookkeeping for a node that was declared dead. Its rank is retained.
pub(crate) fn on_node_dead(shared: &Arc<Shared>, node: &Arc<Node>) {
    let mut was_joined = false;
    node.update_rank_info(|info| {
        info.state = RankState::Unused;
        info.seen_rank = -1;
        was_joined = info.joined;
        info.joined = false;
    });

    if was_joined {
        shared.events.push(Event::Dropped(DroppedData { node: node.number, rank: node.rank() }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use rstest::rstest;
    use crate::config::TransportConfig;
    use crate::discovery::interfaces::MockInterfaceSource;
    use crate::wire::data_header::CURRENT_PROTOCOL_VERSION;

    /// [broadcast_talk] only reaches connected nodes, these tests have no connections
    fn broadcast_talk_unconnected(shared: &Arc<Shared>) {
        for node in shared.directory.remote_nodes() {
            send_talk(shared, &node);
        }
    }

    fn id(last_octet: u8, port: u16) -> NodeId {
        NodeId { unique_ip: Ipv4Addr::new(10, 0, 0, last_octet), port }
    }

    fn candidate(id: NodeId, state: RankState, rank: i32) -> RankCandidate {
        RankCandidate { id, state, rank, static_rank: None }
    }

    #[test]
    fn test_pick_rank_fresh_nodes_by_port() {
        let candidates = vec![
            candidate(id(1, 7002), RankState::NoRank, -1),
            candidate(id(2, 7000), RankState::WaitId, -1),
            candidate(id(3, 7001), RankState::WaitId, -1),
        ];
        let ranks = pick_rank(&candidates);
        assert_eq!(ranks.get(&id(2, 7000)), Some(&0));
        assert_eq!(ranks.get(&id(3, 7001)), Some(&1));
        assert_eq!(ranks.get(&id(1, 7002)), Some(&2));
    }

    #[test]
    fn test_pick_rank_ip_breaks_port_tie() {
        let candidates = vec![
            candidate(id(9, 7000), RankState::NoRank, -1),
            candidate(id(4, 7000), RankState::NoRank, -1),
        ];
        let ranks = pick_rank(&candidates);
        assert_eq!(ranks.get(&id(4, 7000)), Some(&0));
        assert_eq!(ranks.get(&id(9, 7000)), Some(&1));
    }

    #[test]
    fn test_pick_rank_keeps_claims() {
        let candidates = vec![
            candidate(id(1, 7000), RankState::NoRank, -1),
            candidate(id(2, 7001), RankState::Active, 0),
            candidate(id(3, 7002), RankState::Almost, 2),
            candidate(id(4, 7003), RankState::WaitId, -1),
            RankCandidate { id: id(5, 7004), state: RankState::WaitId, rank: -1, static_rank: Some(3) },
            candidate(id(6, 6000), RankState::Unused, 5),
        ];
        let ranks = pick_rank(&candidates);
        assert_eq!(ranks.get(&id(2, 7001)), Some(&0));
        assert_eq!(ranks.get(&id(3, 7002)), Some(&2));
        assert_eq!(ranks.get(&id(5, 7004)), Some(&3));
        assert_eq!(ranks.get(&id(6, 6000)), Some(&5));
        assert_eq!(ranks.get(&id(1, 7000)), Some(&1));
        assert_eq!(ranks.get(&id(4, 7003)), Some(&4));
    }

    /// three nodes learning about each other in different orders, each with itself further
    ///  along than the others
    #[rstest]
    #[case::abc([0, 1, 2])]
    #[case::bca([1, 2, 0])]
    #[case::cab([2, 0, 1])]
    fn test_pick_rank_independent_of_join_order(#[case] order: [usize; 3]) {
        let ids = [id(1, 7100), id(2, 7050), id(3, 7075)];

        let expected = BTreeMap::from([(ids[1], 0), (ids[2], 1), (ids[0], 2)]);

        for own in 0..3 {
            let candidates = order.iter()
                .map(|&i| {
                    let state = if i == own { RankState::NoRank } else { RankState::WaitId };
                    candidate(ids[i], state, -1)
                })
                .collect::<Vec<_>>();
            assert_eq!(pick_rank(&candidates), expected, "view of node {}", own);
        }
    }

    #[rstest]
    #[case::active_beats_almost(RankState::Almost, RankState::Active, false, true)]
    #[case::almost_loses_to_active(RankState::Active, RankState::Almost, true, false)]
    #[case::lower_identity_wins_between_almost(RankState::Almost, RankState::Almost, true, true)]
    #[case::higher_identity_loses_between_almost(RankState::Almost, RankState::Almost, false, false)]
    #[case::lower_identity_wins_between_active(RankState::Active, RankState::Active, true, true)]
    #[case::no_claim(RankState::Almost, RankState::NoRank, true, false)]
    fn test_peer_wins_collision(#[case] own_state: RankState, #[case] peer_state: RankState, #[case] peer_is_lower: bool, #[case] expected: bool) {
        let own_id = id(5, 7000);
        let peer_id = if peer_is_lower { id(4, 7000) } else { id(6, 7000) };
        assert_eq!(peer_wins_collision(own_state, own_id, peer_state, peer_id), expected);
    }

    async fn shared(unique_ip: Ipv4Addr) -> Arc<Shared> {
        let mut config = TransportConfig::default_for("node");
        config.unique_ip = Some(unique_ip.into());
        config.udp_addr = "127.0.0.1:0".parse().unwrap();
        config.tcp_addr = "127.0.0.1:0".parse().unwrap();
        config.no_broadcast = true;

        let mut source = MockInterfaceSource::new();
        source.expect_interfaces().returning(|| Ok(vec![]));
        let (shared, _listener) = Shared::new(config, Box::new(source)).await.unwrap();
        shared
    }

    fn set_own_rank(shared: &Shared, state: RankState, rank: i32) {
        shared.directory.self_node().update_rank_info(|info| {
            info.state = state;
            info.rank = rank;
        });
    }

    /// Hands the talk messages `from` queued for `to` over to `to`, returning their number.
    ///  Without connections, everything sent stays in the node's pending queue.
    fn deliver_talks(from: &Arc<Shared>, to: &Arc<Shared>) -> usize {
        let to_at_from = from.directory.lookup_by_identity(to.self_id).unwrap();
        let from_at_to = to.directory.lookup_by_identity(from.self_id).unwrap();
        let (pending, _) = to_at_from.seq.take_all();
        let num_talks = pending.len();
        for entry in pending {
            match MetaMessage::deser(&entry.segments[0]).unwrap() {
                MetaMessage::Talk { state, rank, seen_rank } => on_talk(to, &from_at_to, state, rank, seen_rank),
                other => panic!("unexpected {:?}", other),
            }
        }
        num_talks
    }

    #[rstest]
    #[case::almost_side_has_higher_identity(Ipv4Addr::new(127, 0, 0, 2), Ipv4Addr::new(127, 0, 0, 1))]
    #[case::almost_side_has_lower_identity(Ipv4Addr::new(127, 0, 0, 1), Ipv4Addr::new(127, 0, 0, 2))]
    #[tokio::test]
    async fn test_almost_node_yields_to_active_holder(#[case] almost_ip: Ipv4Addr, #[case] active_ip: Ipv4Addr) {
        let almost = shared(almost_ip).await;
        let active = shared(active_ip).await;
        almost.directory.create_node(CURRENT_PROTOCOL_VERSION, active.self_id, "active");
        active.directory.create_node(CURRENT_PROTOCOL_VERSION, almost.self_id, "almost");

        // both settled on rank 0 without knowing of each other
        set_own_rank(&almost, RankState::Almost, 0);
        set_own_rank(&active, RankState::Active, 0);

        broadcast_talk_unconnected(&almost);
        broadcast_talk_unconnected(&active);

        let mut rounds = 0;
        while deliver_talks(&almost, &active) + deliver_talks(&active, &almost) > 0 {
            rounds += 1;
            assert!(rounds < 10, "talk messages keep going back and forth");
        }

        assert_eq!(active.directory.self_node().rank_info().state, RankState::Active);
        assert_eq!(active.directory.self_node().rank(), 0);
        let own = almost.directory.self_node().rank_info();
        assert_eq!((own.state, own.rank), (RankState::Almost, 1));

        let active_at_almost = almost.directory.lookup_by_identity(active.self_id).unwrap();
        assert_eq!(active_at_almost.rank(), 0);
        assert!(active_at_almost.rank_info().joined);
        let mut events = Vec::new();
        while let Some(event) = almost.events.poll(Some(Duration::ZERO)).await {
            events.push(event);
        }
        assert!(events.contains(&Event::Joined(JoinedData { node: active_at_almost.number, rank: 0 })));

        almost.abort_tasks();
        active.abort_tasks();
    }

    #[tokio::test]
    async fn test_active_holder_answers_conflicting_claim_once() {
        let holder = shared(Ipv4Addr::new(127, 0, 0, 1)).await;
        let (peer, _) = holder.directory.create_node(CURRENT_PROTOCOL_VERSION, NodeId { unique_ip: Ipv4Addr::new(127, 0, 0, 9), port: 1 }, "peer");
        set_own_rank(&holder, RankState::Active, 0);

        on_talk(&holder, &peer, RankState::Almost, 0, -1);
        assert_eq!(holder.directory.self_node().rank_info().state, RankState::Active);
        assert_eq!(peer.rank(), -1);
        assert_eq!(peer.seq.num_pending(), 1);

        // a node without a claim gets no answer
        on_talk(&holder, &peer, RankState::NoRank, -1, 0);
        assert_eq!(peer.seq.num_pending(), 1);

        // the peer gave up and picked another rank
        on_talk(&holder, &peer, RankState::Almost, 1, -1);
        assert_eq!(peer.rank(), 1);
        holder.abort_tasks();
    }

    #[tokio::test]
    async fn test_rank_given_up_is_released() {
        let s = shared(Ipv4Addr::new(127, 0, 0, 1)).await;
        let (peer, _) = s.directory.create_node(CURRENT_PROTOCOL_VERSION, NodeId { unique_ip: Ipv4Addr::new(127, 0, 0, 9), port: 1 }, "peer");
        let (third, _) = s.directory.create_node(CURRENT_PROTOCOL_VERSION, NodeId { unique_ip: Ipv4Addr::new(127, 0, 0, 8), port: 1 }, "third");
        set_own_rank(&s, RankState::Almost, 5);

        on_talk(&s, &peer, RankState::Almost, 2, -1);
        assert_eq!(s.directory.lookup_by_rank(2).map(|n| n.number), Some(peer.number));

        on_talk(&s, &peer, RankState::NoRank, -1, 5);
        assert_eq!(peer.rank(), -1);

        on_talk(&s, &third, RankState::Almost, 2, -1);
        assert_eq!(s.directory.lookup_by_rank(2).map(|n| n.number), Some(third.number));
        s.abort_tasks();
    }

    #[test]
    fn test_rank_state_order() {
        assert!(RankState::Active > RankState::Almost);
        assert!(RankState::Almost > RankState::NoRank);
        assert!(RankState::NoRank > RankState::WaitId);
        assert!(RankState::WaitId > RankState::Unused);
    }

    #[test]
    fn test_node_id_order() {
        assert!(id(2, 1) > id(1, 9));
        assert!(id(1, 9) > id(1, 8));
    }
}
