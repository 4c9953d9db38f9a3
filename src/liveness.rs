//! Path and node liveness. A path is alive while something (a hello or a data message) was
//!  heard on it within `live_threshold`, and a node is alive while any of its paths is.

use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};
use crate::connection::on_connection_error;
use crate::directory::rank::{self, RankState};
use crate::directory::Node;
use crate::error::TransportError;
use crate::reliability;
use crate::transport::Shared;

/// Periodic check of all remote nodes
pub(crate) fn check(shared: &Arc<Shared>, now: Instant) {
    for node in shared.directory.remote_nodes() {
        if !node.is_live() {
            continue;
        }

        let paths = node.paths();
        if paths.is_empty() {
            continue;
        }

        for path in &paths {
            if path.silence(now) > shared.config.link_live_threshold {
                for conn in node.connections.ready_on_path(path) {
                    debug!("path {} -> {} of node {} is silent for {:?}", path.local_ip, path.remote_ip, node.id, path.silence(now));
                    on_connection_error(shared, &node, &conn, "path is silent");
                }
            }
        }

        if paths.iter().all(|p| p.silence(now) > shared.config.live_threshold) {
            info!("no path to node {} is alive", node.id);
            declare_dead(shared, &node, now);
        }
    }
}

/// Takes a node out of the cluster: its connections are closed, everything queued for it or
///  awaiting its acknowledgement fails, and hellos and connections from it are refused for
///  `wake_grace`. The node keeps its number and rank. A new session epoch makes the node
///  discard its message state for us as well when it reconnects.
pub(crate) fn declare_dead(shared: &Arc<Shared>, node: &Arc<Node>, now: Instant) {
    if !node.set_live(false) {
        return;
    }
    info!("node {} ({}) is dead", node.id, node.name());

    node.set_wake_time(now + shared.config.wake_grace);
    for conn in node.connections.ready_connections() {
        on_connection_error(shared, node, &conn, "node is dead");
    }
    reliability::fail_all(shared, node, TransportError::NodeDead(node.number));
    let epoch = node.start_new_epoch();
    debug!("session epoch for node {} is now {}", node.id, epoch);
    rank::on_node_dead(shared, node);

    // the remaining nodes may now all be settled
    rank::progress_self_rank(shared);
}

/// Brings a dead node back after it was heard from again
pub(crate) fn revive(shared: &Arc<Shared>, node: &Arc<Node>) {
    if node.is_live() || node.set_live(true) {
        return;
    }
    info!("node {} ({}) is back", node.id, node.name());

    let now = Instant::now();
    for path in node.paths() {
        path.touch(now);
    }
    node.update_rank_info(|info| {
        if info.state == RankState::Unused {
            info.state = RankState::WaitId;
        }
    });
    rank::send_talk(shared, node);
}
