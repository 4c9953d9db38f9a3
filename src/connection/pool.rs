use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use parking_lot::RwLock;
use tokio::time::Instant;
use crate::connection::{Connection, ConnectionState};
use crate::path::Path;
use crate::reliability::send_entry::SendEntry;

/// The connection slots of a single node. Slots are never removed; a closed connection's slot
///  is reused by the next connection to the same node.
pub struct ConnectionPool {
    slots: RwLock<Vec<Arc<Connection>>>,
    last_pick: AtomicUsize,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        ConnectionPool {
            slots: Default::default(),
            last_pick: AtomicUsize::new(usize::MAX),
        }
    }
}

impl ConnectionPool {
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.slots.read().clone()
    }

    pub fn num_slots(&self) -> usize {
        self.slots.read().len()
    }

    /// Claims an AVAILABLE slot, adding a new one if there is none
    pub(crate) fn acquire_slot(&self) -> Arc<Connection> {
        let mut slots = self.slots.write();
        if let Some(conn) = slots.iter().find(|c| c.try_claim()) {
            return conn.clone();
        }

        let conn = Arc::new(Connection::new(slots.len()));
        let _claimed = conn.try_claim();
        slots.push(conn.clone());
        conn
    }

    pub fn count_in_state(&self, state: ConnectionState) -> usize {
        self.slots.read()
            .iter()
            .filter(|c| c.state() == state)
            .count()
    }

    pub fn ready_connections(&self) -> Vec<Arc<Connection>> {
        self.slots.read()
            .iter()
            .filter(|c| c.state() == ConnectionState::Ready)
            .cloned()
            .collect()
    }

    pub fn ready_on_path(&self, path: &Arc<Path>) -> Vec<Arc<Connection>> {
        self.slots.read()
            .iter()
            .filter(|c| c.state() == ConnectionState::Ready && c.is_on_path(path))
            .cloned()
            .collect()
    }

    /// The READY connection to send the next message on: best path priority first, then the
    ///  shortest send queue. Ties are broken round-robin.
    pub fn pick_connection_for_send(&self) -> Option<Arc<Connection>> {
        let candidates = self.slots.read()
            .iter()
            .filter(|c| c.state() == ConnectionState::Ready)
            .map(|c| ((c.priority(), c.queue_len()), c.clone()))
            .collect::<Vec<_>>();

        let best = candidates.iter().map(|(key, _)| *key).min()?;
        let tied = candidates.into_iter()
            .filter(|(key, _)| *key == best)
            .map(|(_, c)| c)
            .collect::<Vec<_>>();

        let last = self.last_pick.load(Ordering::Relaxed);
        let chosen = tied.iter()
            .find(|c| last != usize::MAX && c.slot > last)
            .or(tied.first())?
            .clone();
        self.last_pick.store(chosen.slot, Ordering::Relaxed);
        Some(chosen)
    }

    /// Removes fresh entries whose deadline passed from all connection send queues
    pub(crate) fn take_expired(&self, now: Instant) -> Vec<SendEntry> {
        self.all()
            .iter()
            .flat_map(|c| c.take_expired(now))
            .collect()
    }
}
