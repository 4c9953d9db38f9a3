//! Per-node sequencing, acknowledgement, re-sending and reordering.
//!
//! Sequence numbers are assigned when an entry is handed to a socket. After the write, the
//!  entry moves to the node's sent list (keyed by sequence number) until the peer acknowledges
//!  it. Acknowledgements travel piggybacked in every data header (`ack_seq`), or in explicit
//!  ack messages when there is no reverse traffic.
//!
//! Lost messages are recovered from both sides: the sender re-sends everything unacknowledged
//!  when the acknowledged sequence number stalls, and the receiver asks for a re-send from its
//!  first missing sequence number when it holds messages beyond a gap that does not close.

pub mod receive_window;
pub mod send_entry;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::connection;
use crate::directory::rank;
use crate::directory::Node;
use crate::error::TransportError;
use crate::event_queue::{Event, EventQueue, ReceivedData};
use crate::reliability::receive_window::{Placement, ReceiveWindow};
use crate::reliability::send_entry::{Outgoing, ResendFrame, SendEntry, SendFlags, SendOptions};
use crate::transport::Shared;
use crate::wire::data_header::{DataHeader, CURRENT_PROTOCOL_VERSION, META_TAG, PROTOCOL_VERSION_2, UNSEQUENCED};
use crate::wire::meta::MetaMessage;

/// Reliability state for one peer. The three queues each have their own lock (`pending` is
///  the node's send lock, `sent` its sent lock, `recv` its receive lock); none of them is held
///  while doing I/O.
pub struct SeqState {
    last_used_seq: AtomicI64,
    ack_seq: AtomicI64,
    /// mirrors the receive window's `cont_seq` so headers can be written without `recv`
    cont_seq: AtomicI64,
    ack_sent: AtomicI64,

    last_checked_ack: AtomicI64,
    outstanding_at_last_check: AtomicBool,
    last_checked_cont: AtomicI64,
    gap_at_last_check: AtomicBool,

    pending: Mutex<VecDeque<SendEntry>>,
    sent: Mutex<BTreeMap<i64, SendEntry>>,
    recv: Mutex<ReceiveWindow<ReceivedData>>,
}

impl SeqState {
    pub fn new(hold_size: usize) -> SeqState {
        SeqState {
            last_used_seq: AtomicI64::new(0),
            ack_seq: AtomicI64::new(0),
            cont_seq: AtomicI64::new(0),
            ack_sent: AtomicI64::new(0),
            last_checked_ack: AtomicI64::new(0),
            outstanding_at_last_check: AtomicBool::new(false),
            last_checked_cont: AtomicI64::new(0),
            gap_at_last_check: AtomicBool::new(false),
            pending: Default::default(),
            sent: Default::default(),
            recv: Mutex::new(ReceiveWindow::new(hold_size)),
        }
    }

    pub fn assign_seq(&self) -> i64 {
        self.last_used_seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn last_used_seq(&self) -> i64 {
        self.last_used_seq.load(Ordering::Acquire)
    }

    /// highest sequence number acknowledged by the peer
    pub fn ack_seq(&self) -> i64 {
        self.ack_seq.load(Ordering::Acquire)
    }

    /// highest sequence number up to which everything from the peer was delivered
    pub fn cont_seq(&self) -> i64 {
        self.cont_seq.load(Ordering::Acquire)
    }

    pub fn ack_sent(&self) -> i64 {
        self.ack_sent.load(Ordering::Acquire)
    }

    pub fn note_ack_sent(&self, ack: i64) {
        self.ack_sent.fetch_max(ack, Ordering::AcqRel);
    }

    pub fn num_pending(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn num_unacked(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn num_buffered(&self) -> usize {
        self.recv.lock().num_buffered()
    }

    /// true if no sequence number was used or received since the last reset
    pub fn is_pristine(&self) -> bool {
        self.last_used_seq() == 0 && self.cont_seq() == 0 && self.num_unacked() == 0 && self.num_buffered() == 0
    }

    /// Puts a written entry on the sent list. An entry that was acknowledged in the meantime
    ///  is handed back for release.
    pub fn record_sent(&self, entry: SendEntry) -> Option<SendEntry> {
        let seq = entry.wire_seq();
        let mut sent = self.sent.lock();
        if seq <= self.ack_seq() {
            return Some(entry);
        }
        sent.insert(seq, entry);
        None
    }

    /// Releases everything up to `ack`, returning the number of released entries
    pub fn on_ack(&self, ack: i64) -> usize {
        let mut sent = self.sent.lock();
        if ack <= self.ack_seq() {
            return 0;
        }
        let last_used = self.last_used_seq();
        if ack > last_used {
            warn!("peer acknowledged sequence number {} which was never sent (last used {}) - ignoring", ack, last_used);
            return 0;
        }
        self.ack_seq.store(ack, Ordering::Release);

        let unacked = sent.split_off(&(ack + 1));
        let acked = std::mem::replace(&mut *sent, unacked);
        acked.len()
    }

    /// Frames for every unacknowledged entry if the acknowledged sequence number did not move
    ///  since the previous check while there was unacknowledged data at both checks
    pub fn retransmit_check(&self) -> Vec<ResendFrame> {
        let sent = self.sent.lock();
        let ack = self.ack_seq();
        let outstanding = !sent.is_empty();

        let stalled = outstanding
            && self.outstanding_at_last_check.load(Ordering::Acquire)
            && self.last_checked_ack.load(Ordering::Acquire) == ack;

        self.outstanding_at_last_check.store(outstanding, Ordering::Release);
        self.last_checked_ack.store(ack, Ordering::Release);

        if !stalled {
            return Vec::new();
        }
        sent.range(ack + 1..)
            .filter_map(|(_, e)| e.resend_frame())
            .collect()
    }

    pub fn frames_from(&self, from_seq: i64) -> Vec<ResendFrame> {
        self.sent.lock()
            .range(from_seq.max(self.ack_seq() + 1)..)
            .filter_map(|(_, e)| e.resend_frame())
            .collect()
    }

    /// The sequence number to request a re-send from, if a gap in the received sequence
    ///  persisted since the previous check
    pub fn resend_request_check(&self) -> Option<i64> {
        let recv = self.recv.lock();
        let cont = recv.cont_seq();
        let gap = recv.has_gap();

        let stuck = gap
            && self.gap_at_last_check.load(Ordering::Acquire)
            && self.last_checked_cont.load(Ordering::Acquire) == cont;

        self.gap_at_last_check.store(gap, Ordering::Release);
        self.last_checked_cont.store(cont, Ordering::Release);

        if stuck {
            Some(cont + 1)
        }
        else {
            None
        }
    }

    /// `cont_seq`, if it advanced beyond what was last sent to the peer
    pub fn ack_due(&self) -> Option<i64> {
        let cont = self.cont_seq();
        if cont > self.ack_sent() {
            Some(cont)
        }
        else {
            None
        }
    }

    /// Passes a sequenced message through the receive window, pushing deliverable messages to
    ///  `events` in order. Delivery happens while the receive lock is held to keep the order.
    pub fn receive(&self, data: ReceivedData, events: &EventQueue) -> Placement {
        let mut recv = self.recv.lock();
        let placement = recv.receive(data.seq, data, |_, d| events.push(Event::Received(d)));
        self.cont_seq.store(recv.cont_seq(), Ordering::Release);
        placement
    }

    pub fn push_pending_front(&self, entries: Vec<SendEntry>) {
        let mut pending = self.pending.lock();
        for entry in entries.into_iter().rev() {
            pending.push_front(entry);
        }
    }

    pub fn take_expired_pending(&self, now: Instant) -> Vec<SendEntry> {
        let mut pending = self.pending.lock();
        let (expired, keep): (VecDeque<_>, VecDeque<_>) = pending.drain(..)
            .partition(|e| e.is_expired(now));
        *pending = keep;
        expired.into()
    }

    /// Notifies response targets of sent entries whose deadline passed. The entries stay for
    ///  re-sending, so later messages are not blocked by the gap.
    pub fn expire_sent(&self, now: Instant) {
        let mut sent = self.sent.lock();
        for entry in sent.values_mut() {
            if entry.is_expired(now) {
                entry.notify_response_failure(&TransportError::Timeout(entry.node));
                entry.deadline = None;
            }
        }
    }

    pub fn take_all(&self) -> (Vec<SendEntry>, Vec<SendEntry>) {
        let pending = self.pending.lock().drain(..).collect();
        let sent = std::mem::take(&mut *self.sent.lock())
            .into_values()
            .collect();
        (pending, sent)
    }

    /// Starts over with sequence numbers on both directions, discarding buffered messages.
    ///  Entries must have been taken out before.
    pub fn reset(&self) {
        let mut recv = self.recv.lock();
        recv.reset();
        self.cont_seq.store(0, Ordering::Release);
        self.ack_sent.store(0, Ordering::Release);
        self.last_checked_cont.store(0, Ordering::Release);
        self.gap_at_last_check.store(false, Ordering::Release);
        drop(recv);

        let _sent = self.sent.lock();
        self.last_used_seq.store(0, Ordering::Release);
        self.ack_seq.store(0, Ordering::Release);
        self.last_checked_ack.store(0, Ordering::Release);
        self.outstanding_at_last_check.store(false, Ordering::Release);
    }
}

/// The header for a message to `node` in the node's negotiated version, piggybacking our
///  current `cont_seq` for it
pub fn data_header_for(node: &Node, src_tag: i16, dst_tag: i16, msg_id: u64, seq: i64, size: u64) -> DataHeader {
    let version = node.version();
    DataHeader {
        version,
        supported_version: CURRENT_PROTOCOL_VERSION,
        src_tag,
        dst_tag,
        msg_id,
        seq,
        size,
        ack_seq: if version >= PROTOCOL_VERSION_2 { Some(node.seq.cont_seq()) } else { None },
    }
}

/// Hands an entry to a READY connection, or queues it on the node if there is none
pub(crate) fn submit(shared: &Arc<Shared>, node: &Arc<Node>, entry: SendEntry) -> Result<(), TransportError> {
    if node.is_self() {
        loopback(shared, node, entry);
        return Ok(());
    }
    if !node.is_live() {
        return Err(TransportError::NodeDead(node.number));
    }

    let mut pending = node.seq.pending.lock();
    if pending.is_empty() {
        if let Some(conn) = node.connections.pick_connection_for_send() {
            drop(pending);
            connection::enqueue(shared, node, &conn, Outgoing::Fresh(entry));
            return Ok(());
        }
    }
    trace!("no connection to node {} - queueing message {}", node.id, entry.msg_id);
    pending.push_back(entry);
    Ok(())
}

/// Moves queued entries of a node to its READY connections
pub(crate) fn drain_pending(shared: &Arc<Shared>, node: &Arc<Node>) {
    loop {
        let mut pending = node.seq.pending.lock();
        if pending.is_empty() {
            return;
        }
        let Some(conn) = node.connections.pick_connection_for_send() else {
            return;
        };
        let Some(entry) = pending.pop_front() else {
            return;
        };
        drop(pending);
        connection::enqueue(shared, node, &conn, Outgoing::Fresh(entry));
    }
}

/// Sending to ourselves never touches a socket
fn loopback(shared: &Arc<Shared>, node: &Arc<Node>, mut entry: SendEntry) {
    let seq = if entry.is_sequenced() {
        node.seq.assign_seq()
    }
    else {
        UNSEQUENCED
    };

    let payload = match entry.segments.len() {
        0 => Bytes::new(),
        1 => entry.segments[0].clone(),
        _ => Bytes::from(entry.segments.concat()),
    };

    shared.events.push(Event::Received(ReceivedData {
        node: node.number,
        src_tag: entry.src_tag,
        dst_tag: entry.dst_tag,
        msg_id: entry.msg_id,
        seq,
        payload,
        error: None,
    }));
    entry.report_written(&shared.events);
}

pub(crate) fn send_meta(shared: &Arc<Shared>, node: &Arc<Node>, msg: MetaMessage) {
    trace!("sending {:?} to node {}", msg, node.id);
    let entry = SendEntry::new(
        &shared.counters,
        node.number,
        META_TAG,
        META_TAG,
        shared.next_msg_id(),
        vec![msg.ser()],
        SendOptions { flags: SendFlags::UNSEQUENCED | SendFlags::QUIET, ..Default::default() },
    );
    if let Err(e) = submit(shared, node, entry) {
        debug!("could not send meta message to node {}: {}", node.id, e);
    }
}

/// Called by the pump after an entry was written completely
pub(crate) fn complete_write(shared: &Arc<Shared>, node: &Arc<Node>, mut entry: SendEntry) {
    entry.report_written(&shared.events);

    if entry.is_sequenced() && node.version() >= PROTOCOL_VERSION_2 {
        // released right away if it was acknowledged before we got here
        let _ = node.seq.record_sent(entry);
    }
}

pub(crate) fn on_ack(node: &Node, ack: i64) {
    let num_released = node.seq.on_ack(ack);
    if num_released > 0 {
        trace!("node {} acknowledged up to {}, released {} messages", node.id, ack, num_released);
    }
}

/// Processes a message read from a connection
pub(crate) fn on_incoming(shared: &Arc<Shared>, node: &Arc<Node>, header: DataHeader, payload: Bytes) {
    if let Some(ack) = header.ack_seq {
        on_ack(node, ack);
    }

    if header.dst_tag == META_TAG {
        match MetaMessage::deser(&payload) {
            Ok(msg) => on_meta(shared, node, msg),
            Err(e) => warn!("dropping malformed meta message from node {}: {}", node.id, e),
        }
        return;
    }

    let data = ReceivedData {
        node: node.number,
        src_tag: header.src_tag,
        dst_tag: header.dst_tag,
        msg_id: header.msg_id,
        seq: header.seq,
        payload,
        error: None,
    };

    if header.seq == UNSEQUENCED {
        shared.events.push(Event::Received(data));
        return;
    }

    match node.seq.receive(data, &shared.events) {
        Placement::Duplicate => trace!("discarding duplicate message {} from node {}", header.seq, node.id),
        Placement::Held | Placement::Overflow => trace!("holding message {} from node {} (delivered up to {})", header.seq, node.id, node.seq.cont_seq()),
        Placement::Delivered(_) => {}
    }
}

fn on_meta(shared: &Arc<Shared>, node: &Arc<Node>, msg: MetaMessage) {
    trace!("received {:?} from node {}", msg, node.id);
    match msg {
        MetaMessage::Talk { state, rank, seen_rank } => {
            rank::on_talk(shared, node, state, rank, seen_rank);
        }
        MetaMessage::ResendFrom { seq } => {
            on_ack(node, seq - 1);
            let frames = node.seq.frames_from(seq);
            debug!("node {} asks for re-send from {} - re-sending {} messages", node.id, seq, frames.len());
            resend(shared, node, frames);
        }
        MetaMessage::Ack { ack_seq } => {
            on_ack(node, ack_seq);
        }
    }
}

/// Spreads re-sent frames over the node's READY connections. Frames that find no connection
///  are dropped - they are still on the sent list, and the next retransmission check covers
///  them.
pub(crate) fn resend(shared: &Arc<Shared>, node: &Arc<Node>, frames: Vec<ResendFrame>) {
    for frame in frames {
        match node.connections.pick_connection_for_send() {
            Some(conn) => connection::enqueue(shared, node, &conn, Outgoing::Resend(frame)),
            None => return,
        }
    }
}

/// Immediately re-sends everything unacknowledged, e.g. after a connection failed with
///  messages that may not have reached the peer
pub(crate) fn resend_unacked(shared: &Arc<Shared>, node: &Arc<Node>) {
    let frames = node.seq.frames_from(node.seq.ack_seq() + 1);
    if !frames.is_empty() {
        debug!("re-sending {} unacknowledged messages to node {}", frames.len(), node.id);
        resend(shared, node, frames);
    }
}

/// Periodic work for one node: re-sends, re-send requests, explicit acks and deadlines
pub(crate) fn on_retransmit_tick(shared: &Arc<Shared>, node: &Arc<Node>, now: Instant) {
    drain_pending(shared, node);

    let frames = node.seq.retransmit_check();
    if !frames.is_empty() {
        debug!("no acknowledgement progress from node {} (at {}) - re-sending {} messages", node.id, node.seq.ack_seq(), frames.len());
        resend(shared, node, frames);
    }

    if let Some(from_seq) = node.seq.resend_request_check() {
        debug!("gap in messages from node {} persists - requesting re-send from {}", node.id, from_seq);
        send_meta(shared, node, MetaMessage::ResendFrom { seq: from_seq });
    }

    if node.version() >= PROTOCOL_VERSION_2 {
        if let Some(ack_seq) = node.seq.ack_due() {
            send_meta(shared, node, MetaMessage::Ack { ack_seq });
        }
    }

    expire_deadlines(shared, node, now);
}

fn expire_deadlines(shared: &Arc<Shared>, node: &Arc<Node>, now: Instant) {
    let mut expired = node.seq.take_expired_pending(now);
    expired.extend(node.connections.take_expired(now));
    for entry in expired {
        debug!("message {} to node {} timed out", entry.msg_id, node.id);
        entry.fail(TransportError::Timeout(node.number), &shared.events);
    }
    node.seq.expire_sent(now);
}

/// Fails every queued and unacknowledged entry of a node and starts its sequencing over
pub(crate) fn fail_all(shared: &Arc<Shared>, node: &Arc<Node>, error: TransportError) {
    let (pending, sent) = node.seq.take_all();
    if !pending.is_empty() || !sent.is_empty() {
        debug!("failing {} queued and {} unacknowledged messages to node {}: {}", pending.len(), sent.len(), node.id, error);
    }
    for entry in pending.into_iter().chain(sent) {
        entry.fail(error.clone(), &shared.events);
    }
    node.seq.reset();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::send_entry::EntryCounters;
    use std::time::Duration;

    fn entry(counters: &Arc<EntryCounters>, seq: i64) -> SendEntry {
        let mut e = SendEntry::new(counters, 1, 0, 0, seq as u64, vec![Bytes::from(vec![seq as u8])], SendOptions::default());
        e.seq = Some(seq);
        e
    }

    fn sent_state(counters: &Arc<EntryCounters>, n: i64) -> SeqState {
        let state = SeqState::new(16);
        for _ in 0..n {
            let seq = state.assign_seq();
            assert!(state.record_sent(entry(counters, seq)).is_none());
        }
        state
    }

    fn data(seq: i64) -> ReceivedData {
        ReceivedData { node: 1, src_tag: 0, dst_tag: 0, msg_id: seq as u64, seq, payload: Bytes::new(), error: None }
    }

    #[test]
    fn test_assign_seq() {
        let state = SeqState::new(4);
        assert_eq!(state.assign_seq(), 1);
        assert_eq!(state.assign_seq(), 2);
        assert_eq!(state.last_used_seq(), 2);
    }

    #[test]
    fn test_ack_releases_prefix() {
        let counters = Arc::new(EntryCounters::default());
        let state = sent_state(&counters, 5);
        assert_eq!(counters.outstanding(), 5);

        assert_eq!(state.on_ack(3), 3);
        assert_eq!(state.ack_seq(), 3);
        assert_eq!(state.num_unacked(), 2);
        assert_eq!(counters.outstanding(), 2);

        // stale and bogus acks are ignored
        assert_eq!(state.on_ack(2), 0);
        assert_eq!(state.on_ack(17), 0);
        assert_eq!(state.ack_seq(), 3);

        assert_eq!(state.on_ack(5), 2);
        assert_eq!(counters.outstanding(), 0);
    }

    #[test]
    fn test_record_sent_after_ack() {
        let counters = Arc::new(EntryCounters::default());
        let state = SeqState::new(4);
        let seq = state.assign_seq();
        state.assign_seq();
        state.on_ack(2);

        let returned = state.record_sent(entry(&counters, seq));
        assert!(returned.is_some());
        assert_eq!(state.num_unacked(), 0);
    }

    #[test]
    fn test_retransmit_check_requires_two_stalled_checks() {
        let counters = Arc::new(EntryCounters::default());
        let state = sent_state(&counters, 4);

        assert!(state.retransmit_check().is_empty());

        state.on_ack(1);
        assert!(state.retransmit_check().is_empty());

        let frames = state.retransmit_check();
        assert_eq!(frames.iter().map(|f| f.seq).collect::<Vec<_>>(), vec![2, 3, 4]);

        state.on_ack(4);
        assert!(state.retransmit_check().is_empty());
        assert!(state.retransmit_check().is_empty());
    }

    #[test]
    fn test_frames_from() {
        let counters = Arc::new(EntryCounters::default());
        let state = sent_state(&counters, 6);
        state.on_ack(2);

        assert_eq!(state.frames_from(5).iter().map(|f| f.seq).collect::<Vec<_>>(), vec![5, 6]);
        assert_eq!(state.frames_from(1).iter().map(|f| f.seq).collect::<Vec<_>>(), vec![3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_receive_and_resend_request() {
        let events = EventQueue::new();
        let state = SeqState::new(16);

        state.receive(data(1), &events);
        state.receive(data(3), &events);
        assert_eq!(state.cont_seq(), 1);
        assert_eq!(state.num_buffered(), 1);

        // the gap has to persist across two checks
        assert_eq!(state.resend_request_check(), None);
        assert_eq!(state.resend_request_check(), Some(2));

        state.receive(data(2), &events);
        assert_eq!(state.cont_seq(), 3);
        assert_eq!(state.resend_request_check(), None);

        let mut delivered = Vec::new();
        while let Some(Event::Received(d)) = events.poll(Some(Duration::ZERO)).await {
            delivered.push(d.seq);
        }
        assert_eq!(delivered, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_ack_due() {
        let events = EventQueue::new();
        let state = SeqState::new(16);
        assert_eq!(state.ack_due(), None);

        state.receive(data(1), &events);
        state.receive(data(2), &events);
        assert_eq!(state.ack_due(), Some(2));

        state.note_ack_sent(2);
        assert_eq!(state.ack_due(), None);
        state.note_ack_sent(1);
        assert_eq!(state.ack_sent(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadlines() {
        let counters = Arc::new(EntryCounters::default());
        let state = SeqState::new(4);

        let (resp_send, mut resp_recv) = tokio::sync::mpsc::unbounded_channel();
        let mut e = SendEntry::new(&counters, 1, 0, 0, 1, vec![], SendOptions {
            deadline: Some(Duration::from_secs(1)),
            response_target: Some(resp_send),
            ..Default::default()
        });
        e.seq = Some(state.assign_seq());
        state.record_sent(e);

        state.push_pending_front(vec![SendEntry::new(&counters, 1, 0, 0, 2, vec![], SendOptions {
            deadline: Some(Duration::from_secs(1)),
            ..Default::default()
        })]);
        state.push_pending_front(vec![SendEntry::new(&counters, 1, 0, 0, 3, vec![], SendOptions::default())]);

        let now = Instant::now();
        assert!(state.take_expired_pending(now).is_empty());
        state.expire_sent(now);
        assert!(resp_recv.try_recv().is_err());

        let later = now + Duration::from_secs(2);
        let expired = state.take_expired_pending(later);
        assert_eq!(expired.iter().map(|e| e.msg_id).collect::<Vec<_>>(), vec![2]);
        assert_eq!(state.num_pending(), 1);

        state.expire_sent(later);
        assert!(matches!(resp_recv.try_recv(), Ok(Event::Received(ReceivedData { error: Some(TransportError::Timeout(1)), .. }))));
        // the sent entry stays for re-sending
        assert_eq!(state.num_unacked(), 1);
    }

    #[test]
    fn test_take_all_and_reset() {
        let counters = Arc::new(EntryCounters::default());
        let state = sent_state(&counters, 3);
        state.push_pending_front(vec![SendEntry::new(&counters, 1, 0, 0, 9, vec![], SendOptions::default())]);

        let (pending, sent) = state.take_all();
        assert_eq!(pending.len(), 1);
        assert_eq!(sent.len(), 3);
        drop(pending);
        drop(sent);

        state.reset();
        assert_eq!(state.last_used_seq(), 0);
        assert_eq!(state.ack_seq(), 0);
        assert_eq!(state.num_unacked(), 0);
        assert_eq!(counters.outstanding(), 0);
    }
}
