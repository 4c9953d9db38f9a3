use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use bitflags::bitflags;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;
use crate::error::TransportError;
use crate::event_queue::{Event, EventQueue, ReceivedData, SentData};
use crate::wire::data_header::UNSEQUENCED;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct SendFlags: u8 {
        /// Bypass the reliable sequence: no sequence number, no retransmission, no reordering
        ///  on the receiving side
        const UNSEQUENCED = 0x01;
        /// Do not emit a [Event::Sent] when the message was written successfully. Failures
        ///  are still reported.
        const QUIET = 0x02;
    }
}

/// Outcome of a send as reported to an ack target
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SendCompletion {
    pub node: u32,
    pub msg_id: u64,
    pub result: Result<(), TransportError>,
}

#[derive(Clone, Default)]
pub struct SendOptions {
    pub flags: SendFlags,
    /// If the message is not written within this time, it fails with [TransportError::Timeout].
    ///  If it was written but not acknowledged by then, the response target is notified.
    pub deadline: Option<Duration>,
    /// Notified once, when the message was handed to a socket or failed before that
    pub ack_target: Option<mpsc::UnboundedSender<SendCompletion>>,
    /// Receives a synthesized [Event::Received] carrying the error if the message fails after
    ///  it was accepted, e.g. because the destination node died
    pub response_target: Option<mpsc::UnboundedSender<Event>>,
}

/// Counts created and released send entries, making leaks (or double releases, which the
///  type system rules out) observable
#[derive(Default, Debug)]
pub struct EntryCounters {
    created: AtomicU64,
    released: AtomicU64,
}
impl EntryCounters {
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Acquire)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Acquire)
    }

    pub fn outstanding(&self) -> u64 {
        // read 'released' first so a concurrent release can not make this underflow
        let released = self.released();
        self.created().saturating_sub(released)
    }
}

struct EntryTracker(Arc<EntryCounters>);
impl EntryTracker {
    fn new(counters: &Arc<EntryCounters>) -> EntryTracker {
        counters.created.fetch_add(1, Ordering::AcqRel);
        EntryTracker(counters.clone())
    }
}
impl Drop for EntryTracker {
    fn drop(&mut self) {
        self.0.released.fetch_add(1, Ordering::AcqRel);
    }
}

/// An outbound message. It lives in exactly one queue at a time (node pending queue,
///  connection send queue, or the node's sent list) and is released when dropped.
pub struct SendEntry {
    pub node: u32,
    pub src_tag: i16,
    pub dst_tag: i16,
    pub msg_id: u64,
    pub segments: Vec<Bytes>,
    pub flags: SendFlags,
    /// assigned when the entry is first handed to a socket, kept for every re-send
    pub seq: Option<i64>,
    pub deadline: Option<Instant>,
    ack_target: Option<mpsc::UnboundedSender<SendCompletion>>,
    response_target: Option<mpsc::UnboundedSender<Event>>,
    write_reported: bool,
    _tracker: EntryTracker,
}

impl SendEntry {
    pub fn new(
        counters: &Arc<EntryCounters>,
        node: u32,
        src_tag: i16,
        dst_tag: i16,
        msg_id: u64,
        segments: Vec<Bytes>,
        options: SendOptions,
    ) -> SendEntry {
        SendEntry {
            node,
            src_tag,
            dst_tag,
            msg_id,
            segments,
            flags: options.flags,
            seq: None,
            deadline: options.deadline.map(|d| Instant::now() + d),
            ack_target: options.ack_target,
            response_target: options.response_target,
            write_reported: false,
            _tracker: EntryTracker::new(counters),
        }
    }

    pub fn payload_len(&self) -> usize {
        self.segments.iter()
            .map(|s| s.len())
            .sum()
    }

    pub fn is_sequenced(&self) -> bool {
        !self.flags.contains(SendFlags::UNSEQUENCED)
    }

    pub fn wire_seq(&self) -> i64 {
        self.seq.unwrap_or(UNSEQUENCED)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }

    /// Reports the successful hand-off to a socket, at most once per entry
    pub fn report_written(&mut self, events: &EventQueue) {
        if self.write_reported {
            return;
        }
        self.write_reported = true;

        if let Some(ack_target) = self.ack_target.take() {
            let _ = ack_target.send(SendCompletion { node: self.node, msg_id: self.msg_id, result: Ok(()) });
        }
        if !self.flags.contains(SendFlags::QUIET) {
            events.push(Event::Sent(self.sent_data(None)));
        }
    }

    /// Notifies the response target (if it was not notified before) without releasing the
    ///  entry. Used for entries that must remain available for re-sending.
    pub fn notify_response_failure(&mut self, error: &TransportError) {
        if let Some(response_target) = self.response_target.take() {
            let _ = response_target.send(Event::Received(ReceivedData {
                node: self.node,
                src_tag: self.dst_tag,
                dst_tag: self.src_tag,
                msg_id: self.msg_id,
                seq: UNSEQUENCED,
                payload: Bytes::new(),
                error: Some(error.clone()),
            }));
        }
    }

    /// Reports a failure to every party that has not heard about this entry yet, and releases
    ///  the entry
    pub fn fail(mut self, error: TransportError, events: &EventQueue) {
        trace!("failing message {} to node {}: {}", self.msg_id, self.node, error);

        if !self.write_reported {
            self.write_reported = true;
            if let Some(ack_target) = self.ack_target.take() {
                let _ = ack_target.send(SendCompletion { node: self.node, msg_id: self.msg_id, result: Err(error.clone()) });
            }
            events.push(Event::Sent(self.sent_data(Some(error.clone()))));
        }
        self.notify_response_failure(&error);
    }

    pub fn resend_frame(&self) -> Option<ResendFrame> {
        self.seq.map(|seq| ResendFrame {
            seq,
            src_tag: self.src_tag,
            dst_tag: self.dst_tag,
            msg_id: self.msg_id,
            segments: self.segments.clone(),
        })
    }

    fn sent_data(&self, error: Option<TransportError>) -> SentData {
        SentData {
            node: self.node,
            src_tag: self.src_tag,
            dst_tag: self.dst_tag,
            msg_id: self.msg_id,
            error,
        }
    }
}

/// A copy of an already sequenced message. Re-sends are not send entries in their own right:
///  the entry stays in the sent list, and a lost re-send is simply re-sent again.
#[derive(Clone, Debug)]
pub struct ResendFrame {
    pub seq: i64,
    pub src_tag: i16,
    pub dst_tag: i16,
    pub msg_id: u64,
    pub segments: Vec<Bytes>,
}

/// An item in a connection's send queue
pub enum Outgoing {
    Fresh(SendEntry),
    Resend(ResendFrame),
}
