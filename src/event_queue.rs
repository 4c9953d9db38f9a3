use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use bytes::Bytes;
use tokio::select;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::trace;
use crate::error::TransportError;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// a remote node became active with a confirmed rank
    Joined(JoinedData),
    /// a remote node that had joined left the active state or died
    Dropped(DroppedData),
    InterfaceAdded(InterfaceData),
    InterfaceRemoved(InterfaceData),
    Received(ReceivedData),
    Sent(SentData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JoinedData {
    pub node: u32,
    pub rank: i32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DroppedData {
    pub node: u32,
    pub rank: i32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InterfaceData {
    pub name: String,
    pub ip: Ipv4Addr,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReceivedData {
    pub node: u32,
    pub src_tag: i16,
    pub dst_tag: i16,
    pub msg_id: u64,
    pub seq: i64,
    pub payload: Bytes,
    pub error: Option<TransportError>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SentData {
    pub node: u32,
    pub src_tag: i16,
    pub dst_tag: i16,
    pub msg_id: u64,
    pub error: Option<TransportError>,
}

/// FIFO of events for the application. Any task may push; `poll` is the single blocking
///  point for consumers. The receiver is locked only to take an event, never while waiting,
///  so concurrent pollers do not starve each other.
pub struct EventQueue {
    sender: mpsc::UnboundedSender<Event>,
    receiver: Mutex<mpsc::UnboundedReceiver<Event>>,
    available: Notify,
    wake: Notify,
    closed: AtomicBool,
}

impl EventQueue {
    pub fn new() -> EventQueue {
        let (sender, receiver) = mpsc::unbounded_channel();
        EventQueue {
            sender,
            receiver: Mutex::new(receiver),
            available: Notify::new(),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn push(&self, event: Event) {
        trace!("event: {:?}", event);
        // the receiver lives as long as self, so this can not fail
        let _ = self.sender.send(event);
        self.available.notify_waiters();
    }

    /// Makes a blocked (or the next) `poll` call return, with `None` if there is no event.
    ///  Wake-ups do not accumulate.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Events that are already queued are still returned by `poll`, after that it returns
    ///  `None` without blocking
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.available.notify_waiters();
        self.wake.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the next event, waiting up to `deadline`. `None` waits indefinitely,
    ///  `Some(Duration::ZERO)` only checks for an event that is already available.
    pub async fn poll(&self, deadline: Option<Duration>) -> Option<Event> {
        match deadline {
            None => self.do_poll().await,
            Some(d) if d.is_zero() => self.try_next().await,
            Some(d) => tokio::time::timeout(d, self.do_poll())
                .await
                .ok()
                .flatten(),
        }
    }

    async fn try_next(&self) -> Option<Event> {
        self.receiver.lock().await.try_recv().ok()
    }

    async fn do_poll(&self) -> Option<Event> {
        loop {
            // registered before checking, so a push in between is not missed
            let available = self.available.notified();
            tokio::pin!(available);
            available.as_mut().enable();

            if let Some(event) = self.try_next().await {
                return Some(event);
            }
            if self.is_closed() {
                return None;
            }

            select! {
                _ = &mut available => {}
                _ = self.wake.notified() => {
                    trace!("poll woken up");
                    return None;
                }
            }
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        EventQueue::new()
    }
}
