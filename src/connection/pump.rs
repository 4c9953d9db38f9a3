use std::io::IoSlice;
use std::sync::Arc;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, trace};
use crate::connection::{self, Connection};
use crate::directory::Node;
use crate::error::TransportError;
use crate::reliability;
use crate::reliability::data_header_for;
use crate::reliability::send_entry::Outgoing;
use crate::wire::data_header::DataHeader;
use crate::transport::Shared;
use crate::util::safe_converter::SafeCast;

/// Writes a connection's queued items to its socket, one at a time and in queue order, until
///  the queue is empty or the connection fails. At most one pump runs per connection.
pub(crate) async fn pump(shared: Arc<Shared>, node: Arc<Node>, conn: Arc<Connection>, incarnation: u64, mut closed: watch::Receiver<bool>) {
    loop {
        let mut item = {
            let mut queue = conn.sqlock.lock();
            if !conn.is_current(incarnation) {
                // the failure handling took over the queue
                return;
            }
            match queue.items.pop_front() {
                Some(item) => item,
                None => {
                    queue.pumping = false;
                    return;
                }
            }
        };

        let header = frame_header(&node, &mut item);
        let mut buf = BytesMut::with_capacity(DataHeader::serialized_len(header.version));
        header.ser(&mut buf);

        match write_frame(&conn, incarnation, &mut closed, &buf.freeze(), segments(&item)).await {
            Ok(()) => {
                if let Some(ack_seq) = header.ack_seq {
                    node.seq.note_ack_sent(ack_seq);
                }
                trace!("wrote message {} to node {} on connection {}", header.seq, node.id, conn.slot);
                if let Outgoing::Fresh(entry) = item {
                    reliability::complete_write(&shared, &node, entry);
                }
            }
            Err(e) => {
                debug!("writing to node {} on connection {} failed: {}", node.id, conn.slot, e);
                give_back(&shared, &node, &conn, incarnation, item);
                connection::on_incarnation_error(&shared, &node, &conn, incarnation, &e.to_string());
                return;
            }
        }
    }
}

/// Serializes the data header for an item. Fresh sequenced entries get their sequence number
///  here, at the moment they are handed to a socket; entries coming back from a failed
///  connection keep the one they have.
fn frame_header(node: &Node, item: &mut Outgoing) -> DataHeader {
    match item {
        Outgoing::Fresh(entry) => {
            if entry.is_sequenced() && entry.seq.is_none() {
                entry.seq = Some(node.seq.assign_seq());
            }
            data_header_for(node, entry.src_tag, entry.dst_tag, entry.msg_id, entry.wire_seq(), entry.payload_len().safe_cast())
        }
        Outgoing::Resend(frame) => {
            let size = frame.segments.iter().map(|s| s.len()).sum::<usize>();
            data_header_for(node, frame.src_tag, frame.dst_tag, frame.msg_id, frame.seq, size.safe_cast())
        }
    }
}

fn segments(item: &Outgoing) -> &[Bytes] {
    match item {
        Outgoing::Fresh(entry) => &entry.segments,
        Outgoing::Resend(frame) => &frame.segments,
    }
}

/// Puts an item that could not be written back into circulation. While the connection is still
///  READY it goes back to the front of its queue, to be picked up by the failure handling with
///  the rest of the queue.
fn give_back(shared: &Arc<Shared>, node: &Arc<Node>, conn: &Arc<Connection>, incarnation: u64, item: Outgoing) {
    let mut queue = conn.sqlock.lock();
    if conn.is_current(incarnation) {
        queue.items.push_front(item);
        return;
    }
    drop(queue);
    connection::requeue(shared, node, vec![item]);
}

/// Writes a header and payload segments with vectored writes, resuming after partial writes
async fn write_frame(conn: &Connection, incarnation: u64, closed: &mut watch::Receiver<bool>, header: &Bytes, payload: &[Bytes]) -> Result<(), TransportError> {
    let _shared_fd = conn.fdlock.read().await;
    let mut writer = conn.wolock.lock().await;
    if !conn.is_current(incarnation) {
        return Err(TransportError::Socket("connection closed".to_string()));
    }
    let Some(writer) = writer.as_mut() else {
        return Err(TransportError::Socket("connection closed".to_string()));
    };

    let mut bufs = Vec::with_capacity(payload.len() + 1);
    bufs.push(header.clone());
    bufs.extend(payload.iter().filter(|s| !s.is_empty()).cloned());
    let total = bufs.iter().map(|b| b.len()).sum::<usize>();

    let mut bytes_already_sent = 0;
    while bytes_already_sent < total {
        let slices = remaining_slices(&bufs, bytes_already_sent);
        let n = tokio::select! {
            r = writer.write_vectored(&slices) => r?,
            _ = closed.changed() => return Err(TransportError::Socket("connection closed".to_string())),
        };
        if n == 0 {
            return Err(TransportError::Socket("connection closed by peer".to_string()));
        }
        bytes_already_sent += n;
    }
    Ok(())
}

/// IO slices for the part of `bufs` after the first `offset` bytes
fn remaining_slices(bufs: &[Bytes], mut offset: usize) -> Vec<IoSlice<'_>> {
    let mut result = Vec::with_capacity(bufs.len());
    for buf in bufs {
        if offset >= buf.len() {
            offset -= buf.len();
            continue;
        }
        result.push(IoSlice::new(&buf[offset..]));
        offset = 0;
    }
    result
}
