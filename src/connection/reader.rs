use std::sync::Arc;
use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::connection::{self, Connection};
use crate::directory::Node;
use crate::error::TransportError;
use crate::reliability;
use crate::transport::Shared;
use crate::wire::data_header::DataHeader;

/// Reads messages from a connection until the connection fails or is closed. A read error, a
///  malformed header or an oversized message takes the connection out of service.
pub(crate) async fn read_loop(shared: Arc<Shared>, node: Arc<Node>, conn: Arc<Connection>, incarnation: u64, mut closed: watch::Receiver<bool>) {
    if let Err(e) = do_read_loop(&shared, &node, &conn, incarnation, &mut closed).await {
        debug!("reading from node {} on connection {} failed: {}", node.id, conn.slot, e);
        connection::on_incarnation_error(&shared, &node, &conn, incarnation, &e.to_string());
    }
}

async fn do_read_loop(shared: &Arc<Shared>, node: &Arc<Node>, conn: &Connection, incarnation: u64, closed: &mut watch::Receiver<bool>) -> Result<(), TransportError> {
    let _shared_fd = conn.fdlock.read().await;
    let mut reader = conn.rolock.lock().await;
    let Some(reader) = reader.as_mut() else {
        return Ok(());
    };

    let version = node.version();
    let mut header_buf = vec![0u8; DataHeader::serialized_len(version)];

    loop {
        tokio::select! {
            r = reader.read_exact(&mut header_buf) => { r?; }
            _ = closed.changed() => return Ok(()),
        }
        let header = DataHeader::deser(&mut header_buf.as_slice(), version)?;

        let size = usize::try_from(header.size).unwrap_or(usize::MAX);
        if size > shared.config.max_message_size {
            return Err(TransportError::PayloadTooLarge { size, max_size: shared.config.max_message_size });
        }

        let mut payload = BytesMut::zeroed(size);
        if size > 0 {
            tokio::select! {
                r = reader.read_exact(&mut payload) => { r?; }
                _ = closed.changed() => return Ok(()),
            }
        }

        if !conn.is_current(incarnation) {
            return Ok(());
        }
        if let Some(path) = conn.path() {
            path.touch(Instant::now());
        }
        trace!("received message {} ({} bytes) from node {} on connection {}", header.seq, size, node.id, conn.slot);
        reliability::on_incoming(shared, node, header, payload.freeze());
    }
}
