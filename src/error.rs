use thiserror::Error;

/// The error taxonomy that callers observe - either as the `Err` of a public call, or inside an
///  [crate::event_queue::Event] / completion notification for failures that happen after a send
///  was accepted.
///
/// This type is `Clone` because one failure (e.g. a node going down) is typically reported to
///  many outstanding operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unsupported protocol version {got} (max supported {supported})")]
    BadVersion { got: u16, supported: u16 },

    #[error("truncated buffer: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("socket error: {0}")]
    Socket(String),

    #[error("node {0} is dead")]
    NodeDead(u32),

    #[error("no acknowledgement from node {0} before the deadline")]
    Timeout(u32),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown node {0}")]
    UnknownNode(u32),

    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge { size: usize, max_size: usize },

    #[error("transport is shut down")]
    ShutDown,
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Socket(e.to_string())
    }
}

pub type TransportResult<T> = Result<T, TransportError>;
