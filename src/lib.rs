//! Reliable node-to-node messaging for a cluster of processes.
//!
//! Nodes find each other with UDP hello messages (sent to configured contacts and subnet
//!  broadcast addresses) and exchange data over pools of TCP connections, one pool per peer,
//!  spread over all usable interface pairs ('paths'). On top of that, messages to a peer carry
//!  sequence numbers and piggybacked acknowledgements, so they are delivered exactly once and
//!  in order even when connections fail and messages are re-sent on other connections.
//!
//! Nodes also agree on a dense numbering ('ranks'), either statically configured or negotiated.
//!
//! Application code interacts through [transport::Transport]: `send` / `send_gather` and
//!  `poll` for [event_queue::Event]s.

pub mod config;
pub mod connection;
pub mod directory;
pub mod discovery;
pub mod error;
pub mod event_queue;
mod liveness;
pub mod path;
pub mod reliability;
pub mod test_util;
pub mod transport;
pub mod util;
pub mod wire;

pub use config::TransportConfig;
pub use error::{TransportError, TransportResult};
pub use event_queue::Event;
pub use reliability::send_entry::{SendFlags, SendOptions};
pub use transport::{MessageId, Transport};
