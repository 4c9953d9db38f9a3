//! Utilities for testing code based on this crate: a fixed interface list instead of the OS's,
//!  and transports wired up on localhost with short timers. They are used for the crate's own
//!  tests, but they are part of the regular (non-#[cfg(test)]) code so applications can use them
//!  for their tests as well.

pub mod localhost;
