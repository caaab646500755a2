//! The ingestion engine: listener sockets, per-connection framed buffers, the
//! authenticating worker pool and the housekeeping threads around the key store.

pub mod bus;
pub mod config;
pub mod core;
pub mod handler;
pub mod housekeeping;
pub mod keyrequest;
pub mod keystore;
pub mod net;
pub mod queue;
pub mod secure;
pub mod sender;
pub mod shutdown;
pub mod state;

/// Socket identity as seen by the key store and the buffer tables. The store only
/// ever holds the descriptor number; the buffer slot owns the socket itself.
pub type SockId = i32;

/// Sentinel for messages that arrived over UDP and have no client socket.
pub const UDP_NO_CLIENT: SockId = -1;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Protocol {
    Tcp,
    Udp,
}
