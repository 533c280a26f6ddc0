#![doc(issue_tracker_base_url = "https://github.com/tgen-rs/tgen/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

use bytes::Bytes;
use std::{fmt, net::SocketAddr};
use thiserror::Error;

pub mod loopback;
pub use loopback::{LinkOptions, LinkStats, Loopback, LoopbackSocket};

/// Invoked once when a stream connection attempt completes.
pub type ConnectedCallback = Box<dyn FnMut(Result<(), TransportError>)>;
/// Invoked when buffer space frees up after a short send. Receives the free space in bytes.
pub type SendSpaceCallback = Box<dyn FnMut(usize)>;
/// Invoked for every payload received, with the sender's address.
pub type ReceiveCallback = Box<dyn FnMut(Bytes, SocketAddr)>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection refused by {0}")]
    ConnectionRefused(SocketAddr),
    #[error("Socket not connected")]
    NotConnected,
    #[error("Socket closed")]
    Closed,
    #[error("Message too long: {size} bytes (max {max})")]
    MessageTooLong { size: usize, max: usize },
    #[error("Address already in use: {0}")]
    AddrInUse(SocketAddr),
    #[error("Socket limit reached ({0} open)")]
    SocketLimit(usize),
    #[error("Invalid socket state: {0}")]
    InvalidState(&'static str),
}

/// The delivery semantics of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SocketKind {
    /// Connectionless, message-oriented, unreliable (UDP-like).
    #[default]
    Datagram,
    /// Connection-oriented byte stream with a bounded send buffer (TCP-like).
    Stream,
}

impl SocketKind {
    /// Returns `true` if sending requires an established connection.
    #[inline]
    pub const fn is_connection_oriented(&self) -> bool {
        matches!(self, Self::Stream)
    }
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Datagram => f.write_str("datagram"),
            Self::Stream => f.write_str("stream"),
        }
    }
}

/// Non-blocking socket facade.
///
/// Callbacks registered on a socket are never invoked from inside one of its
/// methods: implementations deliver them from scheduler events, so a callback may
/// freely call back into the socket's owner.
pub trait Socket {
    fn kind(&self) -> SocketKind;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn bind(&mut self, addr: SocketAddr) -> Result<(), TransportError>;

    /// Sets the default peer. For stream sockets this starts the handshake, whose
    /// result is reported through the connected callback.
    fn connect(&mut self, peer: SocketAddr) -> Result<(), TransportError>;

    /// Offers `payload` to the transport and returns how many bytes were accepted.
    /// Accepting fewer bytes than offered signals backpressure: the caller should
    /// wait for the send-space callback before offering the rest.
    fn send(&mut self, payload: Bytes) -> Result<usize, TransportError>;

    fn set_connected_callback(&mut self, callback: ConnectedCallback);

    fn set_send_space_callback(&mut self, callback: SendSpaceCallback);

    fn set_receive_callback(&mut self, callback: ReceiveCallback);

    /// Closes the socket. Idempotent.
    fn close(&mut self);
}

/// Creates sockets on behalf of applications.
pub trait SocketFactory {
    fn create_socket(&self, kind: SocketKind) -> Result<Box<dyn Socket>, TransportError>;
}
