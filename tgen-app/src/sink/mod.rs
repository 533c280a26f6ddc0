use std::{
    cell::RefCell,
    fmt,
    net::SocketAddr,
    rc::{Rc, Weak},
};

use thiserror::Error;
use tracing::{debug, trace};

use tgen_common::Scheduler;
use tgen_transport::{Socket, SocketFactory, SocketKind, TransportError};

use crate::app::Application;

mod stats;
pub use stats::{PeerStats, ReceiveStats};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Socket creation failed: {0}")]
    Socket(#[source] TransportError),
    #[error("Bind failed: {0}")]
    Bind(#[source] TransportError),
    #[error("Sink already started")]
    AlreadyStarted,
}

#[derive(Debug, Clone)]
pub struct SinkOptions {
    /// The kind of socket to listen on.
    kind: SocketKind,
    /// Whether to read probe headers for delay and sequence tracking.
    timestamps: bool,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self { kind: SocketKind::Datagram, timestamps: true }
    }
}

impl SinkOptions {
    /// Sets the socket kind to listen on.
    pub fn kind(mut self, kind: SocketKind) -> Self {
        self.kind = kind;
        self
    }

    /// Enables or disables probe header parsing.
    pub fn timestamps(mut self, timestamps: bool) -> Self {
        self.timestamps = timestamps;
        self
    }
}

struct SinkInner<S> {
    scheduler: S,
    factory: Box<dyn SocketFactory>,
    /// The requested listen address.
    local: SocketAddr,
    options: SinkOptions,
    socket: Option<Box<dyn Socket>>,
    stats: ReceiveStats,
    started: bool,
}

impl<S: Scheduler> SinkInner<S> {
    fn on_receive(&mut self, payload: &[u8], from: SocketAddr) {
        let now = self.scheduler.now();
        trace!(%from, size = payload.len(), "Received payload");

        if self.options.timestamps {
            self.stats.record(now, payload, from);
        } else {
            self.stats.record_untimed(now, payload, from);
        }
    }
}

/// Listens on an address and records every payload it receives.
///
/// Like [`TrafficGenerator`](crate::TrafficGenerator), a `PacketSink` is a handle
/// and clones share the same counters.
pub struct PacketSink<S> {
    inner: Rc<RefCell<SinkInner<S>>>,
}

impl<S> Clone for PacketSink<S> {
    fn clone(&self) -> Self {
        Self { inner: Rc::clone(&self.inner) }
    }
}

impl<S: Scheduler + Clone + 'static> PacketSink<S> {
    pub fn new(
        scheduler: S,
        factory: impl SocketFactory + 'static,
        local: SocketAddr,
        options: SinkOptions,
    ) -> Self {
        let inner = SinkInner {
            scheduler,
            factory: Box::new(factory),
            local,
            options,
            socket: None,
            stats: ReceiveStats::default(),
            started: false,
        };

        Self { inner: Rc::new(RefCell::new(inner)) }
    }

    /// Creates and binds the listening socket. A sink starts once.
    pub fn start(&self) -> Result<(), SinkError> {
        let mut inner = self.inner.borrow_mut();
        if inner.started {
            return Err(SinkError::AlreadyStarted);
        }

        let mut socket = inner.factory.create_socket(inner.options.kind).map_err(SinkError::Socket)?;
        socket.bind(inner.local).map_err(SinkError::Bind)?;

        let weak: Weak<RefCell<SinkInner<S>>> = Rc::downgrade(&self.inner);
        socket.set_receive_callback(Box::new(move |payload, from| {
            if let Some(inner) = weak.upgrade() {
                inner.borrow_mut().on_receive(&payload, from);
            }
        }));

        debug!(local = ?socket.local_addr(), kind = %inner.options.kind, "Sink listening");
        inner.socket = Some(socket);
        inner.started = true;

        Ok(())
    }

    /// Closes the socket. Counters are kept.
    pub fn stop(&self) {
        let socket = self.inner.borrow_mut().socket.take();
        if let Some(mut socket) = socket {
            socket.close();
            debug!(stats = %self.inner.borrow().stats, "Sink stopped");
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> ReceiveStats {
        self.inner.borrow().stats.clone()
    }

    /// Clears the counters.
    pub fn reset(&self) {
        self.inner.borrow_mut().stats = ReceiveStats::default();
    }

    /// The bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.borrow().socket.as_ref().and_then(|socket| socket.local_addr())
    }
}

impl<S: Scheduler + Clone + 'static> Application for PacketSink<S> {
    type Error = SinkError;

    fn start(&self) -> Result<(), Self::Error> {
        PacketSink::start(self)
    }

    fn stop(&self) {
        PacketSink::stop(self)
    }
}

impl<S> fmt::Debug for PacketSink<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => f
                .debug_struct("PacketSink")
                .field("local", &inner.local)
                .field("options", &inner.options)
                .field("stats", &inner.stats)
                .finish(),
            Err(_) => f.debug_struct("PacketSink").finish_non_exhaustive(),
        }
    }
}
