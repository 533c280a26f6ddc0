//! An in-memory network for simulated sockets.
//!
//! Every socket created from a [`Loopback`] shares one address space. Payloads are
//! delivered through the scheduler after their serialization time (when a
//! bandwidth is configured) plus the link latency. Stream sockets model a bounded
//! send buffer so senders see partial sends and send-space notifications.

use std::{
    cell::RefCell,
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    rc::{Rc, Weak},
    time::Duration,
};

use bytes::Bytes;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tracing::trace;

use tgen_common::{constants::KiB, DataRate, Scheduler};

use crate::{Socket, SocketFactory, SocketKind, TransportError};

mod socket;
pub use socket::LoopbackSocket;
use socket::Shared;

mod stats;
pub use stats::LinkStats;

/// The largest UDP payload over IPv4.
const DEFAULT_MAX_DATAGRAM: usize = 65_507;

/// First port handed out to sockets that were not bound explicitly.
const EPHEMERAL_PORT_START: u16 = 49_152;

#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// One-way latency applied to every payload.
    latency: Duration,
    /// Per-socket egress bandwidth. `None` puts payloads on the wire instantly.
    bandwidth: Option<DataRate>,
    /// Probability in `[0, 1]` that a datagram is dropped. Streams are lossless.
    loss_rate: f64,
    /// Send buffer size of stream sockets, in bytes.
    tx_buffer: usize,
    /// Largest datagram accepted by `send`.
    max_datagram: usize,
    /// Maximum number of open sockets, if any.
    max_sockets: Option<usize>,
    /// Seed of the loss process.
    seed: u64,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(1),
            bandwidth: None,
            loss_rate: 0.0,
            tx_buffer: 128 * KiB as usize,
            max_datagram: DEFAULT_MAX_DATAGRAM,
            max_sockets: None,
            seed: 0,
        }
    }
}

impl LinkOptions {
    /// Sets the one-way latency.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Sets the per-socket egress bandwidth.
    pub fn bandwidth(mut self, bandwidth: DataRate) -> Self {
        self.bandwidth = Some(bandwidth);
        self
    }

    /// Sets the datagram loss probability. Values are clamped to `[0, 1]`.
    pub fn loss_rate(mut self, loss_rate: f64) -> Self {
        self.loss_rate = if loss_rate.is_nan() { 0.0 } else { loss_rate.clamp(0.0, 1.0) };
        self
    }

    /// Sets the stream send buffer size in bytes. A stream socket always buffers
    /// at least one byte, so zero is raised to one.
    pub fn tx_buffer(mut self, tx_buffer: usize) -> Self {
        self.tx_buffer = tx_buffer.max(1);
        self
    }

    /// Sets the largest datagram accepted by `send`.
    pub fn max_datagram(mut self, max_datagram: usize) -> Self {
        self.max_datagram = max_datagram;
        self
    }

    /// Limits the number of simultaneously open sockets.
    pub fn max_sockets(mut self, max_sockets: usize) -> Self {
        self.max_sockets = Some(max_sockets);
        self
    }

    /// Seeds the loss process.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Shared state of the network.
pub(crate) struct Fabric {
    pub(crate) options: LinkOptions,
    /// Bound sockets, by kind and local address.
    endpoints: FxHashMap<(SocketKind, SocketAddr), Weak<RefCell<Shared>>>,
    next_port: u16,
    next_id: u64,
    open: usize,
    rng: StdRng,
    pub(crate) stats: LinkStats,
}

impl Fabric {
    fn is_bound(&self, kind: SocketKind, addr: SocketAddr) -> bool {
        self.endpoints.get(&(kind, addr)).is_some_and(|ep| ep.strong_count() > 0)
    }

    /// Registers `shared` at `addr`. A port of 0 picks a free ephemeral port.
    pub(crate) fn register(
        &mut self,
        kind: SocketKind,
        mut addr: SocketAddr,
        shared: &Rc<RefCell<Shared>>,
    ) -> Result<SocketAddr, TransportError> {
        if addr.port() == 0 {
            addr.set_port(self.ephemeral_port(kind, addr.ip())?);
        }

        if self.is_bound(kind, addr) {
            return Err(TransportError::AddrInUse(addr));
        }

        self.endpoints.insert((kind, addr), Rc::downgrade(shared));
        Ok(addr)
    }

    pub(crate) fn unregister(&mut self, kind: SocketKind, addr: SocketAddr, shared: &Rc<RefCell<Shared>>) {
        let key = (kind, addr);
        if self.endpoints.get(&key).is_some_and(|ep| ep.as_ptr() == Rc::as_ptr(shared)) {
            self.endpoints.remove(&key);
        }
        self.open = self.open.saturating_sub(1);
    }

    pub(crate) fn endpoint(&self, kind: SocketKind, addr: SocketAddr) -> Option<Rc<RefCell<Shared>>> {
        self.endpoints.get(&(kind, addr)).and_then(Weak::upgrade)
    }

    fn ephemeral_port(&mut self, kind: SocketKind, ip: IpAddr) -> Result<u16, TransportError> {
        let range = usize::from(u16::MAX - EPHEMERAL_PORT_START) + 1;
        for _ in 0..range {
            let port = self.next_port;
            self.next_port =
                if port == u16::MAX { EPHEMERAL_PORT_START } else { port + 1 };

            if !self.is_bound(kind, SocketAddr::new(ip, port)) {
                return Ok(port);
            }
        }

        Err(TransportError::AddrInUse(SocketAddr::new(ip, 0)))
    }

    /// Returns `true` if the loss process drops the next datagram.
    pub(crate) fn roll_loss(&mut self) -> bool {
        let p = self.options.loss_rate;
        p > 0.0 && self.rng.gen_bool(p)
    }
}

/// A simulated network of [`LoopbackSocket`]s, driven by a [`Scheduler`].
pub struct Loopback<S> {
    pub(crate) fabric: Rc<RefCell<Fabric>>,
    pub(crate) scheduler: S,
}

impl<S: Clone> Clone for Loopback<S> {
    fn clone(&self) -> Self {
        Self { fabric: Rc::clone(&self.fabric), scheduler: self.scheduler.clone() }
    }
}

impl<S: Scheduler + Clone + 'static> Loopback<S> {
    pub fn new(scheduler: S, options: LinkOptions) -> Self {
        let fabric = Fabric {
            rng: StdRng::seed_from_u64(options.seed),
            options,
            endpoints: FxHashMap::default(),
            next_port: EPHEMERAL_PORT_START,
            next_id: 0,
            open: 0,
            stats: LinkStats::default(),
        };

        Self { fabric: Rc::new(RefCell::new(fabric)), scheduler }
    }

    /// Creates an unbound socket of the given kind.
    pub fn socket(&self, kind: SocketKind) -> Result<LoopbackSocket<S>, TransportError> {
        let id = {
            let mut fabric = self.fabric.borrow_mut();
            if let Some(max) = fabric.options.max_sockets {
                if fabric.open >= max {
                    return Err(TransportError::SocketLimit(fabric.open));
                }
            }

            fabric.open += 1;
            fabric.next_id += 1;
            fabric.next_id
        };

        trace!(socket = id, %kind, "Created loopback socket");
        Ok(LoopbackSocket::new(self.clone(), id, kind))
    }

    /// Snapshot of the network counters.
    pub fn stats(&self) -> LinkStats {
        self.fabric.borrow().stats
    }

    /// Number of sockets that are open.
    pub fn open_sockets(&self) -> usize {
        self.fabric.borrow().open
    }

    pub fn options(&self) -> LinkOptions {
        self.fabric.borrow().options.clone()
    }

    /// Schedules delivery of `payload` from `from` to whatever is bound at `to` when
    /// the event fires.
    pub(crate) fn deliver(
        &self,
        delay: Duration,
        kind: SocketKind,
        from: SocketAddr,
        to: SocketAddr,
        payload: Bytes,
    ) {
        let net = self.clone();
        self.scheduler.schedule(
            delay,
            Box::new(move || {
                let endpoint = net.fabric.borrow().endpoint(kind, to);
                let Some(endpoint) = endpoint else {
                    trace!(%from, %to, size = payload.len(), "No endpoint bound, dropping payload");
                    net.fabric.borrow_mut().stats.increment_unreachable();
                    return;
                };

                net.fabric.borrow_mut().stats.increment_delivered(payload.len());
                socket::notify_receive(&endpoint, payload, from);
            }),
        );
    }
}

impl<S: Scheduler + Clone + 'static> SocketFactory for Loopback<S> {
    fn create_socket(&self, kind: SocketKind) -> Result<Box<dyn Socket>, TransportError> {
        Ok(Box::new(self.socket(kind)?))
    }
}

impl<S> fmt::Debug for Loopback<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fabric = self.fabric.borrow();
        f.debug_struct("Loopback")
            .field("options", &fabric.options)
            .field("open", &fabric.open)
            .field("stats", &fabric.stats)
            .finish()
    }
}

/// The address ephemeral sockets bind to.
pub(crate) const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
