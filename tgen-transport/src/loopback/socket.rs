use std::{
    cell::RefCell,
    fmt,
    net::SocketAddr,
    rc::{Rc, Weak},
    time::Duration,
};

use bytes::Bytes;
use tracing::{debug, trace};

use tgen_common::Scheduler;

use super::{Loopback, LOCALHOST};
use crate::{
    ConnectedCallback, ReceiveCallback, SendSpaceCallback, Socket, SocketKind, TransportError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Open,
    Connecting,
    Connected,
    Closed,
}

/// Socket state shared with the network and with pending events.
pub(crate) struct Shared {
    id: u64,
    kind: SocketKind,
    state: State,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    /// Stream bytes accepted but not yet on the wire.
    buffered: usize,
    /// Set when a send came up short; cleared by the next send-space notification.
    blocked: bool,
    /// When the egress link is free again.
    next_free: Duration,
    on_connected: Option<ConnectedCallback>,
    on_send_space: Option<SendSpaceCallback>,
    on_receive: Option<ReceiveCallback>,
}

/// Hands a payload to the socket's receive callback, if any.
pub(crate) fn notify_receive(shared: &Rc<RefCell<Shared>>, payload: Bytes, from: SocketAddr) {
    // The callback is taken out for the duration of the call so it can reach back
    // into the socket.
    let callback = shared.borrow_mut().on_receive.take();
    if let Some(mut callback) = callback {
        callback(payload, from);
        let mut this = shared.borrow_mut();
        if this.state != State::Closed && this.on_receive.is_none() {
            this.on_receive = Some(callback);
        }
    }
}

fn notify_connected(shared: &Rc<RefCell<Shared>>, result: Result<(), TransportError>) {
    let callback = shared.borrow_mut().on_connected.take();
    if let Some(mut callback) = callback {
        callback(result);
        let mut this = shared.borrow_mut();
        if this.state != State::Closed && this.on_connected.is_none() {
            this.on_connected = Some(callback);
        }
    }
}

fn notify_send_space(shared: &Rc<RefCell<Shared>>, free: usize) {
    let callback = shared.borrow_mut().on_send_space.take();
    if let Some(mut callback) = callback {
        callback(free);
        let mut this = shared.borrow_mut();
        if this.state != State::Closed && this.on_send_space.is_none() {
            this.on_send_space = Some(callback);
        }
    }
}

/// A socket on a [`Loopback`] network. Closed on drop.
pub struct LoopbackSocket<S> {
    net: Loopback<S>,
    shared: Rc<RefCell<Shared>>,
}

impl<S: Scheduler + Clone + 'static> LoopbackSocket<S> {
    pub(crate) fn new(net: Loopback<S>, id: u64, kind: SocketKind) -> Self {
        let shared = Shared {
            id,
            kind,
            state: State::Open,
            local: None,
            peer: None,
            buffered: 0,
            blocked: false,
            next_free: Duration::ZERO,
            on_connected: None,
            on_send_space: None,
            on_receive: None,
        };

        Self { net, shared: Rc::new(RefCell::new(shared)) }
    }

    /// The connected peer, if any.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.borrow().peer
    }

    /// Stream bytes accepted but not yet on the wire.
    pub fn buffered(&self) -> usize {
        self.shared.borrow().buffered
    }

    fn ensure_bound(&mut self) -> Result<SocketAddr, TransportError> {
        if let Some(local) = self.shared.borrow().local {
            return Ok(local);
        }

        self.bind(SocketAddr::new(LOCALHOST, 0))?;
        self.shared.borrow().local.ok_or(TransportError::InvalidState("unbound"))
    }

    /// Reserves egress time for `len` bytes. Returns the delay until the bytes have
    /// left the socket and the delay until they reach the peer.
    fn reserve_link(&self, len: usize) -> (Duration, Duration) {
        let (latency, bandwidth) = {
            let fabric = self.net.fabric.borrow();
            (fabric.options.latency, fabric.options.bandwidth)
        };

        let now = self.net.scheduler.now();
        let tx_time = bandwidth.map_or(Duration::ZERO, |bw| bw.tx_time(len as u64));

        let mut shared = self.shared.borrow_mut();
        let departure = shared.next_free.max(now) + tx_time;
        shared.next_free = departure;

        let departs_in = departure - now;
        (departs_in, departs_in + latency)
    }

    fn send_datagram(&mut self, payload: Bytes) -> Result<usize, TransportError> {
        let peer = self.shared.borrow().peer.ok_or(TransportError::NotConnected)?;

        let max = self.net.fabric.borrow().options.max_datagram;
        if payload.len() > max {
            return Err(TransportError::MessageTooLong { size: payload.len(), max });
        }

        let local = self.ensure_bound()?;
        let len = payload.len();
        let (_, arrives_in) = self.reserve_link(len);

        let lost = {
            let mut fabric = self.net.fabric.borrow_mut();
            let lost = fabric.roll_loss();
            if lost {
                fabric.stats.increment_lost();
            }
            lost
        };

        if lost {
            trace!(%local, %peer, size = len, "Datagram lost");
        } else {
            self.net.deliver(arrives_in, SocketKind::Datagram, local, peer, payload);
        }

        Ok(len)
    }

    fn send_stream(&mut self, payload: Bytes) -> Result<usize, TransportError> {
        let (state, local, peer) = {
            let shared = self.shared.borrow();
            (shared.state, shared.local, shared.peer)
        };

        let (Some(local), Some(peer)) = (local, peer) else {
            return Err(TransportError::NotConnected);
        };
        if state != State::Connected {
            return Err(TransportError::NotConnected);
        }

        let tx_buffer = self.net.fabric.borrow().options.tx_buffer;
        let accepted = {
            let mut shared = self.shared.borrow_mut();
            let free = tx_buffer.saturating_sub(shared.buffered);
            let accepted = payload.len().min(free);
            if accepted < payload.len() {
                shared.blocked = true;
            }
            shared.buffered += accepted;
            accepted
        };

        if accepted == 0 {
            trace!(%local, size = payload.len(), "Send buffer full");
            return Ok(0);
        }

        let (departs_in, arrives_in) = self.reserve_link(accepted);

        // Free the buffer once the bytes are on the wire
        let weak = Rc::downgrade(&self.shared);
        self.net.scheduler.schedule(departs_in, Box::new(move || on_departure(&weak, accepted, tx_buffer)));

        self.net.deliver(arrives_in, SocketKind::Stream, local, peer, payload.slice(..accepted));

        Ok(accepted)
    }
}

fn on_departure(weak: &Weak<RefCell<Shared>>, len: usize, tx_buffer: usize) {
    let Some(shared) = weak.upgrade() else { return };

    let free = {
        let mut this = shared.borrow_mut();
        this.buffered = this.buffered.saturating_sub(len);
        if !this.blocked || this.state != State::Connected {
            return;
        }
        this.blocked = false;
        tx_buffer.saturating_sub(this.buffered)
    };

    trace!(socket = shared.borrow().id, free, "Send space available");
    notify_send_space(&shared, free);
}

fn on_handshake<S: Scheduler + Clone + 'static>(
    weak: &Weak<RefCell<Shared>>,
    net: &Loopback<S>,
    peer: SocketAddr,
) {
    let Some(shared) = weak.upgrade() else { return };
    if shared.borrow().state != State::Connecting {
        return;
    }

    let listening = net.fabric.borrow().endpoint(SocketKind::Stream, peer).is_some();
    let result = {
        let mut this = shared.borrow_mut();
        if listening {
            this.state = State::Connected;
            Ok(())
        } else {
            this.state = State::Open;
            this.peer = None;
            Err(TransportError::ConnectionRefused(peer))
        }
    };

    debug!(socket = shared.borrow().id, %peer, ?result, "Stream handshake finished");
    notify_connected(&shared, result);
}

impl<S: Scheduler + Clone + 'static> Socket for LoopbackSocket<S> {
    fn kind(&self) -> SocketKind {
        self.shared.borrow().kind
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.borrow().local
    }

    fn bind(&mut self, addr: SocketAddr) -> Result<(), TransportError> {
        let (state, kind, local) = {
            let shared = self.shared.borrow();
            (shared.state, shared.kind, shared.local)
        };

        if state == State::Closed {
            return Err(TransportError::Closed);
        }
        if local.is_some() {
            return Err(TransportError::InvalidState("already bound"));
        }

        let bound = self.net.fabric.borrow_mut().register(kind, addr, &self.shared)?;
        self.shared.borrow_mut().local = Some(bound);

        trace!(socket = self.shared.borrow().id, %kind, addr = %bound, "Bound socket");
        Ok(())
    }

    fn connect(&mut self, peer: SocketAddr) -> Result<(), TransportError> {
        let (state, kind) = {
            let shared = self.shared.borrow();
            (shared.state, shared.kind)
        };

        match state {
            State::Closed => return Err(TransportError::Closed),
            State::Connecting | State::Connected if kind == SocketKind::Stream => {
                return Err(TransportError::InvalidState("already connected"))
            }
            _ => {}
        }

        self.ensure_bound()?;

        if kind == SocketKind::Datagram {
            let mut shared = self.shared.borrow_mut();
            shared.peer = Some(peer);
            shared.state = State::Connected;
            return Ok(());
        }

        {
            let mut shared = self.shared.borrow_mut();
            shared.peer = Some(peer);
            shared.state = State::Connecting;
        }

        // Connection is established after one round trip
        let rtt = self.net.fabric.borrow().options.latency * 2;
        let weak = Rc::downgrade(&self.shared);
        let net = self.net.clone();
        self.net.scheduler.schedule(rtt, Box::new(move || on_handshake(&weak, &net, peer)));

        debug!(socket = self.shared.borrow().id, %peer, "Connecting");
        Ok(())
    }

    fn send(&mut self, payload: Bytes) -> Result<usize, TransportError> {
        let (state, kind) = {
            let shared = self.shared.borrow();
            (shared.state, shared.kind)
        };

        if state == State::Closed {
            return Err(TransportError::Closed);
        }

        match kind {
            SocketKind::Datagram => self.send_datagram(payload),
            SocketKind::Stream => self.send_stream(payload),
        }
    }

    fn set_connected_callback(&mut self, callback: ConnectedCallback) {
        self.shared.borrow_mut().on_connected = Some(callback);
    }

    fn set_send_space_callback(&mut self, callback: SendSpaceCallback) {
        self.shared.borrow_mut().on_send_space = Some(callback);
    }

    fn set_receive_callback(&mut self, callback: ReceiveCallback) {
        self.shared.borrow_mut().on_receive = Some(callback);
    }

    fn close(&mut self) {
        if self.teardown() {
            trace!(socket = self.shared.borrow().id, "Closed socket");
        }
    }
}

impl<S> LoopbackSocket<S> {
    /// Marks the socket closed, drops its callbacks and releases its address.
    /// Returns `false` if it was already closed.
    fn teardown(&mut self) -> bool {
        let (kind, local) = {
            let mut shared = self.shared.borrow_mut();
            if shared.state == State::Closed {
                return false;
            }

            shared.state = State::Closed;
            shared.on_connected = None;
            shared.on_send_space = None;
            shared.on_receive = None;
            (shared.kind, shared.local)
        };

        let mut fabric = self.net.fabric.borrow_mut();
        match local {
            Some(addr) => fabric.unregister(kind, addr, &self.shared),
            None => fabric.open = fabric.open.saturating_sub(1),
        }
        true
    }
}

impl<S> Drop for LoopbackSocket<S> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<S> fmt::Debug for LoopbackSocket<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.borrow();
        f.debug_struct("LoopbackSocket")
            .field("id", &shared.id)
            .field("kind", &shared.kind)
            .field("state", &shared.state)
            .field("local", &shared.local)
            .field("peer", &shared.peer)
            .field("buffered", &shared.buffered)
            .finish()
    }
}
