use std::{
    cell::RefCell,
    net::SocketAddr,
    rc::{Rc, Weak},
    time::Duration,
};

use bytes::Bytes;
use tracing::{debug, error, info, trace};

use tgen_common::{EventId, Scheduler};
use tgen_transport::{Socket, SocketFactory, TransportError};
use tgen_wire::probe::{self, Header};

use super::{GeneratorError, GeneratorOptions, GeneratorReport, Outcome, State};
use crate::spec::{ConfigError, Rate, TrafficSpec};

type FinishCallback = Box<dyn FnOnce(&GeneratorReport)>;

/// Runs `f` on the driver, then fires the finish callback if `f` stopped the
/// generator. The callback runs after the driver borrow ends so it may use the
/// generator handle.
pub(super) fn with_driver<S, R>(
    inner: &Rc<RefCell<Driver<S>>>,
    f: impl FnOnce(&mut Driver<S>) -> R,
) -> R {
    let (out, finished) = {
        let mut driver = inner.borrow_mut();
        let out = f(&mut driver);
        (out, driver.take_finished())
    };

    if let Some((callback, report)) = finished {
        callback(&report);
    }

    out
}

/// Upgrades a weak driver reference from inside a callback. The callback is a
/// no-op once the generator is gone.
fn upgrade_with<S>(this: &Weak<RefCell<Driver<S>>>, f: impl FnOnce(&mut Driver<S>)) {
    if let Some(inner) = this.upgrade() {
        with_driver(&inner, f);
    }
}

/// The generator state machine.
pub(super) struct Driver<S> {
    /// Weak self-reference handed to every callback.
    this: Weak<RefCell<Driver<S>>>,
    scheduler: S,
    factory: Box<dyn SocketFactory>,
    peer: SocketAddr,
    spec: TrafficSpec,
    options: GeneratorOptions,
    state: State,
    /// Owned for the duration of `Running`.
    socket: Option<Box<dyn Socket>>,
    /// The single pending send timer.
    timer: Option<EventId>,
    /// Current pacing of a constant-rate spec.
    rate: Option<Rate>,
    /// When `start` was called.
    started_at: Duration,
    /// Origin of the send timeline. Set once sending may begin: at start for
    /// datagrams, on connection for streams.
    anchor: Option<Duration>,
    /// Index of the next packet to send.
    next: usize,
    seq: u32,
    /// Unsent tail of a packet the transport only partially accepted.
    pending: Option<Bytes>,
    report: GeneratorReport,
    on_finish: Option<FinishCallback>,
    /// Set when the generator stops with a callback registered.
    finished: bool,
}

impl<S> Driver<S> {
    pub(super) fn state(&self) -> State {
        self.state
    }

    pub(super) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(super) fn report(&self) -> &GeneratorReport {
        &self.report
    }

    pub(super) fn set_on_finish(&mut self, callback: FinishCallback) {
        self.on_finish = Some(callback);
    }

    fn take_finished(&mut self) -> Option<(FinishCallback, GeneratorReport)> {
        if !self.finished {
            return None;
        }

        let callback = self.on_finish.take()?;
        self.finished = false;
        Some((callback, self.report.clone()))
    }
}

impl<S: Scheduler + Clone + 'static> Driver<S> {
    pub(super) fn new(
        this: Weak<RefCell<Self>>,
        scheduler: S,
        factory: Box<dyn SocketFactory>,
        peer: SocketAddr,
        spec: TrafficSpec,
        options: GeneratorOptions,
        report: GeneratorReport,
    ) -> Self {
        let rate = match &spec {
            TrafficSpec::ConstantRate { rate, .. } => Some(*rate),
            TrafficSpec::TraceReplay(_) => None,
        };

        Self {
            this,
            scheduler,
            factory,
            peer,
            spec,
            options,
            state: State::Idle,
            socket: None,
            timer: None,
            rate,
            started_at: Duration::ZERO,
            anchor: None,
            next: 0,
            seq: 0,
            pending: None,
            report,
            on_finish: None,
            finished: false,
        }
    }

    pub(super) fn start(&mut self) -> Result<(), GeneratorError> {
        if self.state != State::Idle {
            return Err(GeneratorError::InvalidState(self.state));
        }

        let now = self.scheduler.now();
        self.started_at = now;
        self.report.set_started(now);
        self.state = State::Running;

        if self.spec.is_empty() {
            info!(peer = %self.peer, "Empty schedule, nothing to send");
            self.finish(Outcome::Completed);
            return Ok(());
        }

        let kind = self.options.kind;
        let mut socket = match self.factory.create_socket(kind) {
            Ok(socket) => socket,
            Err(e) => {
                self.fail(e.clone());
                return Err(GeneratorError::Socket(e));
            }
        };

        let this = self.this.clone();
        socket.set_send_space_callback(Box::new(move |free| {
            upgrade_with(&this, |driver| driver.on_send_space(free));
        }));

        let this = self.this.clone();
        socket.set_connected_callback(Box::new(move |result| {
            upgrade_with(&this, |driver| driver.on_connected(result));
        }));

        if let Err(e) = socket.connect(self.peer) {
            socket.close();
            self.fail(e.clone());
            return Err(GeneratorError::Connect(e));
        }

        self.socket = Some(socket);
        debug!(peer = %self.peer, %kind, "Generator started");

        if !kind.is_connection_oriented() {
            self.begin();
        }

        Ok(())
    }

    pub(super) fn stop(&mut self) {
        if self.state == State::Stopped {
            return;
        }

        debug!(peer = %self.peer, "Stopping generator");
        self.finish(Outcome::Stopped);
    }

    pub(super) fn set_rate(&mut self, rate: Rate) -> Result<(), ConfigError> {
        let TrafficSpec::ConstantRate { packet_size, .. } = &self.spec else {
            return Err(ConfigError::NotRateMode);
        };

        rate.validate()?;
        self.options.check_bounded(&rate, *packet_size)?;

        debug!(peer = %self.peer, ?rate, "Rate changed");
        self.rate = Some(rate);
        Ok(())
    }

    fn on_connected(&mut self, result: Result<(), TransportError>) {
        if self.state != State::Running || self.anchor.is_some() {
            return;
        }

        match result {
            Ok(()) => {
                debug!(peer = %self.peer, "Connection established");
                self.begin();
            }
            Err(e) => self.fail(e),
        }
    }

    fn on_timer(&mut self) {
        self.timer = None;
        if self.state != State::Running {
            return;
        }

        self.send_next();
    }

    fn on_send_space(&mut self, free: usize) {
        if self.state != State::Running {
            return;
        }

        // Space notifications without a stalled packet carry no work
        let Some(tail) = self.pending.take() else { return };

        trace!(peer = %self.peer, free, remaining = tail.len(), "Resuming partial send");
        self.transmit(tail);
    }

    /// Anchors the timeline and schedules the first send.
    fn begin(&mut self) {
        self.anchor = Some(self.scheduler.now());
        self.schedule_next();
    }

    /// Schedules the next send, or finishes when the schedule or a bound is exhausted.
    fn schedule_next(&mut self) {
        if self.limit_reached() {
            self.finish(Outcome::Completed);
            return;
        }

        let Some(delay) = self.next_delay() else {
            self.finish(Outcome::Completed);
            return;
        };

        if let Some(stop_time) = self.options.stop_time {
            let at = self.scheduler.now().saturating_sub(self.started_at) + delay;
            if at >= stop_time {
                debug!(peer = %self.peer, ?stop_time, "Run duration reached");
                self.finish(Outcome::Completed);
                return;
            }
        }

        let this = self.this.clone();
        let id = self.scheduler.schedule(
            delay,
            Box::new(move || upgrade_with(&this, Driver::on_timer)),
        );

        if let Some(stale) = self.timer.replace(id) {
            // Only one send is ever pending
            self.scheduler.cancel(stale);
        }
    }

    fn limit_reached(&self) -> bool {
        let packets = self.options.max_packets.is_some_and(|max| self.report.packets_sent() >= max);
        let bytes = self.options.max_bytes.is_some_and(|max| self.report.bytes_sent() >= max);
        packets || bytes
    }

    /// Delay until the next packet is due, `None` when the schedule is exhausted.
    fn next_delay(&self) -> Option<Duration> {
        match &self.spec {
            TrafficSpec::TraceReplay(trace) => {
                let entry = trace.get(self.next)?;
                let elapsed = self.scheduler.now().saturating_sub(self.anchor.unwrap_or_default());
                Some(entry.offset.saturating_sub(elapsed))
            }
            TrafficSpec::ConstantRate { packet_size, .. } => {
                if self.next == 0 {
                    return Some(Duration::ZERO);
                }
                self.rate.map(|rate| rate.interval(*packet_size))
            }
        }
    }

    /// Size of the next packet.
    fn next_size(&self) -> usize {
        let nominal = match &self.spec {
            TrafficSpec::TraceReplay(trace) => trace.get(self.next).map_or(0, |entry| entry.size),
            TrafficSpec::ConstantRate { packet_size, .. } => *packet_size,
        };

        let nominal = u64::from(nominal);
        let size = match self.options.max_bytes {
            Some(max) => nominal.min(max.saturating_sub(self.report.bytes_sent())),
            None => nominal,
        };

        size as usize
    }

    fn send_next(&mut self) {
        let size = self.next_size();
        let header = self.options.timestamps.then(|| Header::new(self.seq, self.scheduler.now()));
        let payload = probe::payload(size, header);

        trace!(peer = %self.peer, seq = self.seq, size, "Sending packet");
        self.transmit(payload);
    }

    /// Offers `payload` to the socket and acts on how much of it was taken.
    fn transmit(&mut self, payload: Bytes) {
        let Some(socket) = self.socket.as_mut() else { return };

        let len = payload.len();
        match socket.send(payload.clone()) {
            Ok(accepted) if accepted >= len => {
                self.report.increment_bytes(len);
                self.complete_packet();
            }
            Ok(accepted) => {
                // Backpressure: wait for the send-space callback
                self.report.increment_bytes(accepted);
                self.report.increment_partial();
                self.pending = Some(payload.slice(accepted..));

                debug!(peer = %self.peer, accepted, remaining = len - accepted, "Partial send, waiting for buffer space");
            }
            Err(e) => self.fail(e),
        }
    }

    fn complete_packet(&mut self) {
        self.report.increment_packets();
        self.next += 1;
        self.seq = self.seq.wrapping_add(1);

        self.schedule_next();
    }

    fn fail(&mut self, e: TransportError) {
        error!(
            peer = %self.peer,
            error = %e,
            sent = self.report.packets_sent(),
            total = ?self.report.total_packets(),
            "Transport error, stopping generator"
        );
        self.finish(Outcome::Failed(e));
    }

    /// Moves to `Stopped`: cancels the pending timer, then releases the socket.
    fn finish(&mut self, outcome: Outcome) {
        if self.state == State::Stopped {
            return;
        }

        if let Some(timer) = self.timer.take() {
            self.scheduler.cancel(timer);
        }
        self.pending = None;

        if let Some(mut socket) = self.socket.take() {
            socket.close();
        }

        if outcome == Outcome::Completed {
            info!(
                peer = %self.peer,
                sent = self.report.packets_sent(),
                bytes = self.report.bytes_sent(),
                "Generator completed"
            );
        }

        self.state = State::Stopped;
        self.report.set_finished(self.scheduler.now(), outcome);
        self.finished = true;
    }
}
