use std::{cell::RefCell, fmt, net::SocketAddr, rc::Rc, time::Duration};

use thiserror::Error;

use tgen_common::Scheduler;
use tgen_transport::{SocketFactory, SocketKind, TransportError};

use crate::{
    app::Application,
    spec::{ConfigError, Rate, TrafficSpec},
};

mod driver;
use driver::{with_driver, Driver};

mod stats;
pub use stats::{GeneratorReport, Outcome};

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Socket creation failed: {0}")]
    Socket(#[source] TransportError),
    #[error("Connect failed: {0}")]
    Connect(#[source] TransportError),
    #[error("Generator cannot start from state {0:?}")]
    InvalidState(State),
}

/// Lifecycle of a generator. A generator is single-use: `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct GeneratorOptions {
    /// The kind of socket to send on.
    kind: SocketKind,
    /// Stop after this many packets.
    max_packets: Option<u64>,
    /// Stop after this many bytes. The last packet is truncated to fit.
    max_bytes: Option<u64>,
    /// Run duration, measured from `start`. Sends that would fall at or past it
    /// are not scheduled.
    stop_time: Option<Duration>,
    /// Whether payloads carry a probe header with sequence number and send time.
    timestamps: bool,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            kind: SocketKind::Datagram,
            max_packets: None,
            max_bytes: None,
            stop_time: None,
            timestamps: true,
        }
    }
}

impl GeneratorOptions {
    /// Sets the socket kind. Stream sockets defer sending until connected.
    pub fn kind(mut self, kind: SocketKind) -> Self {
        self.kind = kind;
        self
    }

    /// Stops the generator after `max_packets` packets.
    pub fn max_packets(mut self, max_packets: u64) -> Self {
        self.max_packets = Some(max_packets);
        self
    }

    /// Stops the generator after `max_bytes` bytes, truncating the last packet.
    pub fn max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    /// Bounds the run duration, measured from `start`.
    pub fn stop_time(mut self, stop_time: Duration) -> Self {
        self.stop_time = Some(stop_time);
        self
    }

    /// Enables or disables the probe header in payloads.
    pub fn timestamps(mut self, timestamps: bool) -> Self {
        self.timestamps = timestamps;
        self
    }

    fn validate(&self, spec: &TrafficSpec) -> Result<(), ConfigError> {
        if self.max_packets == Some(0) {
            return Err(ConfigError::ZeroLimit("max_packets"));
        }
        if self.max_bytes == Some(0) {
            return Err(ConfigError::ZeroLimit("max_bytes"));
        }
        if self.stop_time == Some(Duration::ZERO) {
            return Err(ConfigError::ZeroLimit("stop_time"));
        }

        if let TrafficSpec::ConstantRate { packet_size, rate } = spec {
            self.check_bounded(rate, *packet_size)?;
        }

        Ok(())
    }

    /// A zero gap never advances the clock, so only a count can end the run. Data
    /// rates fast enough to round the gap down to zero count as well.
    fn check_bounded(&self, rate: &Rate, packet_size: u32) -> Result<(), ConfigError> {
        let unbounded = self.max_packets.is_none() && self.max_bytes.is_none();
        if unbounded && rate.interval(packet_size).is_zero() {
            return Err(ConfigError::Unbounded);
        }
        Ok(())
    }

    /// The number of packets this configuration sends at most, when known.
    fn total_packets(&self, spec: &TrafficSpec) -> Option<u64> {
        let by_spec = match spec {
            TrafficSpec::ConstantRate { packet_size, rate } => {
                let by_bytes = self.max_bytes.map(|bytes| bytes.div_ceil(u64::from(*packet_size)));
                // Sends fall at k * interval for every k * interval < stop_time
                let by_time = self.stop_time.and_then(|stop_time| {
                    let interval = rate.interval(*packet_size).as_nanos();
                    (interval > 0).then(|| stop_time.as_nanos().div_ceil(interval))
                });
                min_known(by_bytes, by_time.map(|n| u64::try_from(n).unwrap_or(u64::MAX)))
            }
            TrafficSpec::TraceReplay(trace) => Some(trace.len() as u64),
        };

        min_known(by_spec, self.max_packets)
    }
}

fn min_known(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// A paced or trace-driven packet sender.
///
/// `TrafficGenerator` is a handle: clones drive the same generator. Everything runs
/// on the scheduler's thread, inside scheduler and socket callbacks, which only hold
/// weak references to the generator.
pub struct TrafficGenerator<S> {
    inner: Rc<RefCell<Driver<S>>>,
}

impl<S> Clone for TrafficGenerator<S> {
    fn clone(&self) -> Self {
        Self { inner: Rc::clone(&self.inner) }
    }
}

impl<S: Scheduler + Clone + 'static> TrafficGenerator<S> {
    /// Creates an idle generator that will send to `peer` on a socket from `factory`.
    pub fn new(
        scheduler: S,
        factory: impl SocketFactory + 'static,
        peer: SocketAddr,
        spec: TrafficSpec,
        options: GeneratorOptions,
    ) -> Result<Self, ConfigError> {
        spec.validate()?;
        options.validate(&spec)?;

        let total = options.total_packets(&spec);
        let inner = Rc::new_cyclic(|this| {
            RefCell::new(Driver::new(
                this.clone(),
                scheduler,
                Box::new(factory),
                peer,
                spec,
                options,
                GeneratorReport::new(total),
            ))
        });

        Ok(Self { inner })
    }

    /// Opens the socket and starts the send timeline.
    ///
    /// Socket and connect failures are returned and leave the generator `Stopped`.
    /// Failures after this returns (refused stream connections, send errors) end the
    /// run with [`Outcome::Failed`].
    pub fn start(&self) -> Result<(), GeneratorError> {
        with_driver(&self.inner, Driver::start)
    }

    /// Cancels the pending send, closes the socket and moves to `Stopped`. Calling
    /// it again is a no-op.
    pub fn stop(&self) {
        with_driver(&self.inner, |driver| driver.stop());
    }

    /// Changes the pacing of a constant-rate generator. Takes effect from the next
    /// scheduled send.
    pub fn set_rate(&self, rate: impl Into<Rate>) -> Result<(), ConfigError> {
        self.inner.borrow_mut().set_rate(rate.into())
    }

    /// Registers a callback that runs once with the final report when the generator
    /// stops, for whatever reason.
    pub fn on_finish(&self, callback: impl FnOnce(&GeneratorReport) + 'static) {
        self.inner.borrow_mut().set_on_finish(Box::new(callback));
    }

    pub fn report(&self) -> GeneratorReport {
        self.inner.borrow().report().clone()
    }

    pub fn state(&self) -> State {
        self.inner.borrow().state()
    }

    pub fn peer(&self) -> SocketAddr {
        self.inner.borrow().peer()
    }
}

impl<S: Scheduler + Clone + 'static> Application for TrafficGenerator<S> {
    type Error = GeneratorError;

    fn start(&self) -> Result<(), Self::Error> {
        TrafficGenerator::start(self)
    }

    fn stop(&self) {
        TrafficGenerator::stop(self)
    }
}

impl<S> fmt::Debug for TrafficGenerator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(driver) => f
                .debug_struct("TrafficGenerator")
                .field("state", &driver.state())
                .field("peer", &driver.peer())
                .field("report", driver.report())
                .finish(),
            Err(_) => f.debug_struct("TrafficGenerator").finish_non_exhaustive(),
        }
    }
}
