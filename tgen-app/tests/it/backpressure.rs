use std::{cell::RefCell, net::SocketAddr, rc::Rc, time::Duration};

use bytes::Bytes;
use tgen_app::{GeneratorOptions, Outcome, SinkOptions, TrafficGenerator, TrafficSpec};
use tgen_common::{DataRate, Simulator};
use tgen_transport::{
    ConnectedCallback, LinkOptions, ReceiveCallback, SendSpaceCallback, Socket, SocketFactory,
    SocketKind, TransportError,
};

use crate::{addr, setup};

/// Shared state of a [`FakeSocket`], inspected and driven by the test.
#[derive(Default)]
struct Fake {
    /// Bytes the socket still accepts. `None` accepts everything.
    capacity: Option<usize>,
    /// Length of every payload offered to `send`.
    sends: Vec<usize>,
    closes: usize,
    on_send_space: Option<SendSpaceCallback>,
}

type Handle = Rc<RefCell<Fake>>;

/// Fires the send-space callback the way a transport would: outside of any
/// socket call.
fn signal_space(fake: &Handle, capacity: Option<usize>) {
    let callback = {
        let mut fake = fake.borrow_mut();
        fake.capacity = capacity;
        fake.on_send_space.take()
    };

    if let Some(mut callback) = callback {
        callback(capacity.unwrap_or(usize::MAX));
        fake.borrow_mut().on_send_space.get_or_insert(callback);
    }
}

struct FakeSocket(Handle);

impl Socket for FakeSocket {
    fn kind(&self) -> SocketKind {
        SocketKind::Datagram
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn bind(&mut self, _addr: SocketAddr) -> Result<(), TransportError> {
        Ok(())
    }

    fn connect(&mut self, _peer: SocketAddr) -> Result<(), TransportError> {
        Ok(())
    }

    fn send(&mut self, payload: Bytes) -> Result<usize, TransportError> {
        let mut fake = self.0.borrow_mut();
        fake.sends.push(payload.len());

        let accepted = match fake.capacity {
            Some(capacity) => payload.len().min(capacity),
            None => payload.len(),
        };
        if let Some(capacity) = fake.capacity.as_mut() {
            *capacity -= accepted;
        }

        Ok(accepted)
    }

    fn set_connected_callback(&mut self, _callback: ConnectedCallback) {}

    fn set_send_space_callback(&mut self, callback: SendSpaceCallback) {
        self.0.borrow_mut().on_send_space = Some(callback);
    }

    fn set_receive_callback(&mut self, _callback: ReceiveCallback) {}

    fn close(&mut self) {
        self.0.borrow_mut().closes += 1;
    }
}

struct FakeFactory(Handle);

impl SocketFactory for FakeFactory {
    fn create_socket(&self, _kind: SocketKind) -> Result<Box<dyn Socket>, TransportError> {
        Ok(Box::new(FakeSocket(Rc::clone(&self.0))))
    }
}

#[test]
fn no_send_after_short_send_until_space() {
    let _ = tracing_subscriber::fmt::try_init();

    let sim = Simulator::new();
    let fake = Handle::default();
    fake.borrow_mut().capacity = Some(150);

    let spec = TrafficSpec::constant_rate(100, Duration::from_millis(1));
    let options = GeneratorOptions::default().max_packets(3);
    let generator =
        TrafficGenerator::new(sim.clone(), FakeFactory(Rc::clone(&fake)), addr(9000), spec, options)
            .unwrap();

    generator.start().unwrap();
    sim.run_until(Duration::from_millis(50));

    // The second packet only got half in; nothing is scheduled behind it
    assert_eq!(fake.borrow().sends, vec![100, 100]);
    assert_eq!(sim.pending(), 0);
    assert_eq!(generator.report().partial_sends(), 1);
    assert_eq!(generator.report().packets_sent(), 1);

    // Still blocked: a notification with no room makes no progress
    signal_space(&fake, Some(0));
    assert_eq!(fake.borrow().sends, vec![100, 100, 50]);
    assert_eq!(generator.report().partial_sends(), 2);

    signal_space(&fake, None);
    assert_eq!(fake.borrow().sends, vec![100, 100, 50, 50]);
    assert_eq!(generator.report().packets_sent(), 2);

    sim.run();

    let report = generator.report();
    assert_eq!(fake.borrow().sends, vec![100, 100, 50, 50, 100]);
    assert_eq!(report.packets_sent(), 3);
    assert_eq!(report.bytes_sent(), 300);
    assert_eq!(report.outcome(), Some(&Outcome::Completed));
    assert_eq!(fake.borrow().closes, 1);
}

#[test]
fn space_without_pending_tail_is_ignored() {
    let sim = Simulator::new();
    let fake = Handle::default();

    let spec = TrafficSpec::constant_rate(100, Duration::from_millis(10));
    let options = GeneratorOptions::default().max_packets(2);
    let generator =
        TrafficGenerator::new(sim.clone(), FakeFactory(Rc::clone(&fake)), addr(9000), spec, options)
            .unwrap();

    generator.start().unwrap();
    sim.run_until(Duration::from_millis(5));
    signal_space(&fake, None);
    assert_eq!(fake.borrow().sends, vec![100]);

    sim.run();
    assert_eq!(fake.borrow().sends, vec![100, 100]);
    assert_eq!(generator.report().partial_sends(), 0);
}

#[test]
fn stop_drops_pending_tail() {
    let sim = Simulator::new();
    let fake = Handle::default();
    fake.borrow_mut().capacity = Some(50);

    let spec = TrafficSpec::constant_rate(100, Duration::from_millis(1));
    let options = GeneratorOptions::default().max_packets(3);
    let generator =
        TrafficGenerator::new(sim.clone(), FakeFactory(Rc::clone(&fake)), addr(9000), spec, options)
            .unwrap();

    generator.start().unwrap();
    sim.run();
    assert_eq!(fake.borrow().sends, vec![100]);
    assert_eq!(generator.report().partial_sends(), 1);

    generator.stop();
    assert_eq!(fake.borrow().closes, 1);

    // Space arriving after the stop must not resume the tail
    signal_space(&fake, None);
    sim.run();

    let report = generator.report();
    assert_eq!(fake.borrow().sends, vec![100]);
    assert_eq!(report.packets_sent(), 0);
    assert_eq!(report.bytes_sent(), 50);
    assert_eq!(report.outcome(), Some(&Outcome::Stopped));

    generator.stop();
    assert_eq!(fake.borrow().closes, 1);
}

#[test]
fn stream_over_loopback_survives_backpressure() {
    let options = LinkOptions::default()
        .bandwidth(DataRate::from_mbps(8))
        .tx_buffer(1_000);
    let (sim, net, sink) =
        setup(options, SinkOptions::default().kind(SocketKind::Stream), 8080);

    let spec = TrafficSpec::constant_rate(1_500, Duration::ZERO);
    let options = GeneratorOptions::default().kind(SocketKind::Stream).max_packets(4);
    let generator = TrafficGenerator::new(sim.clone(), net.clone(), addr(8080), spec, options).unwrap();

    generator.start().unwrap();
    // Nothing goes out before the handshake
    sim.run_until(Duration::from_millis(1));
    assert_eq!(generator.report().bytes_sent(), 0);

    sim.run();

    let report = generator.report();
    assert_eq!(report.outcome(), Some(&Outcome::Completed));
    assert_eq!(report.packets_sent(), 4);
    assert_eq!(report.bytes_sent(), 6_000);
    assert!(report.partial_sends() > 0);

    // Stream chunks do not map to packets, bytes do
    assert_eq!(sink.stats().bytes_received(), 6_000);
    assert_eq!(net.stats().lost(), 0);
}
