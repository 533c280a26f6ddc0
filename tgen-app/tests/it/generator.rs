use std::{cell::RefCell, rc::Rc, time::Duration};

use tgen_app::{
    schedule_lifetime, ConfigError, GeneratorError, GeneratorOptions, GeneratorReport, Outcome,
    Rate, SinkOptions, State, Trace, TraceEntry, TrafficGenerator, TrafficSpec,
};
use tgen_common::{DataRate, Scheduler, Simulator};
use tgen_transport::{LinkOptions, Loopback, SocketKind, TransportError};

use crate::{addr, setup};

type Finished = Rc<RefCell<Vec<GeneratorReport>>>;

fn record_finish(generator: &TrafficGenerator<Simulator>) -> Finished {
    let finished: Finished = Rc::default();
    let log = Rc::clone(&finished);
    generator.on_finish(move |report| log.borrow_mut().push(report.clone()));
    finished
}

#[test]
fn constant_rate_bounded_run() {
    let (sim, net, sink) = setup(LinkOptions::default(), SinkOptions::default(), 9000);

    // 1024 B at 1 Mbps is one packet every 8.192 ms
    let spec = TrafficSpec::constant_rate(1024, DataRate::from_mbps(1));
    let options = GeneratorOptions::default().stop_time(Duration::from_secs(10));
    let generator = TrafficGenerator::new(sim.clone(), net, addr(9000), spec, options).unwrap();

    generator.start().unwrap();
    sim.run();

    let report = generator.report();
    let sent = report.packets_sent();
    assert!((1219..=1221).contains(&sent), "sent {sent} packets");
    // Sends fall at k * 8.192 ms for every k below 10 s
    assert_eq!(report.total_packets(), Some(1221));
    assert_eq!(report.bytes_sent(), sent * 1024);
    assert_eq!(report.outcome(), Some(&Outcome::Completed));
    assert_eq!(generator.state(), State::Stopped);

    let stats = sink.stats();
    assert_eq!(stats.packets_received(), sent);
    assert_eq!(stats.delay_samples().len() as u64, sent);
    assert_eq!(stats.max_delay(), Some(Duration::from_millis(1)));
}

#[test]
fn interval_pacing() {
    let (sim, net, sink) = setup(LinkOptions::default(), SinkOptions::default(), 9000);

    let spec = TrafficSpec::constant_rate(100, Duration::from_millis(100));
    let options = GeneratorOptions::default().max_packets(5);
    let generator = TrafficGenerator::new(sim.clone(), net, addr(9000), spec, options).unwrap();

    generator.start().unwrap();
    sim.run();

    let report = generator.report();
    assert_eq!(report.packets_sent(), 5);
    assert_eq!(report.total_packets(), Some(5));
    // Last send at 400 ms completes the run
    assert_eq!(report.finished_at(), Some(Duration::from_millis(400)));

    let stats = sink.stats();
    assert_eq!(stats.first_rx_time(), Some(Duration::from_millis(1)));
    assert_eq!(stats.last_rx_time(), Some(Duration::from_millis(401)));
}

#[test]
fn max_bytes_truncates_last_packet() {
    let (sim, net, sink) = setup(LinkOptions::default(), SinkOptions::default(), 9000);

    let spec = TrafficSpec::constant_rate(1000, Duration::from_millis(1));
    let options = GeneratorOptions::default().max_bytes(2500);
    let generator = TrafficGenerator::new(sim.clone(), net, addr(9000), spec, options).unwrap();
    assert_eq!(generator.report().total_packets(), Some(3));

    generator.start().unwrap();
    sim.run();

    let report = generator.report();
    assert_eq!(report.packets_sent(), 3);
    assert_eq!(report.bytes_sent(), 2500);
    assert_eq!(sink.stats().bytes_received(), 2500);
}

#[test]
fn zero_interval_needs_a_bound() {
    let sim = Simulator::new();
    let net = Loopback::new(sim.clone(), LinkOptions::default());
    let spec = TrafficSpec::constant_rate(100, Duration::ZERO);

    let err = TrafficGenerator::new(sim.clone(), net.clone(), addr(9000), spec.clone(), GeneratorOptions::default())
        .unwrap_err();
    assert_eq!(err, ConfigError::Unbounded);

    let generator = TrafficGenerator::new(
        sim.clone(),
        net,
        addr(9000),
        spec,
        GeneratorOptions::default().max_packets(10),
    )
    .unwrap();
    generator.start().unwrap();
    sim.run();

    let report = generator.report();
    assert_eq!(report.packets_sent(), 10);
    assert_eq!(report.finished_at(), Some(Duration::ZERO));
}

#[test]
fn sub_nanosecond_rate_still_advances() {
    let (sim, net, sink) = setup(LinkOptions::default(), SinkOptions::default(), 9000);

    // 8 bits at 10 Gbps is 0.8 ns, paced at 1 ns
    let spec = TrafficSpec::constant_rate(1, DataRate::from_gbps(10));
    let options = GeneratorOptions::default().stop_time(Duration::from_micros(10));
    let generator = TrafficGenerator::new(sim.clone(), net, addr(9000), spec, options).unwrap();
    assert_eq!(generator.report().total_packets(), Some(10_000));

    generator.start().unwrap();
    sim.run();

    let report = generator.report();
    assert_eq!(report.outcome(), Some(&Outcome::Completed));
    assert_eq!(report.packets_sent(), 10_000);
    assert_eq!(report.finished_at(), Some(Duration::from_nanos(9_999)));
    assert_eq!(sink.stats().packets_received(), 10_000);
}

#[test]
fn total_packets_from_stop_time() {
    let sim = Simulator::new();
    let net = Loopback::new(sim.clone(), LinkOptions::default());
    let new = |options| {
        TrafficGenerator::new(
            sim.clone(),
            net.clone(),
            addr(9000),
            TrafficSpec::constant_rate(100, Duration::from_millis(10)),
            options,
        )
        .unwrap()
    };

    let by_time = GeneratorOptions::default().stop_time(Duration::from_secs(1));
    assert_eq!(new(by_time.clone()).report().total_packets(), Some(100));
    // A partial interval still fits one more send
    let uneven = GeneratorOptions::default().stop_time(Duration::from_millis(1_005));
    assert_eq!(new(uneven).report().total_packets(), Some(101));
    // The tighter bound wins
    assert_eq!(new(by_time.max_packets(20)).report().total_packets(), Some(20));
}

#[test]
fn invalid_configuration() {
    let sim = Simulator::new();
    let net = Loopback::new(sim.clone(), LinkOptions::default());
    let new = |spec, options| TrafficGenerator::new(sim.clone(), net.clone(), addr(9000), spec, options);

    let spec = TrafficSpec::constant_rate(100, Duration::from_millis(1));
    assert_eq!(
        new(spec.clone(), GeneratorOptions::default().max_packets(0)).unwrap_err(),
        ConfigError::ZeroLimit("max_packets")
    );
    assert_eq!(
        new(spec, GeneratorOptions::default().max_bytes(0)).unwrap_err(),
        ConfigError::ZeroLimit("max_bytes")
    );
    assert_eq!(
        new(TrafficSpec::constant_rate(0, Duration::from_millis(1)), GeneratorOptions::default())
            .unwrap_err(),
        ConfigError::ZeroPacketSize
    );
    assert_eq!(
        new(TrafficSpec::constant_rate(100, DataRate::from_bps(0)), GeneratorOptions::default())
            .unwrap_err(),
        ConfigError::ZeroDataRate
    );
}

#[test]
fn set_rate_mid_run() {
    let (sim, net, _sink) = setup(LinkOptions::default(), SinkOptions::default(), 9000);

    let spec = TrafficSpec::constant_rate(100, Duration::from_millis(10));
    let options = GeneratorOptions::default().stop_time(Duration::from_secs(1));
    let generator = TrafficGenerator::new(sim.clone(), net, addr(9000), spec, options).unwrap();

    let handle = generator.clone();
    sim.schedule(
        Duration::from_millis(500),
        Box::new(move || handle.set_rate(Duration::from_millis(5)).unwrap()),
    );

    generator.start().unwrap();
    sim.run();

    // 51 sends in the first half at 10 ms, then 99 more at 5 ms
    let sent = generator.report().packets_sent();
    assert!((149..=151).contains(&sent), "sent {sent} packets");

    assert_eq!(generator.set_rate(DataRate::from_bps(0)), Err(ConfigError::ZeroDataRate));
    // A time bound alone cannot end a run that never advances the clock
    assert_eq!(generator.set_rate(Duration::ZERO), Err(ConfigError::Unbounded));
}

#[test]
fn set_rate_rejects_trace_specs() {
    let sim = Simulator::new();
    let net = Loopback::new(sim.clone(), LinkOptions::default());
    let trace = Trace::from_entries(vec![TraceEntry::new(Duration::ZERO, 10)]);
    let generator =
        TrafficGenerator::new(sim, net, addr(9000), TrafficSpec::trace(trace), GeneratorOptions::default())
            .unwrap();

    assert_eq!(
        generator.set_rate(Rate::from(DataRate::from_mbps(1))),
        Err(ConfigError::NotRateMode)
    );
}

#[test]
fn stop_is_idempotent() {
    let (sim, net, _sink) = setup(LinkOptions::default(), SinkOptions::default(), 9000);

    let spec = TrafficSpec::constant_rate(100, Duration::from_millis(10));
    let generator =
        TrafficGenerator::new(sim.clone(), net.clone(), addr(9000), spec, GeneratorOptions::default())
            .unwrap();
    let finished = record_finish(&generator);

    schedule_lifetime(&sim, generator.clone(), Duration::ZERO, Some(Duration::from_millis(95)));
    sim.run();

    let first = generator.report();
    assert_eq!(first.outcome(), Some(&Outcome::Stopped));
    assert_eq!(first.packets_sent(), 10);
    assert_eq!(first.finished_at(), Some(Duration::from_millis(95)));
    // Only the sink's socket is left
    assert_eq!(net.open_sockets(), 1);

    generator.stop();
    assert_eq!(generator.report(), first);
    assert_eq!(finished.borrow().len(), 1);
    assert_eq!(finished.borrow()[0], first);
}

#[test]
fn stop_before_start() {
    let sim = Simulator::new();
    let net = Loopback::new(sim.clone(), LinkOptions::default());
    let spec = TrafficSpec::constant_rate(100, Duration::from_millis(10));
    let generator = TrafficGenerator::new(sim, net, addr(9000), spec, GeneratorOptions::default()).unwrap();
    let finished = record_finish(&generator);

    generator.stop();
    assert_eq!(generator.state(), State::Stopped);
    assert_eq!(finished.borrow().len(), 1);
    assert!(matches!(generator.start(), Err(GeneratorError::InvalidState(State::Stopped))));
}

#[test]
fn start_twice() {
    let (sim, net, _sink) = setup(LinkOptions::default(), SinkOptions::default(), 9000);
    let spec = TrafficSpec::constant_rate(100, Duration::from_millis(10));
    let generator = TrafficGenerator::new(sim, net, addr(9000), spec, GeneratorOptions::default()).unwrap();

    generator.start().unwrap();
    assert!(matches!(generator.start(), Err(GeneratorError::InvalidState(State::Running))));
    generator.stop();
}

#[test]
fn socket_creation_failure() {
    let sim = Simulator::new();
    let net = Loopback::new(sim.clone(), LinkOptions::default().max_sockets(0));
    let spec = TrafficSpec::constant_rate(100, Duration::from_millis(10));
    let generator = TrafficGenerator::new(sim, net, addr(9000), spec, GeneratorOptions::default()).unwrap();
    let finished = record_finish(&generator);

    let err = generator.start().unwrap_err();
    assert!(matches!(err, GeneratorError::Socket(TransportError::SocketLimit(0))));
    assert_eq!(generator.state(), State::Stopped);

    let finished = finished.borrow();
    assert_eq!(finished.len(), 1);
    assert_eq!(
        finished[0].outcome(),
        Some(&Outcome::Failed(TransportError::SocketLimit(0)))
    );
}

#[test]
fn stream_connection_refused() {
    let sim = Simulator::new();
    let net = Loopback::new(sim.clone(), LinkOptions::default().latency(Duration::from_millis(5)));
    let spec = TrafficSpec::constant_rate(100, Duration::from_millis(10));
    let options = GeneratorOptions::default().kind(SocketKind::Stream);
    let generator = TrafficGenerator::new(sim.clone(), net.clone(), addr(8080), spec, options).unwrap();
    let finished = record_finish(&generator);

    // The handshake result arrives asynchronously
    generator.start().unwrap();
    assert_eq!(generator.state(), State::Running);
    sim.run();

    let report = generator.report();
    assert_eq!(report.outcome(), Some(&Outcome::Failed(TransportError::ConnectionRefused(addr(8080)))));
    assert_eq!(report.packets_sent(), 0);
    assert_eq!(report.finished_at(), Some(Duration::from_millis(10)));
    assert_eq!(finished.borrow().len(), 1);
    assert_eq!(net.open_sockets(), 0);
}

#[test]
fn send_error_stops_the_run() {
    let (sim, net, _sink) =
        setup(LinkOptions::default().max_datagram(500), SinkOptions::default(), 9000);

    let trace = Trace::from_entries(vec![
        TraceEntry::new(Duration::ZERO, 100),
        TraceEntry::new(Duration::from_millis(10), 1000),
        TraceEntry::new(Duration::from_millis(20), 100),
    ]);
    let generator =
        TrafficGenerator::new(sim.clone(), net, addr(9000), TrafficSpec::trace(trace), GeneratorOptions::default())
            .unwrap();

    generator.start().unwrap();
    sim.run();

    let report = generator.report();
    assert_eq!(report.packets_sent(), 1);
    assert_eq!(report.total_packets(), Some(3));
    assert_eq!(
        report.outcome(),
        Some(&Outcome::Failed(TransportError::MessageTooLong { size: 1000, max: 500 }))
    );
}

#[test]
fn dropped_generator_callbacks_are_noops() {
    let (sim, net, sink) = setup(LinkOptions::default(), SinkOptions::default(), 9000);

    let spec = TrafficSpec::constant_rate(100, Duration::from_millis(10));
    let generator = TrafficGenerator::new(sim.clone(), net, addr(9000), spec, GeneratorOptions::default()).unwrap();
    generator.start().unwrap();
    sim.run_until(Duration::from_millis(25));
    drop(generator);

    sim.run();
    assert_eq!(sink.stats().packets_received(), 3);
}
