use std::{net::SocketAddr, time::Duration};

use tgen::{
    schedule_lifetime, DataRate, GeneratorOptions, LinkOptions, Loopback, PacketSink, Simulator,
    SinkOptions, SocketKind, TrafficGenerator, TrafficSpec,
};

/// A bulk stream sender pacing faster than its link, so the send buffer fills up
/// and the generator runs on send-space notifications.
fn main() {
    let _ = tracing_subscriber::fmt::try_init();

    let sim = Simulator::new();
    let link = LinkOptions::default()
        .latency(Duration::from_millis(5))
        .bandwidth(DataRate::from_mbps(5))
        .tx_buffer(16 * 1024);
    let net = Loopback::new(sim.clone(), link);

    let addr: SocketAddr = "10.1.1.2:8080".parse().unwrap();
    let sink = PacketSink::new(sim.clone(), net.clone(), addr, SinkOptions::default().kind(SocketKind::Stream));

    // 10 Mbps offered over a 5 Mbps link, 1 MB in total
    let spec = TrafficSpec::constant_rate(1448, DataRate::from_mbps(10));
    let options = GeneratorOptions::default()
        .kind(SocketKind::Stream)
        .max_bytes(1_000_000)
        .stop_time(Duration::from_secs(10));
    let generator = TrafficGenerator::new(sim.clone(), net, addr, spec, options).unwrap();

    schedule_lifetime(&sim, sink.clone(), Duration::ZERO, Some(Duration::from_secs(12)));
    schedule_lifetime(&sim, generator.clone(), Duration::from_millis(100), None);

    // Halve the offered load halfway through
    let handle = generator.clone();
    tgen::Scheduler::schedule(
        &sim,
        Duration::from_secs(1),
        Box::new(move || handle.set_rate(DataRate::from_mbps(5)).unwrap()),
    );

    sim.run();

    let report = generator.report();
    tracing::info!("Generator: {report}");
    tracing::info!("Sink: {}", sink.stats());
    tracing::info!(
        goodput_mbps = sink.stats().throughput() / 1e6,
        elapsed = ?report.elapsed(),
        "Done"
    );
}
