use std::{net::SocketAddr, path::PathBuf, time::Duration};

use tgen::{
    schedule_lifetime, DataRate, GeneratorOptions, LinkOptions, Loopback, PacketSink, Simulator,
    SinkOptions, Trace, TrafficGenerator, TrafficSpec,
};

/// Replays a trace file over a lossy simulated link and prints what the sink saw.
///
/// Usage: `cargo run --example trace_replay [trace file]`
fn main() {
    let _ = tracing_subscriber::fmt::try_init();

    let path = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("data/sample.trace")
    });
    let trace = Trace::load(&path).unwrap();
    tracing::info!(
        path = %path.display(),
        entries = trace.len(),
        skipped = trace.skipped(),
        bytes = trace.total_bytes(),
        "Loaded trace"
    );

    let sim = Simulator::new();
    let link = LinkOptions::default()
        .latency(Duration::from_millis(20))
        .bandwidth("10Mbps".parse::<DataRate>().unwrap())
        .loss_rate(0.05)
        .seed(7);
    let net = Loopback::new(sim.clone(), link);

    let sink_addr: SocketAddr = "10.1.1.2:9".parse().unwrap();
    let sink = PacketSink::new(sim.clone(), net.clone(), sink_addr, SinkOptions::default());
    let generator = TrafficGenerator::new(
        sim.clone(),
        net.clone(),
        sink_addr,
        TrafficSpec::trace(trace),
        GeneratorOptions::default(),
    )
    .unwrap();
    generator.on_finish(|report| tracing::info!("Generator finished: {report}"));

    schedule_lifetime(&sim, sink.clone(), Duration::ZERO, None);
    schedule_lifetime(&sim, generator, Duration::from_secs(1), None);
    sim.run();

    tracing::info!("Sink: {}", sink.stats());
    tracing::info!("Link: {:?}", net.stats());
}
