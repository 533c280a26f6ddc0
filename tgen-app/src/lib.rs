#![doc(issue_tracker_base_url = "https://github.com/tgen-rs/tgen/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod app;
mod generator;
mod sink;
mod spec;

pub mod trace;

pub use app::{schedule_lifetime, Application};
pub use generator::{
    GeneratorError, GeneratorOptions, GeneratorReport, Outcome, State, TrafficGenerator,
};
pub use sink::{PacketSink, PeerStats, ReceiveStats, SinkError, SinkOptions};
pub use spec::{ConfigError, Rate, TrafficSpec};
pub use trace::{Trace, TraceEntry, TraceError};
