#![doc(issue_tracker_base_url = "https://github.com/tgen-rs/tgen/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use tgen_app::*;
pub use tgen_common::{constants, DataRate, EventId, ParseRateError, Scheduler, Simulator};
pub use tgen_transport::*;
pub use tgen_wire::probe;
