#![doc(issue_tracker_base_url = "https://github.com/tgen-rs/tgen/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod probe;
