#![doc(issue_tracker_base_url = "https://github.com/chainbound/nfw/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! The queue lifecycle manager: opens a session with the kernel, creates the configured queues,
//! and runs one worker thread that receives queued packets, hands them to their queue's
//! [`PacketHandler`](nfw_filter::PacketHandler) and answers each with exactly one verdict.

mod config;
pub use config::*;

mod error;
pub use error::QueueError;

mod manager;
pub use manager::{Firewall, State};

pub mod verdict;

mod worker;
