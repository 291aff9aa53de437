#![doc(issue_tracker_base_url = "https://github.com/chainbound/nfw/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Stateless per-packet classification: header decoding, filter rules and the first-match
//! engine that turns them into verdicts.

mod engine;
pub use engine::*;

mod handler;
pub use handler::*;

pub mod packet;
pub use packet::{decode, IpProtocol, PacketView, TcpFlags};

mod rule;
pub use rule::*;

pub use nfw_wire::Verdict;
