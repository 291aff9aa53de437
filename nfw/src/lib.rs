#![doc(issue_tracker_base_url = "https://github.com/chainbound/nfw/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! A minimal inline firewall for packets diverted to userspace by the netfilter `NFQUEUE`
//! target.
//!
//! Rules are matched in order against the IPv4 and TCP headers of each packet, and optionally
//! against banned byte strings in the TCP payload. The first matching rule decides; packets no
//! rule matches are accepted.
//!
//! ```no_run
//! use nfw::{netlink::Netlink, Action, FilterRule, Firewall, FirewallConfig, IpProtocol};
//! use nfw::{QueueRegistration, RuleSet};
//!
//! let rules = RuleSet::new(vec![
//!     FilterRule::new(Action::Drop).protocol(IpProtocol::TCP).dst_port(1337),
//! ]);
//!
//! let config = FirewallConfig::new().queue(QueueRegistration::new(0, rules));
//! let firewall = Firewall::new(Netlink::new(), config);
//! firewall.start()?;
//! // ...
//! firewall.stop();
//! # Ok::<(), nfw::QueueError>(())
//! ```

pub mod cli;

pub use nfw_common::*;
pub use nfw_filter::*;
pub use nfw_queue::*;
pub use nfw_transport::*;
pub use nfw_wire as wire;
