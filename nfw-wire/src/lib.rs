#![doc(issue_tracker_base_url = "https://github.com/chainbound/nfw/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Wire format of the netfilter queue subsystem (`nfnetlink_queue`).
//!
//! Netlink frames are laid out as a `nlmsghdr` (host byte order), an `nfgenmsg` whose resource
//! id carries the queue number (network byte order), and a list of 4-byte aligned attributes.
//! Attribute headers are in host byte order, attribute payloads in network byte order.

use thiserror::Error;

pub mod netlink;
pub mod queue;

pub use queue::{Codec, Command, CopyMode, Message, Packet, PacketHeader, Request, Verdict};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("malformed attribute of type {ty} ({len} bytes)")]
    Attribute { ty: u16, len: usize },
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
