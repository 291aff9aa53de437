#![doc(issue_tracker_base_url = "https://github.com/chainbound/nfw/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! The kernel side of the firewall: a [`QueueBackend`] opens [`QueueSession`]s, through which
//! queues are bound, packets are received and verdicts are issued.

use std::{fmt, io, os::fd::AsFd};

pub use nfw_wire::{CopyMode, Verdict};

#[cfg(target_os = "linux")]
pub mod netlink;

/// A protocol family to bind a session to (`AF_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolFamily(pub u16);

impl ProtocolFamily {
    pub const INET: Self = Self(libc::AF_INET as u16);
    pub const INET6: Self = Self(libc::AF_INET6 as u16);
}

impl Default for ProtocolFamily {
    fn default() -> Self {
        Self::INET
    }
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::INET => f.write_str("inet"),
            Self::INET6 => f.write_str("inet6"),
            Self(n) => write!(f, "af{n}"),
        }
    }
}

/// A numbered queue created within a session. Handles are owned by whoever created them and are
/// consumed by [`QueueSession::destroy_queue`]; they are not valid once their session is closed.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    number: u16,
}

impl QueueHandle {
    pub const fn new(number: u16) -> Self {
        Self { number }
    }

    pub const fn number(&self) -> u16 {
        self.number
    }
}

/// Opens sessions with the kernel's packet queueing facility.
pub trait QueueBackend: Send + Sync + 'static {
    type Session: QueueSession;

    /// Opens a new session.
    fn open(&self) -> io::Result<Self::Session>;
}

/// A process' connection to the packet queueing facility.
///
/// The session's file descriptor becomes readable when [`QueueSession::recv`] has data.
pub trait QueueSession: AsFd + Send + 'static {
    /// Binds the session to a protocol family.
    fn bind_family(&mut self, family: ProtocolFamily) -> io::Result<()>;

    /// Creates (binds) the queue with the given number.
    fn create_queue(&mut self, number: u16) -> io::Result<QueueHandle>;

    /// Sets how much of each packet is copied to userspace.
    fn set_mode(&mut self, queue: &QueueHandle, mode: CopyMode, range: u32) -> io::Result<()>;

    /// Makes the kernel accept packets instead of dropping them when the queue is full.
    fn set_fail_open(&mut self, queue: &QueueHandle, enabled: bool) -> io::Result<()>;

    /// Sets the maximum number of packets waiting in the kernel queue.
    fn set_max_len(&mut self, queue: &QueueHandle, len: u32) -> io::Result<()>;

    /// True if data is buffered in userspace, so [`QueueSession::recv`] will not block even
    /// though the descriptor may not be readable.
    fn has_pending(&self) -> bool {
        false
    }

    /// Receives one datagram into `buf` and returns its full length, which exceeds `buf.len()`
    /// when the datagram was truncated. `Ok(0)` means the kernel side closed.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Issues the verdict for packet `id` on `queue`.
    fn set_verdict(&mut self, queue: &QueueHandle, id: u32, verdict: Verdict) -> io::Result<()>;

    /// Destroys (unbinds) a queue.
    fn destroy_queue(&mut self, queue: QueueHandle) -> io::Result<()>;

    /// Closes the session. All its queues must have been destroyed first.
    fn close(self) -> io::Result<()>
    where
        Self: Sized;
}
