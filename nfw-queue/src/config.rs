use std::{fmt, sync::Arc, time::Duration};

use nfw_common::constants::KiB;
use nfw_filter::PacketHandler;
use nfw_transport::{CopyMode, ProtocolFamily};

/// How long the worker waits for packets before it re-checks whether it should stop.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Fits a full 64 KiB packet plus its netlink metadata.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = (8 * KiB + 64 * KiB) as usize;

/// Copy everything up to the largest possible IPv4 packet.
pub const DEFAULT_COPY_RANGE: u32 = 0xffff;

/// A numbered queue together with the handler that decides on its packets.
#[derive(Clone)]
pub struct QueueRegistration {
    number: u16,
    mode: CopyMode,
    range: u32,
    handler: Arc<dyn PacketHandler>,
    fail_open: Option<bool>,
    max_len: Option<u32>,
}

impl fmt::Debug for QueueRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueRegistration")
            .field("number", &self.number)
            .field("mode", &self.mode)
            .field("range", &self.range)
            .field("fail_open", &self.fail_open)
            .field("max_len", &self.max_len)
            .finish_non_exhaustive()
    }
}

impl QueueRegistration {
    /// Registers `handler` for queue `number`, copying full packets.
    pub fn new(number: u16, handler: impl PacketHandler) -> Self {
        Self::shared(number, Arc::new(handler))
    }

    /// Like [`QueueRegistration::new`], for a handler the caller keeps a reference to.
    pub fn shared(number: u16, handler: Arc<dyn PacketHandler>) -> Self {
        Self {
            number,
            mode: CopyMode::default(),
            range: DEFAULT_COPY_RANGE,
            handler,
            fail_open: None,
            max_len: None,
        }
    }

    /// Sets the copy mode.
    pub fn mode(mut self, mode: CopyMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the maximum number of bytes copied per packet.
    pub fn range(mut self, range: u32) -> Self {
        self.range = range;
        self
    }

    /// Makes the kernel accept (`true`) instead of drop packets that don't fit in the queue.
    /// Left at the kernel default when unset.
    pub fn fail_open(mut self, enabled: bool) -> Self {
        self.fail_open = Some(enabled);
        self
    }

    /// Sets the kernel side queue length. Left at the kernel default when unset.
    pub fn max_len(mut self, len: u32) -> Self {
        self.max_len = Some(len);
        self
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn copy_mode(&self) -> CopyMode {
        self.mode
    }

    pub fn copy_range(&self) -> u32 {
        self.range
    }

    pub fn handler(&self) -> &Arc<dyn PacketHandler> {
        &self.handler
    }

    pub(crate) fn fail_open_flag(&self) -> Option<bool> {
        self.fail_open
    }

    pub(crate) fn max_queue_len(&self) -> Option<u32> {
        self.max_len
    }
}

/// Options for a [`Firewall`](crate::Firewall).
#[derive(Debug, Clone)]
pub struct FirewallConfig {
    pub(crate) protocol_family: ProtocolFamily,
    pub(crate) queues: Vec<QueueRegistration>,
    pub(crate) poll_timeout: Duration,
    pub(crate) recv_buffer_size: usize,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            protocol_family: ProtocolFamily::default(),
            queues: Vec::new(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }
}

impl FirewallConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the protocol family the session binds to. Defaults to IPv4.
    pub fn protocol_family(mut self, family: ProtocolFamily) -> Self {
        self.protocol_family = family;
        self
    }

    /// Adds a queue. Queues are created in the order they are added.
    pub fn queue(mut self, registration: QueueRegistration) -> Self {
        self.queues.push(registration);
        self
    }

    /// Sets the bounded wait of the worker, i.e. the worst case latency of a stop request.
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Sets the size of the receive buffer. Datagrams larger than this are truncated.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    pub fn queues(&self) -> &[QueueRegistration] {
        &self.queues
    }
}
