use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::BytesMut;
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
};
use rustc_hash::FxHashMap;
use tokio_util::codec::Decoder;
use tracing::{debug, info, trace, warn};

use nfw_common::ErrorReporter;
use nfw_filter::PacketHandler;
use nfw_transport::{QueueHandle, QueueSession};
use nfw_wire::{Codec, Message, Packet, Verdict};

use crate::{verdict, QueueError};

/// A created queue and the handler deciding on its packets.
pub(crate) struct Binding {
    handle: QueueHandle,
    handler: Arc<dyn PacketHandler>,
}

impl Binding {
    pub(crate) fn new(handle: QueueHandle, handler: Arc<dyn PacketHandler>) -> Self {
        Self { handle, handler }
    }
}

/// A session together with every queue created in it. Owns all kernel resources of a running
/// firewall.
pub(crate) struct Bindings<S> {
    session: S,
    queues: FxHashMap<u16, Binding>,
}

impl<S: QueueSession> Bindings<S> {
    pub(crate) fn new(session: S) -> Self {
        Self { session, queues: FxHashMap::default() }
    }

    pub(crate) fn session(&mut self) -> &mut S {
        &mut self.session
    }

    pub(crate) fn contains(&self, queue: u16) -> bool {
        self.queues.contains_key(&queue)
    }

    pub(crate) fn insert(&mut self, binding: Binding) {
        self.queues.insert(binding.handle.number(), binding);
    }

    pub(crate) fn len(&self) -> usize {
        self.queues.len()
    }

    /// Destroys every queue, lowest number first, then closes the session. Handles are invalid
    /// once the session is closed, so the order matters.
    pub(crate) fn teardown(self, reporter: &dyn ErrorReporter) {
        let Self { mut session, queues } = self;

        let mut queues: Vec<_> = queues.into_values().map(|b| b.handle).collect();
        queues.sort_unstable_by_key(QueueHandle::number);

        for handle in queues {
            let queue = handle.number();
            match session.destroy_queue(handle) {
                Ok(()) => debug!(queue, "destroyed queue"),
                Err(source) => QueueError::DestroyQueue { queue, source }.report_to(reporter),
            }
        }

        match session.close() {
            Ok(()) => debug!("closed queue session"),
            Err(source) => QueueError::Close(source).report_to(reporter),
        }
    }
}

/// The receive, classify and verdict loop. Runs on its own thread until the running flag is
/// cleared or the session fails.
pub(crate) struct Worker<S> {
    bindings: Bindings<S>,
    running: Arc<AtomicBool>,
    reporter: Arc<dyn ErrorReporter>,
    codec: Codec,
    buf: Vec<u8>,
    poll_timeout: Duration,
}

impl<S: QueueSession> Worker<S> {
    pub(crate) fn new(
        bindings: Bindings<S>,
        running: Arc<AtomicBool>,
        reporter: Arc<dyn ErrorReporter>,
        poll_timeout: Duration,
        recv_buffer_size: usize,
    ) -> Self {
        Self {
            bindings,
            running,
            reporter,
            codec: Codec::new(),
            buf: vec![0; recv_buffer_size],
            poll_timeout,
        }
    }

    pub(crate) fn run(mut self) {
        let _span = tracing::info_span!("queue_worker", queues = self.bindings.len()).entered();
        info!("queue worker started");

        while self.running.load(Ordering::Acquire) {
            match self.wait() {
                Ok(true) => {}
                Ok(false) => continue,
                Err(source) => {
                    QueueError::Poll(source).report_to(&*self.reporter);
                    break;
                }
            }

            let n = match self.bindings.session.recv(&mut self.buf) {
                Ok(0) => {
                    debug!("queue session closed by the kernel");
                    break;
                }
                Ok(n) if n > self.buf.len() => {
                    warn!(
                        len = n,
                        buffer = self.buf.len(),
                        "datagram truncated, raise the receive buffer size"
                    );
                    self.buf.len()
                }
                Ok(n) => n,
                Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {
                    continue
                }
                Err(source) => {
                    QueueError::Recv(source).report_to(&*self.reporter);
                    break;
                }
            };

            self.dispatch(n);
        }

        self.running.store(false, Ordering::Release);
        info!("queue worker stopping");

        self.teardown();
    }

    /// Releases the kernel resources without running the loop.
    pub(crate) fn teardown(self) {
        let Self { bindings, reporter, .. } = self;
        bindings.teardown(&*reporter);
    }

    /// Waits for the session to become readable. Returns `Ok(false)` on timeout or interruption.
    fn wait(&self) -> io::Result<bool> {
        if self.bindings.session.has_pending() {
            return Ok(true);
        }

        let millis = u16::try_from(self.poll_timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.bindings.session.as_fd(), PollFlags::POLLIN)];

        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(n) => Ok(n > 0),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Handles every message of a received datagram, in order.
    ///
    /// The decoder always makes progress on errors: a frame that fails to parse is skipped, a
    /// frame whose length overruns the datagram ends it. Packets in either kind of broken frame
    /// are accepted if their id can still be read.
    fn dispatch(&mut self, n: usize) {
        let mut datagram = BytesMut::from(&self.buf[..n]);

        loop {
            let offset = n - datagram.len();

            match self.codec.decode(&mut datagram) {
                Ok(Some(Message::Packet(packet))) => self.handle(&packet),
                Ok(Some(Message::Error { seq, errno })) => {
                    let source = io::Error::from_raw_os_error(errno);
                    QueueError::Kernel { seq, source }.report_to(&*self.reporter);
                }
                Ok(Some(Message::Overrun)) => warn!("kernel reported a receive buffer overrun"),
                Ok(Some(msg)) => trace!(?msg, "ignoring message"),
                Ok(None) => break,
                Err(e) => {
                    warn!(?e, "malformed frame");
                    self.salvage(offset, n);
                }
            }
        }
    }

    /// Accepts the packet in the broken frame at `buf[offset..n]`, if any.
    fn salvage(&mut self, offset: usize, n: usize) {
        let Some(packet) = Packet::salvage(&self.buf[offset..n]) else {
            return;
        };

        let queue = QueueHandle::new(packet.queue);
        debug!(queue = packet.queue, id = ?packet.id(), "accepting packet from a broken frame");
        if let Err(e) = verdict::accept(&mut self.bindings.session, &queue, &packet) {
            e.report_to(&*self.reporter);
        }
    }

    /// Classifies one packet and answers it. Every path ends in exactly one verdict.
    fn handle(&mut self, packet: &Packet) {
        let Some(binding) = self.bindings.queues.get(&packet.queue) else {
            debug!(queue = packet.queue, "packet on an unknown queue, accepting");
            let unknown = QueueHandle::new(packet.queue);
            if let Err(e) = verdict::accept(&mut self.bindings.session, &unknown, packet) {
                e.report_to(&*self.reporter);
            }
            return;
        };

        let handler = &binding.handler;
        let decision =
            panic::catch_unwind(AssertUnwindSafe(|| handler.classify_and_verdict(&packet.payload)));

        let decision = match decision {
            Ok(decision) => decision,
            Err(_) => {
                let id = packet.id().unwrap_or(0);
                QueueError::Handler { queue: packet.queue, id }.report_to(&*self.reporter);
                Verdict::Accept
            }
        };

        trace!(queue = packet.queue, id = ?packet.id(), ?decision, "verdict");

        if let Err(e) = verdict::issue(&mut self.bindings.session, &binding.handle, packet, decision)
        {
            e.report_to(&*self.reporter);
        }
    }
}
