//! Linux backend speaking `nfnetlink_queue` over a `NETLINK_NETFILTER` socket.

use std::{
    collections::VecDeque,
    io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    time::Duration,
};

use bytes::BytesMut;
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
    sys::socket::{
        bind, recv, sendto, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag,
        SockProtocol, SockType,
    },
};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace, warn};

use nfw_wire::{queue::NFQA_CFG_F_FAIL_OPEN, Codec, Command, Message, Request};

use crate::{CopyMode, ProtocolFamily, QueueBackend, QueueHandle, QueueSession, Verdict};

/// Large enough for a full 64 KiB packet plus netlink and queue metadata.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 8192 + 0x10000;

/// How long to wait for the kernel to acknowledge a configuration request.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Opens netlink sessions with the kernel.
#[derive(Debug, Clone)]
pub struct Netlink {
    ack_timeout: Duration,
    recv_buffer_size: usize,
}

impl Default for Netlink {
    fn default() -> Self {
        Self { ack_timeout: DEFAULT_ACK_TIMEOUT, recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE }
    }
}

impl Netlink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long configuration requests wait for the kernel's acknowledgement.
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Sets the buffer used to receive acknowledgements during setup.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }
}

impl QueueBackend for Netlink {
    type Session = NetlinkSession;

    fn open(&self) -> io::Result<Self::Session> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            SockProtocol::NetlinkNetFilter,
        )?;

        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, 0))?;
        disable_enobufs(&fd)?;

        debug!(fd = fd.as_raw_fd(), "opened netfilter queue session");

        Ok(NetlinkSession {
            fd,
            codec: Codec::new(),
            tx: BytesMut::with_capacity(256),
            backlog: VecDeque::new(),
            ack_timeout: self.ack_timeout,
            recv_buffer_size: self.recv_buffer_size,
        })
    }
}

/// The kernel reports `ENOBUFS` when the socket buffer overflows. There is nothing to do about it
/// from userspace but it would surface as a receive error, so it is turned off.
fn disable_enobufs(fd: &OwnedFd) -> io::Result<()> {
    let enable: libc::c_int = 1;
    // SAFETY: valid socket, option value points to a live c_int of the advertised size.
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_NETLINK,
            libc::NETLINK_NO_ENOBUFS,
            &enable as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// A session over a netlink socket.
#[derive(Debug)]
pub struct NetlinkSession {
    fd: OwnedFd,
    codec: Codec,
    /// Reused request buffer.
    tx: BytesMut,
    /// Datagrams carrying packets that arrived while waiting for an acknowledgement.
    backlog: VecDeque<BytesMut>,
    ack_timeout: Duration,
    recv_buffer_size: usize,
}

impl NetlinkSession {
    /// Sends a request and, for configuration requests, waits for the kernel's verdict on it.
    fn request(&mut self, request: Request) -> io::Result<()> {
        let wants_ack = request.wants_ack();

        self.tx.clear();
        self.codec.encode(request, &mut self.tx).map_err(io::Error::other)?;
        let seq = self.codec.seq();

        loop {
            match sendto(self.fd.as_raw_fd(), &self.tx, &NetlinkAddr::new(0, 0), MsgFlags::empty())
            {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if wants_ack {
            self.wait_ack(seq)
        } else {
            Ok(())
        }
    }

    fn wait_ack(&mut self, seq: u32) -> io::Result<()> {
        loop {
            if !self.wait_readable(self.ack_timeout)? {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no acknowledgement for request {seq}"),
                ));
            }

            let mut datagram = BytesMut::zeroed(self.recv_buffer_size);
            let n = match recv(self.fd.as_raw_fd(), &mut datagram, MsgFlags::empty()) {
                Ok(n) => n,
                Err(Errno::EINTR | Errno::EAGAIN) => continue,
                Err(e) => return Err(e.into()),
            };
            datagram.truncate(n);

            let mut scan = datagram.clone();
            let mut outcome = None;
            let mut keep = false;

            loop {
                match self.codec.decode(&mut scan) {
                    Ok(Some(Message::Ack { seq: acked })) if acked == seq => {
                        outcome = Some(Ok(()));
                    }
                    Ok(Some(Message::Error { seq: failed, errno })) if failed == seq => {
                        outcome = Some(Err(io::Error::from_raw_os_error(errno)));
                    }
                    Ok(Some(Message::Ack { .. } | Message::Noop | Message::Done)) => {}
                    Ok(Some(msg)) => {
                        trace!(?msg, "deferring message received while waiting for ack");
                        keep = true;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(?e, "malformed frame while waiting for ack");
                        break;
                    }
                }
            }

            if keep {
                self.backlog.push_back(datagram);
            }

            if let Some(outcome) = outcome {
                return outcome;
            }
        }
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];

        loop {
            match poll(&mut fds, PollTimeout::from(millis)) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl AsFd for NetlinkSession {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl QueueSession for NetlinkSession {
    fn bind_family(&mut self, family: ProtocolFamily) -> io::Result<()> {
        self.request(Request::Command { queue: 0, command: Command::PfUnbind(family.0) })?;
        self.request(Request::Command { queue: 0, command: Command::PfBind(family.0) })
    }

    fn create_queue(&mut self, number: u16) -> io::Result<QueueHandle> {
        self.request(Request::Command { queue: number, command: Command::Bind })?;
        Ok(QueueHandle::new(number))
    }

    fn set_mode(&mut self, queue: &QueueHandle, mode: CopyMode, range: u32) -> io::Result<()> {
        self.request(Request::Params { queue: queue.number(), mode, range })
    }

    fn set_fail_open(&mut self, queue: &QueueHandle, enabled: bool) -> io::Result<()> {
        let flags = if enabled { NFQA_CFG_F_FAIL_OPEN } else { 0 };
        self.request(Request::Flags { queue: queue.number(), flags, mask: NFQA_CFG_F_FAIL_OPEN })
    }

    fn set_max_len(&mut self, queue: &QueueHandle, len: u32) -> io::Result<()> {
        self.request(Request::MaxLen { queue: queue.number(), len })
    }

    fn has_pending(&self) -> bool {
        !self.backlog.is_empty()
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(datagram) = self.backlog.pop_front() {
            let n = datagram.len().min(buf.len());
            buf[..n].copy_from_slice(&datagram[..n]);
            return Ok(datagram.len());
        }

        // MSG_TRUNC reports the full datagram length even when it doesn't fit.
        recv(self.fd.as_raw_fd(), buf, MsgFlags::MSG_TRUNC).map_err(Into::into)
    }

    fn set_verdict(&mut self, queue: &QueueHandle, id: u32, verdict: Verdict) -> io::Result<()> {
        self.request(Request::Verdict { queue: queue.number(), id, verdict })
    }

    fn destroy_queue(&mut self, queue: QueueHandle) -> io::Result<()> {
        self.request(Request::Command { queue: queue.number(), command: Command::Unbind })
    }

    fn close(self) -> io::Result<()> {
        debug!(fd = self.fd.as_raw_fd(), "closing netfilter queue session");
        drop(self.fd);
        Ok(())
    }
}
