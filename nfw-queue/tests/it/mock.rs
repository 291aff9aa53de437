//! An in-memory queue backend. The session's descriptor is one end of a `UnixDatagram` pair;
//! the test plays the kernel on the other end.

use std::{
    collections::HashSet,
    io,
    net::Ipv4Addr,
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd},
        unix::net::UnixDatagram,
    },
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use nix::sys::socket::{recv, MsgFlags};
use parking_lot::{Condvar, Mutex};
use pnet::packet::{
    ip::IpNextHeaderProtocols,
    ipv4::MutableIpv4Packet,
    tcp::{MutableTcpPacket, TcpFlags},
};

use nfw_common::ErrorReporter;
use nfw_transport::{CopyMode, ProtocolFamily, QueueBackend, QueueHandle, QueueSession, Verdict};
use nfw_wire::Packet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open,
    BindFamily(u16),
    CreateQueue(u16),
    SetMode(u16, CopyMode, u32),
    SetFailOpen(u16, bool),
    SetMaxLen(u16, u32),
    Verdict { queue: u16, id: u32, verdict: Verdict },
    DestroyQueue(u16),
    Close,
}

pub const EPERM: i32 = 1;

/// Operations that fail with `EPERM`.
#[derive(Debug, Default)]
pub struct Failures {
    pub open: bool,
    pub bind: bool,
    pub create: HashSet<u16>,
    pub set_mode: HashSet<u16>,
    pub fail_open: HashSet<u16>,
    pub verdict: bool,
    pub recv: bool,
}

#[derive(Debug, Default)]
struct Shared {
    calls: Mutex<Vec<Call>>,
    changed: Condvar,
    failures: Mutex<Failures>,
    open_delay: Mutex<Option<Duration>>,
    kernel: Mutex<Option<UnixDatagram>>,
}

impl Shared {
    fn record(&self, call: Call) {
        self.calls.lock().push(call);
        self.changed.notify_all();
    }

    fn fail(&self, check: impl FnOnce(&Failures) -> bool) -> io::Result<()> {
        let failures = self.failures.lock();
        if check(&*failures) {
            Err(io::Error::from_raw_os_error(EPERM))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    shared: Arc<Shared>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(self, f: impl FnOnce(&mut Failures)) -> Self {
        f(&mut *self.shared.failures.lock());
        self
    }

    /// Makes every `open` take `delay`.
    pub fn slow_open(self, delay: Duration) -> Self {
        *self.shared.open_delay.lock() = Some(delay);
        self
    }

    pub fn set_failures(&self, f: impl FnOnce(&mut Failures)) {
        f(&mut *self.shared.failures.lock());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.shared.calls.lock().clone()
    }

    pub fn verdicts(&self) -> Vec<(u16, u32, Verdict)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Verdict { queue, id, verdict } => Some((queue, id, verdict)),
                _ => None,
            })
            .collect()
    }

    /// Waits until `done` holds for the recorded calls. Returns false on timeout.
    pub fn wait_for(&self, timeout: Duration, done: impl Fn(&[Call]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut calls = self.shared.calls.lock();
        while !done(&calls) {
            if self.shared.changed.wait_until(&mut calls, deadline).timed_out() {
                return done(&calls);
            }
        }
        true
    }

    pub fn wait_for_verdicts(&self, n: usize) -> Vec<(u16, u32, Verdict)> {
        let counted = |calls: &[Call]| {
            calls.iter().filter(|c| matches!(c, Call::Verdict { .. })).count() >= n
        };
        assert!(self.wait_for(Duration::from_secs(5), counted), "timed out waiting for verdicts");
        self.verdicts()
    }

    /// The kernel end of the most recently opened session.
    pub fn kernel(&self) -> Kernel {
        let sock = self.shared.kernel.lock().take().expect("no session opened");
        Kernel { sock, seq: 0 }
    }
}

impl QueueBackend for MockBackend {
    type Session = MockSession;

    fn open(&self) -> io::Result<Self::Session> {
        self.shared.record(Call::Open);
        let delay = *self.shared.open_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.shared.fail(|f| f.open)?;

        let (sock, kernel) = UnixDatagram::pair()?;
        sock.set_nonblocking(true)?;
        *self.shared.kernel.lock() = Some(kernel);

        Ok(MockSession { sock, shared: Arc::clone(&self.shared) })
    }
}

#[derive(Debug)]
pub struct MockSession {
    sock: UnixDatagram,
    shared: Arc<Shared>,
}

impl AsFd for MockSession {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.sock.as_fd()
    }
}

impl QueueSession for MockSession {
    fn bind_family(&mut self, family: ProtocolFamily) -> io::Result<()> {
        self.shared.record(Call::BindFamily(family.0));
        self.shared.fail(|f| f.bind)
    }

    fn create_queue(&mut self, number: u16) -> io::Result<QueueHandle> {
        self.shared.record(Call::CreateQueue(number));
        self.shared.fail(|f| f.create.contains(&number))?;
        Ok(QueueHandle::new(number))
    }

    fn set_mode(&mut self, queue: &QueueHandle, mode: CopyMode, range: u32) -> io::Result<()> {
        self.shared.record(Call::SetMode(queue.number(), mode, range));
        self.shared.fail(|f| f.set_mode.contains(&queue.number()))
    }

    fn set_fail_open(&mut self, queue: &QueueHandle, enabled: bool) -> io::Result<()> {
        self.shared.record(Call::SetFailOpen(queue.number(), enabled));
        self.shared.fail(|f| f.fail_open.contains(&queue.number()))
    }

    fn set_max_len(&mut self, queue: &QueueHandle, len: u32) -> io::Result<()> {
        self.shared.record(Call::SetMaxLen(queue.number(), len));
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.shared.fail(|f| f.recv)?;
        // Like the netlink backend, report the full length of truncated datagrams.
        recv(self.sock.as_raw_fd(), buf, MsgFlags::MSG_TRUNC).map_err(Into::into)
    }

    fn set_verdict(&mut self, queue: &QueueHandle, id: u32, verdict: Verdict) -> io::Result<()> {
        self.shared.record(Call::Verdict { queue: queue.number(), id, verdict });
        self.shared.fail(|f| f.verdict)
    }

    fn destroy_queue(&mut self, queue: QueueHandle) -> io::Result<()> {
        self.shared.record(Call::DestroyQueue(queue.number()));
        Ok(())
    }

    fn close(self) -> io::Result<()> {
        self.shared.record(Call::Close);
        Ok(())
    }
}

/// The kernel side of a mock session.
#[derive(Debug)]
pub struct Kernel {
    sock: UnixDatagram,
    seq: u32,
}

impl Kernel {
    /// Sends the packets as a single datagram.
    pub fn send(&mut self, packets: &[Packet]) {
        let mut buf = BytesMut::new();
        for packet in packets {
            self.seq += 1;
            packet.encode(self.seq, &mut buf);
        }
        self.send_raw(&buf);
    }

    pub fn send_raw(&self, datagram: &[u8]) {
        self.sock.send(datagram).expect("session end is alive");
    }

    /// A zero length datagram reads as the kernel closing the session.
    pub fn hang_up(&self) {
        self.send_raw(&[]);
    }
}

/// An IPv4/TCP packet to `dst_port` carrying `payload`.
pub fn tcp(dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 40 + payload.len()];
    let total = buf.len() as u16;

    let mut ip = MutableIpv4Packet::new(&mut buf).expect("fits ipv4");
    ip.set_version(4);
    ip.set_header_length(5);
    ip.set_total_length(total);
    ip.set_ttl(64);
    ip.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
    ip.set_source(Ipv4Addr::new(10, 0, 0, 1));
    ip.set_destination(Ipv4Addr::new(10, 0, 0, 2));

    let mut tcp = MutableTcpPacket::new(&mut buf[20..]).expect("fits tcp");
    tcp.set_source(40000);
    tcp.set_destination(dst_port);
    tcp.set_data_offset(5);
    tcp.set_flags((TcpFlags::ACK as u8).into());
    tcp.set_window(1024);
    tcp.set_payload(payload);

    buf
}

/// Collects everything sent to the error channel.
#[derive(Debug, Clone, Default)]
pub struct Reports(Arc<Mutex<Vec<(String, String, i32)>>>);

impl Reports {
    pub fn operations(&self) -> Vec<String> {
        self.0.lock().iter().map(|(op, _, _)| op.clone()).collect()
    }

    pub fn all(&self) -> Vec<(String, String, i32)> {
        self.0.lock().clone()
    }
}

impl ErrorReporter for Reports {
    fn report(&self, operation: &str, message: &str, code: i32) {
        self.0.lock().push((operation.to_owned(), message.to_owned(), code));
    }
}
