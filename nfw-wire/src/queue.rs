//! `nfnetlink_queue` messages: configuration and verdict requests sent to the kernel, and the
//! packet, ack and error messages received from it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::{
    netlink::{
        align, Attrs, Builder, Header, NFGEN_HDRLEN, NLMSG_DONE, NLMSG_ERROR, NLMSG_HDRLEN,
        NLMSG_NOOP, NLMSG_OVERRUN, NLM_F_ACK, NLM_F_REQUEST,
    },
    Error,
};

pub const NFNL_SUBSYS_QUEUE: u16 = 3;

pub const NFQNL_MSG_PACKET: u16 = 0;
pub const NFQNL_MSG_VERDICT: u16 = 1;
pub const NFQNL_MSG_CONFIG: u16 = 2;

pub const NFQA_CFG_CMD: u16 = 1;
pub const NFQA_CFG_PARAMS: u16 = 2;
pub const NFQA_CFG_QUEUE_MAXLEN: u16 = 3;
pub const NFQA_CFG_MASK: u16 = 4;
pub const NFQA_CFG_FLAGS: u16 = 5;

pub const NFQNL_CFG_CMD_BIND: u8 = 1;
pub const NFQNL_CFG_CMD_UNBIND: u8 = 2;
pub const NFQNL_CFG_CMD_PF_BIND: u8 = 3;
pub const NFQNL_CFG_CMD_PF_UNBIND: u8 = 4;

/// Accept packets instead of dropping them when the kernel queue is full.
pub const NFQA_CFG_F_FAIL_OPEN: u32 = 1 << 0;

pub const NFQA_PACKET_HDR: u16 = 1;
pub const NFQA_VERDICT_HDR: u16 = 2;
pub const NFQA_MARK: u16 = 3;
pub const NFQA_IFINDEX_INDEV: u16 = 5;
pub const NFQA_IFINDEX_OUTDEV: u16 = 6;
pub const NFQA_PAYLOAD: u16 = 10;
pub const NFQA_CAP_LEN: u16 = 13;

/// Full netlink message type of a queue message.
#[inline]
pub const fn msg_type(msg: u16) -> u16 {
    (NFNL_SUBSYS_QUEUE << 8) | msg
}

/// How much of each queued packet the kernel copies to userspace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CopyMode {
    /// Nothing is copied.
    None = 0,
    /// Only packet metadata.
    Meta = 1,
    /// Metadata and up to `range` bytes of the packet.
    #[default]
    Packet = 2,
}

/// Decision sent back to the kernel for a queued packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Verdict {
    Drop = 0,
    Accept = 1,
}

/// Queue configuration commands (`NFQNL_CFG_CMD_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Bind,
    Unbind,
    PfBind(u16),
    PfUnbind(u16),
}

impl Command {
    fn encode(self, dst: &mut BytesMut) {
        let (cmd, pf) = match self {
            Self::Bind => (NFQNL_CFG_CMD_BIND, 0),
            Self::Unbind => (NFQNL_CFG_CMD_UNBIND, 0),
            Self::PfBind(pf) => (NFQNL_CFG_CMD_PF_BIND, pf),
            Self::PfUnbind(pf) => (NFQNL_CFG_CMD_PF_UNBIND, pf),
        };

        dst.put_u8(cmd);
        dst.put_u8(0);
        dst.put_u16(pf);
    }
}

/// A request from userspace to the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Command { queue: u16, command: Command },
    Params { queue: u16, mode: CopyMode, range: u32 },
    Flags { queue: u16, flags: u32, mask: u32 },
    MaxLen { queue: u16, len: u32 },
    Verdict { queue: u16, id: u32, verdict: Verdict },
}

impl Request {
    /// Configuration requests are acknowledged by the kernel, verdicts are not.
    pub const fn wants_ack(&self) -> bool {
        !matches!(self, Self::Verdict { .. })
    }

    /// Writes the request as a single netlink message. Returns the number of bytes written.
    pub fn encode(&self, seq: u32, dst: &mut BytesMut) -> usize {
        let flags = if self.wants_ack() { NLM_F_REQUEST | NLM_F_ACK } else { NLM_F_REQUEST };

        match *self {
            Self::Command { queue, command } => {
                Builder::nfnl(dst, msg_type(NFQNL_MSG_CONFIG), flags, seq, 0, queue)
                    .attr(NFQA_CFG_CMD, |dst| command.encode(dst))
                    .finish()
            }
            Self::Params { queue, mode, range } => {
                Builder::nfnl(dst, msg_type(NFQNL_MSG_CONFIG), flags, seq, 0, queue)
                    .attr(NFQA_CFG_PARAMS, |dst| {
                        dst.put_u32(range);
                        dst.put_u8(mode as u8);
                    })
                    .finish()
            }
            Self::Flags { queue, flags: cfg_flags, mask } => {
                Builder::nfnl(dst, msg_type(NFQNL_MSG_CONFIG), flags, seq, 0, queue)
                    .attr_u32(NFQA_CFG_FLAGS, cfg_flags)
                    .attr_u32(NFQA_CFG_MASK, mask)
                    .finish()
            }
            Self::MaxLen { queue, len } => {
                Builder::nfnl(dst, msg_type(NFQNL_MSG_CONFIG), flags, seq, 0, queue)
                    .attr_u32(NFQA_CFG_QUEUE_MAXLEN, len)
                    .finish()
            }
            Self::Verdict { queue, id, verdict } => {
                Builder::nfnl(dst, msg_type(NFQNL_MSG_VERDICT), flags, seq, 0, queue)
                    .attr(NFQA_VERDICT_HDR, |dst| {
                        dst.put_u32(verdict as u32);
                        dst.put_u32(id);
                    })
                    .finish()
            }
        }
    }
}

/// `struct nfqnl_msg_packet_hdr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub id: u32,
    pub hw_protocol: u16,
    pub hook: u8,
}

/// A packet queued by the kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    /// The queue number the packet was diverted to.
    pub queue: u16,
    pub header: Option<PacketHeader>,
    pub mark: Option<u32>,
    pub indev: Option<u32>,
    pub outdev: Option<u32>,
    /// Original length of the packet, present when the payload was truncated to the copy range.
    pub cap_len: Option<u32>,
    /// The copied packet bytes, starting at the network header. Empty when nothing was copied.
    pub payload: Bytes,
}

impl Packet {
    /// Creates an IPv4 packet with the given id, as the kernel would deliver it.
    pub fn new(queue: u16, id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            queue,
            header: Some(PacketHeader { id, hw_protocol: 0x0800, hook: 1 }),
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// The packet id, if the kernel sent a packet header.
    pub fn id(&self) -> Option<u32> {
        self.header.map(|h| h.id)
    }

    /// Writes the packet as the kernel would (`NFQNL_MSG_PACKET`). Used to synthesize traffic.
    pub fn encode(&self, seq: u32, dst: &mut BytesMut) -> usize {
        let mut builder = Builder::nfnl(dst, msg_type(NFQNL_MSG_PACKET), 0, seq, 2, self.queue);

        if let Some(header) = self.header {
            builder = builder.attr(NFQA_PACKET_HDR, |dst| {
                dst.put_u32(header.id);
                dst.put_u16(header.hw_protocol);
                dst.put_u8(header.hook);
            });
        }
        if let Some(mark) = self.mark {
            builder = builder.attr_u32(NFQA_MARK, mark);
        }
        if let Some(indev) = self.indev {
            builder = builder.attr_u32(NFQA_IFINDEX_INDEV, indev);
        }
        if let Some(outdev) = self.outdev {
            builder = builder.attr_u32(NFQA_IFINDEX_OUTDEV, outdev);
        }
        if let Some(cap_len) = self.cap_len {
            builder = builder.attr_u32(NFQA_CAP_LEN, cap_len);
        }
        if !self.payload.is_empty() {
            builder = builder.attr(NFQA_PAYLOAD, |dst| dst.put_slice(&self.payload));
        }

        builder.finish()
    }

    /// Reads what is left of a packet message that was cut short, for instance by a receive
    /// buffer smaller than the datagram. Returns `None` unless the queue number and the packet
    /// id survived. The payload is never returned, a partial packet can't be classified.
    pub fn salvage(frame: &[u8]) -> Option<Self> {
        let header = Header::peek(frame).ok()?;
        if header.ty != msg_type(NFQNL_MSG_PACKET) {
            return None;
        }

        let end = (header.len as usize).clamp(NLMSG_HDRLEN, frame.len());
        let mut packet = Self::parse(&Bytes::copy_from_slice(&frame[..end])).ok()?;
        packet.header?;

        packet.payload = Bytes::new();
        Some(packet)
    }

    /// Parses the body of a packet message. Attribute damage never fails the whole packet: the
    /// queue number is all that is needed to issue a verdict, so parsing stops at the first bad
    /// attribute and keeps what was read so far.
    fn parse(frame: &Bytes) -> Result<Self, Error> {
        let body = &frame[NLMSG_HDRLEN..];
        if body.len() < NFGEN_HDRLEN {
            return Err(Error::Truncated { need: NLMSG_HDRLEN + NFGEN_HDRLEN, have: frame.len() });
        }

        let mut packet =
            Self { queue: u16::from_be_bytes([body[2], body[3]]), ..Default::default() };

        for attr in Attrs::new(&body[NFGEN_HDRLEN..]) {
            let attr = match attr {
                Ok(attr) => attr,
                Err(e) => {
                    warn!(queue = packet.queue, ?e, "malformed packet attribute");
                    break;
                }
            };

            let parsed = match attr.ty {
                NFQA_PACKET_HDR => attr.array::<7>().map(|raw| {
                    packet.header = Some(PacketHeader {
                        id: u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
                        hw_protocol: u16::from_be_bytes([raw[4], raw[5]]),
                        hook: raw[6],
                    });
                }),
                NFQA_MARK => attr.u32().map(|v| packet.mark = Some(v)),
                NFQA_IFINDEX_INDEV => attr.u32().map(|v| packet.indev = Some(v)),
                NFQA_IFINDEX_OUTDEV => attr.u32().map(|v| packet.outdev = Some(v)),
                NFQA_CAP_LEN => attr.u32().map(|v| packet.cap_len = Some(v)),
                NFQA_PAYLOAD => {
                    packet.payload = frame.slice_ref(attr.payload);
                    Ok(())
                }
                _ => Ok(()),
            };

            if let Err(e) = parsed {
                warn!(queue = packet.queue, ?e, "skipping short packet attribute");
            }
        }

        Ok(packet)
    }
}

/// A message received from the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Packet(Packet),
    /// Positive acknowledgement of the request with sequence number `seq`.
    Ack { seq: u32 },
    /// The request with sequence number `seq` failed with `errno`. Also used by the kernel for
    /// asynchronous errors such as `ENOBUFS`, in which case `seq` is 0.
    Error { seq: u32, errno: i32 },
    Done,
    Noop,
    Overrun,
    Other { ty: u16 },
}

impl Message {
    fn parse(header: Header, frame: Bytes) -> Result<Self, Error> {
        match header.ty {
            NLMSG_ERROR => {
                let mut body = &frame[NLMSG_HDRLEN..];
                if body.len() < 4 {
                    return Err(Error::Truncated { need: NLMSG_HDRLEN + 4, have: frame.len() });
                }

                let errno = body.get_i32_ne();
                if errno == 0 {
                    Ok(Self::Ack { seq: header.seq })
                } else {
                    Ok(Self::Error { seq: header.seq, errno: errno.saturating_abs() })
                }
            }
            NLMSG_DONE => Ok(Self::Done),
            NLMSG_NOOP => Ok(Self::Noop),
            NLMSG_OVERRUN => Ok(Self::Overrun),
            ty if ty == msg_type(NFQNL_MSG_PACKET) => Packet::parse(&frame).map(Self::Packet),
            ty => Ok(Self::Other { ty }),
        }
    }
}

/// Codec for the queue subsystem. Encoding stamps every request with a fresh sequence number;
/// decoding splits a received datagram into its messages.
///
/// Netlink sockets are datagram oriented, so bytes left in the buffer after [`Decoder::decode`]
/// returns `Ok(None)` are trailing garbage and should be discarded by the caller.
#[derive(Debug, Default)]
pub struct Codec {
    seq: u32,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sequence number of the last encoded request.
    pub fn seq(&self) -> u32 {
        self.seq
    }
}

impl Encoder<Request> for Codec {
    type Error = Error;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.seq = self.seq.wrapping_add(1);
        item.encode(self.seq, dst);
        Ok(())
    }
}

impl Decoder for Codec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < NLMSG_HDRLEN {
            return Ok(None);
        }

        let header = Header::peek(src)?;
        let len = header.len as usize;
        if len < NLMSG_HDRLEN || len > src.len() {
            let have = src.len();
            src.clear();
            return Err(Error::Truncated { need: len.max(NLMSG_HDRLEN), have });
        }

        let frame = src.split_to(len).freeze();
        let padding = (align(len) - len).min(src.len());
        src.advance(padding);

        Message::parse(header, frame).map(Some)
    }
}
