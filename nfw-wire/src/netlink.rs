//! Generic netlink framing: message headers and attributes.

use bytes::{Buf, BufMut, BytesMut};

use crate::Error;

/// Length of `struct nlmsghdr`.
pub const NLMSG_HDRLEN: usize = 16;
/// Length of `struct nfgenmsg`.
pub const NFGEN_HDRLEN: usize = 4;
/// Length of `struct nlattr`.
pub const NLA_HDRLEN: usize = 4;

pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const NLMSG_OVERRUN: u16 = 4;

pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_ACK: u16 = 0x04;

pub const NFNETLINK_V0: u8 = 0;

const NLA_F_NESTED: u16 = 1 << 15;
const NLA_F_NET_BYTEORDER: u16 = 1 << 14;
const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

/// Rounds `len` up to the netlink alignment of 4 bytes.
#[inline]
pub const fn align(len: usize) -> usize {
    (len + 3) & !3
}

/// `struct nlmsghdr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Length of the message including this header.
    pub len: u32,
    pub ty: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

impl Header {
    /// Reads a header from the front of `src` without consuming it.
    pub fn peek(src: &[u8]) -> Result<Self, Error> {
        if src.len() < NLMSG_HDRLEN {
            return Err(Error::Truncated { need: NLMSG_HDRLEN, have: src.len() });
        }

        let mut src = &src[..NLMSG_HDRLEN];
        Ok(Self {
            len: src.get_u32_ne(),
            ty: src.get_u16_ne(),
            flags: src.get_u16_ne(),
            seq: src.get_u32_ne(),
            pid: src.get_u32_ne(),
        })
    }

    pub fn put(&self, dst: &mut BytesMut) {
        dst.put_u32_ne(self.len);
        dst.put_u16_ne(self.ty);
        dst.put_u16_ne(self.flags);
        dst.put_u32_ne(self.seq);
        dst.put_u32_ne(self.pid);
    }
}

/// Builds a single netlink message in place. The length field is patched on [`Builder::finish`].
pub struct Builder<'a> {
    dst: &'a mut BytesMut,
    start: usize,
}

impl<'a> Builder<'a> {
    /// Starts an nfnetlink message: `nlmsghdr` followed by `nfgenmsg`.
    pub fn nfnl(
        dst: &'a mut BytesMut,
        ty: u16,
        flags: u16,
        seq: u32,
        family: u8,
        res_id: u16,
    ) -> Self {
        let start = dst.len();
        Header { len: 0, ty, flags, seq, pid: 0 }.put(dst);
        dst.put_u8(family);
        dst.put_u8(NFNETLINK_V0);
        dst.put_u16(res_id);
        Self { dst, start }
    }

    /// Appends an attribute, `payload` writes the attribute body.
    pub fn attr(self, ty: u16, payload: impl FnOnce(&mut BytesMut)) -> Self {
        let at = self.dst.len();
        self.dst.put_u16_ne(0);
        self.dst.put_u16_ne(ty);
        payload(&mut *self.dst);

        let len = self.dst.len() - at;
        self.dst[at..at + 2].copy_from_slice(&(len as u16).to_ne_bytes());
        self.dst.put_bytes(0, align(len) - len);
        self
    }

    pub fn attr_u32(self, ty: u16, value: u32) -> Self {
        self.attr(ty, |dst| dst.put_u32(value))
    }

    /// Patches the message length and returns the total number of bytes written.
    pub fn finish(self) -> usize {
        let len = self.dst.len() - self.start;
        self.dst[self.start..self.start + 4].copy_from_slice(&(len as u32).to_ne_bytes());
        len
    }
}

/// A borrowed netlink attribute.
#[derive(Debug, Clone, Copy)]
pub struct Attr<'a> {
    pub ty: u16,
    pub payload: &'a [u8],
}

impl<'a> Attr<'a> {
    pub fn u32(&self) -> Result<u32, Error> {
        self.array::<4>().map(u32::from_be_bytes)
    }

    pub fn u16(&self) -> Result<u16, Error> {
        self.array::<2>().map(u16::from_be_bytes)
    }

    /// Returns the first `N` bytes of the payload.
    pub fn array<const N: usize>(&self) -> Result<[u8; N], Error> {
        self.payload
            .get(..N)
            .and_then(|b| b.try_into().ok())
            .ok_or(Error::Attribute { ty: self.ty, len: self.payload.len() })
    }
}

/// Iterator over the attributes in a message body. Stops at the first malformed attribute and
/// yields the error.
pub struct Attrs<'a> {
    buf: &'a [u8],
}

impl<'a> Attrs<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for Attrs<'a> {
    type Item = Result<Attr<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < NLA_HDRLEN {
            return None;
        }

        let len = u16::from_ne_bytes([self.buf[0], self.buf[1]]) as usize;
        let ty = u16::from_ne_bytes([self.buf[2], self.buf[3]]) & NLA_TYPE_MASK;

        if len < NLA_HDRLEN || len > self.buf.len() {
            let have = self.buf.len();
            self.buf = &[];
            return Some(Err(Error::Truncated { need: len.max(NLA_HDRLEN), have }));
        }

        let payload = &self.buf[NLA_HDRLEN..len];
        self.buf = &self.buf[align(len).min(self.buf.len())..];

        Some(Ok(Attr { ty, payload }))
    }
}
