//! Bounds-checked IPv4 and TCP header decoding.
//!
//! The decoder runs on attacker controlled bytes. Every offset is checked against the captured
//! buffer before it is read, and malformed input degrades the view instead of failing:
//!
//! * shorter than a minimal IPv4 header, or not IPv4: no view at all ([`decode`] returns `None`),
//! * IP header length claim out of bounds, or a broken TCP header: an IP-only view,
//! * otherwise: IP and TCP fields plus the application payload.

use std::{
    fmt,
    net::Ipv4Addr,
    ops::{BitAnd, BitOr, BitOrAssign},
    str::FromStr,
};

use thiserror::Error;

/// Length of an IPv4 header without options.
pub const IPV4_MIN_HEADER_LEN: usize = 20;
/// Length of a TCP header without options.
pub const TCP_MIN_HEADER_LEN: usize = 20;

/// An IP protocol number, as found in the IPv4 protocol field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpProtocol(pub u8);

impl IpProtocol {
    pub const ICMP: Self = Self(1);
    pub const TCP: Self = Self(6);
    pub const UDP: Self = Self(17);
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ICMP => f.write_str("icmp"),
            Self::TCP => f.write_str("tcp"),
            Self::UDP => f.write_str("udp"),
            Self(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid protocol: {0}")]
pub struct ParseProtocolError(String);

impl FromStr for IpProtocol {
    type Err = ParseProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "icmp" => Ok(Self::ICMP),
            "tcp" => Ok(Self::TCP),
            "udp" => Ok(Self::UDP),
            other => other.parse().map(Self).map_err(|_| ParseProtocolError(s.to_owned())),
        }
    }
}

/// The six classic TCP control bits.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const FIN: Self = Self(0x01);
    pub const SYN: Self = Self(0x02);
    pub const RST: Self = Self(0x04);
    pub const PSH: Self = Self(0x08);
    pub const ACK: Self = Self(0x10);
    pub const URG: Self = Self(0x20);

    const ALL: u8 = 0x3f;
    const NAMES: [(Self, &'static str); 6] = [
        (Self::FIN, "FIN"),
        (Self::SYN, "SYN"),
        (Self::RST, "RST"),
        (Self::PSH, "PSH"),
        (Self::ACK, "ACK"),
        (Self::URG, "URG"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Builds a flag set from raw bits. ECE, CWR and reserved bits are discarded.
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & Self::ALL)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TcpFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for TcpFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for TcpFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}

/// Decoded IPv4 header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    /// Header length in bytes, as declared by the IHL field.
    pub header_len: usize,
    /// Declared total length of the datagram.
    pub total_len: u16,
    pub protocol: IpProtocol,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Reads the fixed part of an IPv4 header. Returns `None` for short buffers and for anything
    /// that is not IPv4.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let raw: &[u8; IPV4_MIN_HEADER_LEN] = buf.get(..IPV4_MIN_HEADER_LEN)?.try_into().ok()?;

        let version = raw[0] >> 4;
        if version != 4 {
            return None;
        }

        Some(Self {
            version,
            header_len: usize::from(raw[0] & 0x0f) * 4,
            total_len: u16::from_be_bytes([raw[2], raw[3]]),
            protocol: IpProtocol(raw[9]),
            src: Ipv4Addr::new(raw[12], raw[13], raw[14], raw[15]),
            dst: Ipv4Addr::new(raw[16], raw[17], raw[18], raw[19]),
        })
    }

    /// Whether the declared header length is sane and fits in `captured` bytes.
    pub const fn header_fits(&self, captured: usize) -> bool {
        self.header_len >= IPV4_MIN_HEADER_LEN && self.header_len <= captured
    }

    /// The end of the datagram within a capture of `captured` bytes: the declared total length
    /// when it is consistent, the capture length otherwise (truncated copies, offloaded packets).
    pub fn end(&self, captured: usize) -> usize {
        let total = usize::from(self.total_len);
        if total >= self.header_len && total <= captured {
            total
        } else {
            captured
        }
    }
}

/// Decoded TCP header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: TcpFlags,
    /// Header length in bytes, as declared by the data offset field.
    pub header_len: usize,
}

impl TcpHeader {
    /// Reads a TCP header from the start of `segment`. Returns `None` if the fixed header or the
    /// declared header length does not fit.
    pub fn parse(segment: &[u8]) -> Option<Self> {
        let raw: &[u8; TCP_MIN_HEADER_LEN] =
            segment.get(..TCP_MIN_HEADER_LEN)?.try_into().ok()?;

        let header_len = usize::from(raw[12] >> 4) * 4;
        if header_len < TCP_MIN_HEADER_LEN || header_len > segment.len() {
            return None;
        }

        Some(Self {
            src_port: u16::from_be_bytes([raw[0], raw[1]]),
            dst_port: u16::from_be_bytes([raw[2], raw[3]]),
            flags: TcpFlags::from_bits_truncate(raw[13]),
            header_len,
        })
    }
}

/// A view over one packet, borrowed from the buffer it was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketView<'a> {
    pub ip: Ipv4Header,
    /// Present only for TCP packets whose header could be fully decoded.
    pub tcp: Option<TcpHeader>,
    /// Application payload. Always empty unless `tcp` is present.
    pub payload: &'a [u8],
}

impl PacketView<'_> {
    /// True if transport fields could not be extracted.
    pub const fn is_ip_only(&self) -> bool {
        self.tcp.is_none()
    }
}

/// Decodes the IPv4 (and TCP) headers at the start of `buf`.
///
/// Returns `None` when the packet can not be classified at all. This never panics, whatever the
/// input.
pub fn decode(buf: &[u8]) -> Option<PacketView<'_>> {
    let ip = Ipv4Header::parse(buf)?;
    let mut view = PacketView { ip, tcp: None, payload: &[] };

    if !ip.header_fits(buf.len()) || ip.protocol != IpProtocol::TCP {
        return Some(view);
    }

    let segment = &buf[ip.header_len..ip.end(buf.len())];
    if let Some(tcp) = TcpHeader::parse(segment) {
        view.tcp = Some(tcp);
        view.payload = &segment[tcp.header_len..];
    }

    Some(view)
}
