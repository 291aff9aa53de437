use std::{fmt, net::Ipv4Addr, str::FromStr};

use memchr::memmem::Finder;
use thiserror::Error;

use crate::packet::{IpProtocol, PacketView, TcpFlags};
use nfw_wire::Verdict;

/// What to do with a packet matched by a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Action {
    #[default]
    Accept,
    Drop,
}

impl From<Action> for Verdict {
    fn from(action: Action) -> Self {
        match action {
            Action::Accept => Self::Accept,
            Action::Drop => Self::Drop,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept => f.write_str("ACCEPT"),
            Self::Drop => f.write_str("DROP"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid action: {0} (expected accept or drop)")]
pub struct ParseActionError(String);

impl FromStr for Action {
    type Err = ParseActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "accept" => Ok(Self::Accept),
            "drop" => Ok(Self::Drop),
            _ => Err(ParseActionError(s.to_owned())),
        }
    }
}

/// A TCP flag test: `(flags & mask) == expected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagMatch {
    pub mask: TcpFlags,
    pub expected: TcpFlags,
}

impl FlagMatch {
    #[inline]
    pub fn matches(&self, flags: TcpFlags) -> bool {
        flags & self.mask == self.expected
    }
}

/// A single filter rule. Every predicate that is set must hold for the rule to match; a rule
/// with no predicates matches every decodable packet.
///
/// # Example
///
/// ```
/// use nfw_filter::{Action, FilterRule, IpProtocol};
///
/// let rule = FilterRule::new(Action::Drop).protocol(IpProtocol::TCP).dst_port(1337);
/// assert_eq!(rule.action(), Action::Drop);
/// ```
#[derive(Debug, Clone, Default)]
pub struct FilterRule {
    action: Action,
    protocol: Option<IpProtocol>,
    src_ip: Option<Ipv4Addr>,
    dst_ip: Option<Ipv4Addr>,
    src_port: Option<u16>,
    dst_port: Option<u16>,
    flags: Option<FlagMatch>,
    banned: Vec<Finder<'static>>,
}

impl FilterRule {
    /// Creates a catch-all rule with the given action.
    pub fn new(action: Action) -> Self {
        Self { action, ..Default::default() }
    }

    /// Matches only packets of the given transport protocol.
    pub fn protocol(mut self, protocol: IpProtocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn src_ip(mut self, addr: Ipv4Addr) -> Self {
        self.src_ip = Some(addr);
        self
    }

    pub fn dst_ip(mut self, addr: Ipv4Addr) -> Self {
        self.dst_ip = Some(addr);
        self
    }

    /// Matches only TCP packets with the given source port. Port 0 means any.
    pub fn src_port(mut self, port: u16) -> Self {
        self.src_port = (port != 0).then_some(port);
        self
    }

    /// Matches only TCP packets with the given destination port. Port 0 means any.
    pub fn dst_port(mut self, port: u16) -> Self {
        self.dst_port = (port != 0).then_some(port);
        self
    }

    /// Matches only TCP packets where `(flags & mask) == expected`. An empty mask disables the
    /// test.
    pub fn tcp_flags(mut self, mask: TcpFlags, expected: TcpFlags) -> Self {
        self.flags = (!mask.is_empty()).then_some(FlagMatch { mask, expected });
        self
    }

    /// Adds a banned byte string. Once any is set, the rule only matches TCP packets whose
    /// payload contains at least one of them.
    pub fn ban(mut self, needle: impl AsRef<[u8]>) -> Self {
        self.banned.push(Finder::new(needle.as_ref()).into_owned());
        self
    }

    /// Adds several banned byte strings, see [`FilterRule::ban`].
    pub fn ban_all<I>(self, needles: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        needles.into_iter().fold(self, |rule, needle| rule.ban(needle))
    }

    pub const fn action(&self) -> Action {
        self.action
    }

    /// The banned byte strings, in insertion order.
    pub fn banned(&self) -> impl Iterator<Item = &[u8]> {
        self.banned.iter().map(|finder| finder.needle())
    }

    /// Evaluates every predicate of this rule against `view`.
    pub fn matches(&self, view: &PacketView<'_>) -> bool {
        if self.protocol.is_some_and(|p| p != view.ip.protocol) {
            return false;
        }

        if self.src_ip.is_some_and(|a| a != view.ip.src) ||
            self.dst_ip.is_some_and(|a| a != view.ip.dst)
        {
            return false;
        }

        if self.src_port.is_some() || self.dst_port.is_some() || self.flags.is_some() {
            // Transport predicates can only hold on a decoded TCP header.
            let Some(tcp) = view.tcp else {
                return false;
            };

            if self.src_port.is_some_and(|p| p != tcp.src_port) ||
                self.dst_port.is_some_and(|p| p != tcp.dst_port) ||
                self.flags.is_some_and(|f| !f.matches(tcp.flags))
            {
                return false;
            }
        }

        if !self.banned.is_empty() {
            if view.payload.is_empty() {
                return false;
            }

            return self.banned.iter().any(|finder| finder.find(view.payload).is_some());
        }

        true
    }
}
