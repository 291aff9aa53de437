use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use clap::{Parser, ValueEnum};

use nfw_filter::{Action, FilterRule, IpProtocol, PacketHandler, RuleSet, TcpFlags};
use nfw_queue::{FirewallConfig, QueueRegistration};
use nfw_transport::CopyMode;

#[derive(Parser, Debug)]
#[command(
    name = "nfw",
    version,
    about = "Inline firewall for packets diverted to a netfilter queue"
)]
pub struct Cli {
    /// Queue number to attach to (repeatable)
    #[arg(long = "queue", short = 'q', value_name = "NUM", default_values_t = vec![0u16])]
    pub queues: Vec<u16>,

    /// How much of each packet the kernel copies to userspace
    #[arg(long, value_enum, default_value_t = CopyModeArg::Packet)]
    pub copy_mode: CopyModeArg,

    /// Maximum number of bytes copied per packet
    #[arg(long, default_value_t = 0xffff)]
    pub copy_range: u32,

    /// Let packets pass instead of dropping them when the kernel queue is full
    #[arg(long)]
    pub fail_open: bool,

    /// Kernel queue length
    #[arg(long, value_name = "PACKETS")]
    pub queue_max_len: Option<u32>,

    /// Drop TCP packets whose payload contains WORD (repeatable)
    #[arg(long = "ban", value_name = "WORD")]
    pub banned: Vec<String>,

    /// Drop TCP packets to PORT (repeatable)
    #[arg(long = "drop-dst-port", value_name = "PORT")]
    pub drop_dst_ports: Vec<u16>,

    /// Drop TCP SYNs from IPV4 (repeatable)
    #[arg(long = "drop-syn-from", value_name = "IPV4")]
    pub drop_syn_from: Vec<Ipv4Addr>,

    /// Don't install the built-in example rules
    #[arg(long)]
    pub no_default_rules: bool,

    /// Action for packets no rule matches
    #[arg(long, default_value = "accept")]
    pub default_action: Action,

    /// Milliseconds the worker waits for packets before checking for shutdown
    #[arg(long, value_name = "MS", default_value_t = 100)]
    pub poll_timeout: u64,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyModeArg {
    /// Copy nothing
    None,
    /// Copy packet metadata only
    Meta,
    /// Copy metadata and packet bytes
    Packet,
}

impl From<CopyModeArg> for CopyMode {
    fn from(arg: CopyModeArg) -> Self {
        match arg {
            CopyModeArg::None => Self::None,
            CopyModeArg::Meta => Self::Meta,
            CopyModeArg::Packet => Self::Packet,
        }
    }
}

/// The example rules installed unless `--no-default-rules` is given: drop TCP payloads
/// mentioning any of the banned words, TCP to port 1337, and SYNs from 192.168.1.100.
pub fn default_rules() -> Vec<FilterRule> {
    vec![
        FilterRule::new(Action::Drop).protocol(IpProtocol::TCP).ban_all(["C++", "blockme", "virus"]),
        FilterRule::new(Action::Drop).protocol(IpProtocol::TCP).dst_port(1337),
        drop_syn_from(Ipv4Addr::new(192, 168, 1, 100)),
    ]
}

fn drop_syn_from(addr: Ipv4Addr) -> FilterRule {
    FilterRule::new(Action::Drop)
        .protocol(IpProtocol::TCP)
        .src_ip(addr)
        .tcp_flags(TcpFlags::SYN, TcpFlags::SYN)
}

impl Cli {
    /// The rule set described by the flags. Built-in rules come first.
    pub fn rules(&self) -> RuleSet {
        let mut rules = RuleSet::default().with_default(self.default_action);

        if !self.no_default_rules {
            rules.extend(default_rules());
        }

        if !self.banned.is_empty() {
            rules.push(FilterRule::new(Action::Drop).protocol(IpProtocol::TCP).ban_all(&self.banned));
        }

        rules.extend(
            self.drop_dst_ports
                .iter()
                .map(|&port| FilterRule::new(Action::Drop).protocol(IpProtocol::TCP).dst_port(port)),
        );
        rules.extend(self.drop_syn_from.iter().copied().map(drop_syn_from));

        rules
    }

    /// Registers `handler` on every requested queue.
    pub fn config(&self, handler: Arc<dyn PacketHandler>) -> FirewallConfig {
        let mut config =
            FirewallConfig::new().poll_timeout(Duration::from_millis(self.poll_timeout));

        for &number in &self.queues {
            let mut queue = QueueRegistration::shared(number, Arc::clone(&handler))
                .mode(self.copy_mode.into())
                .range(self.copy_range);

            if self.fail_open {
                queue = queue.fail_open(true);
            }
            if let Some(len) = self.queue_max_len {
                queue = queue.max_len(len);
            }

            config = config.queue(queue);
        }

        config
    }
}
