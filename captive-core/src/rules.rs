//! The packet-filter rule set derived from admission state.
//!
//! `Rule`'s variant order is its evaluation precedence: every `AllowClient`
//! entry sorts ahead of the redirect rules, so a table kept in a `BTreeSet`
//! is always evaluated pass-through first.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;

pub const DNS_PORT: u16 = 53;
pub const HTTP_PORT: u16 = 80;
pub const HTTPS_PORT: u16 = 443;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Other,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Other => "other",
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "other" | "icmp" => Ok(Protocol::Other),
            _ => Err(format!("unknown protocol '{}'", s)),
        }
    }
}

/// What the classifier needs to know about an inbound LAN packet.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMeta {
    pub src: Ipv4Addr,
    pub protocol: Protocol,
    pub dst_port: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Rule {
    /// Traffic from an admitted client goes to the uplink untouched.
    AllowClient(Ipv4Addr),
    /// DNS from unadmitted clients goes to the gateway resolver.
    RedirectDns(Protocol),
    /// HTTP from unadmitted clients goes to the portal.
    RedirectHttp,
    /// HTTPS from unadmitted clients goes to the plaintext portal.
    RedirectHttps,
    /// Everything else from unadmitted clients is dropped.
    DropUnadmitted,
    /// Masquerade onto the uplink.
    UplinkNat,
}

impl Rule {
    pub fn matches(&self, packet: &PacketMeta) -> bool {
        match self {
            Rule::AllowClient(ip) => packet.src == *ip,
            Rule::RedirectDns(proto) => packet.protocol == *proto && packet.dst_port == DNS_PORT,
            Rule::RedirectHttp => packet.protocol == Protocol::Tcp && packet.dst_port == HTTP_PORT,
            Rule::RedirectHttps => {
                packet.protocol == Protocol::Tcp && packet.dst_port == HTTPS_PORT
            }
            Rule::DropUnadmitted | Rule::UplinkNat => true,
        }
    }

    pub fn verdict(&self) -> Verdict {
        match self {
            Rule::AllowClient(_) => Verdict::Pass,
            Rule::RedirectDns(_) => Verdict::RedirectResolver,
            Rule::RedirectHttp | Rule::RedirectHttps => Verdict::RedirectPortal,
            Rule::DropUnadmitted => Verdict::Drop,
            Rule::UplinkNat => Verdict::Forward,
        }
    }

    pub fn is_redirect(&self) -> bool {
        matches!(
            self,
            Rule::RedirectDns(_) | Rule::RedirectHttp | Rule::RedirectHttps
        )
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::AllowClient(ip) => write!(f, "allow {}", ip),
            Rule::RedirectDns(proto) => write!(f, "redirect {}/53 -> resolver", proto.as_str()),
            Rule::RedirectHttp => write!(f, "redirect tcp/80 -> portal"),
            Rule::RedirectHttps => write!(f, "redirect tcp/443 -> portal"),
            Rule::DropUnadmitted => write!(f, "drop unadmitted"),
            Rule::UplinkNat => write!(f, "nat -> uplink"),
        }
    }
}

/// Outcome of classifying one packet.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    RedirectResolver,
    RedirectPortal,
    Drop,
    /// Unadmitted traffic forwarded under NAT.
    Forward,
}

/// Rules added and removed to move from one table to another.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RuleDiff {
    pub install: Vec<Rule>,
    pub remove: Vec<Rule>,
}

impl RuleDiff {
    pub fn is_empty(&self) -> bool {
        self.install.is_empty() && self.remove.is_empty()
    }
}

/// An ordered, duplicate-free rule set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RuleTable {
    rules: BTreeSet<Rule>,
}

impl RuleTable {
    /// Rules that stay installed regardless of membership.
    pub fn base(uplink_up: bool, isolate_unadmitted: bool) -> BTreeSet<Rule> {
        let mut rules = BTreeSet::from([
            Rule::RedirectDns(Protocol::Udp),
            Rule::RedirectDns(Protocol::Tcp),
            Rule::RedirectHttp,
            Rule::RedirectHttps,
        ]);
        if uplink_up {
            rules.insert(Rule::UplinkNat);
        }
        if !uplink_up || isolate_unadmitted {
            rules.insert(Rule::DropUnadmitted);
        }
        rules
    }

    pub fn desired<'a, I>(admitted: I, uplink_up: bool, isolate_unadmitted: bool) -> Self
    where
        I: IntoIterator<Item = &'a Ipv4Addr>,
    {
        let mut rules = Self::base(uplink_up, isolate_unadmitted);
        rules.extend(admitted.into_iter().map(|ip| Rule::AllowClient(*ip)));
        RuleTable { rules }
    }

    pub fn rules(&self) -> &BTreeSet<Rule> {
        &self.rules
    }

    pub fn contains(&self, rule: &Rule) -> bool {
        self.rules.contains(rule)
    }

    /// The first matching rule, in precedence order.
    pub fn first_match(&self, packet: &PacketMeta) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.matches(packet))
    }

    /// Unmatched traffic is dropped.
    pub fn evaluate(&self, packet: &PacketMeta) -> Verdict {
        self.first_match(packet)
            .map_or(Verdict::Drop, |rule| rule.verdict())
    }

    /// What to change on a backend currently holding `active` so it holds this
    /// table. Installs are listed before removals and applied in that order.
    pub fn diff(&self, active: &BTreeSet<Rule>) -> RuleDiff {
        RuleDiff {
            install: self.rules.difference(active).copied().collect(),
            remove: active.difference(&self.rules).copied().collect(),
        }
    }
}
