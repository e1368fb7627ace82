use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use thiserror::Error;

/// An address range written as `ip[/prefix]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Cidr {
    pub network: IpAddr,
    pub prefix: u8,
}

impl Cidr {
    /// Build a range, clamping the prefix to the address family width.
    pub fn new(network: IpAddr, prefix: u8) -> Self {
        let prefix = prefix.min(family_width(&network));
        Cidr { network, prefix }
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(candidate)) => {
                let mask = match self.prefix {
                    0 => 0,
                    p => u32::MAX << (32 - u32::from(p)),
                };
                u32::from(net) & mask == u32::from(*candidate) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(candidate)) => {
                let mask = match self.prefix {
                    0 => 0,
                    p => u128::MAX << (128 - u32::from(p)),
                };
                u128::from(net) & mask == u128::from(*candidate) & mask
            }
            _ => false,
        }
    }
}

fn family_width(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct RuleParseError(String);

impl FromStr for Cidr {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, prefix) = match s.split_once('/') {
            Some((ip, prefix)) => {
                let prefix = prefix
                    .trim()
                    .parse::<u16>()
                    .map_err(|_| RuleParseError(format!("invalid prefix length in {s}")))?;
                (ip, Some(prefix))
            }
            None => (s, None),
        };
        let network: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| RuleParseError(format!("invalid address {ip}")))?;
        let width = family_width(&network);
        // Missing prefix means a host route
        let prefix = prefix.map_or(width, |p| p.min(u16::from(width)) as u8);
        Ok(Cidr::new(network, prefix))
    }
}

/// Maps the address a connection arrives from to the address SPF should see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NatRule {
    pub source: IpAddr,
    pub target: IpAddr,
}

impl FromStr for NatRule {
    type Err = RuleParseError;

    /// Parses `src:dest`; both sides are IPv4 literals.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (source, target) = s
            .split_once(':')
            .ok_or_else(|| RuleParseError(format!("{s} is not of the form src_ip:dest_ip")))?;
        let source: Ipv4Addr = source
            .trim()
            .parse()
            .map_err(|_| RuleParseError(format!("invalid NAT source address {source}")))?;
        let target: Ipv4Addr = target
            .trim()
            .parse()
            .map_err(|_| RuleParseError(format!("invalid NAT destination address {target}")))?;
        Ok(NatRule {
            source: IpAddr::V4(source),
            target: IpAddr::V4(target),
        })
    }
}

/// Site overrides: trusted clients, senders and recipients, plus NAT remapping.
///
/// Every rule list is searched most-recently-configured first and stops at
/// the first match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Whitelist {
    pub cidrs: Vec<Cidr>,
    pub ptrs: Vec<String>,
    pub froms: Vec<String>,
    pub tos: Vec<String>,
    pub nats: Vec<NatRule>,
}

impl Whitelist {
    pub fn add_cidr(&mut self, cidr: Cidr) {
        self.cidrs.push(cidr);
    }

    pub fn add_ptr(&mut self, suffix: &str) {
        self.ptrs.push(suffix.to_string());
    }

    pub fn add_from(&mut self, pattern: &str) {
        self.froms.push(pattern.to_ascii_lowercase());
    }

    pub fn add_to(&mut self, pattern: &str) {
        self.tos.push(pattern.to_ascii_lowercase());
    }

    pub fn add_nat(&mut self, rule: NatRule) {
        self.nats.push(rule);
    }

    pub fn ip_trusted(&self, addr: &IpAddr) -> bool {
        self.cidrs.iter().rev().any(|cidr| cidr.contains(addr))
    }

    /// Case-insensitive suffix match against the client's host name.
    pub fn ptr_trusted(&self, name: &str) -> bool {
        let name = name.as_bytes();
        self.ptrs.iter().rev().any(|suffix| {
            let suffix = suffix.as_bytes();
            name.len() >= suffix.len() && name[name.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
        })
    }

    /// Substring match, not suffix: `example.com` also trusts
    /// `user@example.com.attacker.net`.
    pub fn from_trusted(&self, sender: &str) -> bool {
        let sender = sender.to_ascii_lowercase();
        self.froms.iter().rev().any(|pattern| sender.contains(pattern.as_str()))
    }

    /// Same substring semantics as [`Whitelist::from_trusted`].
    pub fn to_trusted(&self, recipient: &str) -> bool {
        let recipient = recipient.to_ascii_lowercase();
        self.tos.iter().rev().any(|pattern| recipient.contains(pattern.as_str()))
    }

    /// A recipient whitelist switches enforcement from per-transaction
    /// rejection to per-recipient exemption.
    pub fn has_recipient_rules(&self) -> bool {
        !self.tos.is_empty()
    }

    pub fn nat_translate(&self, addr: IpAddr) -> IpAddr {
        self.nats
            .iter()
            .rev()
            .find(|rule| rule.source == addr)
            .map_or(addr, |rule| rule.target)
    }
}
