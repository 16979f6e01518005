//! IP-based access policy.
//!
//! Policy lists are ordered CIDR networks; the first matching entry wins.
//! IPv4 matches by `(addr & mask) == network`, IPv6 by octet-wise AND over
//! all 16 bytes. Only IPv4 and IPv6 sources ever match; UNIX socket peers
//! fall through every list.

use std::net::IpAddr;
use std::str::FromStr;

use regex::Regex;

use crate::config::schema::AccessConfig;

/// One policy list entry: a network, its mask, and an optional per-entry
/// stream-ID pattern carried to the caller on match.
#[derive(Debug, Clone)]
pub struct IpNet {
    network: Network,
    /// Stream-ID pattern attached to this entry, if any.
    pub limit: Option<Regex>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Network {
    V4 { net: [u8; 4], mask: [u8; 4] },
    V6 { net: [u8; 16], mask: [u8; 16] },
}

impl IpNet {
    /// Whether the given address falls inside this network.
    pub fn matches(&self, addr: &IpAddr) -> bool {
        match (&self.network, addr) {
            (Network::V4 { net, mask }, IpAddr::V4(a)) => {
                let octets = a.octets();
                (0..4).all(|i| octets[i] & mask[i] == net[i])
            }
            (Network::V6 { net, mask }, IpAddr::V6(a)) => {
                let octets = a.octets();
                (0..16).all(|i| octets[i] & mask[i] == net[i])
            }
            _ => false,
        }
    }

    fn with_limit(mut self, limit: Regex) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl FromStr for IpNet {
    type Err = String;

    /// Parse `"addr/prefix"` CIDR notation; a bare address implies a
    /// full-length mask. The network is normalized to `addr & mask`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, prefix) = match s.split_once('/') {
            Some((a, p)) => {
                let prefix: u32 = p
                    .parse()
                    .map_err(|_| format!("invalid prefix length '{}'", p))?;
                (a, Some(prefix))
            }
            None => (s, None),
        };

        let addr: IpAddr = addr_str
            .parse()
            .map_err(|_| format!("invalid address '{}'", addr_str))?;

        let network = match addr {
            IpAddr::V4(a) => {
                let prefix = prefix.unwrap_or(32);
                if prefix > 32 {
                    return Err(format!("prefix /{} too long for IPv4", prefix));
                }
                let mask = prefix_mask::<4>(prefix);
                let mut net = a.octets();
                for i in 0..4 {
                    net[i] &= mask[i];
                }
                Network::V4 { net, mask }
            }
            IpAddr::V6(a) => {
                let prefix = prefix.unwrap_or(128);
                if prefix > 128 {
                    return Err(format!("prefix /{} too long for IPv6", prefix));
                }
                let mask = prefix_mask::<16>(prefix);
                let mut net = a.octets();
                for i in 0..16 {
                    net[i] &= mask[i];
                }
                Network::V6 { net, mask }
            }
        };

        Ok(Self {
            network,
            limit: None,
        })
    }
}

impl std::fmt::Display for IpNet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.network {
            Network::V4 { net, mask } => {
                let prefix: u32 = mask.iter().map(|b| b.count_ones()).sum();
                write!(f, "{}/{}", std::net::Ipv4Addr::from(*net), prefix)
            }
            Network::V6 { net, mask } => {
                let prefix: u32 = mask.iter().map(|b| b.count_ones()).sum();
                write!(f, "{}/{}", std::net::Ipv6Addr::from(*net), prefix)
            }
        }
    }
}

fn prefix_mask<const N: usize>(prefix: u32) -> [u8; N] {
    let mut mask = [0u8; N];
    let mut remaining = prefix;
    for byte in mask.iter_mut() {
        if remaining >= 8 {
            *byte = 0xff;
            remaining -= 8;
        } else {
            *byte = !(0xffu8 >> remaining) as u8;
            break;
        }
    }
    mask
}

/// An ordered policy list, searched in insertion order.
#[derive(Debug, Clone, Default)]
pub struct IpNetList(Vec<IpNet>);

impl IpNetList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First matching entry, or None.
    pub fn find(&self, addr: &IpAddr) -> Option<&IpNet> {
        self.0.iter().find(|net| net.matches(addr))
    }

    /// Whether any entry matches the address.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.find(addr).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpNet> {
        self.0.iter()
    }
}

/// All policy lists of a configuration snapshot, parsed and ready to match.
#[derive(Debug, Clone, Default)]
pub struct CompiledPolicy {
    pub match_ips: IpNetList,
    pub reject_ips: IpNetList,
    pub write_ips: IpNetList,
    pub trusted_ips: IpNetList,
    pub limit_ips: IpNetList,
}

impl CompiledPolicy {
    pub fn compile(access: &AccessConfig) -> Result<Self, String> {
        Ok(Self {
            match_ips: compile_list(&access.match_ips)?,
            reject_ips: compile_list(&access.reject_ips)?,
            write_ips: compile_list(&access.write_ips)?,
            trusted_ips: compile_list(&access.trusted_ips)?,
            limit_ips: IpNetList(
                access
                    .limit_ips
                    .iter()
                    .map(|entry| {
                        let net: IpNet = entry.net.parse()?;
                        let limit = Regex::new(&entry.streams)
                            .map_err(|e| format!("pattern '{}': {}", entry.streams, e))?;
                        Ok(net.with_limit(limit))
                    })
                    .collect::<Result<Vec<_>, String>>()?,
            ),
        })
    }

    /// Stream-ID limit pattern for the address, if one is configured.
    pub fn stream_limit(&self, addr: &IpAddr) -> Option<Regex> {
        self.limit_ips.find(addr).and_then(|net| net.limit.clone())
    }
}

fn compile_list(entries: &[String]) -> Result<IpNetList, String> {
    Ok(IpNetList(
        entries
            .iter()
            .map(|e| e.parse())
            .collect::<Result<Vec<_>, String>>()?,
    ))
}
