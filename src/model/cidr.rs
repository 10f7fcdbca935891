//! CIDR blocks
//!
//! Address bindings keep their host part (`10.10.10.254/24`) while allowed
//! IPs, NAT subnets and firewall subnets are compared in network form
//! (`10.10.10.0/24`), so both shapes share one type with an explicit
//! [`Cidr::network`] projection.

use crate::error::{BrgError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// IP address plus prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Build a CIDR, validating the prefix length for the address family
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self> {
        let max_prefix = max_prefix(&addr);
        if prefix > max_prefix {
            return Err(BrgError::InvalidArgument(format!(
                "Prefix length {} exceeds maximum {} for IP address {}",
                prefix, max_prefix, addr
            )));
        }
        Ok(Self { addr, prefix })
    }

    /// Address part as given
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Prefix length
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// True for IPv4 blocks
    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// The block with host bits cleared
    pub fn network(&self) -> Self {
        let addr = match self.addr {
            IpAddr::V4(v4) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix)
                };
                IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
            }
            IpAddr::V6(v6) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix)
                };
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
            }
        };
        Self {
            addr,
            prefix: self.prefix,
        }
    }

    /// Whether `ip` falls inside this block
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match Cidr::new(*ip, self.prefix) {
            Ok(other) => other.network().addr == self.network().addr,
            Err(_) => false,
        }
    }
}

fn max_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

impl FromStr for Cidr {
    type Err = BrgError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (ip, prefix) = s.split_once('/').ok_or_else(|| {
            BrgError::InvalidArgument(format!(
                "Invalid CIDR notation: '{}' (expected format: IP/prefix, e.g. 10.10.10.1/32)",
                s
            ))
        })?;

        let addr: IpAddr = ip
            .parse()
            .map_err(|_| BrgError::InvalidArgument(format!("Invalid IP address in '{}'", s)))?;

        let prefix: u8 = prefix
            .parse()
            .map_err(|_| BrgError::InvalidArgument(format!("Invalid prefix length in '{}'", s)))?;

        Self::new(addr, prefix)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl Serialize for Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse, canonicalise to network form, sort and deduplicate a list of blocks
pub fn normalize_allowed_ips<S: AsRef<str>>(ips: &[S]) -> Result<Vec<Cidr>> {
    let mut out = Vec::with_capacity(ips.len());
    for ip in ips {
        // Accept comma-joined lists, the way `wg` prints them
        for part in ip.as_ref().split(',').map(str::trim).filter(|p| !p.is_empty()) {
            out.push(part.parse::<Cidr>()?.network());
        }
    }
    out.sort();
    out.dedup();
    Ok(out)
}
