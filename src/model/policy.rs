//! Process-wide filter and forwarding policy
//!
//! NAT rules, forwarding-block rules, forwarding toggles and the inbound
//! port allow-list live in one [`GlobalPolicy`] record because they are all
//! realised in shared kernel namespaces rather than per interface.

use crate::error::{BrgError, Result};
use crate::model::Cidr;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Egress label used when a rule has no egress interface
pub const ANY_EGRESS: &str = "any";

/// Identity of a NAT or firewall rule: subnet plus egress interface
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleKey {
    /// Source subnet in network form
    pub subnet: Cidr,
    /// Egress interface; `None` matches any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress: Option<String>,
}

impl RuleKey {
    /// Build a key, canonicalising the subnet and treating `"any"` as no egress
    pub fn new(subnet: Cidr, egress: Option<&str>) -> Self {
        let egress = egress
            .map(str::trim)
            .filter(|e| !e.is_empty() && *e != ANY_EGRESS)
            .map(str::to_string);
        Self {
            subnet: subnet.network(),
            egress,
        }
    }

    /// Egress name for display
    pub fn egress_label(&self) -> &str {
        self.egress.as_deref().unwrap_or(ANY_EGRESS)
    }
}

impl std::fmt::Display for RuleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.subnet, self.egress_label())
    }
}

/// Which filter family a rule belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleFamily {
    /// Source NAT (masquerade)
    Nat,
    /// Forwarding block
    Firewall,
}

impl std::fmt::Display for RuleFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleFamily::Nat => write!(f, "nat"),
            RuleFamily::Firewall => write!(f, "firewall"),
        }
    }
}

/// A NAT or forwarding-block rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    /// Identity
    #[serde(flatten)]
    pub key: RuleKey,
    /// Whether the rule should be present in the kernel
    pub active: bool,
    /// Interface whose command created the rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// IP family selector for forwarding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    /// IPv4
    Ipv4,
    /// IPv6
    Ipv6,
}

impl FromStr for IpFamily {
    type Err = BrgError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ipv4" | "4" | "v4" => Ok(IpFamily::Ipv4),
            "ipv6" | "6" | "v6" => Ok(IpFamily::Ipv6),
            other => Err(BrgError::InvalidArgument(format!(
                "Unknown IP family '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for IpFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpFamily::Ipv4 => write!(f, "ipv4"),
            IpFamily::Ipv6 => write!(f, "ipv6"),
        }
    }
}

/// Kernel forwarding toggles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingPolicy {
    /// `net.ipv4.ip_forward`
    pub ipv4: bool,
    /// `net.ipv6.conf.all.forwarding`
    pub ipv6: bool,
}

impl ForwardingPolicy {
    /// Read one family
    pub fn get(&self, family: IpFamily) -> bool {
        match family {
            IpFamily::Ipv4 => self.ipv4,
            IpFamily::Ipv6 => self.ipv6,
        }
    }

    /// Set one family
    pub fn set(&mut self, family: IpFamily, enabled: bool) {
        match family {
            IpFamily::Ipv4 => self.ipv4 = enabled,
            IpFamily::Ipv6 => self.ipv6 = enabled,
        }
    }
}

/// Transport protocol of a firewall port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

impl FromStr for Protocol {
    type Err = BrgError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(BrgError::InvalidArgument(format!(
                "Unknown protocol '{}' (expected tcp or udp)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Inbound allow-list entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FirewallPort {
    /// Transport protocol
    pub protocol: Protocol,
    /// Destination port
    pub port: u16,
}

impl std::fmt::Display for FirewallPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

/// The single global policy record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalPolicy {
    /// NAT rules, ordered by key
    #[serde(default)]
    pub nat: Vec<FilterRule>,
    /// Forwarding-block rules, ordered by key
    #[serde(default)]
    pub firewall: Vec<FilterRule>,
    /// Forwarding toggles
    #[serde(default)]
    pub forwarding: ForwardingPolicy,
    /// Allowed inbound ports, sorted
    #[serde(default)]
    pub firewall_ports: Vec<FirewallPort>,
    /// Bumped on every committed change
    #[serde(default)]
    pub revision: u64,
}

impl GlobalPolicy {
    /// Rules of one family
    pub fn rules(&self, family: RuleFamily) -> &[FilterRule] {
        match family {
            RuleFamily::Nat => &self.nat,
            RuleFamily::Firewall => &self.firewall,
        }
    }

    /// Mutable rules of one family
    pub fn rules_mut(&mut self, family: RuleFamily) -> &mut Vec<FilterRule> {
        match family {
            RuleFamily::Nat => &mut self.nat,
            RuleFamily::Firewall => &mut self.firewall,
        }
    }

    /// Find a rule by exact key
    pub fn rule(&self, family: RuleFamily, key: &RuleKey) -> Option<&FilterRule> {
        self.rules(family).iter().find(|r| &r.key == key)
    }
}
