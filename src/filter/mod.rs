//! Packet filter adapter
//!
//! NAT rules, forwarding-block rules, the inbound port allow-list and the
//! forwarding sysctls. All of these live in namespaces shared by every
//! interface, so callers must hold the global lock around every mutating
//! call; the adapter itself performs no locking.
//!
//! Rules are matched by exact `(subnet, egress)` key: removing a rule without
//! an egress never touches a rule that names one.

mod iptables;
mod memory;
mod sysctl;

pub use iptables::{IptablesFilter, FIREWALL_CHAIN, INPUT_CHAIN, NAT_CHAIN};
pub use memory::MemoryFilter;
pub use sysctl::SysctlForwarding;

use crate::error::Result;
use crate::model::{FirewallPort, ForwardingPolicy, IpFamily, RuleFamily, RuleKey};

/// Operations on the host packet filter
#[cfg_attr(test, mockall::automock)]
pub trait PacketFilter: Send + Sync {
    /// Install a NAT or forwarding-block rule; present rules are left alone
    fn add_rule(&self, family: RuleFamily, key: &RuleKey) -> Result<()>;

    /// Remove the rule with exactly this key; absent rules are left alone
    fn remove_rule(&self, family: RuleFamily, key: &RuleKey) -> Result<()>;

    /// Rules currently installed for a family
    fn list_rules(&self, family: RuleFamily) -> Result<Vec<RuleKey>>;

    /// Toggle kernel forwarding for one IP family
    fn set_forwarding(&self, family: IpFamily, enabled: bool) -> Result<()>;

    /// Read both forwarding toggles
    fn forwarding(&self) -> Result<ForwardingPolicy>;

    /// Allow or deny inbound traffic to a port
    fn set_port(&self, port: &FirewallPort, allowed: bool) -> Result<()>;

    /// Ports currently allowed
    fn list_ports(&self) -> Result<Vec<FirewallPort>>;
}
