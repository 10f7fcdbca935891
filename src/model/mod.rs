//! Desired-state data model
//!
//! Plain serde types shared by the state store, the engine and the query
//! projector. Nothing in here talks to the kernel.

mod cidr;
mod interface;
mod policy;

pub use cidr::{normalize_allowed_ips, Cidr};
pub use interface::{InterfaceRecord, LinkState, LogLevel, LogSink, PeerRecord, Variant};
pub use policy::{
    FilterRule, FirewallPort, ForwardingPolicy, GlobalPolicy, IpFamily, Protocol, RuleFamily,
    RuleKey, ANY_EGRESS,
};
