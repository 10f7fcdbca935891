//! iptables realisation of the packet filter
//!
//! Every rule lives in a dedicated chain jumped to from the built-in one, so
//! the engine never edits chains owned by anything else:
//!
//! | chain        | table  | parent        | rule                                   |
//! |--------------|--------|---------------|----------------------------------------|
//! | `BRGNET-NAT` | nat    | `POSTROUTING` | `-s <subnet> [-o <if>] -j MASQUERADE`  |
//! | `BRGNET-FWD` | filter | `FORWARD`     | `-s <subnet> [-o <if>] -j DROP`        |
//! | `BRGNET-IN`  | filter | `INPUT`       | `-p <proto> --dport <port> -j ACCEPT`  |
//!
//! IPv6 subnets go to `ip6tables`; port rules are installed in both.

use crate::error::{BrgError, Result};
use crate::filter::{PacketFilter, SysctlForwarding};
use crate::model::{FirewallPort, ForwardingPolicy, IpFamily, Protocol, RuleFamily, RuleKey};
use crate::platform::CommandRunner;
use std::sync::Arc;
use tracing::{debug, info};

/// Chain holding NAT rules
pub const NAT_CHAIN: &str = "BRGNET-NAT";

/// Chain holding forwarding-block rules
pub const FIREWALL_CHAIN: &str = "BRGNET-FWD";

/// Chain holding the inbound port allow-list
pub const INPUT_CHAIN: &str = "BRGNET-IN";

struct ChainSpec {
    table: &'static str,
    chain: &'static str,
    parent: &'static str,
}

const NAT: ChainSpec = ChainSpec {
    table: "nat",
    chain: NAT_CHAIN,
    parent: "POSTROUTING",
};

const FIREWALL: ChainSpec = ChainSpec {
    table: "filter",
    chain: FIREWALL_CHAIN,
    parent: "FORWARD",
};

const INPUT: ChainSpec = ChainSpec {
    table: "filter",
    chain: INPUT_CHAIN,
    parent: "INPUT",
};

fn spec_for(family: RuleFamily) -> &'static ChainSpec {
    match family {
        RuleFamily::Nat => &NAT,
        RuleFamily::Firewall => &FIREWALL,
    }
}

fn target_for(family: RuleFamily) -> &'static str {
    match family {
        RuleFamily::Nat => "MASQUERADE",
        RuleFamily::Firewall => "DROP",
    }
}

/// Rule body (everything after the chain name) for a NAT/firewall key
pub fn rule_args(family: RuleFamily, key: &RuleKey) -> Vec<String> {
    let mut args = vec!["-s".to_string(), key.subnet.to_string()];
    if let Some(egress) = &key.egress {
        args.push("-o".to_string());
        args.push(egress.clone());
    }
    args.push("-j".to_string());
    args.push(target_for(family).to_string());
    args
}

/// Rule body for an allow-listed port
pub fn port_args(port: &FirewallPort) -> Vec<String> {
    vec![
        "-p".to_string(),
        port.protocol.to_string(),
        "--dport".to_string(),
        port.port.to_string(),
        "-j".to_string(),
        "ACCEPT".to_string(),
    ]
}

/// Parse the rule keys out of `iptables -S <chain>` output
pub fn parse_rule_listing(chain: &str, listing: &str) -> Result<Vec<RuleKey>> {
    let mut keys = Vec::new();
    for tokens in appended_rules(chain, listing) {
        let subnet = flag_value(&tokens, "-s").ok_or_else(|| {
            BrgError::AdapterFailure(format!("Rule in {} without source: {:?}", chain, tokens))
        })?;
        let egress = flag_value(&tokens, "-o");
        keys.push(RuleKey::new(subnet.parse().map_err(adapter)?, egress));
    }
    Ok(keys)
}

/// Parse the allow-listed ports out of `iptables -S BRGNET-IN` output
pub fn parse_port_listing(listing: &str) -> Result<Vec<FirewallPort>> {
    let mut ports = Vec::new();
    for tokens in appended_rules(INPUT_CHAIN, listing) {
        let (Some(proto), Some(port)) = (flag_value(&tokens, "-p"), flag_value(&tokens, "--dport"))
        else {
            continue;
        };
        let protocol: Protocol = proto.parse().map_err(adapter)?;
        let port = port
            .parse()
            .map_err(|_| BrgError::AdapterFailure(format!("Bad port '{}' in {}", port, INPUT_CHAIN)))?;
        ports.push(FirewallPort { protocol, port });
    }
    Ok(ports)
}

fn appended_rules<'a>(chain: &'a str, listing: &'a str) -> impl Iterator<Item = Vec<&'a str>> + 'a {
    listing
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .filter(move |tokens| tokens.len() > 2 && tokens[0] == "-A" && tokens[1] == chain)
}

fn flag_value<'a>(tokens: &[&'a str], flag: &str) -> Option<&'a str> {
    tokens
        .iter()
        .position(|t| *t == flag)
        .and_then(|i| tokens.get(i + 1))
        .copied()
}

fn adapter(err: BrgError) -> BrgError {
    BrgError::AdapterFailure(format!("Unexpected iptables listing: {}", err))
}

fn is_missing_chain(err: &BrgError) -> bool {
    matches!(err, BrgError::AdapterFailure(msg) if msg.contains("No chain") || msg.contains("does not exist"))
}

/// Packet filter backed by `iptables` / `ip6tables`
pub struct IptablesFilter {
    runner: Arc<dyn CommandRunner>,
    iptables: String,
    ip6tables: String,
    sysctl: SysctlForwarding,
}

impl IptablesFilter {
    /// Create a filter invoking the given tools through `runner`
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        iptables: &str,
        ip6tables: &str,
        sysctl: SysctlForwarding,
    ) -> Self {
        Self {
            runner,
            iptables: iptables.to_string(),
            ip6tables: ip6tables.to_string(),
            sysctl,
        }
    }

    fn program(&self, ipv4: bool) -> &str {
        if ipv4 {
            &self.iptables
        } else {
            &self.ip6tables
        }
    }

    fn run(&self, program: &str, table: &str, args: &[&str]) -> Result<String> {
        let mut full = vec!["-w", "-t", table];
        full.extend_from_slice(args);
        self.runner.run(program, &full, None)
    }

    /// Create the chain and its jump if missing
    fn ensure_chain(&self, program: &str, spec: &ChainSpec) -> Result<()> {
        if self.run(program, spec.table, &["-S", spec.chain]).is_err() {
            debug!("Creating chain {} in {} ({})", spec.chain, spec.table, program);
            self.run(program, spec.table, &["-N", spec.chain])?;
        }
        if self
            .run(program, spec.table, &["-C", spec.parent, "-j", spec.chain])
            .is_err()
        {
            self.run(program, spec.table, &["-A", spec.parent, "-j", spec.chain])?;
        }
        Ok(())
    }

    fn present(&self, program: &str, spec: &ChainSpec, body: &[String]) -> bool {
        let mut args = vec!["-C", spec.chain];
        args.extend(body.iter().map(String::as_str));
        self.run(program, spec.table, &args).is_ok()
    }

    fn edit(&self, program: &str, spec: &ChainSpec, op: &str, body: &[String]) -> Result<()> {
        let mut args = vec![op, spec.chain];
        args.extend(body.iter().map(String::as_str));
        self.run(program, spec.table, &args)?;
        Ok(())
    }

    fn install(&self, program: &str, spec: &ChainSpec, body: &[String]) -> Result<()> {
        self.ensure_chain(program, spec)?;
        if self.present(program, spec, body) {
            debug!("Rule already present in {}: {:?}", spec.chain, body);
            return Ok(());
        }
        self.edit(program, spec, "-A", body)
    }

    fn uninstall(&self, program: &str, spec: &ChainSpec, body: &[String]) -> Result<()> {
        if !self.present(program, spec, body) {
            debug!("Rule already absent from {}: {:?}", spec.chain, body);
            return Ok(());
        }
        self.edit(program, spec, "-D", body)
    }

    fn listing(&self, program: &str, spec: &ChainSpec) -> Result<String> {
        match self.run(program, spec.table, &["-S", spec.chain]) {
            Ok(out) => Ok(out),
            Err(e) if is_missing_chain(&e) => Ok(String::new()),
            Err(e) => Err(e),
        }
    }
}

impl PacketFilter for IptablesFilter {
    fn add_rule(&self, family: RuleFamily, key: &RuleKey) -> Result<()> {
        info!("Adding {} rule {}", family, key);
        let program = self.program(key.subnet.is_ipv4());
        self.install(program, spec_for(family), &rule_args(family, key))
    }

    fn remove_rule(&self, family: RuleFamily, key: &RuleKey) -> Result<()> {
        info!("Removing {} rule {}", family, key);
        let program = self.program(key.subnet.is_ipv4());
        self.uninstall(program, spec_for(family), &rule_args(family, key))
    }

    fn list_rules(&self, family: RuleFamily) -> Result<Vec<RuleKey>> {
        let spec = spec_for(family);
        let mut keys = parse_rule_listing(spec.chain, &self.listing(&self.iptables, spec)?)?;
        keys.extend(parse_rule_listing(
            spec.chain,
            &self.listing(&self.ip6tables, spec)?,
        )?);
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn set_forwarding(&self, family: IpFamily, enabled: bool) -> Result<()> {
        self.sysctl.set(family, enabled)
    }

    fn forwarding(&self) -> Result<ForwardingPolicy> {
        self.sysctl.read()
    }

    fn set_port(&self, port: &FirewallPort, allowed: bool) -> Result<()> {
        info!(
            "{} inbound port {}",
            if allowed { "Allowing" } else { "Denying" },
            port
        );
        let body = port_args(port);
        for program in [self.iptables.as_str(), self.ip6tables.as_str()] {
            if allowed {
                self.install(program, &INPUT, &body)?;
            } else {
                self.uninstall(program, &INPUT, &body)?;
            }
        }
        Ok(())
    }

    fn list_ports(&self) -> Result<Vec<FirewallPort>> {
        let mut ports = parse_port_listing(&self.listing(&self.iptables, &INPUT)?)?;
        ports.extend(parse_port_listing(&self.listing(&self.ip6tables, &INPUT)?)?);
        ports.sort();
        ports.dedup();
        Ok(ports)
    }
}
