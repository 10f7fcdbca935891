//! Global policy operations: NAT, forwarding block, forwarding, firewall ports

use super::{parse_rule_key, Reconciler};
use crate::config::validation::validate_port;
use crate::error::{BrgError, Result};
use crate::model::{FilterRule, FirewallPort, GlobalPolicy, IpFamily, Protocol, RuleFamily, RuleKey};
use tracing::{debug, info};

/// Enable or disable one rule inside a policy. Enabling an active rule and
/// disabling an inactive one change nothing; disabling a rule never seen is
/// `NotFound`.
pub(super) fn toggle_rule(
    policy: &mut GlobalPolicy,
    family: RuleFamily,
    key: RuleKey,
    enable: bool,
    origin: Option<&str>,
) -> Result<()> {
    let rules = policy.rules_mut(family);
    match rules.binary_search_by(|r| r.key.cmp(&key)) {
        Ok(idx) => {
            let rule = &mut rules[idx];
            if rule.active != enable {
                rule.active = enable;
                if enable {
                    rule.origin = origin.map(str::to_string);
                }
            }
            Ok(())
        }
        Err(_) if !enable => Err(BrgError::NotFound(format!("{} rule {}", family, key))),
        Err(idx) => {
            rules.insert(
                idx,
                FilterRule {
                    key,
                    active: true,
                    origin: origin.map(str::to_string),
                },
            );
            Ok(())
        }
    }
}

/// Add or remove a port on the sorted allow-list
pub(super) fn toggle_port(policy: &mut GlobalPolicy, port: FirewallPort, allow: bool) {
    match (policy.firewall_ports.binary_search(&port), allow) {
        (Err(idx), true) => policy.firewall_ports.insert(idx, port),
        (Ok(idx), false) => {
            policy.firewall_ports.remove(idx);
        }
        _ => {}
    }
}

impl Reconciler {
    /// Lock global policy, apply `mutate` and commit the result
    async fn mutate_global<F>(&self, operation: &str, mutate: F) -> Result<GlobalPolicy>
    where
        F: FnOnce(&mut GlobalPolicy) -> Result<()>,
    {
        let _held = self.lock(true, None).await?;

        let prior = self.store.load_global()?;
        let mut intended = prior.clone();
        mutate(&mut intended)?;

        if intended == prior {
            debug!("{}: nothing to change", operation);
            return Ok(prior);
        }

        intended.revision = prior.revision + 1;
        self.commit_global(operation, &prior, &intended).await?;
        info!(
            "{} committed (global revision {})",
            operation, intended.revision
        );
        Ok(intended)
    }

    async fn set_rule(
        &self,
        family: RuleFamily,
        subnet: &str,
        egress: Option<&str>,
        enable: bool,
        origin: Option<&str>,
    ) -> Result<RuleKey> {
        let key = parse_rule_key(subnet, egress)?;
        let stored = key.clone();
        let operation = if enable {
            format!("enable {} rule", family)
        } else {
            format!("disable {} rule", family)
        };

        self.mutate_global(&operation, move |policy| {
            toggle_rule(policy, family, stored, enable, origin)
        })
        .await?;
        Ok(key)
    }

    /// Masquerade traffic from `subnet` leaving through `egress` (any when
    /// `None`). `origin` names the interface the request was made through.
    pub async fn set_nat(
        &self,
        subnet: &str,
        egress: Option<&str>,
        enable: bool,
        origin: Option<&str>,
    ) -> Result<RuleKey> {
        self.set_rule(RuleFamily::Nat, subnet, egress, enable, origin)
            .await
    }

    /// Block forwarding of traffic from `subnet` through `egress`
    pub async fn set_firewall_rule(
        &self,
        subnet: &str,
        egress: Option<&str>,
        enable: bool,
        origin: Option<&str>,
    ) -> Result<RuleKey> {
        self.set_rule(RuleFamily::Firewall, subnet, egress, enable, origin)
            .await
    }

    /// Toggle kernel IP forwarding for one family
    pub async fn set_forwarding(&self, family: IpFamily, enabled: bool) -> Result<GlobalPolicy> {
        self.mutate_global(&format!("set {} forwarding", family), move |policy| {
            policy.forwarding.set(family, enabled);
            Ok(())
        })
        .await
    }

    /// Allow or stop allowing inbound traffic to a port
    pub async fn set_firewall_port(
        &self,
        protocol: Protocol,
        port: u16,
        allow: bool,
    ) -> Result<FirewallPort> {
        validate_port(port)?;
        let entry = FirewallPort { protocol, port };
        self.mutate_global(&format!("set firewall port {}", entry), move |policy| {
            toggle_port(policy, entry, allow);
            Ok(())
        })
        .await?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::ErrorKind;
    use crate::filter::{MemoryFilter, PacketFilter};
    use crate::kernel::Backends;
    use crate::store::StateStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn engine(dir: &TempDir, filter: Arc<MemoryFilter>) -> Reconciler {
        let config = EngineConfig::rooted_at(dir.path());
        let store = StateStore::open(&config.state_dir).unwrap();
        Reconciler::new(config, store, Backends::memory(), filter)
    }

    fn key(subnet: &str, egress: Option<&str>) -> RuleKey {
        parse_rule_key(subnet, egress).unwrap()
    }

    #[test]
    fn test_toggle_rule_states() {
        let mut policy = GlobalPolicy::default();
        let k = key("10.10.10.0/24", None);

        toggle_rule(&mut policy, RuleFamily::Nat, k.clone(), true, Some("wg0")).unwrap();
        assert!(policy.rule(RuleFamily::Nat, &k).unwrap().active);

        toggle_rule(&mut policy, RuleFamily::Nat, k.clone(), false, None).unwrap();
        let rule = policy.rule(RuleFamily::Nat, &k).unwrap();
        assert!(!rule.active);
        assert_eq!(rule.origin.as_deref(), Some("wg0"));

        let unknown = key("10.20.0.0/16", None);
        let err = toggle_rule(&mut policy, RuleFamily::Nat, unknown, false, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_toggle_rule_keeps_order() {
        let mut policy = GlobalPolicy::default();
        for subnet in ["10.30.0.0/16", "10.10.0.0/16", "10.20.0.0/16"] {
            toggle_rule(&mut policy, RuleFamily::Firewall, key(subnet, None), true, None).unwrap();
        }
        assert!(policy.firewall.windows(2).all(|w| w[0].key < w[1].key));
    }

    #[tokio::test]
    async fn test_nat_enable_installs_once() {
        let dir = TempDir::new().unwrap();
        let filter = Arc::new(MemoryFilter::new());
        let engine = engine(&dir, filter.clone());

        engine
            .set_nat("10.10.10.0/24", Some("any"), true, Some("wg0"))
            .await
            .unwrap();
        engine
            .set_nat("10.10.10.0/24", None, true, Some("wg0"))
            .await
            .unwrap();

        let live = filter.list_rules(RuleFamily::Nat).unwrap();
        assert_eq!(live, vec![key("10.10.10.0/24", None)]);
        assert_eq!(engine.store().load_global().unwrap().revision, 1);
    }

    #[tokio::test]
    async fn test_disable_keeps_inactive_record() {
        let dir = TempDir::new().unwrap();
        let filter = Arc::new(MemoryFilter::new());
        let engine = engine(&dir, filter.clone());

        engine
            .set_firewall_rule("10.10.10.0/24", Some("enp0s3"), true, None)
            .await
            .unwrap();
        engine
            .set_firewall_rule("10.10.10.0/24", Some("enp0s3"), false, None)
            .await
            .unwrap();

        assert!(filter.list_rules(RuleFamily::Firewall).unwrap().is_empty());
        let policy = engine.store().load_global().unwrap();
        assert_eq!(policy.firewall.len(), 1);
        assert!(!policy.firewall[0].active);
    }

    #[tokio::test]
    async fn test_filter_failure_rolls_back_policy() {
        let dir = TempDir::new().unwrap();
        let filter = Arc::new(MemoryFilter::new());
        let engine = engine(&dir, filter.clone());

        filter.fail_next("add_rule", 1);
        let err = engine
            .set_nat("10.10.10.0/24", None, true, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AdapterFailure);
        assert_eq!(
            engine.store().load_global().unwrap(),
            GlobalPolicy::default()
        );
    }

    #[tokio::test]
    async fn test_forwarding_and_ports() {
        let dir = TempDir::new().unwrap();
        let filter = Arc::new(MemoryFilter::new());
        let engine = engine(&dir, filter.clone());

        engine.set_forwarding(IpFamily::Ipv4, true).await.unwrap();
        assert!(filter.forwarding().unwrap().ipv4);
        assert!(!filter.forwarding().unwrap().ipv6);

        engine
            .set_firewall_port(Protocol::Udp, 51820, true)
            .await
            .unwrap();
        assert_eq!(filter.list_ports().unwrap().len(), 1);

        let err = engine
            .set_firewall_port(Protocol::Tcp, 0, true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        engine
            .set_firewall_port(Protocol::Udp, 51820, false)
            .await
            .unwrap();
        assert!(filter.list_ports().unwrap().is_empty());
    }
}
