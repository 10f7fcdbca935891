//! In-memory packet filter used by tests and dry runs

use crate::error::{BrgError, Result};
use crate::filter::PacketFilter;
use crate::model::{FirewallPort, ForwardingPolicy, IpFamily, RuleFamily, RuleKey};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    nat: BTreeSet<RuleKey>,
    firewall: BTreeSet<RuleKey>,
    forwarding: ForwardingPolicy,
    ports: BTreeSet<FirewallPort>,
    failures: HashMap<&'static str, usize>,
    calls: Vec<String>,
}

impl Inner {
    fn rules(&mut self, family: RuleFamily) -> &mut BTreeSet<RuleKey> {
        match family {
            RuleFamily::Nat => &mut self.nat,
            RuleFamily::Firewall => &mut self.firewall,
        }
    }
}

/// Packet filter state kept in memory, with per-operation failure injection
#[derive(Default)]
pub struct MemoryFilter {
    inner: Mutex<Inner>,
}

impl MemoryFilter {
    /// Create an empty filter
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `op` fail
    pub fn fail_next(&self, op: &'static str, times: usize) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failures.insert(op, times);
        }
    }

    /// Operations performed so far
    pub fn calls(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|inner| inner.calls.clone())
            .unwrap_or_default()
    }

    fn call(&self, op: &'static str, detail: String) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| BrgError::Internal("memory filter poisoned".to_string()))?;
        inner.calls.push(format!("{} {}", op, detail));
        if let Some(remaining) = inner.failures.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BrgError::AdapterFailure(format!(
                    "injected failure in {} ({})",
                    op, detail
                )));
            }
        }
        Ok(inner)
    }
}

impl PacketFilter for MemoryFilter {
    fn add_rule(&self, family: RuleFamily, key: &RuleKey) -> Result<()> {
        let mut inner = self.call("add_rule", format!("{} {}", family, key))?;
        inner.rules(family).insert(key.clone());
        Ok(())
    }

    fn remove_rule(&self, family: RuleFamily, key: &RuleKey) -> Result<()> {
        let mut inner = self.call("remove_rule", format!("{} {}", family, key))?;
        inner.rules(family).remove(key);
        Ok(())
    }

    fn list_rules(&self, family: RuleFamily) -> Result<Vec<RuleKey>> {
        let mut inner = self.call("list_rules", family.to_string())?;
        Ok(inner.rules(family).iter().cloned().collect())
    }

    fn set_forwarding(&self, family: IpFamily, enabled: bool) -> Result<()> {
        let mut inner = self.call("set_forwarding", format!("{} {}", family, enabled))?;
        inner.forwarding.set(family, enabled);
        Ok(())
    }

    fn forwarding(&self) -> Result<ForwardingPolicy> {
        let inner = self.call("forwarding", String::new())?;
        Ok(inner.forwarding)
    }

    fn set_port(&self, port: &FirewallPort, allowed: bool) -> Result<()> {
        let mut inner = self.call("set_port", format!("{} {}", port, allowed))?;
        if allowed {
            inner.ports.insert(*port);
        } else {
            inner.ports.remove(port);
        }
        Ok(())
    }

    fn list_ports(&self) -> Result<Vec<FirewallPort>> {
        let inner = self.call("list_ports", String::new())?;
        Ok(inner.ports.iter().copied().collect())
    }
}
