//! Multi-resource change sets and the repair path

use super::global::toggle_rule;
use super::interface::{check_obfuscation, check_own_key};
use super::{
    first_error, parse_rule_key, settle, ChangeSet, KeyChange, Reconciler, RuleChange, Stages,
};
use crate::config::validation::{validate_interface_name, validate_mtu, validate_port};
use crate::error::{BrgError, Result};
use crate::model::{Cidr, GlobalPolicy, InterfaceRecord, PeerRecord, RuleFamily, RuleKey};
use crate::wireguard::{PrivateKey, PublicKey};
use tracing::{debug, error, info};

/// Outcome of [`Reconciler::reconcile_all`]
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Interfaces whose kernel state now matches the store
    pub reconciled: Vec<String>,
    /// Interfaces that could not be reconciled
    pub failures: Vec<(String, BrgError)>,
    /// Failure re-driving global policy, if any
    pub global: Option<BrgError>,
}

impl ReconcileReport {
    /// Whether everything was reconciled
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.global.is_none()
    }
}

/// How far the adapters got while applying a change set
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Reached {
    Interface,
    Global,
    Link,
}

/// Change set inputs, parsed before any lock is taken
struct ParsedChanges {
    private_key: Option<PrivateKey>,
    add_addresses: Vec<Cidr>,
    remove_addresses: Vec<Cidr>,
    upsert_peers: Vec<PeerRecord>,
    remove_peers: Vec<PublicKey>,
    nat: Vec<(RuleKey, bool)>,
    firewall: Vec<(RuleKey, bool)>,
}

impl ParsedChanges {
    fn parse(changes: &ChangeSet) -> Result<Self> {
        if let Some(mtu) = changes.mtu {
            validate_mtu(mtu)?;
        }
        if let Some(port) = changes.listen_port {
            if port != 0 {
                validate_port(port)?;
            }
        }
        if let Some(params) = &changes.obfuscation {
            params.validate()?;
        }

        let private_key = match &changes.private_key {
            None => None,
            Some(KeyChange::Generate) => Some(PrivateKey::generate()),
            Some(KeyChange::Set(encoded)) => Some(PrivateKey::from_base64(encoded)?),
        };

        let rules = |toggles: &[RuleChange]| -> Result<Vec<(RuleKey, bool)>> {
            toggles
                .iter()
                .map(|t| Ok((parse_rule_key(&t.subnet, t.egress.as_deref())?, t.enable)))
                .collect()
        };

        Ok(Self {
            private_key,
            add_addresses: changes
                .add_addresses
                .iter()
                .map(|a| a.parse())
                .collect::<Result<_>>()?,
            remove_addresses: changes
                .remove_addresses
                .iter()
                .map(|a| a.parse())
                .collect::<Result<_>>()?,
            upsert_peers: changes
                .upsert_peers
                .iter()
                .map(|p| p.parse())
                .collect::<Result<_>>()?,
            remove_peers: changes
                .remove_peers
                .iter()
                .map(|k| PublicKey::from_base64(k.trim()))
                .collect::<Result<_>>()?,
            nat: rules(&changes.nat)?,
            firewall: rules(&changes.firewall)?,
        })
    }
}

impl Reconciler {
    /// Apply several sub-resource changes to one interface as a single
    /// transaction. Adapters are driven in the order key, port, interface
    /// parameters, addresses, peers, NAT and firewall rules, link state; a
    /// failure anywhere undoes every earlier step.
    pub async fn apply(&self, name: &str, changes: &ChangeSet) -> Result<InterfaceRecord> {
        validate_interface_name(name)?;
        let parsed = ParsedChanges::parse(changes)?;
        let _held = self.lock(changes.touches_global(), Some(name)).await?;

        let prior = self.store.get_interface(name)?;
        let mut intended = prior.clone();

        if let Some(key) = parsed.private_key {
            intended.set_private_key(key);
        }
        if let Some(port) = changes.listen_port {
            intended.listen_port = port;
        }
        if let Some(mtu) = changes.mtu {
            intended.mtu = Some(mtu);
        }
        if let Some(params) = &changes.obfuscation {
            check_obfuscation(intended.variant, Some(params))?;
            intended.obfuscation = Some(params.clone());
        }
        for address in parsed.remove_addresses {
            let idx = intended
                .addresses
                .iter()
                .position(|a| *a == address)
                .ok_or_else(|| BrgError::NotFound(format!("address {} on {}", address, name)))?;
            intended.addresses.remove(idx);
        }
        for address in parsed.add_addresses {
            if !intended.addresses.contains(&address) {
                intended.addresses.push(address);
            }
        }
        for key in &parsed.remove_peers {
            intended
                .remove_peer(key)
                .ok_or_else(|| BrgError::NotFound(format!("peer {} on {}", key, name)))?;
        }
        for peer in parsed.upsert_peers {
            intended.upsert_peer(peer);
        }
        check_own_key(&intended)?;
        if let Some(state) = changes.link {
            intended.state = state;
        }

        let global = if changes.touches_global() {
            let prior_global = self.store.load_global()?;
            let mut intended_global = prior_global.clone();
            for (key, enable) in parsed.nat {
                toggle_rule(&mut intended_global, RuleFamily::Nat, key, enable, Some(name))?;
            }
            for (key, enable) in parsed.firewall {
                toggle_rule(&mut intended_global, RuleFamily::Firewall, key, enable, Some(name))?;
            }
            if intended_global == prior_global {
                None
            } else {
                intended_global.revision = prior_global.revision + 1;
                Some((prior_global, intended_global))
            }
        } else {
            None
        };

        let interface_changed = intended != prior;
        if !interface_changed && global.is_none() {
            debug!("apply on {}: nothing to change", name);
            return Ok(prior);
        }
        if interface_changed {
            intended.revision = prior.revision + 1;
            self.store.put_interface(&intended)?;
        }
        if let Some((_, intended_global)) = &global {
            if let Err(cause) = self.store.put_global(intended_global) {
                let restored = self.store.put_interface(&prior);
                return Err(settle("apply", cause, restored));
            }
            debug!(
                "apply on {} moves global policy to revision {}",
                name, intended_global.revision
            );
        }

        let forward = Stages::between(&prior, &intended);
        let mut reached = Reached::Interface;
        let outcome: Result<()> = async {
            self.drive_interface(&intended, forward.without_link()).await?;
            if let Some((prior_global, intended_global)) = &global {
                reached = Reached::Global;
                self.drive_global(Some(prior_global), intended_global).await?;
            }
            reached = Reached::Link;
            self.drive_interface(&intended, forward.link_only()).await
        }
        .await;

        if let Err(cause) = outcome {
            let backward = Stages::between(&intended, &prior);
            let mut rollback = Ok(());
            if reached >= Reached::Link {
                rollback = first_error(
                    rollback,
                    self.drive_interface(&prior, backward.link_only()).await,
                );
            }
            if let Some((prior_global, intended_global)) = &global {
                if reached >= Reached::Global {
                    rollback = first_error(
                        rollback,
                        self.drive_global(Some(intended_global), prior_global).await,
                    );
                }
                rollback = first_error(rollback, self.store.put_global(prior_global));
            }
            rollback = first_error(
                rollback,
                self.drive_interface(&prior, backward.without_link()).await,
            );
            if interface_changed {
                rollback = first_error(rollback, self.store.put_interface(&prior));
            }
            return Err(settle("apply", cause, rollback));
        }

        info!(
            "apply on {} committed (revision {})",
            name,
            if interface_changed {
                intended.revision
            } else {
                prior.revision
            }
        );
        Ok(if interface_changed { intended } else { prior })
    }

    /// Drive one interface's kernel state to its stored record, recreating
    /// the kernel interface if it is missing
    pub async fn reconcile(&self, name: &str) -> Result<InterfaceRecord> {
        validate_interface_name(name)?;
        let _held = self.lock(false, Some(name)).await?;

        let mut record = self.store.get_interface(name)?;
        self.restore_device(&record).await?;
        if record.pending {
            record.pending = false;
            self.store.put_interface(&record)?;
            info!("Creation of {} confirmed", name);
        }
        info!("Interface {} reconciled (revision {})", name, record.revision);
        Ok(record)
    }

    /// Re-install every active rule, forwarding toggle and port, and remove
    /// live entries in the engine's chains that nothing wants
    pub async fn reconcile_global(&self) -> Result<GlobalPolicy> {
        let _held = self.lock(true, None).await?;

        let policy = self.store.load_global()?;
        self.drive_global(None, &policy).await?;
        info!("Global policy reconciled (revision {})", policy.revision);
        Ok(policy)
    }

    /// Reconcile every stored interface, then global policy. Failures are
    /// collected rather than stopping the pass.
    pub async fn reconcile_all(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for name in self.store.list_interfaces()? {
            match self.reconcile(&name).await {
                Ok(_) => report.reconciled.push(name),
                Err(e) => {
                    error!("Failed to reconcile {}: {}", name, e);
                    report.failures.push((name, e));
                }
            }
        }

        if let Err(e) = self.reconcile_global().await {
            error!("Failed to reconcile global policy: {}", e);
            report.global = Some(e);
        }

        Ok(report)
    }
}
