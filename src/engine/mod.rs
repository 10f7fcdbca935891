//! Reconciliation engine
//!
//! The single entry point for mutating operations. Every operation is one
//! transaction:
//!
//! 1. validate the request (no lock, no I/O);
//! 2. take the lock scopes it needs, global before interface;
//! 3. load the last confirmed record ("prior") and derive the intended one;
//! 4. persist the intended record, then drive the adapters toward it;
//! 5. on adapter failure, drive the adapters back toward the prior record
//!    and restore it in the store. A rollback that fails is reported as
//!    [`BrgError::Inconsistent`]; `reconcile` is the idempotent repair path.
//!
//! Link state changes and interface deletion apply to the kernel first and
//! to the store second.
//!
//! Adapter calls run on tokio's blocking pool. A call that returns after the
//! configured deadline counts as failed even if it succeeded; it is never
//! interrupted, so rollback starts only once it has returned.

mod global;
mod interface;
mod reconcile;
mod request;

pub use reconcile::ReconcileReport;
pub use request::{parse_rule_key, AddInterface, ChangeSet, KeyChange, PeerSpec, RuleChange};

use crate::config::EngineConfig;
use crate::error::{BrgError, Result};
use crate::filter::{IptablesFilter, MemoryFilter, PacketFilter, SysctlForwarding};
use crate::kernel::{Backends, TunnelBackend, DEFAULT_MTU};
use crate::lock::{HeldLocks, LockCoordinator};
use crate::model::{GlobalPolicy, InterfaceRecord, IpFamily, RuleFamily, RuleKey, Variant};
use crate::platform::{CommandRunner, SystemRunner};
use crate::query::QueryProjector;
use crate::store::StateStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Which parts of an interface a drive touches, in application order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Stages {
    key: bool,
    port: bool,
    mtu: bool,
    obfuscation: bool,
    addresses: bool,
    peers: bool,
    link: bool,
}

impl Stages {
    fn all() -> Self {
        Self {
            key: true,
            port: true,
            mtu: true,
            obfuscation: true,
            addresses: true,
            peers: true,
            link: true,
        }
    }

    fn between(from: &InterfaceRecord, to: &InterfaceRecord) -> Self {
        Self {
            key: from.private_key != to.private_key,
            port: from.listen_port != to.listen_port,
            mtu: from.mtu != to.mtu,
            obfuscation: from.obfuscation != to.obfuscation,
            addresses: from.addresses != to.addresses,
            peers: from.peers != to.peers,
            link: from.state != to.state,
        }
    }

    fn link_only(self) -> Self {
        Self {
            link: self.link,
            ..Self::default()
        }
    }

    fn without_link(self) -> Self {
        Self {
            link: false,
            ..self
        }
    }
}

/// Turn a failed operation into its terminal error given the rollback outcome
fn settle(operation: &str, cause: BrgError, rollback: Result<()>) -> BrgError {
    match rollback {
        Ok(()) => {
            warn!("{} failed and was rolled back: {}", operation, cause);
            cause
        }
        Err(rollback) => {
            error!(
                "{} failed ({}) and rollback failed ({}); state is inconsistent",
                operation, cause, rollback
            );
            BrgError::Inconsistent {
                operation: operation.to_string(),
                cause: cause.to_string(),
                rollback: rollback.to_string(),
            }
        }
    }
}

/// Keep the first error of a sequence of attempts
fn first_error(acc: Result<()>, next: Result<()>) -> Result<()> {
    match acc {
        Err(e) => Err(e),
        Ok(()) => next,
    }
}

/// Validates, locks, applies, persists and rolls back
pub struct Reconciler {
    config: EngineConfig,
    store: StateStore,
    locks: LockCoordinator,
    backends: Backends,
    filter: Arc<dyn PacketFilter>,
}

impl Reconciler {
    /// Assemble an engine from its parts
    pub fn new(
        config: EngineConfig,
        store: StateStore,
        backends: Backends,
        filter: Arc<dyn PacketFilter>,
    ) -> Self {
        let locks = LockCoordinator::new(&config.lock_dir);
        Self {
            config,
            store,
            locks,
            backends,
            filter,
        }
    }

    /// Build the engine described by `config`: Linux adapters, or in-memory
    /// ones for a dry run
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let mut store = StateStore::open(&config.state_dir)?;

        let (backends, filter): (Backends, Arc<dyn PacketFilter>) = if config.dry_run {
            warn!("Dry run: kernel, packet filter and state changes are simulated");
            let seeded = simulated(&store)?;
            store = store.scratch_copy()?;
            seeded
        } else {
            let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());
            let filter = IptablesFilter::new(
                runner.clone(),
                &config.tools.iptables,
                &config.tools.ip6tables,
                SysctlForwarding::new(&config.sysctl_root),
            );
            (Backends::system(&config, runner), Arc::new(filter))
        };

        Ok(Self::new(config, store, backends, filter))
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Underlying state store
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Read-only projector over the same store and adapters
    pub fn query(&self) -> QueryProjector {
        QueryProjector::new(
            self.store.clone(),
            self.backends.clone(),
            self.filter.clone(),
        )
    }

    async fn lock(&self, global: bool, interface: Option<&str>) -> Result<HeldLocks> {
        let held = self
            .locks
            .acquire_for(global, interface, self.config.lock_timeout())
            .await?;
        debug!(
            "Holding locks (global: {}, interface: {:?})",
            held.holds_global(),
            held.interface()
        );
        Ok(held)
    }

    /// Run one blocking adapter call under the operation deadline
    async fn adapter<T, F>(&self, what: String, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let deadline = self.config.adapter_deadline();
        let started = Instant::now();
        debug!("Adapter call: {}", what);

        let result = tokio::task::spawn_blocking(f).await?;
        let elapsed = started.elapsed();
        match result {
            Ok(_) if elapsed > deadline => Err(BrgError::AdapterFailure(format!(
                "{} exceeded the {:?} deadline (took {:?})",
                what, deadline, elapsed
            ))),
            other => other,
        }
    }

    async fn tunnel<F>(&self, backend: &Arc<dyn TunnelBackend>, what: &str, name: &str, f: F) -> Result<()>
    where
        F: FnOnce(&dyn TunnelBackend, &str) -> Result<()> + Send + 'static,
    {
        let backend = backend.clone();
        let target = name.to_string();
        self.adapter(format!("{} {}", what, name), move || {
            f(backend.as_ref(), &target)
        })
        .await
    }

    async fn packet_filter<T, F>(&self, what: String, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn PacketFilter) -> Result<T> + Send + 'static,
    {
        let filter = self.filter.clone();
        self.adapter(what, move || f(filter.as_ref())).await
    }

    /// Apply the selected parts of `to` to its kernel interface
    async fn drive_interface(&self, to: &InterfaceRecord, stages: Stages) -> Result<()> {
        let backend = self.backends.for_variant(to.variant);
        let name = to.name.as_str();

        if stages.key {
            let key = to.private_key.clone();
            self.tunnel(&backend, "set private key on", name, move |b, n| {
                b.set_private_key(n, key.as_ref())
            })
            .await?;
        }

        if stages.port {
            let port = to.listen_port;
            self.tunnel(&backend, "set listen port on", name, move |b, n| {
                b.set_port(n, port)
            })
            .await?;
        }

        if stages.mtu {
            let mtu = to.mtu.unwrap_or(DEFAULT_MTU);
            self.tunnel(&backend, "set mtu on", name, move |b, n| b.set_mtu(n, mtu))
                .await?;
        }

        if stages.obfuscation && to.variant == Variant::Obfuscated {
            if let Some(params) = to.obfuscation.clone() {
                self.tunnel(&backend, "set obfuscation on", name, move |b, n| {
                    b.set_obfuscation(n, &params)
                })
                .await?;
            }
        }

        if stages.addresses {
            let addresses = to.addresses.clone();
            self.tunnel(&backend, "set addresses on", name, move |b, n| {
                b.set_addresses(n, &addresses)
            })
            .await?;
        }

        if stages.peers {
            let peers = to.peers.clone();
            self.tunnel(&backend, "set peers on", name, move |b, n| {
                b.set_peers(n, &peers)
            })
            .await?;
        }

        if stages.link {
            let state = to.state;
            self.tunnel(&backend, "set link on", name, move |b, n| {
                b.set_link(n, state)
            })
            .await?;
        }

        Ok(())
    }

    /// Make sure the kernel interface exists and matches `record` entirely
    async fn restore_device(&self, record: &InterfaceRecord) -> Result<()> {
        let backend = self.backends.for_variant(record.variant);
        let probe = backend.clone();
        let name = record.name.clone();
        let exists = self
            .adapter(format!("probe {}", record.name), move || probe.exists(&name))
            .await?;

        if !exists {
            warn!("Kernel interface {} missing, recreating", record.name);
            self.tunnel(&backend, "create", &record.name, |b, n| b.create(n))
                .await?;
        }

        self.drive_interface(record, Stages::all()).await
    }

    /// Destroy the kernel interface `name` if it exists
    async fn discard_device(&self, backend: &Arc<dyn TunnelBackend>, name: &str) -> Result<()> {
        let probe = backend.clone();
        let target = name.to_string();
        let exists = self
            .adapter(format!("probe {}", name), move || probe.exists(&target))
            .await?;
        if exists {
            self.tunnel(backend, "destroy", name, |b, n| b.destroy(n))
                .await?;
        }
        Ok(())
    }

    /// Apply global policy. With `from` the difference is applied; without it
    /// every desired entry is (re)installed and live entries nobody wants
    /// are removed.
    async fn drive_global(&self, from: Option<&GlobalPolicy>, to: &GlobalPolicy) -> Result<()> {
        for family in [RuleFamily::Nat, RuleFamily::Firewall] {
            let wanted: BTreeSet<RuleKey> = active_keys(to, family);
            let (install, uninstall): (Vec<RuleKey>, Vec<RuleKey>) = match from {
                Some(from) => {
                    let had = active_keys(from, family);
                    (
                        wanted.difference(&had).cloned().collect(),
                        had.difference(&wanted).cloned().collect(),
                    )
                }
                None => {
                    let live = self
                        .packet_filter(format!("list {} rules", family), move |f| {
                            f.list_rules(family)
                        })
                        .await?;
                    (
                        wanted.iter().cloned().collect(),
                        live.into_iter().filter(|k| !wanted.contains(k)).collect(),
                    )
                }
            };

            for key in uninstall {
                self.packet_filter(format!("remove {} rule {}", family, key), move |f| {
                    f.remove_rule(family, &key)
                })
                .await?;
            }
            for key in install {
                self.packet_filter(format!("add {} rule {}", family, key), move |f| {
                    f.add_rule(family, &key)
                })
                .await?;
            }
        }

        for family in [IpFamily::Ipv4, IpFamily::Ipv6] {
            let enabled = to.forwarding.get(family);
            if from.map_or(true, |f| f.forwarding.get(family) != enabled) {
                self.packet_filter(format!("set {} forwarding", family), move |f| {
                    f.set_forwarding(family, enabled)
                })
                .await?;
            }
        }

        let wanted: BTreeSet<_> = to.firewall_ports.iter().copied().collect();
        let (allow, deny): (Vec<_>, Vec<_>) = match from {
            Some(from) => {
                let had: BTreeSet<_> = from.firewall_ports.iter().copied().collect();
                (
                    wanted.difference(&had).copied().collect(),
                    had.difference(&wanted).copied().collect(),
                )
            }
            None => {
                let live = self
                    .packet_filter("list firewall ports".to_string(), |f| f.list_ports())
                    .await?;
                (
                    wanted.iter().copied().collect(),
                    live.into_iter().filter(|p| !wanted.contains(p)).collect(),
                )
            }
        };
        for port in deny {
            self.packet_filter(format!("deny port {}", port), move |f| f.set_port(&port, false))
                .await?;
        }
        for port in allow {
            self.packet_filter(format!("allow port {}", port), move |f| f.set_port(&port, true))
                .await?;
        }

        Ok(())
    }

    /// Persist `intended`, drive the kernel toward it and roll back on failure
    async fn commit_interface(
        &self,
        operation: &str,
        prior: &InterfaceRecord,
        intended: &InterfaceRecord,
    ) -> Result<()> {
        self.store.put_interface(intended)?;

        if let Err(cause) = self
            .drive_interface(intended, Stages::between(prior, intended))
            .await
        {
            let reverted = self
                .drive_interface(prior, Stages::between(intended, prior))
                .await;
            let restored = self.store.put_interface(prior);
            return Err(settle(operation, cause, first_error(reverted, restored)));
        }
        Ok(())
    }

    /// Persist `intended` global policy, drive the filter toward it and roll
    /// back on failure
    async fn commit_global(
        &self,
        operation: &str,
        prior: &GlobalPolicy,
        intended: &GlobalPolicy,
    ) -> Result<()> {
        self.store.put_global(intended)?;

        if let Err(cause) = self.drive_global(Some(prior), intended).await {
            let reverted = self.drive_global(Some(intended), prior).await;
            let restored = self.store.put_global(prior);
            return Err(settle(operation, cause, first_error(reverted, restored)));
        }
        Ok(())
    }
}

/// In-memory adapters preloaded with the stored state, so a dry run starts
/// from what the host would already have
fn simulated(store: &StateStore) -> Result<(Backends, Arc<dyn PacketFilter>)> {
    let backends = Backends::memory();
    for record in store.load_interfaces()? {
        let backend = backends.for_variant(record.variant);
        let name = record.name.as_str();
        backend.create(name)?;
        backend.set_private_key(name, record.private_key.as_ref())?;
        backend.set_port(name, record.listen_port)?;
        backend.set_mtu(name, record.mtu.unwrap_or(DEFAULT_MTU))?;
        if let (Variant::Obfuscated, Some(params)) = (record.variant, &record.obfuscation) {
            backend.set_obfuscation(name, params)?;
        }
        backend.set_addresses(name, &record.addresses)?;
        backend.set_peers(name, &record.peers)?;
        backend.set_link(name, record.state)?;
    }

    let filter = MemoryFilter::new();
    let policy = store.load_global()?;
    for family in [RuleFamily::Nat, RuleFamily::Firewall] {
        for key in active_keys(&policy, family) {
            filter.add_rule(family, &key)?;
        }
    }
    for family in [IpFamily::Ipv4, IpFamily::Ipv6] {
        filter.set_forwarding(family, policy.forwarding.get(family))?;
    }
    for port in &policy.firewall_ports {
        filter.set_port(port, true)?;
    }

    Ok((backends, Arc::new(filter)))
}

fn active_keys(policy: &GlobalPolicy, family: RuleFamily) -> BTreeSet<RuleKey> {
    policy
        .rules(family)
        .iter()
        .filter(|r| r.active)
        .map(|r| r.key.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LinkState, LogLevel, LogSink};
    use crate::wireguard::PrivateKey;
    use tempfile::TempDir;

    fn record() -> InterfaceRecord {
        InterfaceRecord::new(
            "wg0".to_string(),
            Variant::Standard,
            None,
            LogSink {
                dir: "/var/log".into(),
                level: LogLevel::Silent,
                json: false,
            },
            None,
        )
    }

    #[test]
    fn test_stages_between_selects_changed_parts() {
        let prior = record();
        let mut next = prior.clone();
        next.listen_port = 51820;
        next.state = LinkState::Up;

        let stages = Stages::between(&prior, &next);
        assert!(stages.port && stages.link);
        assert!(!stages.key && !stages.peers && !stages.addresses);
        assert!(!stages.without_link().link);
        assert_eq!(stages.link_only(), Stages { link: true, ..Stages::default() });
        assert_eq!(Stages::between(&prior, &prior), Stages::default());
    }

    #[test]
    fn test_settle_keeps_cause_when_rolled_back() {
        let cause = BrgError::AdapterFailure("boom".to_string());
        let err = settle("op", cause, Ok(()));
        assert!(matches!(err, BrgError::AdapterFailure(_)));

        let err = settle(
            "op",
            BrgError::AdapterFailure("boom".to_string()),
            Err(BrgError::AdapterFailure("again".to_string())),
        );
        assert!(matches!(err, BrgError::Inconsistent { .. }));
    }

    #[tokio::test]
    async fn test_dry_run_starts_from_stored_state() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::rooted_at(dir.path());
        config.dry_run = true;

        let store = StateStore::open(&config.state_dir).unwrap();
        let mut r = record();
        r.set_private_key(PrivateKey::generate());
        r.listen_port = 51820;
        r.revision = 1;
        store.put_interface(&r).unwrap();

        let engine = Reconciler::from_config(config.clone()).unwrap();
        engine.set_port("wg0", 51821).await.unwrap();

        let view = engine.query().get_interface("wg0").await.unwrap();
        assert_eq!(view.live.unwrap().listen_port, 51821);

        let on_disk = StateStore::open(&config.state_dir).unwrap();
        assert_eq!(on_disk.get_interface("wg0").unwrap(), r);
    }

    #[tokio::test]
    async fn test_dry_run_add_is_not_persisted() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::rooted_at(dir.path());
        config.dry_run = true;

        let engine = Reconciler::from_config(config.clone()).unwrap();
        engine
            .add_interface(AddInterface {
                name: "wg1".to_string(),
                variant: Variant::Standard,
                mtu: None,
                log: LogSink {
                    dir: dir.path().to_path_buf(),
                    level: LogLevel::Silent,
                    json: false,
                },
                obfuscation: None,
            })
            .await
            .unwrap();
        assert!(engine.store().load_interface("wg1").unwrap().is_some());

        let on_disk = StateStore::open(&config.state_dir).unwrap();
        assert!(on_disk.load_interface("wg1").unwrap().is_none());
        assert!(on_disk.list_interfaces().unwrap().is_empty());
    }
}
