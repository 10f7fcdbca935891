//! Interface-scoped operations

use super::{settle, PeerSpec, Reconciler, Stages};
use crate::config::validation::{validate_interface_name, validate_log_dir, validate_mtu};
use crate::engine::AddInterface;
use crate::error::{BrgError, Result};
use crate::kernel::TunnelBackend;
use crate::logging::open_sink;
use crate::model::{Cidr, InterfaceRecord, LinkState, PeerRecord, Variant};
use crate::wireguard::{ObfuscationParams, PrivateKey, PublicKey};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Check the variant/parameter-block pairing of a new or updated interface
pub(super) fn check_obfuscation(variant: Variant, params: Option<&ObfuscationParams>) -> Result<()> {
    match (variant, params) {
        (Variant::Obfuscated, None) => Err(BrgError::InvalidArgument(
            "Obfuscated interfaces require an obfuscation parameter block".to_string(),
        )),
        (Variant::Standard, Some(_)) => Err(BrgError::UnsupportedForVariant {
            variant: variant.to_string(),
            what: "obfuscation parameters".to_string(),
        }),
        (Variant::Obfuscated, Some(params)) => params.validate(),
        (Variant::Standard, None) => Ok(()),
    }
}

/// Reject a key set where the interface's own public key is also a peer
pub(super) fn check_own_key(record: &InterfaceRecord) -> Result<()> {
    if let Some(own) = &record.public_key {
        if record.peer(own).is_some() {
            return Err(BrgError::InvalidArgument(format!(
                "Peer key {} equals the public key of interface {}",
                own, record.name
            )));
        }
    }
    Ok(())
}

impl Reconciler {
    /// Lock an interface, apply `mutate` to its record and commit the result.
    /// A mutation that changes nothing returns the stored record untouched.
    async fn mutate_interface<F>(&self, operation: &str, name: &str, mutate: F) -> Result<InterfaceRecord>
    where
        F: FnOnce(&mut InterfaceRecord) -> Result<()>,
    {
        validate_interface_name(name)?;
        let _held = self.lock(false, Some(name)).await?;

        let prior = self.store.get_interface(name)?;
        let mut intended = prior.clone();
        mutate(&mut intended)?;

        if intended == prior {
            debug!("{} on {}: nothing to change", operation, name);
            return Ok(prior);
        }

        intended.revision = prior.revision + 1;
        self.commit_interface(operation, &prior, &intended).await?;
        info!(
            "{} on {} committed (revision {})",
            operation, name, intended.revision
        );
        Ok(intended)
    }

    /// Create an interface, administratively down with no keys, peers or
    /// addresses.
    ///
    /// The record is stored as pending before the kernel interface is
    /// created and confirmed once the kernel matches it. When a failed
    /// creation cannot be undone the pending record is kept, so repeating
    /// the same call (or a reconcile) finishes the job.
    pub async fn add_interface(&self, request: AddInterface) -> Result<InterfaceRecord> {
        let name = request.name.as_str();
        validate_interface_name(name)?;
        if let Some(mtu) = request.mtu {
            validate_mtu(mtu)?;
        }
        check_obfuscation(request.variant, request.obfuscation.as_ref())?;
        validate_log_dir(&request.log.dir)?;
        if let Some((path, _)) = open_sink(&request.log, name)? {
            debug!("Log sink for {} at {:?}", name, path);
        }

        let _held = self.lock(false, Some(name)).await?;
        let backend = self.backends.for_variant(request.variant);

        let mut record = InterfaceRecord::new(
            request.name.clone(),
            request.variant,
            request.mtu,
            request.log.clone(),
            request.obfuscation.clone(),
        );
        record.pending = true;

        let resumed = match self.store.load_interface(name)? {
            Some(stored) if stored.pending && stored.variant == request.variant => {
                warn!(
                    "Resuming unfinished creation of {} (revision {})",
                    name, stored.revision
                );
                record.revision = stored.revision + 1;
                true
            }
            Some(_) => {
                return Err(BrgError::AlreadyExists(format!("interface {}", name)));
            }
            None => {
                let probe = backend.clone();
                let target = name.to_string();
                if self
                    .adapter(format!("probe {}", name), move || probe.exists(&target))
                    .await?
                {
                    return Err(BrgError::AlreadyExists(format!(
                        "kernel interface {} (not managed by this engine)",
                        name
                    )));
                }
                record.revision = 1;
                false
            }
        };

        self.store.put_interface(&record)?;

        let provisioned = if resumed {
            self.restore_device(&record).await
        } else {
            self.provision(&backend, &record).await
        };
        let confirmed = match provisioned {
            Ok(()) => {
                record.pending = false;
                self.store.put_interface(&record)
            }
            Err(e) => Err(e),
        };

        if let Err(cause) = confirmed {
            let discarded = self.discard_device(&backend, name).await;
            let restored = match discarded {
                Ok(()) => self.store.delete_interface(name).map(|_| ()),
                Err(e) => {
                    warn!("Keeping pending record for {} for a later retry", name);
                    Err(e)
                }
            };
            return Err(settle("add interface", cause, restored));
        }

        info!("Interface {} ({}) added", name, record.variant);
        Ok(record)
    }

    /// Create the kernel interface for a new record and configure it
    async fn provision(
        &self,
        backend: &Arc<dyn TunnelBackend>,
        record: &InterfaceRecord,
    ) -> Result<()> {
        let name = record.name.as_str();
        self.tunnel(backend, "create", name, |b, n| b.create(n)).await?;

        let fresh = InterfaceRecord::new(
            record.name.clone(),
            record.variant,
            None,
            record.log.clone(),
            None,
        );
        self.drive_interface(record, Stages::between(&fresh, record))
            .await
    }

    /// Bring an interface up or down; the kernel is changed before the store
    pub async fn set_link(&self, name: &str, state: LinkState) -> Result<InterfaceRecord> {
        validate_interface_name(name)?;
        let _held = self.lock(false, Some(name)).await?;

        let prior = self.store.get_interface(name)?;
        if prior.state == state {
            debug!("Interface {} already {}", name, state);
            return Ok(prior);
        }

        let mut intended = prior.clone();
        intended.state = state;
        intended.revision = prior.revision + 1;
        let stages = Stages::between(&prior, &intended).link_only();

        if let Err(cause) = self.drive_interface(&intended, stages).await {
            let reverted = self.drive_interface(&prior, stages).await;
            return Err(settle("set link", cause, reverted));
        }

        if let Err(cause) = self.store.put_interface(&intended) {
            let reverted = self.drive_interface(&prior, stages).await;
            return Err(settle("set link", cause, reverted));
        }

        info!("Interface {} is {}", name, state);
        Ok(intended)
    }

    /// Change the UDP listen port (0 lets the kernel choose)
    pub async fn set_port(&self, name: &str, port: u16) -> Result<InterfaceRecord> {
        self.mutate_interface("set port", name, |r| {
            r.listen_port = port;
            Ok(())
        })
        .await
    }

    /// Install a private key, or generate one when `key` is `None`.
    /// Returns the derived public key.
    pub async fn set_private_key(&self, name: &str, key: Option<&str>) -> Result<PublicKey> {
        let key = match key {
            Some(encoded) => PrivateKey::from_base64(encoded)?,
            None => PrivateKey::generate(),
        };

        let record = self
            .mutate_interface("set private key", name, move |r| {
                r.set_private_key(key);
                check_own_key(r)
            })
            .await?;

        record
            .public_key
            .ok_or_else(|| BrgError::Internal(format!("interface {} has no public key", name)))
    }

    /// Create a peer or replace all of its mutable fields
    pub async fn upsert_peer(&self, name: &str, spec: &PeerSpec) -> Result<PeerRecord> {
        let peer = spec.parse()?;
        let stored = peer.clone();

        self.mutate_interface("upsert peer", name, move |r| {
            r.upsert_peer(stored);
            check_own_key(r)
        })
        .await?;

        Ok(peer)
    }

    /// Remove a peer; `NotFound` when it is not configured
    pub async fn remove_peer(&self, name: &str, public_key: &str) -> Result<()> {
        let key = PublicKey::from_base64(public_key)?;

        self.mutate_interface("remove peer", name, |r| {
            r.remove_peer(&key)
                .map(|_| ())
                .ok_or_else(|| BrgError::NotFound(format!("peer {} on {}", key, name)))
        })
        .await?;
        Ok(())
    }

    /// Bind an address (host part kept); binding it twice is a no-op
    pub async fn add_address(&self, name: &str, address: &str) -> Result<Cidr> {
        let address: Cidr = address.parse()?;

        self.mutate_interface("add address", name, |r| {
            if !r.addresses.contains(&address) {
                r.addresses.push(address);
            }
            Ok(())
        })
        .await?;
        Ok(address)
    }

    /// Unbind an address; `NotFound` when it is not bound
    pub async fn remove_address(&self, name: &str, address: &str) -> Result<()> {
        let address: Cidr = address.parse()?;

        self.mutate_interface("remove address", name, |r| {
            let idx = r
                .addresses
                .iter()
                .position(|a| *a == address)
                .ok_or_else(|| BrgError::NotFound(format!("address {} on {}", address, name)))?;
            r.addresses.remove(idx);
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Change the MTU of a live interface
    pub async fn set_mtu(&self, name: &str, mtu: u16) -> Result<InterfaceRecord> {
        validate_mtu(mtu)?;
        self.mutate_interface("set mtu", name, |r| {
            r.mtu = Some(mtu);
            Ok(())
        })
        .await
    }

    /// Replace the obfuscation parameter block of an obfuscated interface
    pub async fn set_obfuscation(
        &self,
        name: &str,
        params: ObfuscationParams,
    ) -> Result<InterfaceRecord> {
        params.validate()?;
        self.mutate_interface("set obfuscation", name, move |r| {
            check_obfuscation(r.variant, Some(&params))?;
            r.obfuscation = Some(params);
            Ok(())
        })
        .await
    }

    /// Tear down an interface with its peers and addresses and forget it.
    /// Global rules naming it as egress are left in place.
    pub async fn delete_interface(&self, name: &str) -> Result<()> {
        validate_interface_name(name)?;
        let _held = self.lock(false, Some(name)).await?;

        let prior = self.store.get_interface(name)?;
        let backend = self.backends.for_variant(prior.variant);

        if let Err(cause) = self.tunnel(&backend, "destroy", name, |b, n| b.destroy(n)).await {
            let restored = self.restore_device(&prior).await;
            return Err(settle("delete interface", cause, restored));
        }

        if let Err(cause) = self.store.delete_interface(name) {
            let restored = self.restore_device(&prior).await;
            return Err(settle("delete interface", cause, restored));
        }

        info!("Interface {} deleted", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::ErrorKind;
    use crate::filter::MemoryFilter;
    use crate::kernel::{Backends, MemoryTunnel, MockTunnelBackend, TunnelBackend};
    use crate::model::{LogLevel, LogSink};
    use crate::store::StateStore;
    use mockall::Sequence;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn engine_with(dir: &TempDir, standard: Arc<dyn TunnelBackend>) -> Reconciler {
        let config = EngineConfig::rooted_at(dir.path());
        let store = StateStore::open(&config.state_dir).unwrap();
        let backends = Backends::new(standard, Arc::new(MemoryTunnel::new(Variant::Obfuscated)));
        Reconciler::new(config, store, backends, Arc::new(MemoryFilter::new()))
    }

    fn add_request(dir: &TempDir, name: &str) -> AddInterface {
        AddInterface {
            name: name.to_string(),
            variant: Variant::Standard,
            mtu: None,
            log: LogSink {
                dir: dir.path().to_path_buf(),
                level: LogLevel::Error,
                json: false,
            },
            obfuscation: None,
        }
    }

    #[test]
    fn test_obfuscation_pairing() {
        let params = ObfuscationParams::generate();
        assert!(check_obfuscation(Variant::Standard, None).is_ok());
        assert!(check_obfuscation(Variant::Obfuscated, Some(&params)).is_ok());
        assert_eq!(
            check_obfuscation(Variant::Obfuscated, None).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            check_obfuscation(Variant::Standard, Some(&params))
                .unwrap_err()
                .kind(),
            ErrorKind::UnsupportedForVariant
        );
    }

    #[tokio::test]
    async fn test_add_creates_kernel_interface_after_store_write() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockTunnelBackend::new();
        let mut seq = Sequence::new();
        mock.expect_exists()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(false));
        mock.expect_create()
            .withf(|name| name == "wg0")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let engine = engine_with(&dir, Arc::new(mock));
        let record = engine.add_interface(add_request(&dir, "wg0")).await.unwrap();
        assert_eq!(record.state, LinkState::Down);
        assert!(engine.store().load_interface("wg0").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_add_rolls_back_when_create_fails() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockTunnelBackend::new();
        mock.expect_exists().returning(|_| Ok(false));
        mock.expect_create()
            .returning(|_| Err(BrgError::AdapterFailure("RTNETLINK answers: Operation not permitted".into())));

        let engine = engine_with(&dir, Arc::new(mock));
        let err = engine.add_interface(add_request(&dir, "wg0")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AdapterFailure);
        assert!(engine.store().load_interface("wg0").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_refuses_unmanaged_kernel_name() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockTunnelBackend::new();
        mock.expect_exists().returning(|_| Ok(true));
        mock.expect_create().never();

        let engine = engine_with(&dir, Arc::new(mock));
        let err = engine.add_interface(add_request(&dir, "wg0")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_unfinished_add_is_completed_by_retry() {
        let dir = TempDir::new().unwrap();
        let tunnel = Arc::new(MemoryTunnel::new(Variant::Standard));
        let engine = engine_with(&dir, tunnel.clone());
        let mut request = add_request(&dir, "wg0");
        request.mtu = Some(1400);

        tunnel.fail_next("set_mtu", 1);
        tunnel.fail_next("destroy", 1);
        let err = engine.add_interface(request.clone()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Inconsistent);
        assert!(engine.store().get_interface("wg0").unwrap().pending);
        assert_eq!(tunnel.device_names(), vec!["wg0".to_string()]);

        let record = engine.add_interface(request.clone()).await.unwrap();
        assert!(!record.pending);
        assert!(!engine.store().get_interface("wg0").unwrap().pending);
        assert_eq!(tunnel.read_state("wg0").unwrap().mtu, Some(1400));

        let err = engine.add_interface(request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_unfinished_add_is_completed_by_reconcile() {
        let dir = TempDir::new().unwrap();
        let tunnel = Arc::new(MemoryTunnel::new(Variant::Standard));
        let engine = engine_with(&dir, tunnel.clone());
        let mut request = add_request(&dir, "wg0");
        request.mtu = Some(1400);

        tunnel.fail_next("set_mtu", 1);
        tunnel.fail_next("destroy", 1);
        assert!(engine.add_interface(request).await.is_err());

        let record = engine.reconcile("wg0").await.unwrap();
        assert!(!record.pending);
        assert!(!engine.store().get_interface("wg0").unwrap().pending);
        assert_eq!(tunnel.read_state("wg0").unwrap().mtu, Some(1400));
    }

    #[tokio::test]
    async fn test_set_link_failure_keeps_store_unchanged() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockTunnelBackend::new();
        mock.expect_exists().returning(|_| Ok(false));
        mock.expect_create().returning(|_| Ok(()));
        mock.expect_set_link()
            .withf(|_, state| *state == LinkState::Up)
            .times(1)
            .returning(|_, _| Err(BrgError::AdapterFailure("link busy".into())));
        mock.expect_set_link()
            .withf(|_, state| *state == LinkState::Down)
            .times(1)
            .returning(|_, _| Ok(()));

        let engine = engine_with(&dir, Arc::new(mock));
        engine.add_interface(add_request(&dir, "wg0")).await.unwrap();

        let err = engine.set_link("wg0", LinkState::Up).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AdapterFailure);
        assert_eq!(
            engine.store().get_interface("wg0").unwrap().state,
            LinkState::Down
        );
    }

    #[tokio::test]
    async fn test_failed_rollback_is_inconsistent() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockTunnelBackend::new();
        mock.expect_exists().returning(|_| Ok(false));
        mock.expect_create().returning(|_| Ok(()));
        mock.expect_set_port()
            .returning(|_, _| Err(BrgError::AdapterFailure("netlink gone".into())));

        let engine = engine_with(&dir, Arc::new(mock));
        engine.add_interface(add_request(&dir, "wg0")).await.unwrap();

        let err = engine.set_port("wg0", 51855).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Inconsistent);
        assert!(err.is_retryable());
        assert_eq!(engine.store().get_interface("wg0").unwrap().listen_port, 0);
    }

    #[tokio::test]
    async fn test_noop_mutation_skips_adapter() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockTunnelBackend::new();
        mock.expect_exists().returning(|_| Ok(false));
        mock.expect_create().returning(|_| Ok(()));
        mock.expect_set_port().times(1).returning(|_, _| Ok(()));

        let engine = engine_with(&dir, Arc::new(mock));
        engine.add_interface(add_request(&dir, "wg0")).await.unwrap();

        let first = engine.set_port("wg0", 51855).await.unwrap();
        let second = engine.set_port("wg0", 51855).await.unwrap();
        assert_eq!(first.revision, second.revision);
    }

    #[tokio::test]
    async fn test_slow_adapter_call_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let tunnel = Arc::new(MemoryTunnel::new(Variant::Standard));
        let mut engine = engine_with(&dir, tunnel.clone());
        engine.config.adapter_deadline_ms = 40;

        engine.add_interface(add_request(&dir, "wg0")).await.unwrap();
        tunnel.delay("set_mtu", std::time::Duration::from_millis(150));

        let err = engine.set_mtu("wg0", 1380).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Inconsistent);
        assert_eq!(engine.store().get_interface("wg0").unwrap().mtu, None);
    }

    #[tokio::test]
    async fn test_key_matching_a_peer_is_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(&dir, Arc::new(MemoryTunnel::new(Variant::Standard)));
        engine.add_interface(add_request(&dir, "wg0")).await.unwrap();

        let key = PrivateKey::generate();
        engine
            .upsert_peer(
                "wg0",
                &PeerSpec {
                    public_key: key.public_key().to_base64(),
                    allowed_ips: vec!["10.0.0.2/32".to_string()],
                    ..PeerSpec::default()
                },
            )
            .await
            .unwrap();

        let err = engine
            .set_private_key("wg0", Some(&key.to_base64()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(engine.store().get_interface("wg0").unwrap().private_key.is_none());
    }
}
