//! In-memory tunnel backend
//!
//! Behaves like the kernel for the engine's purposes: devices must be
//! created before they are configured, creation of a live name fails, and
//! destroying a missing device succeeds. Failures and latency can be
//! injected per operation for rollback and deadline tests.

use crate::error::{BrgError, Result};
use crate::kernel::{LiveDevice, LivePeer, TunnelBackend, DEFAULT_MTU};
use crate::model::{Cidr, LinkState, PeerRecord, Variant};
use crate::wireguard::{ObfuscationParams, PrivateKey};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
struct MemDevice {
    private_key: Option<PrivateKey>,
    listen_port: u16,
    up: bool,
    mtu: u16,
    addresses: Vec<Cidr>,
    peers: Vec<PeerRecord>,
    obfuscation: Option<ObfuscationParams>,
}

#[derive(Default)]
struct Inner {
    devices: BTreeMap<String, MemDevice>,
    failures: HashMap<&'static str, usize>,
    delays: HashMap<&'static str, Duration>,
    calls: Vec<String>,
}

/// Tunnel backend that keeps devices in memory
pub struct MemoryTunnel {
    variant: Variant,
    inner: Mutex<Inner>,
}

impl MemoryTunnel {
    /// Create an empty backend for `variant`
    pub fn new(variant: Variant) -> Self {
        Self {
            variant,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| BrgError::Internal("memory tunnel poisoned".to_string()))
    }

    /// Make the next `times` calls of `op` fail (op names match the trait
    /// methods, e.g. `"set_peers"`)
    pub fn fail_next(&self, op: &'static str, times: usize) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failures.insert(op, times);
        }
    }

    /// Delay every call of `op` by `delay`
    pub fn delay(&self, op: &'static str, delay: Duration) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.delays.insert(op, delay);
        }
    }

    /// Operations performed so far, as `"op name"` strings
    pub fn calls(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|inner| inner.calls.clone())
            .unwrap_or_default()
    }

    /// Names of live devices
    pub fn device_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|inner| inner.devices.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop a device behind the engine's back, as a reboot would
    pub fn forget(&self, name: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.devices.remove(name);
        }
    }

    /// Private key currently installed on a device
    pub fn private_key(&self, name: &str) -> Option<PrivateKey> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.devices.get(name).and_then(|d| d.private_key.clone()))
    }

    /// Obfuscation block currently installed on a device
    pub fn obfuscation(&self, name: &str) -> Option<ObfuscationParams> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.devices.get(name).and_then(|d| d.obfuscation.clone()))
    }

    fn call<T>(
        &self,
        op: &'static str,
        name: &str,
        f: impl FnOnce(&mut BTreeMap<String, MemDevice>) -> Result<T>,
    ) -> Result<T> {
        let delay = {
            let mut inner = self.lock()?;
            inner.calls.push(format!("{} {}", op, name));
            inner.delays.get(op).copied()
        };

        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let mut inner = self.lock()?;
        if let Some(remaining) = inner.failures.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BrgError::AdapterFailure(format!(
                    "injected failure in {} on {}",
                    op, name
                )));
            }
        }
        f(&mut inner.devices)
    }

    fn with_device<T>(
        &self,
        op: &'static str,
        name: &str,
        f: impl FnOnce(&mut MemDevice) -> T,
    ) -> Result<T> {
        self.call(op, name, |devices| {
            let device = devices.get_mut(name).ok_or_else(|| {
                BrgError::AdapterFailure(format!("Cannot find device \"{}\"", name))
            })?;
            Ok(f(device))
        })
    }
}

impl TunnelBackend for MemoryTunnel {
    fn variant(&self) -> Variant {
        self.variant
    }

    fn exists(&self, name: &str) -> Result<bool> {
        self.call("exists", name, |devices| Ok(devices.contains_key(name)))
    }

    fn create(&self, name: &str) -> Result<()> {
        self.call("create", name, |devices| {
            if devices.contains_key(name) {
                return Err(BrgError::AdapterFailure(format!(
                    "RTNETLINK answers: File exists ({})",
                    name
                )));
            }
            devices.insert(
                name.to_string(),
                MemDevice {
                    mtu: DEFAULT_MTU,
                    ..MemDevice::default()
                },
            );
            Ok(())
        })
    }

    fn destroy(&self, name: &str) -> Result<()> {
        self.call("destroy", name, |devices| {
            devices.remove(name);
            Ok(())
        })
    }

    fn set_link(&self, name: &str, state: LinkState) -> Result<()> {
        self.with_device("set_link", name, |d| d.up = state.is_up())
    }

    fn set_private_key(&self, name: &str, key: Option<&PrivateKey>) -> Result<()> {
        self.with_device("set_private_key", name, |d| d.private_key = key.cloned())
    }

    fn set_port(&self, name: &str, port: u16) -> Result<()> {
        self.with_device("set_port", name, |d| d.listen_port = port)
    }

    fn set_peers(&self, name: &str, peers: &[PeerRecord]) -> Result<()> {
        self.with_device("set_peers", name, |d| d.peers = peers.to_vec())
    }

    fn set_addresses(&self, name: &str, addresses: &[Cidr]) -> Result<()> {
        self.with_device("set_addresses", name, |d| d.addresses = addresses.to_vec())
    }

    fn set_mtu(&self, name: &str, mtu: u16) -> Result<()> {
        self.with_device("set_mtu", name, |d| d.mtu = mtu)
    }

    fn set_obfuscation(&self, name: &str, params: &ObfuscationParams) -> Result<()> {
        if self.variant == Variant::Standard {
            return Err(BrgError::UnsupportedForVariant {
                variant: self.variant.to_string(),
                what: "obfuscation parameters".to_string(),
            });
        }
        params.validate()?;
        self.with_device("set_obfuscation", name, |d| {
            d.obfuscation = Some(params.clone())
        })
    }

    fn read_state(&self, name: &str) -> Result<LiveDevice> {
        self.with_device("read_state", name, |d| LiveDevice {
            public_key: d.private_key.as_ref().map(PrivateKey::public_key),
            listen_port: d.listen_port,
            up: d.up,
            mtu: Some(d.mtu),
            addresses: d.addresses.clone(),
            peers: d
                .peers
                .iter()
                .map(|p| LivePeer {
                    public_key: p.public_key.clone(),
                    endpoint: p.endpoint,
                    allowed_ips: p.allowed_ips.clone(),
                    latest_handshake: None,
                    rx_bytes: 0,
                    tx_bytes: 0,
                    persistent_keepalive: p.persistent_keepalive,
                })
                .collect(),
        })
    }
}
