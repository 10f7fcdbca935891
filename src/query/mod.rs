//! Read-only views over desired and live state
//!
//! Every view is a store snapshot merged with at most one adapter read per
//! interface. Nothing here takes a lock: store records are replaced
//! atomically, so a reader sees either the old or the new version. When an
//! adapter read fails the view degrades to the stored state with `live`
//! left empty.
//!
//! Private and preshared keys never appear in a view.

use crate::config::validation::validate_interface_name;
use crate::error::Result;
use crate::filter::PacketFilter;
use crate::kernel::{Backends, LiveDevice, LivePeer};
use crate::model::{
    Cidr, FilterRule, FirewallPort, ForwardingPolicy, InterfaceRecord, LinkState, PeerRecord,
    Protocol, RuleFamily, RuleKey, Variant,
};
use crate::store::StateStore;
use crate::wireguard::{KeyPair, ObfuscationParams, PublicKey};
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

/// Live link attributes reported by the kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveLink {
    /// Administratively up
    pub up: bool,
    /// Current MTU
    pub mtu: Option<u16>,
    /// Bound UDP port
    pub listen_port: u16,
    /// Public key of the installed private key
    pub public_key: Option<PublicKey>,
}

/// Transfer statistics of one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStats {
    /// Endpoint the kernel currently uses
    pub endpoint: Option<SocketAddr>,
    /// Unix time of the latest handshake
    pub latest_handshake: Option<u64>,
    /// Bytes received
    pub rx_bytes: u64,
    /// Bytes sent
    pub tx_bytes: u64,
}

impl From<&LivePeer> for PeerStats {
    fn from(peer: &LivePeer) -> Self {
        Self {
            endpoint: peer.endpoint,
            latest_handshake: peer.latest_handshake,
            rx_bytes: peer.rx_bytes,
            tx_bytes: peer.tx_bytes,
        }
    }
}

/// A configured peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerView {
    /// Owning interface
    pub interface: String,
    /// Peer public key
    pub public_key: PublicKey,
    /// Allowed IPs
    pub allowed_ips: Vec<Cidr>,
    /// Configured endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<SocketAddr>,
    /// Persistent keepalive in seconds
    pub persistent_keepalive: u16,
    /// Whether a preshared key is configured
    pub preshared_key: bool,
    /// Kernel statistics, when the interface could be read
    pub live: Option<PeerStats>,
}

impl PeerView {
    fn new(interface: &str, peer: &PeerRecord, live: Option<&LiveDevice>) -> Self {
        Self {
            interface: interface.to_string(),
            public_key: peer.public_key.clone(),
            allowed_ips: peer.allowed_ips.clone(),
            endpoint: peer.endpoint,
            persistent_keepalive: peer.persistent_keepalive,
            preshared_key: peer.preshared_key.is_some(),
            live: live
                .and_then(|d| d.peer(&peer.public_key))
                .map(PeerStats::from),
        }
    }
}

/// An address binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressView {
    /// Owning interface
    pub interface: String,
    /// Bound address with prefix
    pub address: Cidr,
    /// Whether the kernel reports the address, when it could be read
    pub bound: Option<bool>,
}

/// Full interface view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceView {
    /// Interface name
    pub name: String,
    /// Protocol variant
    pub variant: Variant,
    /// Desired link state
    pub state: LinkState,
    /// Desired listen port
    pub listen_port: u16,
    /// Desired MTU
    pub mtu: Option<u16>,
    /// Public key, once a private key is set
    pub public_key: Option<PublicKey>,
    /// Obfuscation parameter block
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obfuscation: Option<ObfuscationParams>,
    /// Peers
    pub peers: Vec<PeerView>,
    /// Address bindings
    pub addresses: Vec<AddressView>,
    /// Record revision
    pub revision: u64,
    /// Kernel view, when the interface could be read
    pub live: Option<LiveLink>,
}

/// Desired and live forwarding toggles
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardingView {
    /// Stored policy
    pub desired: ForwardingPolicy,
    /// Kernel values, when they could be read
    pub live: Option<ForwardingPolicy>,
}

/// A NAT or firewall rule with its kernel presence
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleView {
    /// Source subnet
    pub subnet: Cidr,
    /// Egress interface (`any` when unset)
    pub egress: String,
    /// Whether the rule should be installed
    pub active: bool,
    /// Interface whose command created the rule
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Whether the rule is installed, when the filter could be read
    pub installed: Option<bool>,
}

/// An allowed inbound port with its kernel presence
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirewallPortView {
    /// Transport protocol
    pub protocol: Protocol,
    /// Destination port
    pub port: u16,
    /// Whether the port is open in the filter, when it could be read
    pub installed: Option<bool>,
}

/// A freshly generated key pair, as printed by `genkey`
#[derive(Debug, Clone, Serialize)]
pub struct KeyPairView {
    /// Private key, base64
    pub private_key: String,
    /// Public key, base64
    pub public_key: String,
}

/// Builds read-only views
#[derive(Clone)]
pub struct QueryProjector {
    store: StateStore,
    backends: Backends,
    filter: Arc<dyn PacketFilter>,
}

impl QueryProjector {
    /// Create a projector over a store and its adapters
    pub fn new(store: StateStore, backends: Backends, filter: Arc<dyn PacketFilter>) -> Self {
        Self {
            store,
            backends,
            filter,
        }
    }

    async fn live_device(&self, record: &InterfaceRecord) -> Option<LiveDevice> {
        let backend = self.backends.for_variant(record.variant);
        let name = record.name.clone();
        let result = tokio::task::spawn_blocking(move || backend.read_state(&name)).await;
        match result {
            Ok(Ok(device)) => Some(device),
            Ok(Err(e)) => {
                warn!("Cannot read live state of {}: {}", record.name, e);
                None
            }
            Err(e) => {
                warn!("Live state read of {} panicked: {}", record.name, e);
                None
            }
        }
    }

    async fn read_filter<T, F>(&self, what: &str, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn PacketFilter) -> Result<T> + Send + 'static,
    {
        let filter = self.filter.clone();
        match tokio::task::spawn_blocking(move || f(filter.as_ref())).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!("Cannot read {}: {}", what, e);
                None
            }
            Err(e) => {
                warn!("Reading {} panicked: {}", what, e);
                None
            }
        }
    }

    fn addresses(record: &InterfaceRecord, live: Option<&LiveDevice>) -> Vec<AddressView> {
        record
            .addresses
            .iter()
            .map(|address| AddressView {
                interface: record.name.clone(),
                address: *address,
                bound: live.map(|d| d.addresses.contains(address)),
            })
            .collect()
    }

    fn peers(record: &InterfaceRecord, live: Option<&LiveDevice>) -> Vec<PeerView> {
        record
            .peers
            .iter()
            .map(|peer| PeerView::new(&record.name, peer, live))
            .collect()
    }

    /// Configuration and live link state of one interface
    pub async fn get_interface(&self, name: &str) -> Result<InterfaceView> {
        validate_interface_name(name)?;
        let record = self.store.get_interface(name)?;
        let live = self.live_device(&record).await;

        Ok(InterfaceView {
            name: record.name.clone(),
            variant: record.variant,
            state: record.state,
            listen_port: record.listen_port,
            mtu: record.mtu,
            public_key: record.public_key.clone(),
            obfuscation: record.obfuscation.clone(),
            peers: Self::peers(&record, live.as_ref()),
            addresses: Self::addresses(&record, live.as_ref()),
            revision: record.revision,
            live: live.map(|d| LiveLink {
                up: d.up,
                mtu: d.mtu,
                listen_port: d.listen_port,
                public_key: d.public_key,
            }),
        })
    }

    /// Addresses bound to one interface
    pub async fn get_addresses(&self, name: &str) -> Result<Vec<AddressView>> {
        validate_interface_name(name)?;
        let record = self.store.get_interface(name)?;
        let live = self.live_device(&record).await;
        Ok(Self::addresses(&record, live.as_ref()))
    }

    /// Peers of one interface with their transfer statistics
    pub async fn get_peers(&self, name: &str) -> Result<Vec<PeerView>> {
        validate_interface_name(name)?;
        let record = self.store.get_interface(name)?;
        let live = self.live_device(&record).await;
        Ok(Self::peers(&record, live.as_ref()))
    }

    /// Addresses of every interface
    pub async fn get_global_addresses(&self) -> Result<Vec<AddressView>> {
        let mut out = Vec::new();
        for record in self.store.load_interfaces()? {
            let live = self.live_device(&record).await;
            out.extend(Self::addresses(&record, live.as_ref()));
        }
        Ok(out)
    }

    /// Peers of every interface
    pub async fn get_global_peers(&self) -> Result<Vec<PeerView>> {
        let mut out = Vec::new();
        for record in self.store.load_interfaces()? {
            let live = self.live_device(&record).await;
            out.extend(Self::peers(&record, live.as_ref()));
        }
        Ok(out)
    }

    /// Stored forwarding toggles and the live sysctl values
    pub async fn get_forwarding(&self) -> Result<ForwardingView> {
        let desired = self.store.load_global()?.forwarding;
        let live = self.read_filter("forwarding", |f| f.forwarding()).await;
        Ok(ForwardingView { desired, live })
    }

    /// Inbound port allow-list
    pub async fn get_firewall_ports(&self) -> Result<Vec<FirewallPortView>> {
        let ports = self.store.load_global()?.firewall_ports;
        let live: Option<BTreeSet<FirewallPort>> = self
            .read_filter("firewall ports", |f| f.list_ports())
            .await
            .map(|ports| ports.into_iter().collect());

        Ok(ports
            .into_iter()
            .map(|p| FirewallPortView {
                protocol: p.protocol,
                port: p.port,
                installed: live.as_ref().map(|l| l.contains(&p)),
            })
            .collect())
    }

    async fn get_rules(&self, family: RuleFamily) -> Result<Vec<RuleView>> {
        let policy = self.store.load_global()?;
        let live: Option<BTreeSet<RuleKey>> = self
            .read_filter(&format!("{} rules", family), move |f| f.list_rules(family))
            .await
            .map(|keys| keys.into_iter().collect());

        Ok(policy
            .rules(family)
            .iter()
            .map(|rule: &FilterRule| RuleView {
                subnet: rule.key.subnet,
                egress: rule.key.egress_label().to_string(),
                active: rule.active,
                origin: rule.origin.clone(),
                installed: live.as_ref().map(|l| l.contains(&rule.key)),
            })
            .collect())
    }

    /// NAT rules, active and inactive
    pub async fn get_nat(&self) -> Result<Vec<RuleView>> {
        self.get_rules(RuleFamily::Nat).await
    }

    /// Forwarding-block rules, active and inactive
    pub async fn get_firewall_rules(&self) -> Result<Vec<RuleView>> {
        self.get_rules(RuleFamily::Firewall).await
    }

    /// Generate a key pair without storing it
    pub fn generate_keypair(&self) -> KeyPairView {
        let pair = KeyPair::generate();
        KeyPairView {
            private_key: pair.private.to_base64(),
            public_key: pair.public.to_base64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::filter::MemoryFilter;
    use crate::kernel::{MemoryTunnel, TunnelBackend};
    use crate::model::{GlobalPolicy, LogLevel, LogSink};
    use crate::wireguard::{PresharedKey, PrivateKey};
    use std::path::PathBuf;
    use tempfile::TempDir;

    const PEER: &str = "7cnFoHH7r0p3ZLlOqVSkCuUjDDT/xRTjwrCl6ElbRkY=";

    fn record() -> InterfaceRecord {
        let mut r = InterfaceRecord::new(
            "wg0".to_string(),
            Variant::Standard,
            None,
            LogSink {
                dir: PathBuf::from("/var/log"),
                level: LogLevel::Error,
                json: false,
            },
            None,
        );
        r.set_private_key(PrivateKey::generate());
        r.addresses.push("10.10.10.254/24".parse().unwrap());
        r.upsert_peer(PeerRecord {
            public_key: PublicKey::from_base64(PEER).unwrap(),
            preshared_key: Some(PresharedKey::generate()),
            allowed_ips: vec!["10.10.10.1/32".parse().unwrap()],
            endpoint: None,
            persistent_keepalive: 25,
        });
        r
    }

    fn projector(dir: &TempDir, tunnel: Arc<MemoryTunnel>, filter: Arc<MemoryFilter>) -> QueryProjector {
        let store = StateStore::open(dir.path()).unwrap();
        let backends = Backends::new(tunnel, Arc::new(MemoryTunnel::new(Variant::Obfuscated)));
        QueryProjector::new(store, backends, filter)
    }

    #[tokio::test]
    async fn test_views_never_expose_secrets() {
        let dir = TempDir::new().unwrap();
        let tunnel = Arc::new(MemoryTunnel::new(Variant::Standard));
        let q = projector(&dir, tunnel, Arc::new(MemoryFilter::new()));
        let r = record();
        q.store.put_interface(&r).unwrap();

        let view = q.get_interface("wg0").await.unwrap();
        let json = serde_json::to_string(&view).unwrap();
        let private = r.private_key.as_ref().unwrap().to_base64();
        assert!(!json.contains(&private));
        assert!(!json.contains("private_key"));
        assert!(view.peers[0].preshared_key);
    }

    #[tokio::test]
    async fn test_named_queries_reject_bad_names() {
        let dir = TempDir::new().unwrap();
        let tunnel = Arc::new(MemoryTunnel::new(Variant::Standard));
        let q = projector(&dir, tunnel, Arc::new(MemoryFilter::new()));
        q.store.put_global(&GlobalPolicy::default()).unwrap();

        let err = q.get_interface("../global").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = q.get_addresses("../global").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = q.get_peers("wg0/../../global").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_missing_device_degrades_to_store_view() {
        let dir = TempDir::new().unwrap();
        let tunnel = Arc::new(MemoryTunnel::new(Variant::Standard));
        let q = projector(&dir, tunnel, Arc::new(MemoryFilter::new()));
        q.store.put_interface(&record()).unwrap();

        let view = q.get_interface("wg0").await.unwrap();
        assert!(view.live.is_none());
        assert_eq!(view.addresses[0].bound, None);
        assert_eq!(view.peers[0].live, None);
    }

    #[tokio::test]
    async fn test_live_state_is_merged() {
        let dir = TempDir::new().unwrap();
        let tunnel = Arc::new(MemoryTunnel::new(Variant::Standard));
        let q = projector(&dir, tunnel.clone(), Arc::new(MemoryFilter::new()));
        let r = record();
        q.store.put_interface(&r).unwrap();

        tunnel.create("wg0").unwrap();
        tunnel.set_addresses("wg0", &r.addresses).unwrap();
        tunnel.set_peers("wg0", &r.peers).unwrap();

        let addresses = q.get_addresses("wg0").await.unwrap();
        assert_eq!(addresses[0].bound, Some(true));
        let peers = q.get_peers("wg0").await.unwrap();
        assert_eq!(peers[0].live.as_ref().unwrap().rx_bytes, 0);
        assert_eq!(q.get_global_peers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_interface_is_not_found() {
        let dir = TempDir::new().unwrap();
        let q = projector(
            &dir,
            Arc::new(MemoryTunnel::new(Variant::Standard)),
            Arc::new(MemoryFilter::new()),
        );
        assert_eq!(
            q.get_peers("wg9").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert!(q.get_global_addresses().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rules_report_installation() {
        let dir = TempDir::new().unwrap();
        let filter = Arc::new(MemoryFilter::new());
        let q = projector(&dir, Arc::new(MemoryTunnel::new(Variant::Standard)), filter.clone());

        let installed = RuleKey::new("10.10.10.0/24".parse().unwrap(), None);
        let inactive = RuleKey::new("10.20.0.0/16".parse().unwrap(), Some("eth0"));
        let mut policy = GlobalPolicy::default();
        policy.nat.push(FilterRule {
            key: installed.clone(),
            active: true,
            origin: Some("wg0".to_string()),
        });
        policy.nat.push(FilterRule {
            key: inactive,
            active: false,
            origin: None,
        });
        q.store.put_global(&policy).unwrap();
        filter.add_rule(RuleFamily::Nat, &installed).unwrap();

        let rules = q.get_nat().await.unwrap();
        assert_eq!(rules[0].installed, Some(true));
        assert_eq!(rules[1].installed, Some(false));
        assert_eq!(rules[1].egress, "eth0");
        assert!(q.get_firewall_rules().await.unwrap().is_empty());

        filter.fail_next("forwarding", 1);
        let forwarding = q.get_forwarding().await.unwrap();
        assert!(forwarding.live.is_none());
    }

    #[test]
    fn test_generated_pair_matches() {
        let dir = TempDir::new().unwrap();
        let q = projector(
            &dir,
            Arc::new(MemoryTunnel::new(Variant::Standard)),
            Arc::new(MemoryFilter::new()),
        );
        let pair = q.generate_keypair();
        let private = PrivateKey::from_base64(&pair.private_key).unwrap();
        assert_eq!(private.public_key().to_base64(), pair.public_key);
    }
}
