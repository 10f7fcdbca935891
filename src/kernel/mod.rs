//! Kernel tunnel adapter
//!
//! [`TunnelBackend`] is the capability set the engine drives for one tunnel
//! variant. The Linux implementations shell out to `ip` and `wg`/`awg`;
//! [`MemoryTunnel`] keeps devices in memory for tests and dry runs.
//!
//! Calls are synchronous and block on the underlying tool. The peer list is
//! always pushed as one replace-style `syncconf` call; addresses are diffed
//! and applied incrementally, with rollback left to the engine.

mod memory;
mod obfuscated;
mod standard;
pub mod wgtool;

pub use memory::MemoryTunnel;
pub use obfuscated::ObfuscatedTunnel;
pub use standard::StandardTunnel;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::model::{Cidr, LinkState, PeerRecord, Variant};
use crate::platform::CommandRunner;
use crate::wireguard::{ObfuscationParams, PrivateKey, PublicKey};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

/// MTU the kernel assigns to a new WireGuard link
pub const DEFAULT_MTU: u16 = 1420;

/// Live view of one peer as reported by the kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LivePeer {
    /// Peer public key
    pub public_key: PublicKey,
    /// Current endpoint (learned or configured)
    pub endpoint: Option<SocketAddr>,
    /// Allowed IPs
    pub allowed_ips: Vec<Cidr>,
    /// Unix time of the latest handshake
    pub latest_handshake: Option<u64>,
    /// Bytes received
    pub rx_bytes: u64,
    /// Bytes sent
    pub tx_bytes: u64,
    /// Persistent keepalive in seconds (0 = off)
    pub persistent_keepalive: u16,
}

/// Live view of one tunnel interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LiveDevice {
    /// Public key of the configured private key
    pub public_key: Option<PublicKey>,
    /// Bound UDP port
    pub listen_port: u16,
    /// Administratively up
    pub up: bool,
    /// Current MTU
    pub mtu: Option<u16>,
    /// Bound addresses
    pub addresses: Vec<Cidr>,
    /// Peers with transfer counters
    pub peers: Vec<LivePeer>,
}

impl LiveDevice {
    /// Look up a live peer
    pub fn peer(&self, key: &PublicKey) -> Option<&LivePeer> {
        self.peers.iter().find(|p| &p.public_key == key)
    }
}

/// Operations on kernel tunnel interfaces of one variant
#[cfg_attr(test, mockall::automock)]
pub trait TunnelBackend: Send + Sync {
    /// Variant served by this backend
    fn variant(&self) -> Variant;

    /// Whether the kernel interface exists
    fn exists(&self, name: &str) -> Result<bool>;

    /// Allocate the kernel interface (administratively down)
    fn create(&self, name: &str) -> Result<()>;

    /// Remove the kernel interface with its peers and addresses; a missing
    /// interface is not an error
    fn destroy(&self, name: &str) -> Result<()>;

    /// Bring the link up or down
    fn set_link(&self, name: &str, state: LinkState) -> Result<()>;

    /// Install the private key, or clear it with `None`
    fn set_private_key<'a>(&self, name: &str, key: Option<&'a PrivateKey>) -> Result<()>;

    /// Set the UDP listen port (0 = kernel chooses)
    fn set_port(&self, name: &str, port: u16) -> Result<()>;

    /// Replace the whole peer list in one call
    fn set_peers(&self, name: &str, peers: &[PeerRecord]) -> Result<()>;

    /// Make the bound addresses equal to `addresses`
    fn set_addresses(&self, name: &str, addresses: &[Cidr]) -> Result<()>;

    /// Set the MTU
    fn set_mtu(&self, name: &str, mtu: u16) -> Result<()>;

    /// Push the AmneziaWG parameter block
    fn set_obfuscation(&self, name: &str, params: &ObfuscationParams) -> Result<()>;

    /// Read live state
    fn read_state(&self, name: &str) -> Result<LiveDevice>;
}

/// One backend per variant
#[derive(Clone)]
pub struct Backends {
    standard: Arc<dyn TunnelBackend>,
    obfuscated: Arc<dyn TunnelBackend>,
}

impl Backends {
    /// Pair two backends
    pub fn new(standard: Arc<dyn TunnelBackend>, obfuscated: Arc<dyn TunnelBackend>) -> Self {
        Self {
            standard,
            obfuscated,
        }
    }

    /// Linux backends driven through `runner`
    pub fn system(config: &EngineConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self::new(
            Arc::new(StandardTunnel::new(
                runner.clone(),
                &config.tools.ip,
                &config.tools.wg,
            )),
            Arc::new(ObfuscatedTunnel::new(
                runner,
                &config.tools.ip,
                &config.tools.awg,
            )),
        )
    }

    /// In-memory backends
    pub fn memory() -> Self {
        Self::new(
            Arc::new(MemoryTunnel::new(Variant::Standard)),
            Arc::new(MemoryTunnel::new(Variant::Obfuscated)),
        )
    }

    /// Backend serving `variant`
    pub fn for_variant(&self, variant: Variant) -> Arc<dyn TunnelBackend> {
        match variant {
            Variant::Standard => self.standard.clone(),
            Variant::Obfuscated => self.obfuscated.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backends_select_by_variant() {
        let backends = Backends::memory();
        assert_eq!(
            backends.for_variant(Variant::Standard).variant(),
            Variant::Standard
        );
        assert_eq!(
            backends.for_variant(Variant::Obfuscated).variant(),
            Variant::Obfuscated
        );
    }
}
