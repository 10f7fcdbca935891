//! AmneziaWG backend (`ip link ... type amneziawg` + `awg`)
//!
//! Same capability set as the standard backend, plus the junk-packet and
//! header-marker parameter block pushed with `awg set`.

use crate::error::Result;
use crate::kernel::wgtool::{read_live, WgTool};
use crate::kernel::{LiveDevice, TunnelBackend};
use crate::model::{Cidr, LinkState, PeerRecord, Variant};
use crate::platform::{CommandRunner, IpRoute};
use crate::wireguard::{ObfuscationParams, PrivateKey};
use std::sync::Arc;
use tracing::debug;

/// Kernel AmneziaWG interfaces
pub struct ObfuscatedTunnel {
    ip: IpRoute,
    awg: WgTool,
}

impl ObfuscatedTunnel {
    /// Link type passed to `ip link add`
    pub const LINK_KIND: &'static str = "amneziawg";

    /// Create a backend invoking `ip` and `awg` through `runner`
    pub fn new(runner: Arc<dyn CommandRunner>, ip: &str, awg: &str) -> Self {
        Self {
            ip: IpRoute::new(runner.clone(), ip),
            awg: WgTool::new(runner, awg),
        }
    }
}

impl TunnelBackend for ObfuscatedTunnel {
    fn variant(&self) -> Variant {
        Variant::Obfuscated
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.ip.link_exists(name))
    }

    fn create(&self, name: &str) -> Result<()> {
        self.ip.link_add(name, Self::LINK_KIND)
    }

    fn destroy(&self, name: &str) -> Result<()> {
        self.ip.link_del(name)
    }

    fn set_link(&self, name: &str, state: LinkState) -> Result<()> {
        self.ip.link_set(name, state.is_up())
    }

    fn set_private_key(&self, name: &str, key: Option<&PrivateKey>) -> Result<()> {
        self.awg.set_private_key(name, key)
    }

    fn set_port(&self, name: &str, port: u16) -> Result<()> {
        self.awg.set_listen_port(name, port)
    }

    fn set_peers(&self, name: &str, peers: &[PeerRecord]) -> Result<()> {
        self.awg.sync_peers(name, peers)
    }

    fn set_addresses(&self, name: &str, addresses: &[Cidr]) -> Result<()> {
        self.ip.sync_addresses(name, addresses)
    }

    fn set_mtu(&self, name: &str, mtu: u16) -> Result<()> {
        self.ip.set_mtu(name, mtu)
    }

    fn set_obfuscation(&self, name: &str, params: &ObfuscationParams) -> Result<()> {
        params.validate()?;
        debug!("Pushing obfuscation parameters to {}", name);

        let values = params.to_set_args();
        let mut args: Vec<&str> = vec!["set", name];
        args.extend(values.iter().map(String::as_str));
        self.awg.run(&args, None)?;
        Ok(())
    }

    fn read_state(&self, name: &str) -> Result<LiveDevice> {
        read_live(&self.ip, &self.awg, name)
    }
}
