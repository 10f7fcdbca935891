//! Standard WireGuard backend (`ip link ... type wireguard` + `wg`)

use crate::error::{BrgError, Result};
use crate::kernel::wgtool::{read_live, WgTool};
use crate::kernel::{LiveDevice, TunnelBackend};
use crate::model::{Cidr, LinkState, PeerRecord, Variant};
use crate::platform::{CommandRunner, IpRoute};
use crate::wireguard::{ObfuscationParams, PrivateKey};
use std::sync::Arc;

/// Kernel WireGuard interfaces
pub struct StandardTunnel {
    ip: IpRoute,
    wg: WgTool,
}

impl StandardTunnel {
    /// Link type passed to `ip link add`
    pub const LINK_KIND: &'static str = "wireguard";

    /// Create a backend invoking `ip` and `wg` through `runner`
    pub fn new(runner: Arc<dyn CommandRunner>, ip: &str, wg: &str) -> Self {
        Self {
            ip: IpRoute::new(runner.clone(), ip),
            wg: WgTool::new(runner, wg),
        }
    }
}

impl TunnelBackend for StandardTunnel {
    fn variant(&self) -> Variant {
        Variant::Standard
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
        self.wg.set_private_key(name, key)
    }

    fn set_port(&self, name: &str, port: u16) -> Result<()> {
        self.wg.set_listen_port(name, port)
    }

    fn set_peers(&self, name: &str, peers: &[PeerRecord]) -> Result<()> {
        self.wg.sync_peers(name, peers)
    }

    fn set_addresses(&self, name: &str, addresses: &[Cidr]) -> Result<()> {
        self.ip.sync_addresses(name, addresses)
    }

    fn set_mtu(&self, name: &str, mtu: u16) -> Result<()> {
        self.ip.set_mtu(name, mtu)
    }

    fn set_obfuscation(&self, _name: &str, _params: &ObfuscationParams) -> Result<()> {
        Err(BrgError::UnsupportedForVariant {
            variant: Variant::Standard.to_string(),
            what: "obfuscation parameters".to_string(),
        })
    }

    fn read_state(&self, name: &str) -> Result<LiveDevice> {
        read_live(&self.ip, &self.wg, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::platform::RecordingRunner;

    fn backend() -> (Arc<RecordingRunner>, StandardTunnel) {
        let runner = Arc::new(RecordingRunner::new());
        let tunnel = StandardTunnel::new(runner.clone(), "ip", "wg");
        (runner, tunnel)
    }

    #[test]
    fn test_create_uses_wireguard_link_type() {
        let (runner, tunnel) = backend();
        tunnel.create("wg0").unwrap();
        tunnel.set_link("wg0", LinkState::Up).unwrap();
        tunnel.set_port("wg0", 51855).unwrap();
        assert_eq!(
            runner.command_lines(),
            vec![
                "ip link add dev wg0 type wireguard",
                "ip link set dev wg0 up",
                "wg set wg0 listen-port 51855",
            ]
        );
    }

    #[test]
    fn test_peers_are_replaced_in_one_call() {
        let (runner, tunnel) = backend();
        tunnel.set_peers("wg0", &[]).unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].command_line(), "wg syncconf wg0 /dev/stdin");
    }

    #[test]
    fn test_obfuscation_rejected() {
        let (runner, tunnel) = backend();
        let err = tunnel
            .set_obfuscation("wg0", &ObfuscationParams::generate())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedForVariant);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_command_failure_is_adapter_failure() {
        let (runner, tunnel) = backend();
        runner.fail("ip link add", "RTNETLINK answers: Operation not permitted");
        let err = tunnel.create("wg0").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AdapterFailure);
    }
}
