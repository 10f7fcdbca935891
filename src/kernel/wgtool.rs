//! `wg` / `awg` command front-end
//!
//! Both tools share the same `set`, `syncconf` and `show dump` grammar, so a
//! single [`WgTool`] serves the two variants with a different program name.

use crate::error::{BrgError, Result};
use crate::kernel::{LiveDevice, LivePeer};
use crate::model::{Cidr, PeerRecord};
use crate::platform::{CommandRunner, IpRoute};
use crate::wireguard::{PrivateKey, PublicKey};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

const NONE: &str = "(none)";

/// Interface-level fields of a dump
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpedDevice {
    /// Public key, if a private key is configured
    pub public_key: Option<PublicKey>,
    /// Listen port
    pub listen_port: u16,
    /// Peers
    pub peers: Vec<LivePeer>,
}

/// Parse `wg show <name> dump`.
///
/// The first line describes the interface (private key, public key, listen
/// port, then tool-specific fields); every further line is one peer:
/// public key, preshared key, endpoint, allowed IPs, latest handshake,
/// rx bytes, tx bytes, persistent keepalive.
pub fn parse_dump(text: &str) -> Result<DumpedDevice> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());

    let header = lines
        .next()
        .ok_or_else(|| BrgError::AdapterFailure("empty dump output".to_string()))?;
    let fields: Vec<&str> = header.split('\t').collect();
    if fields.len() < 3 {
        return Err(BrgError::AdapterFailure(format!(
            "Malformed dump header: {} fields",
            fields.len()
        )));
    }

    let public_key = match fields[1] {
        NONE => None,
        key => Some(PublicKey::from_base64(key).map_err(adapter)?),
    };
    let listen_port = fields[2]
        .parse()
        .map_err(|_| BrgError::AdapterFailure(format!("Bad listen port '{}'", fields[2])))?;

    let mut peers = Vec::new();
    for line in lines {
        peers.push(parse_peer_line(line)?);
    }

    Ok(DumpedDevice {
        public_key,
        listen_port,
        peers,
    })
}

fn parse_peer_line(line: &str) -> Result<LivePeer> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 8 {
        return Err(BrgError::AdapterFailure(format!(
            "Malformed dump peer line: {} fields",
            fields.len()
        )));
    }

    let public_key = PublicKey::from_base64(fields[0]).map_err(adapter)?;

    let endpoint = match fields[2] {
        NONE => None,
        ep => Some(
            ep.parse()
                .map_err(|_| BrgError::AdapterFailure(format!("Bad endpoint '{}'", ep)))?,
        ),
    };

    let allowed_ips = match fields[3] {
        NONE | "" => Vec::new(),
        list => list
            .split(',')
            .map(|c| c.parse::<Cidr>())
            .collect::<Result<Vec<_>>>()
            .map_err(adapter)?,
    };

    let latest_handshake = match parse_counter(fields[4])? {
        0 => None,
        secs => Some(secs),
    };

    let persistent_keepalive = match fields[7] {
        "off" => 0,
        secs => secs
            .parse()
            .map_err(|_| BrgError::AdapterFailure(format!("Bad keepalive '{}'", secs)))?,
    };

    Ok(LivePeer {
        public_key,
        endpoint,
        allowed_ips,
        latest_handshake,
        rx_bytes: parse_counter(fields[5])?,
        tx_bytes: parse_counter(fields[6])?,
        persistent_keepalive,
    })
}

fn parse_counter(field: &str) -> Result<u64> {
    field
        .parse()
        .map_err(|_| BrgError::AdapterFailure(format!("Bad counter '{}'", field)))
}

fn adapter(err: BrgError) -> BrgError {
    BrgError::AdapterFailure(format!("Unexpected dump content: {}", err))
}

/// Render the peer list as a `syncconf` configuration.
///
/// The `[Interface]` section is left empty so `syncconf` keeps the key and
/// port already set on the device and only reconciles peers.
pub fn render_peers(peers: &[PeerRecord]) -> String {
    let mut conf = String::from("[Interface]\n");
    for peer in peers {
        let _ = writeln!(conf, "\n[Peer]");
        let _ = writeln!(conf, "PublicKey = {}", peer.public_key);
        if let Some(psk) = &peer.preshared_key {
            let _ = writeln!(conf, "PresharedKey = {}", psk.to_base64());
        }
        let allowed: Vec<String> = peer.allowed_ips.iter().map(Cidr::to_string).collect();
        let _ = writeln!(conf, "AllowedIPs = {}", allowed.join(", "));
        if let Some(endpoint) = peer.endpoint {
            let _ = writeln!(conf, "Endpoint = {}", endpoint);
        }
        if peer.persistent_keepalive > 0 {
            let _ = writeln!(conf, "PersistentKeepalive = {}", peer.persistent_keepalive);
        }
    }
    conf
}

/// Front-end for one of the `wg`-style tools
#[derive(Clone)]
pub struct WgTool {
    runner: Arc<dyn CommandRunner>,
    program: String,
}

impl WgTool {
    /// Wrap `runner`, invoking `program` (`wg` or `awg`)
    pub fn new(runner: Arc<dyn CommandRunner>, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }

    /// Run the tool with optional stdin
    pub fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<String> {
        self.runner.run(&self.program, args, stdin)
    }

    /// Install or clear the private key; the key travels on stdin
    pub fn set_private_key(&self, name: &str, key: Option<&PrivateKey>) -> Result<()> {
        let encoded = key.map(PrivateKey::to_base64).unwrap_or_default();
        debug!(
            "Setting private key on {} ({})",
            name,
            if key.is_some() { "set" } else { "clear" }
        );
        self.run(
            &["set", name, "private-key", "/dev/stdin"],
            Some(&encoded),
        )?;
        Ok(())
    }

    /// Set the listen port
    pub fn set_listen_port(&self, name: &str, port: u16) -> Result<()> {
        self.run(&["set", name, "listen-port", &port.to_string()], None)?;
        Ok(())
    }

    /// Replace the peer list in one call
    pub fn sync_peers(&self, name: &str, peers: &[PeerRecord]) -> Result<()> {
        debug!("Syncing {} peers on {}", peers.len(), name);
        self.run(&["syncconf", name, "/dev/stdin"], Some(&render_peers(peers)))?;
        Ok(())
    }

    /// Read and parse `show <name> dump`
    pub fn dump(&self, name: &str) -> Result<DumpedDevice> {
        let out = self.run(&["show", name, "dump"], None)?;
        parse_dump(&out)
    }
}

/// Combine the tool dump with link information into a [`LiveDevice`]
pub fn read_live(ip: &IpRoute, tool: &WgTool, name: &str) -> Result<LiveDevice> {
    let dumped = tool.dump(name)?;
    let link = ip.link_info(name)?;
    Ok(LiveDevice {
        public_key: dumped.public_key,
        listen_port: dumped.listen_port,
        up: link.up,
        mtu: link.mtu,
        addresses: link.addresses,
        peers: dumped.peers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::RecordingRunner;
    use crate::wireguard::PresharedKey;

    const PEER_A: &str = "7cnFoHH7r0p3ZLlOqVSkCuUjDDT/xRTjwrCl6ElbRkY=";
    const PEER_B: &str = "tXw2Re4d7BQ/9RwSd4jCa0qXMp4j2UTVq8/8AYG2A0s=";

    fn dump_text() -> String {
        format!(
            "(none)\t{PEER_B}\t51820\toff\n\
             {PEER_A}\t(none)\t172.168.85.1:65535\t10.0.0.1/32,10.0.1.0/24\t1700000000\t1024\t2048\t25\n\
             {PEER_B}\t(none)\t(none)\t(none)\t0\t0\t0\toff\n"
        )
    }

    #[test]
    fn test_parse_dump() {
        let device = parse_dump(&dump_text()).unwrap();
        assert_eq!(device.listen_port, 51820);
        assert_eq!(device.public_key.unwrap().to_base64(), PEER_B);
        assert_eq!(device.peers.len(), 2);

        let a = &device.peers[0];
        assert_eq!(a.endpoint.unwrap().port(), 65535);
        assert_eq!(a.allowed_ips.len(), 2);
        assert_eq!(a.latest_handshake, Some(1_700_000_000));
        assert_eq!((a.rx_bytes, a.tx_bytes), (1024, 2048));
        assert_eq!(a.persistent_keepalive, 25);

        let b = &device.peers[1];
        assert!(b.endpoint.is_none());
        assert!(b.allowed_ips.is_empty());
        assert!(b.latest_handshake.is_none());
        assert_eq!(b.persistent_keepalive, 0);
    }

    #[test]
    fn test_parse_dump_rejects_garbage() {
        assert!(parse_dump("").is_err());
        assert!(parse_dump("only-one-field").is_err());
        let bad_peer = format!("(none)\t(none)\t0\toff\n{PEER_A}\tbroken\n");
        assert!(parse_dump(&bad_peer).is_err());
    }

    #[test]
    fn test_render_peers() {
        let peers = vec![PeerRecord {
            public_key: PEER_A.parse().unwrap(),
            preshared_key: Some(PresharedKey::from_bytes([7u8; 32])),
            allowed_ips: vec!["10.0.0.1/32".parse().unwrap(), "fd00::/64".parse().unwrap()],
            endpoint: Some("89.89.89.1:51820".parse().unwrap()),
            persistent_keepalive: 25,
        }];
        let conf = render_peers(&peers);
        assert!(conf.starts_with("[Interface]\n"));
        assert!(conf.contains(&format!("PublicKey = {}", PEER_A)));
        assert!(conf.contains("PresharedKey = "));
        assert!(conf.contains("AllowedIPs = 10.0.0.1/32, fd00::/64"));
        assert!(conf.contains("Endpoint = 89.89.89.1:51820"));
        assert!(conf.contains("PersistentKeepalive = 25"));
    }

    #[test]
    fn test_empty_peer_list_renders_interface_only() {
        assert_eq!(render_peers(&[]), "[Interface]\n");
    }

    #[test]
    fn test_private_key_goes_over_stdin() {
        let runner = Arc::new(RecordingRunner::new());
        let tool = WgTool::new(runner.clone(), "wg");
        let key = PrivateKey::generate();
        tool.set_private_key("wg0", Some(&key)).unwrap();

        let call = &runner.calls()[0];
        assert!(!call.command_line().contains(&key.to_base64()));
        assert_eq!(call.stdin.as_deref(), Some(key.to_base64().as_str()));
    }
}
