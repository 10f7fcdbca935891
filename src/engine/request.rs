//! Request types accepted by the engine
//!
//! Inputs arrive as the strings a caller typed; parsing them here keeps every
//! `InvalidArgument` decision in one place and ahead of any lock or store
//! access.

use crate::config::validation::parse_endpoint;
use crate::error::{BrgError, Result};
use crate::model::{normalize_allowed_ips, Cidr, LinkState, LogSink, PeerRecord, RuleKey, Variant};
use crate::wireguard::{ObfuscationParams, PresharedKey, PublicKey};
use serde::Deserialize;

/// Parameters of `AddInterface`
#[derive(Debug, Clone)]
pub struct AddInterface {
    /// Interface name
    pub name: String,
    /// Protocol variant
    pub variant: Variant,
    /// MTU (kernel default when unset)
    pub mtu: Option<u16>,
    /// Log sink
    pub log: LogSink,
    /// Obfuscation parameter block (required for the obfuscated variant)
    pub obfuscation: Option<ObfuscationParams>,
}

/// Parameters of `UpsertPeer`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerSpec {
    /// Peer public key, base64
    pub public_key: String,
    /// Allowed IPs; entries may themselves be comma-separated lists
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// Endpoint as `IP:port`
    pub endpoint: Option<String>,
    /// Keepalive seconds; negative values clamp to 0
    pub keepalive: Option<i64>,
    /// Preshared key, base64
    pub preshared_key: Option<String>,
}

impl PeerSpec {
    /// Validate and convert into a peer record
    pub fn parse(&self) -> Result<PeerRecord> {
        let public_key = PublicKey::from_base64(self.public_key.trim())?;

        let allowed_ips = normalize_allowed_ips(&self.allowed_ips)?;
        if allowed_ips.is_empty() {
            return Err(BrgError::InvalidArgument(format!(
                "Peer {} needs at least one allowed IP",
                public_key
            )));
        }

        let endpoint = self.endpoint.as_deref().map(parse_endpoint).transpose()?;

        let persistent_keepalive = match self.keepalive {
            None => 0,
            Some(secs) => u16::try_from(secs.max(0)).map_err(|_| {
                BrgError::InvalidArgument(format!("Keepalive {} exceeds 65535 seconds", secs))
            })?,
        };

        let preshared_key = self
            .preshared_key
            .as_deref()
            .map(|k| PresharedKey::from_base64(k.trim()))
            .transpose()?;

        Ok(PeerRecord {
            public_key,
            preshared_key,
            allowed_ips,
            endpoint,
            persistent_keepalive,
        })
    }
}

/// Parse a NAT/firewall rule key from a subnet and optional egress name
pub fn parse_rule_key(subnet: &str, egress: Option<&str>) -> Result<RuleKey> {
    let subnet: Cidr = subnet.parse()?;
    if let Some(egress) = egress {
        if egress != crate::model::ANY_EGRESS && !egress.trim().is_empty() {
            crate::config::validation::validate_interface_name(egress.trim())?;
        }
    }
    Ok(RuleKey::new(subnet, egress))
}

/// How a change set touches the private key
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyChange {
    /// Generate a fresh key pair
    Generate,
    /// Install this base64 private key
    Set(String),
}

/// One NAT or firewall toggle inside a change set
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RuleChange {
    /// Source subnet
    pub subnet: String,
    /// Egress interface (`None` or `"any"` = any)
    #[serde(default)]
    pub egress: Option<String>,
    /// Enable or disable
    pub enable: bool,
}

/// Several sub-resource changes applied as one transaction, in the order
/// key material, port, interface parameters, addresses, peers, NAT and
/// firewall rules, link state
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChangeSet {
    /// Private key change
    pub private_key: Option<KeyChange>,
    /// New listen port
    pub listen_port: Option<u16>,
    /// New MTU
    pub mtu: Option<u16>,
    /// New obfuscation block
    pub obfuscation: Option<ObfuscationParams>,
    /// Addresses to bind
    pub add_addresses: Vec<String>,
    /// Addresses to unbind
    pub remove_addresses: Vec<String>,
    /// Peers to create or replace
    pub upsert_peers: Vec<PeerSpec>,
    /// Peers to remove, by public key
    pub remove_peers: Vec<String>,
    /// NAT toggles
    pub nat: Vec<RuleChange>,
    /// Forwarding-block toggles
    pub firewall: Vec<RuleChange>,
    /// Final link state
    pub link: Option<LinkState>,
}

impl ChangeSet {
    /// Whether the change set touches global policy
    pub fn touches_global(&self) -> bool {
        !self.nat.is_empty() || !self.firewall.is_empty()
    }

    /// Whether the change set does nothing
    pub fn is_empty(&self) -> bool {
        self.private_key.is_none()
            && self.listen_port.is_none()
            && self.mtu.is_none()
            && self.obfuscation.is_none()
            && self.add_addresses.is_empty()
            && self.remove_addresses.is_empty()
            && self.upsert_peers.is_empty()
            && self.remove_peers.is_empty()
            && !self.touches_global()
            && self.link.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const PEER: &str = "7cnFoHH7r0p3ZLlOqVSkCuUjDDT/xRTjwrCl6ElbRkY=";

    fn spec() -> PeerSpec {
        PeerSpec {
            public_key: PEER.to_string(),
            allowed_ips: vec!["10.0.0.1/32".to_string()],
            ..PeerSpec::default()
        }
    }

    #[test]
    fn test_peer_spec_parses() {
        let mut s = spec();
        s.allowed_ips = vec!["10.0.1.7/24, 10.0.0.1/32".to_string()];
        s.endpoint = Some("89.89.89.1:51820".to_string());
        s.keepalive = Some(25);
        let peer = s.parse().unwrap();
        assert_eq!(peer.allowed_ips.len(), 2);
        assert_eq!(peer.persistent_keepalive, 25);
        assert!(peer.endpoint.is_some());
    }

    #[test]
    fn test_negative_keepalive_clamps_to_zero() {
        let mut s = spec();
        s.keepalive = Some(-5);
        assert_eq!(s.parse().unwrap().persistent_keepalive, 0);
    }

    #[test]
    fn test_empty_allowed_ips_rejected() {
        let mut s = spec();
        s.allowed_ips.clear();
        assert_eq!(s.parse().unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_short_key_rejected() {
        let mut s = spec();
        s.public_key = "abc".to_string();
        assert_eq!(s.parse().unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_rule_key_treats_any_as_none() {
        let a = parse_rule_key("10.10.10.0/24", Some("any")).unwrap();
        let b = parse_rule_key("10.10.10.1/24", None).unwrap();
        assert_eq!(a, b);
        assert!(parse_rule_key("10.10.10.0/24", Some("eth0;reboot")).is_err());
    }

    #[test]
    fn test_change_set_from_json() {
        let cs: ChangeSet = serde_json::from_str(
            r#"{
                "private_key": "generate",
                "listen_port": 51820,
                "upsert_peers": [{"public_key": "7cnFoHH7r0p3ZLlOqVSkCuUjDDT/xRTjwrCl6ElbRkY=", "allowed_ips": ["10.0.0.2/32"]}],
                "nat": [{"subnet": "10.0.0.0/24", "enable": true}],
                "link": "up"
            }"#,
        )
        .unwrap();
        assert_eq!(cs.private_key, Some(KeyChange::Generate));
        assert_eq!(cs.link, Some(LinkState::Up));
        assert!(cs.touches_global());
        assert!(serde_json::from_str::<ChangeSet>(r#"{"bogus": 1}"#).is_err());
    }

    #[test]
    fn test_change_set_scope() {
        let mut cs = ChangeSet::default();
        assert!(cs.is_empty());
        cs.nat.push(RuleChange {
            subnet: "10.0.0.0/8".to_string(),
            egress: None,
            enable: true,
        });
        assert!(cs.touches_global());
        assert!(!cs.is_empty());
    }
}
