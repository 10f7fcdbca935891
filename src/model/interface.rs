//! Interface and peer records
//!
//! An [`InterfaceRecord`] is the desired state of one tunnel interface and
//! owns its peers and address bindings. Records reference nothing else by
//! pointer; global rules point back at interfaces by name only.

use crate::error::{BrgError, Result};
use crate::model::Cidr;
use crate::wireguard::{ObfuscationParams, PresharedKey, PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Tunnel protocol variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// Standard WireGuard
    Standard,
    /// AmneziaWG (obfuscated WireGuard)
    Obfuscated,
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Variant::Standard => write!(f, "standard"),
            Variant::Obfuscated => write!(f, "obfuscated"),
        }
    }
}

impl FromStr for Variant {
    type Err = BrgError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "standard" | "wg" | "wireguard" => Ok(Variant::Standard),
            "obfuscated" | "awg" | "amneziawg" => Ok(Variant::Obfuscated),
            other => Err(BrgError::InvalidArgument(format!(
                "Unknown variant '{}' (expected standard or obfuscated)",
                other
            ))),
        }
    }
}

/// Administrative link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// Created, administratively down
    Down,
    /// Administratively up
    Up,
}

impl LinkState {
    /// Check if the link is up
    pub fn is_up(&self) -> bool {
        matches!(self, LinkState::Up)
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Down => write!(f, "down"),
            LinkState::Up => write!(f, "up"),
        }
    }
}

/// Verbosity of an interface's log sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Nothing is written
    Silent,
    /// Failures only
    Error,
    /// Everything the engine does to the interface
    Debug,
}

impl FromStr for LogLevel {
    type Err = BrgError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "silent" | "none" | "0" => Ok(LogLevel::Silent),
            "error" | "1" => Ok(LogLevel::Error),
            "debug" | "2" => Ok(LogLevel::Debug),
            other => Err(BrgError::InvalidArgument(format!(
                "Unknown log level '{}' (expected silent, error or debug)",
                other
            ))),
        }
    }
}

/// Where and how operations on an interface are logged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSink {
    /// Directory holding `<interface>.log`
    pub dir: PathBuf,
    /// Verbosity
    pub level: LogLevel,
    /// Emit JSON lines instead of plain text
    #[serde(default)]
    pub json: bool,
}

impl LogSink {
    /// Path of the log file for `interface`
    pub fn file_for(&self, interface: &str) -> PathBuf {
        self.dir.join(format!("{}.log", interface))
    }
}

/// Desired state of one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Peer public key, unique within the interface
    pub public_key: PublicKey,
    /// Optional preshared key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<PresharedKey>,
    /// Allowed IPs in network form, sorted and deduplicated
    pub allowed_ips: Vec<Cidr>,
    /// Remote endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<SocketAddr>,
    /// Persistent keepalive in seconds (0 = disabled)
    #[serde(default)]
    pub persistent_keepalive: u16,
}

/// Desired state of one tunnel interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceRecord {
    /// Interface name
    pub name: String,
    /// Protocol variant
    pub variant: Variant,
    /// Administrative state
    pub state: LinkState,
    /// UDP listen port (0 = chosen by the kernel)
    #[serde(default)]
    pub listen_port: u16,
    /// MTU (kernel default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u16>,
    /// Private key, present once set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PrivateKey>,
    /// Public key derived from `private_key`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PublicKey>,
    /// Log sink configuration
    pub log: LogSink,
    /// AmneziaWG parameter block (obfuscated variant only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obfuscation: Option<ObfuscationParams>,
    /// Peers, ordered by public key
    #[serde(default)]
    pub peers: Vec<PeerRecord>,
    /// Address bindings in insertion order
    #[serde(default)]
    pub addresses: Vec<Cidr>,
    /// Bumped on every committed change
    #[serde(default)]
    pub revision: u64,
    /// Creation started but not yet confirmed; a retried add or a reconcile
    /// finishes it
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pending: bool,
}

impl InterfaceRecord {
    /// A freshly created interface: down, no keys, no peers, no addresses
    pub fn new(
        name: String,
        variant: Variant,
        mtu: Option<u16>,
        log: LogSink,
        obfuscation: Option<ObfuscationParams>,
    ) -> Self {
        Self {
            name,
            variant,
            state: LinkState::Down,
            listen_port: 0,
            mtu,
            private_key: None,
            public_key: None,
            log,
            obfuscation,
            peers: Vec::new(),
            addresses: Vec::new(),
            revision: 0,
            pending: false,
        }
    }

    /// Look up a peer by public key
    pub fn peer(&self, key: &PublicKey) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| &p.public_key == key)
    }

    /// Insert or replace a peer, keeping the list ordered by key
    pub fn upsert_peer(&mut self, peer: PeerRecord) {
        match self
            .peers
            .binary_search_by(|p| p.public_key.cmp(&peer.public_key))
        {
            Ok(idx) => self.peers[idx] = peer,
            Err(idx) => self.peers.insert(idx, peer),
        }
    }

    /// Remove a peer, returning it if it existed
    pub fn remove_peer(&mut self, key: &PublicKey) -> Option<PeerRecord> {
        let idx = self.peers.iter().position(|p| &p.public_key == key)?;
        Some(self.peers.remove(idx))
    }

    /// Install a private key and its derived public key
    pub fn set_private_key(&mut self, key: PrivateKey) {
        self.public_key = Some(key.public_key());
        self.private_key = Some(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wireguard::KeyPair;

    fn record() -> InterfaceRecord {
        InterfaceRecord::new(
            "wg0".to_string(),
            Variant::Standard,
            None,
            LogSink {
                dir: PathBuf::from("/var/log"),
                level: LogLevel::Error,
                json: false,
            },
            None,
        )
    }

    fn peer(key: PublicKey, ip: &str) -> PeerRecord {
        PeerRecord {
            public_key: key,
            preshared_key: None,
            allowed_ips: vec![ip.parse().unwrap()],
            endpoint: None,
            persistent_keepalive: 0,
        }
    }

    #[test]
    fn test_new_record_is_down_and_empty() {
        let r = record();
        assert_eq!(r.state, LinkState::Down);
        assert!(r.peers.is_empty());
        assert!(r.addresses.is_empty());
        assert!(r.private_key.is_none());
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut r = record();
        let key = KeyPair::generate().public;
        r.upsert_peer(peer(key.clone(), "10.0.0.1/32"));
        r.upsert_peer(peer(key.clone(), "10.0.0.2/32"));
        assert_eq!(r.peers.len(), 1);
        assert_eq!(r.peer(&key).unwrap().allowed_ips[0].to_string(), "10.0.0.2/32");
    }

    #[test]
    fn test_peers_stay_sorted() {
        let mut r = record();
        for _ in 0..8 {
            r.upsert_peer(peer(KeyPair::generate().public, "10.0.0.1/32"));
        }
        assert!(r.peers.windows(2).all(|w| w[0].public_key < w[1].public_key));
    }

    #[test]
    fn test_remove_peer() {
        let mut r = record();
        let key = KeyPair::generate().public;
        r.upsert_peer(peer(key.clone(), "10.0.0.1/32"));
        assert!(r.remove_peer(&key).is_some());
        assert!(r.remove_peer(&key).is_none());
    }

    #[test]
    fn test_record_json_roundtrip_keeps_keys() {
        let mut r = record();
        r.set_private_key(PrivateKey::generate());
        let json = serde_json::to_string(&r).unwrap();
        let back: InterfaceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn test_variant_aliases() {
        assert_eq!("awg".parse::<Variant>().unwrap(), Variant::Obfuscated);
        assert_eq!("wg".parse::<Variant>().unwrap(), Variant::Standard);
        assert!("ipsec".parse::<Variant>().is_err());
    }
}
