//! WireGuard key management
//!
//! Private, public and preshared keys are 32-byte values exchanged as
//! base64 strings by `wg`/`awg` and stored the same way in state records.
//! Secret material is zeroized on drop and never rendered by `Debug`/`Display`.

use crate::error::{BrgError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Length of a base64-encoded 32-byte key
pub const KEY_BASE64_LEN: usize = 44;

fn decode_key(s: &str, what: &str) -> Result<[u8; 32]> {
    let s = s.trim();
    if s.len() != KEY_BASE64_LEN {
        return Err(BrgError::InvalidArgument(format!(
            "Invalid {} length: expected {} base64 characters, got {}",
            what,
            KEY_BASE64_LEN,
            s.len()
        )));
    }

    let decoded = Zeroizing::new(
        BASE64
            .decode(s)
            .map_err(|e| BrgError::InvalidArgument(format!("Invalid base64 {}: {}", what, e)))?,
    );

    if decoded.len() != 32 {
        return Err(BrgError::InvalidArgument(format!(
            "Invalid {} length: expected 32 bytes, got {}",
            what,
            decoded.len()
        )));
    }

    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&decoded);
    Ok(bytes)
}

/// WireGuard private key (32 bytes, x25519)
#[derive(Clone)]
pub struct PrivateKey {
    secret: Zeroizing<[u8; 32]>,
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        Self {
            secret: Zeroizing::new(secret.to_bytes()),
        }
    }

    /// Create a private key from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: Zeroizing::new(bytes),
        }
    }

    /// Parse a private key from base64-encoded string
    pub fn from_base64(s: &str) -> Result<Self> {
        decode_key(s, "private key").map(Self::from_bytes)
    }

    /// Convert to base64-encoded string
    pub fn to_base64(&self) -> String {
        BASE64.encode(*self.secret)
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(*self.secret);
        let public = X25519PublicKey::from(&secret);
        PublicKey {
            key: public.to_bytes(),
        }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.secret
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        *self.secret == *other.secret
    }
}

impl Eq for PrivateKey {}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([REDACTED])")
    }
}

// Ensure private keys are never accidentally logged
impl fmt::Display for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl Serialize for PrivateKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let encoded = Zeroizing::new(self.to_base64());
        serializer.serialize_str(&encoded)
    }
}

impl<'de> Deserialize<'de> for PrivateKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = Zeroizing::new(String::deserialize(deserializer)?);
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// WireGuard public key (32 bytes, x25519)
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey {
    key: [u8; 32],
}

impl PublicKey {
    /// Create a public key from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { key: bytes }
    }

    /// Parse a public key from base64-encoded string
    pub fn from_base64(s: &str) -> Result<Self> {
        decode_key(s, "public key").map(Self::from_bytes)
    }

    /// Convert to base64-encoded string
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.key)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl std::str::FromStr for PublicKey {
    type Err = BrgError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_base64(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// Optional symmetric key mixed into the handshake of one peer
#[derive(Clone)]
pub struct PresharedKey {
    secret: Zeroizing<[u8; 32]>,
}

impl PresharedKey {
    /// Generate a random preshared key
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let key = Self::from_bytes(bytes);
        zeroize::Zeroize::zeroize(&mut bytes);
        key
    }

    /// Create a preshared key from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: Zeroizing::new(bytes),
        }
    }

    /// Parse from base64
    pub fn from_base64(s: &str) -> Result<Self> {
        decode_key(s, "preshared key").map(Self::from_bytes)
    }

    /// Convert to base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(*self.secret)
    }
}

impl PartialEq for PresharedKey {
    fn eq(&self, other: &Self) -> bool {
        *self.secret == *other.secret
    }
}

impl Eq for PresharedKey {}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PresharedKey([REDACTED])")
    }
}

impl Serialize for PresharedKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let encoded = Zeroizing::new(self.to_base64());
        serializer.serialize_str(&encoded)
    }
}

impl<'de> Deserialize<'de> for PresharedKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = Zeroizing::new(String::deserialize(deserializer)?);
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// WireGuard key pair (private + public)
#[derive(Clone)]
pub struct KeyPair {
    /// Private key
    pub private: PrivateKey,
    /// Public key (derived from private)
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let private = PrivateKey::generate();
        let public = private.public_key();
        Self { private, public }
    }

    /// Create a key pair from a private key
    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("private", &"[REDACTED]")
            .field("public", &self.public)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_keypair() {
        let keypair = KeyPair::generate();
        assert_eq!(keypair.private.as_bytes().len(), 32);
        assert_eq!(keypair.public.as_bytes().len(), 32);
        assert_eq!(keypair.private.public_key(), keypair.public);
    }

    #[test]
    fn test_private_key_to_base64() {
        let private = PrivateKey::generate();
        assert_eq!(private.to_base64().len(), KEY_BASE64_LEN);
    }

    #[test]
    fn test_known_key_parses() {
        let key = PrivateKey::from_base64("AAgUffqqXRCwO6M91FcZIhzyOIiYIwLcUFJEHSSu2k8=").unwrap();
        let peer = PublicKey::from_base64("lTREr8sjJxZQfIDJohjeWHnlhUt5k/r1fkGqRiY4ZRo=").unwrap();
        assert_ne!(key.public_key(), peer);
    }

    #[test]
    fn test_public_key_derivation_is_stable() {
        let private = PrivateKey::generate();
        assert_eq!(private.public_key(), private.public_key());
    }

    #[test]
    fn test_private_key_not_logged() {
        let private = PrivateKey::generate();
        let debug_str = format!("{:?}", private);
        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains(&private.to_base64()));
        assert_eq!(format!("{}", private), "[REDACTED]");
    }

    #[test]
    fn test_serde_uses_base64() {
        let public = PrivateKey::generate().public_key();
        let json = serde_json::to_string(&public).unwrap();
        assert_eq!(json, format!("\"{}\"", public.to_base64()));
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, public);
    }

    #[test]
    fn test_invalid_base64() {
        assert!(PrivateKey::from_base64("invalid!@#$").is_err());
        assert!(PublicKey::from_base64("").is_err());
    }

    #[test]
    fn test_short_key_is_invalid_argument() {
        let short_key = BASE64.encode([0u8; 16]);
        let err = PrivateKey::from_base64(&short_key).unwrap_err();
        assert!(matches!(err, BrgError::InvalidArgument(_)));
    }

    #[test]
    fn test_preshared_key_redacted() {
        let psk = PresharedKey::generate();
        assert_eq!(format!("{:?}", psk), "PresharedKey([REDACTED])");
        assert_eq!(PresharedKey::from_base64(&psk.to_base64()).unwrap(), psk);
    }
}
