//! WireGuard key material and AmneziaWG parameters
//!
//! Cryptography itself is done by the kernel tunnel subsystem; this module
//! only produces, parses and protects the values handed to it.

mod keys;
mod obfuscation;

pub use keys::{KeyPair, PresharedKey, PrivateKey, PublicKey, KEY_BASE64_LEN};
pub use obfuscation::ObfuscationParams;
