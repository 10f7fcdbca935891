//! Input validation functions
//!
//! Validation for interface names, MTU, ports, endpoints and paths. Every
//! failure is an `InvalidArgument` except configuration-file checks, which
//! surface as `Config` errors from [`super::EngineConfig::validate`].

use crate::error::{BrgError, Result};
use std::net::SocketAddr;
use std::path::Path;

/// Smallest MTU accepted for a tunnel interface
pub const MIN_MTU: u16 = 500;

/// Largest MTU accepted for a tunnel interface
pub const MAX_MTU: u16 = 1500;

/// Validate a network interface name (Linux: max 15 chars, starts with a letter)
pub fn validate_interface_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BrgError::InvalidArgument(
            "Interface name cannot be empty".to_string(),
        ));
    }

    if name.len() > 15 {
        return Err(BrgError::InvalidArgument(format!(
            "Interface name '{}' exceeds maximum length of 15 characters",
            name
        )));
    }

    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(BrgError::InvalidArgument(format!(
            "Interface name '{}' must start with a letter, example: 'wg0, wg1'",
            name
        )));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(BrgError::InvalidArgument(format!(
            "Interface name '{}' contains invalid characters (only alphanumeric, '_', '-' and '.' allowed)",
            name
        )));
    }

    Ok(())
}

/// Validate MTU value
pub fn validate_mtu(mtu: u16) -> Result<()> {
    if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
        return Err(BrgError::InvalidArgument(format!(
            "MTU value {} is out of valid range ({}-{})",
            mtu, MIN_MTU, MAX_MTU
        )));
    }
    Ok(())
}

/// Validate a firewall port (0 is not a real destination port)
pub fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(BrgError::InvalidArgument(
            "Port number cannot be 0".to_string(),
        ));
    }
    Ok(())
}

/// Parse a peer endpoint (`IP:port`, IPv6 in brackets)
pub fn parse_endpoint(endpoint: &str) -> Result<SocketAddr> {
    let addr: SocketAddr = endpoint.trim().parse().map_err(|_| {
        BrgError::InvalidArgument(format!(
            "Invalid endpoint format '{}', expected format: `IP-address:port` (e.g. `89.89.89.1:51820`)",
            endpoint
        ))
    })?;

    if addr.port() == 0 {
        return Err(BrgError::InvalidArgument(format!(
            "Invalid endpoint '{}': port cannot be 0",
            endpoint
        )));
    }

    Ok(addr)
}

/// Validate a log directory path (syntactically; it is created on demand)
pub fn validate_log_dir(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(BrgError::InvalidArgument(
            "Log directory path cannot be empty".to_string(),
        ));
    }

    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(BrgError::InvalidArgument(format!(
            "Log directory {:?} contains a parent directory reference",
            path
        )));
    }

    Ok(())
}
