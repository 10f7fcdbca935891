//! Forwarding sysctls written through `/proc/sys`

use crate::error::{BrgError, Result};
use crate::model::{ForwardingPolicy, IpFamily};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Reads and writes the forwarding toggles under a sysctl root
#[derive(Debug, Clone)]
pub struct SysctlForwarding {
    root: PathBuf,
}

impl SysctlForwarding {
    /// Use `root` as the sysctl tree (normally `/proc/sys`)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// File backing the toggle of `family`
    pub fn path(&self, family: IpFamily) -> PathBuf {
        match family {
            IpFamily::Ipv4 => self.root.join("net/ipv4/ip_forward"),
            IpFamily::Ipv6 => self.root.join("net/ipv6/conf/all/forwarding"),
        }
    }

    /// Write one toggle
    pub fn set(&self, family: IpFamily, enabled: bool) -> Result<()> {
        let path = self.path(family);
        info!(
            "Setting {} forwarding {}",
            family,
            if enabled { "on" } else { "off" }
        );
        fs::write(&path, if enabled { "1\n" } else { "0\n" }).map_err(|e| {
            BrgError::AdapterFailure(format!("{} forwarding write failed: {}", family, e))
        })
    }

    /// Read one toggle
    pub fn get(&self, family: IpFamily) -> Result<bool> {
        read_flag(&self.path(family))
    }

    /// Read both toggles
    pub fn read(&self) -> Result<ForwardingPolicy> {
        Ok(ForwardingPolicy {
            ipv4: self.get(IpFamily::Ipv4)?,
            ipv6: self.get(IpFamily::Ipv6)?,
        })
    }
}

fn read_flag(path: &Path) -> Result<bool> {
    let raw = fs::read_to_string(path)
        .map_err(|e| BrgError::AdapterFailure(format!("Failed to read {:?}: {}", path, e)))?;
    match raw.trim() {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(BrgError::AdapterFailure(format!(
            "Unexpected value '{}' in {:?}",
            other, path
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sysctl_tree() -> (TempDir, SysctlForwarding) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("net/ipv4")).unwrap();
        fs::create_dir_all(dir.path().join("net/ipv6/conf/all")).unwrap();
        fs::write(dir.path().join("net/ipv4/ip_forward"), "0\n").unwrap();
        fs::write(dir.path().join("net/ipv6/conf/all/forwarding"), "0\n").unwrap();
        let sysctl = SysctlForwarding::new(dir.path());
        (dir, sysctl)
    }

    #[test]
    fn test_set_and_read() {
        let (_dir, sysctl) = sysctl_tree();
        sysctl.set(IpFamily::Ipv4, true).unwrap();
        assert_eq!(
            sysctl.read().unwrap(),
            ForwardingPolicy {
                ipv4: true,
                ipv6: false
            }
        );
    }

    #[test]
    fn test_missing_tree_is_adapter_failure() {
        let sysctl = SysctlForwarding::new("/nonexistent/sys");
        assert!(sysctl.get(IpFamily::Ipv6).is_err());
        assert!(sysctl.set(IpFamily::Ipv6, true).is_err());
    }

    #[test]
    fn test_garbage_value_rejected() {
        let (dir, sysctl) = sysctl_tree();
        fs::write(dir.path().join("net/ipv4/ip_forward"), "yes\n").unwrap();
        assert!(sysctl.get(IpFamily::Ipv4).is_err());
    }
}
