//! TOML configuration file parser
//!
//! The file mirrors [`EngineConfig`] with every field optional, so a missing
//! or partial file falls back to the built-in defaults.

use crate::config::{EngineConfig, ToolPaths};
use crate::error::{BrgError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// TOML configuration file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    /// Directory holding interface and global records
    pub state_dir: Option<PathBuf>,

    /// Directory holding lock files
    pub lock_dir: Option<PathBuf>,

    /// Lock acquisition timeout in milliseconds (absent = wait forever)
    pub lock_timeout_ms: Option<u64>,

    /// Adapter call deadline in milliseconds
    pub adapter_deadline_ms: Option<u64>,

    /// Root of the sysctl tree
    pub sysctl_root: Option<PathBuf>,

    /// Use in-memory adapters instead of touching the kernel
    pub dry_run: Option<bool>,

    /// External tool overrides
    #[serde(default)]
    pub tools: TomlToolPaths,
}

/// TOML `[tools]` table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TomlToolPaths {
    /// `ip` binary
    pub ip: Option<String>,
    /// `wg` binary
    pub wg: Option<String>,
    /// `awg` binary
    pub awg: Option<String>,
    /// `iptables` binary
    pub iptables: Option<String>,
    /// `ip6tables` binary
    pub ip6tables: Option<String>,
}

impl TomlConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            BrgError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        Self::parse(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn parse(toml: &str) -> Result<Self> {
        toml::from_str(toml)
            .map_err(|e| BrgError::Config(format!("Failed to parse TOML config: {}", e)))
    }
}

// Convert TOML config to the resolved engine config
impl From<TomlConfig> for EngineConfig {
    fn from(toml: TomlConfig) -> Self {
        let defaults = EngineConfig::default();
        let tools = ToolPaths {
            ip: toml.tools.ip.unwrap_or(defaults.tools.ip),
            wg: toml.tools.wg.unwrap_or(defaults.tools.wg),
            awg: toml.tools.awg.unwrap_or(defaults.tools.awg),
            iptables: toml.tools.iptables.unwrap_or(defaults.tools.iptables),
            ip6tables: toml.tools.ip6tables.unwrap_or(defaults.tools.ip6tables),
        };

        EngineConfig {
            state_dir: toml.state_dir.unwrap_or(defaults.state_dir),
            lock_dir: toml.lock_dir.unwrap_or(defaults.lock_dir),
            lock_timeout_ms: toml.lock_timeout_ms.or(defaults.lock_timeout_ms),
            adapter_deadline_ms: toml
                .adapter_deadline_ms
                .unwrap_or(defaults.adapter_deadline_ms),
            sysctl_root: toml.sysctl_root.unwrap_or(defaults.sysctl_root),
            dry_run: toml.dry_run.unwrap_or(defaults.dry_run),
            tools,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            state_dir = "/tmp/brgnet/state"
            lock_dir = "/tmp/brgnet/lock"
            lock_timeout_ms = 5000
            adapter_deadline_ms = 2000
            sysctl_root = "/tmp/sys"
            dry_run = true

            [tools]
            awg = "/usr/local/bin/awg"
        "#;

        let config: EngineConfig = TomlConfig::parse(toml).expect("Failed to parse TOML").into();
        assert_eq!(config.state_dir, PathBuf::from("/tmp/brgnet/state"));
        assert_eq!(config.lock_timeout_ms, Some(5000));
        assert_eq!(config.adapter_deadline_ms, 2000);
        assert!(config.dry_run);
        assert_eq!(config.tools.awg, "/usr/local/bin/awg");
        assert_eq!(config.tools.wg, "wg");
    }

    #[test]
    fn test_parse_with_defaults() {
        let config: EngineConfig = TomlConfig::parse("").expect("Failed to parse TOML").into();
        let defaults = EngineConfig::default();
        assert_eq!(config.state_dir, defaults.state_dir);
        assert_eq!(config.lock_timeout_ms, None);
        assert!(!config.dry_run);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(TomlConfig::parse("statedir = \"/x\"").is_err());
    }
}
