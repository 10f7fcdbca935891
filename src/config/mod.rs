//! Configuration management
//!
//! The engine reads one optional TOML file naming where state and locks
//! live, how long to wait for locks and adapters, and which external tools
//! to invoke.

mod toml_parser;
pub mod validation;

pub use toml_parser::{TomlConfig, TomlToolPaths};

use crate::error::{BrgError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/brgnet/config.toml";

/// Resolved engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding interface and global records
    pub state_dir: PathBuf,
    /// Directory holding lock files
    pub lock_dir: PathBuf,
    /// Lock acquisition timeout (None = wait indefinitely)
    pub lock_timeout_ms: Option<u64>,
    /// Adapter call deadline
    pub adapter_deadline_ms: u64,
    /// Root of the sysctl tree (normally `/proc/sys`)
    pub sysctl_root: PathBuf,
    /// Use in-memory adapters
    pub dry_run: bool,
    /// External tools
    pub tools: ToolPaths,
}

/// External tool names or paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPaths {
    /// iproute2
    pub ip: String,
    /// WireGuard tools
    pub wg: String,
    /// AmneziaWG tools
    pub awg: String,
    /// IPv4 packet filter
    pub iptables: String,
    /// IPv6 packet filter
    pub ip6tables: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ip: "ip".to_string(),
            wg: "wg".to_string(),
            awg: "awg".to_string(),
            iptables: "iptables".to_string(),
            ip6tables: "ip6tables".to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/brgnet"),
            lock_dir: PathBuf::from("/run/brgnet"),
            lock_timeout_ms: None,
            adapter_deadline_ms: 10_000,
            sysctl_root: PathBuf::from("/proc/sys"),
            dry_run: false,
            tools: ToolPaths::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file; a missing file yields defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let config: EngineConfig = TomlConfig::from_file(path)?.into();
        config.validate()?;
        Ok(config)
    }

    /// Configuration rooted in one directory, used by tests and dry runs
    pub fn rooted_at<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            state_dir: root.join("state"),
            lock_dir: root.join("lock"),
            sysctl_root: root.join("sys"),
            ..Self::default()
        }
    }

    /// Lock timeout as a duration
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    /// Adapter deadline as a duration
    pub fn adapter_deadline(&self) -> Duration {
        Duration::from_millis(self.adapter_deadline_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for (name, dir) in [
            ("state_dir", &self.state_dir),
            ("lock_dir", &self.lock_dir),
            ("sysctl_root", &self.sysctl_root),
        ] {
            if !dir.is_absolute() {
                return Err(BrgError::Config(format!(
                    "{} must be an absolute path, got {:?}",
                    name, dir
                )));
            }
        }

        if self.state_dir == self.lock_dir {
            return Err(BrgError::Config(
                "state_dir and lock_dir must differ".to_string(),
            ));
        }

        if self.adapter_deadline_ms == 0 {
            return Err(BrgError::Config(
                "adapter_deadline_ms must be positive".to_string(),
            ));
        }

        for tool in [
            &self.tools.ip,
            &self.tools.wg,
            &self.tools.awg,
            &self.tools.iptables,
            &self.tools.ip6tables,
        ] {
            if tool.trim().is_empty() || tool.contains(char::is_whitespace) {
                return Err(BrgError::Config(format!("Invalid tool path '{}'", tool)));
            }
        }

        Ok(())
    }
}
