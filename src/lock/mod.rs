//! Lock coordinator
//!
//! Cross-process advisory locks on files under the lock directory:
//! `global.lock` guards NAT, firewall, forwarding and port state and
//! `iface-<name>.lock` guards one interface. Each acquisition opens its own
//! file description, so two acquisitions exclude each other whether they
//! come from different processes or different threads of this one.
//!
//! Locks are exclusive and non-reentrant. When an operation needs both
//! scopes it takes the global lock first.

use crate::error::{BrgError, Result};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// What a lock protects
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockScope {
    /// Global policy: NAT, firewall rules, forwarding, firewall ports
    Global,
    /// One interface and its peers and addresses
    Interface(String),
}

impl LockScope {
    fn file_name(&self) -> String {
        match self {
            LockScope::Global => "global.lock".to_string(),
            LockScope::Interface(name) => format!("iface-{}.lock", name),
        }
    }
}

impl std::fmt::Display for LockScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockScope::Global => write!(f, "global"),
            LockScope::Interface(name) => write!(f, "interface {}", name),
        }
    }
}

/// A held lock; released on drop
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    scope: LockScope,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock as well; unlocking first
        // makes the release independent of other clones of the descriptor.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            warn!(
                "Failed to unlock {}: {}",
                self.scope,
                std::io::Error::last_os_error()
            );
        }
        debug!("Released {} lock", self.scope);
    }
}

/// Locks held for one engine operation. Fields drop in declaration order,
/// so the interface lock is released before the global one.
#[derive(Debug, Default)]
pub struct HeldLocks {
    interface: Option<LockGuard>,
    global: Option<LockGuard>,
}

impl HeldLocks {
    /// Whether the global scope is held
    pub fn holds_global(&self) -> bool {
        self.global.is_some()
    }

    /// Interface whose scope is held
    pub fn interface(&self) -> Option<&str> {
        match self.interface.as_ref().map(|g| &g.scope) {
            Some(LockScope::Interface(name)) => Some(name),
            _ => None,
        }
    }
}

/// Hands out file locks under one directory
#[derive(Debug, Clone)]
pub struct LockCoordinator {
    dir: PathBuf,
}

impl LockCoordinator {
    /// Use `dir` for lock files (created on first use)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn open(&self, scope: &LockScope) -> Result<File> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(scope.file_name());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&path)?;
        Ok(file)
    }

    /// Block the calling thread until `scope` is held
    pub fn acquire_blocking(&self, scope: &LockScope) -> Result<LockGuard> {
        let file = self.open(scope)?;
        loop {
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(BrgError::Io(err));
            }
        }
        debug!("Acquired {} lock", scope);
        Ok(LockGuard {
            file,
            scope: scope.clone(),
        })
    }

    /// Take `scope` only if it is free right now
    pub fn try_acquire(&self, scope: &LockScope) -> Result<Option<LockGuard>> {
        let file = self.open(scope)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(Some(LockGuard {
                file,
                scope: scope.clone(),
            }));
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(BrgError::Io(err))
        }
    }

    /// Acquire `scope` on a blocking worker, giving up after `timeout`.
    ///
    /// A worker that obtains the lock after its caller gave up hands the
    /// guard to a dropped join handle, which releases it immediately.
    pub async fn acquire(&self, scope: LockScope, timeout: Option<Duration>) -> Result<LockGuard> {
        let coordinator = self.clone();
        let label = scope.to_string();
        let task = tokio::task::spawn_blocking(move || coordinator.acquire_blocking(&scope));

        match timeout {
            None => task.await?,
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined?,
                Err(_) => {
                    warn!("Timed out after {:?} waiting for {} lock", limit, label);
                    Err(BrgError::LockTimeout(label))
                }
            },
        }
    }

    /// Acquire the scopes an operation needs, global first, within one
    /// overall timeout
    pub async fn acquire_for(
        &self,
        global: bool,
        interface: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<HeldLocks> {
        let started = Instant::now();
        let remaining = |limit: Option<Duration>| limit.map(|l| l.saturating_sub(started.elapsed()));

        let mut held = HeldLocks::default();
        if global {
            held.global = Some(self.acquire(LockScope::Global, remaining(timeout)).await?);
        }
        if let Some(name) = interface {
            held.interface = Some(
                self.acquire(LockScope::Interface(name.to_string()), remaining(timeout))
                    .await?,
            );
        }
        Ok(held)
    }
}
