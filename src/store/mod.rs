//! Durable desired-state store
//!
//! Layout under the state directory:
//!
//! ```text
//! interfaces/<name>.json   one InterfaceRecord (contains the private key)
//! global.json              GlobalPolicy
//! ```
//!
//! Every write replaces the whole record atomically: the JSON goes to a
//! temporary file in the same directory, is fsynced and renamed over the
//! target. Readers therefore see either the old or the new record, never a
//! mix, and may run without holding any lock.

use crate::error::{BrgError, Result};
use crate::model::{GlobalPolicy, InterfaceRecord};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, warn};

const INTERFACES_DIR: &str = "interfaces";
const GLOBAL_FILE: &str = "global.json";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// JSON-file state store
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
    /// Keeps a scratch copy's directory alive while any clone uses it
    scratch: Option<Arc<TempDir>>,
}

impl StateStore {
    /// Open the store rooted at `root`, creating its directories
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(root.join(INTERFACES_DIR))?;
        Ok(Self {
            root,
            scratch: None,
        })
    }

    /// A throwaway store holding a copy of this one's records. Writes to the
    /// copy never reach this store; its directory is removed once the last
    /// clone is dropped.
    pub fn scratch_copy(&self) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("brgnet-scratch-").tempdir()?;
        let mut copy = Self::open(dir.path())?;
        for record in self.load_interfaces()? {
            copy.put_interface(&record)?;
        }
        copy.put_global(&self.load_global()?)?;
        info!("Using scratch state at {:?}", dir.path());
        copy.scratch = Some(Arc::new(dir));
        Ok(copy)
    }

    fn interface_path(&self, name: &str) -> PathBuf {
        self.root.join(INTERFACES_DIR).join(format!("{}.json", name))
    }

    fn global_path(&self) -> PathBuf {
        self.root.join(GLOBAL_FILE)
    }

    /// Load an interface record, `None` if absent
    pub fn load_interface(&self, name: &str) -> Result<Option<InterfaceRecord>> {
        read_json(&self.interface_path(name))
    }

    /// Load an interface record, `NotFound` if absent
    pub fn get_interface(&self, name: &str) -> Result<InterfaceRecord> {
        self.load_interface(name)?
            .ok_or_else(|| BrgError::NotFound(format!("interface {}", name)))
    }

    /// Write an interface record
    pub fn put_interface(&self, record: &InterfaceRecord) -> Result<()> {
        debug!(
            "Storing interface {} (revision {})",
            record.name, record.revision
        );
        write_json_atomic(&self.interface_path(&record.name), record)
    }

    /// Remove an interface record; returns whether it existed
    pub fn delete_interface(&self, name: &str) -> Result<bool> {
        match fs::remove_file(self.interface_path(name)) {
            Ok(()) => {
                sync_dir(&self.root.join(INTERFACES_DIR));
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of stored interfaces, sorted
    pub fn list_interfaces(&self) -> Result<Vec<String>> {
        let dir = self.root.join(INTERFACES_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Load every stored interface. Records deleted between listing and
    /// reading are skipped.
    pub fn load_interfaces(&self) -> Result<Vec<InterfaceRecord>> {
        let mut records = Vec::new();
        for name in self.list_interfaces()? {
            if let Some(record) = self.load_interface(&name)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Load global policy; a fresh store has the empty policy
    pub fn load_global(&self) -> Result<GlobalPolicy> {
        Ok(read_json(&self.global_path())?.unwrap_or_default())
    }

    /// Write global policy
    pub fn put_global(&self, policy: &GlobalPolicy) -> Result<()> {
        debug!("Storing global policy (revision {})", policy.revision);
        write_json_atomic(&self.global_path(), policy)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value = serde_json::from_slice(&data).map_err(|e| {
        BrgError::Serialization(format!("Corrupt state record {:?}: {}", path, e))
    })?;
    Ok(Some(value))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| BrgError::Internal(format!("State path {:?} has no parent", path)))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| BrgError::Internal(format!("State path {:?} has no file name", path)))?;

    let tmp = dir.join(format!(
        ".{}.tmp-{}-{}",
        file_name,
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let json = serde_json::to_vec_pretty(value)?;
    let result = (|| -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&tmp)?;
        file.write_all(&json)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    } else {
        sync_dir(dir);
    }
    result
}

fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        warn!("Failed to sync directory {:?}: {}", dir, e);
    }
}
