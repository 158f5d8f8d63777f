//! Persistent state store for dynamic hosts and user key-values.
//!
//! The snapshot survives across runs so provisioning scripts can crash and
//! resume: `add_host` persists immediately, and the next context entry
//! merges stored hosts back into the inventory. Writes are crash-safe:
//! serialize to a temp file in the target directory, fsync, rename.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

const STATE_VERSION: u32 = 1;

/// On-disk shape: `{version, hosts, vars}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub hosts: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
}

/// Mutex-guarded snapshot with batched writes. At most one writer at a
/// time; readers observe the last committed snapshot.
pub struct StateStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    snapshot: StateSnapshot,
    dirty: bool,
}

impl StateStore {
    /// Loads the store, treating a missing file as an empty snapshot and a
    /// malformed file as fatal.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| EngineError::StateInvalid(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StateSnapshot {
                version: STATE_VERSION,
                ..StateSnapshot::default()
            },
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                snapshot,
                dirty: false,
            }),
        })
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.lock().expect("state lock").snapshot.clone()
    }

    pub fn put_host(&self, name: &str, attrs: BTreeMap<String, Value>) {
        let mut inner = self.inner.lock().expect("state lock");
        inner.snapshot.hosts.insert(name.to_string(), attrs);
        inner.dirty = true;
    }

    pub fn put_var(&self, key: &str, value: Value) {
        let mut inner = self.inner.lock().expect("state lock");
        inner.snapshot.vars.insert(key.to_string(), value);
        inner.dirty = true;
    }

    pub fn get_var(&self, key: &str) -> Option<Value> {
        self.inner
            .lock()
            .expect("state lock")
            .snapshot
            .vars
            .get(key)
            .cloned()
    }

    pub fn has(&self, key: &str) -> bool {
        let inner = self.inner.lock().expect("state lock");
        inner.snapshot.vars.contains_key(key) || inner.snapshot.hosts.contains_key(key)
    }

    /// Writes the snapshot atomically when there are pending changes.
    pub fn flush(&self) -> Result<()> {
        let snapshot = {
            let mut inner = self.inner.lock().expect("state lock");
            if !inner.dirty {
                return Ok(());
            }
            inner.dirty = false;
            let mut snap = inner.snapshot.clone();
            snap.version = STATE_VERSION;
            snap
        };
        write_json_atomic(&self.path, &snapshot)?;
        tracing::debug!(path = %self.path.display(), "state flushed");
        Ok(())
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "state flush on drop failed");
        }
    }
}

/// Temp file in the target directory, fsync, rename. Shared by the state
/// store and the audit log.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(dir) = dir {
        std::fs::create_dir_all(dir)?;
    }
    let dir = dir.map(Path::to_path_buf).unwrap_or_else(|| ".".into());
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
