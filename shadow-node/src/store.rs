//! File-backed identity store: one TOML table of key/value strings, written atomically.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use shadow_core::identity::{IdentityStore, StoreError};

pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or corrupt file reads as empty; I/O failures are errors.
    fn read_table(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let s = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        match toml::from_str(&s) {
            Ok(t) => Ok(t),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "identity file corrupt");
                Ok(BTreeMap::new())
            }
        }
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read_table()?.remove(key))
    }

    fn store(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut table = self.read_table().unwrap_or_default();
        table.insert(key.to_string(), value.to_string());
        let content = toml::to_string(&table).map_err(|e| StoreError::Parse(e.to_string()))?;
        atomic_write(&self.path, content.as_bytes())?;
        Ok(())
    }
}

/// Write to `<path>.tmp`, then rename over `path`.
fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        e
    })
}
