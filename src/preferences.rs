//! Persisted user preferences.
//!
//! Transports never talk to storage directly. They take a [`PreferenceStore`]
//! so hosts can plug in whatever persistence they already have, and tests can
//! use [`MemoryPreferences`].

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Key-value store for small integer preferences.
#[cfg_attr(test, mockall::automock)]
pub trait PreferenceStore: Send + Sync {
    /// Read a stored value.
    fn get(&self, key: &str) -> Option<i64>;

    /// Store a value, replacing any previous one.
    fn set(&self, key: &str, value: i64) -> Result<()>;
}

impl<T: PreferenceStore + ?Sized> PreferenceStore for Arc<T> {
    fn get(&self, key: &str) -> Option<i64> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: i64) -> Result<()> {
        (**self).set(key, value)
    }
}

/// In-memory preference store.
///
/// Clones share the same map, so a clone handed to a second transport sees
/// everything the first one wrote. This is how a process restart is simulated
/// in tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryPreferences {
    values: Arc<RwLock<BTreeMap<String, i64>>>,
}

impl MemoryPreferences {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get(&self, key: &str) -> Option<i64> {
        self.values.read().get(key).copied()
    }

    fn set(&self, key: &str, value: i64) -> Result<()> {
        self.values.write().insert(key.to_string(), value);
        Ok(())
    }
}

/// Preference store backed by a JSON object on disk.
///
/// The whole file is rewritten on every [`set`](PreferenceStore::set).
#[derive(Debug)]
pub struct JsonFilePreferences {
    path: PathBuf,
    values: RwLock<BTreeMap<String, i64>>,
}

impl JsonFilePreferences {
    /// File name used inside the per-user configuration directory.
    pub const FILE_NAME: &'static str = "preferences.json";

    /// Open the store at `path`, loading existing values if the file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let values = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No preference file at {}, starting empty", path.display());
                BTreeMap::new()
            }
            Err(e) => return Err(Error::Io(e)),
        };

        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    /// Open the store in the per-user configuration directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform has no configuration directory or the
    /// existing file cannot be read.
    pub fn open_default() -> Result<Self> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::Internal("no configuration directory".to_string()))?;
        Self::open(dir.join(env!("CARGO_PKG_NAME")).join(Self::FILE_NAME))
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, i64>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(values)?;
        std::fs::write(&self.path, data)?;
        Ok(())
    }
}

impl PreferenceStore for JsonFilePreferences {
    fn get(&self, key: &str) -> Option<i64> {
        self.values.read().get(key).copied()
    }

    fn set(&self, key: &str, value: i64) -> Result<()> {
        let mut values = self.values.write();
        values.insert(key.to_string(), value);
        self.persist(&values).map_err(|e| {
            warn!("Failed to write {}: {}", self.path.display(), e);
            e
        })
    }
}
