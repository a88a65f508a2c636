//! Key-value persistence used by the registry and the event tracker.
//!
//! Each logical store is a single JSON document under a fixed key. The engine never talks to a
//! concrete backend directly, so tests can substitute [`MemoryStorage`].
use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::Result;

/// A minimal string key-value store.
///
/// Implementations are expected to be cheap and synchronous. Errors are reported to the caller,
/// but the engine only logs them and carries on with its in-memory state.
pub trait KeyValueStorage: Send + Sync {
    /// Read the value stored under `key`. Returns `Ok(None)` if the key is absent.
    fn get(&self, key: &str) -> Result<Option<String>>;
    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Remove `key`. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

impl<T: KeyValueStorage + ?Sized> KeyValueStorage for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }
}

/// In-memory storage. Contents are lost when the value is dropped.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    /// Create an empty storage.
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values.remove(key);
        Ok(())
    }
}

/// Storage that keeps every key in its own `<dir>/<key>.json` file.
///
/// Writes go through a temporary file and a rename, so a crash never leaves a half-written
/// document behind. Concurrent writers from different processes are last-write-wins.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open (and create if needed) a storage directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the directory cannot be created.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_owned();
        fs::create_dir_all(&dir)?;
        Ok(FileStorage { dir })
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
            && !key.starts_with('.');
        if !valid {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid storage key {key:?}"),
            )
            .into());
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path(key)?) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path(key)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path(key)?) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// `TryParse` allows one stored entry to fail parsing without discarding the rest of the
/// document.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum TryParse<T> {
    Parsed(T),
    ParseFailed(serde_json::Value),
}

impl<T> TryParse<T> {
    /// The parsed value, or `None` (logged) if `entry` of the document under `key` was malformed.
    pub(crate) fn ok_or_log(self, key: &str, entry: &str) -> Option<T> {
        match self {
            TryParse::Parsed(value) => Some(value),
            TryParse::ParseFailed(_) => {
                log::warn!(target: "splitkit", key, entry; "skipping unparseable stored entry");
                None
            }
        }
    }
}

/// Load and parse the JSON document stored under `key`.
///
/// Missing keys, read failures and corrupted documents all yield `None`; failures are logged.
pub(crate) fn load_json<T: DeserializeOwned>(
    storage: &dyn KeyValueStorage,
    key: &str,
) -> Option<T> {
    let raw = match storage.get(key) {
        Ok(raw) => raw?,
        Err(err) => {
            log::warn!(target: "splitkit", key; "failed to read from storage: {err}");
            return None;
        }
    };

    serde_json::from_str(&raw)
        .inspect_err(|err| {
            log::warn!(target: "splitkit", key; "discarding corrupted stored value: {err}");
        })
        .ok()
}

/// Serialize `value` as JSON and store it under `key`. Failures are logged and otherwise ignored.
pub(crate) fn save_json<T: Serialize + ?Sized>(storage: &dyn KeyValueStorage, key: &str, value: &T) {
    let result = serde_json::to_string(value)
        .map_err(crate::Error::from)
        .and_then(|json| storage.set(key, &json));

    if let Err(err) = result {
        log::warn!(target: "splitkit", key; "failed to write to storage: {err}");
    }
}

/// Remove `key`, logging failures.
pub(crate) fn remove_key(storage: &dyn KeyValueStorage, key: &str) {
    if let Err(err) = storage.remove(key) {
        log::warn!(target: "splitkit", key; "failed to remove from storage: {err}");
    }
}
