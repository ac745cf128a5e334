//! # Identity Module
//!
//! Resolution of the locally persisted user identity that scopes per-user
//! topics.
//!
//! The identity is looked up in a small key-value store each time a
//! connection is established. Two store implementations ship with the crate:
//!
//! - [`MemoryStore`]: process-local map, handy for tests and embedding
//! - [`FileStore`]: a JSON object on disk, read on every lookup
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tokio_stomp_notify::identity::{IdentitySource, MemoryStore, DEFAULT_IDENTITY_KEY};
//!
//! let store = MemoryStore::new();
//! store.set(DEFAULT_IDENTITY_KEY, "42");
//!
//! let source = IdentitySource::store(Arc::new(store));
//! assert_eq!(source.resolve().as_deref(), Some("42"));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::errors::IdentityError;

/// Key the identity is stored under unless configured otherwise.
pub const DEFAULT_IDENTITY_KEY: &str = "userId";

/// Alternate key used by account-oriented deployments.
pub const ACCOUNT_ID_KEY: &str = "accountId";

/// A read-mostly key-value store holding the identity.
pub trait IdentityStore: fmt::Debug + Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<String>;
}

/// Process-local identity store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values
            .lock()
            .unwrap()
            .insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().remove(key)
    }
}

impl IdentityStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }
}

/// Identity store backed by a JSON object file.
///
/// The file is read on every lookup so that a login/logout performed by
/// another process is picked up by the next connection. Non-string scalar
/// values (numbers, booleans) are returned in their JSON text form.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the whole store. A missing file is an empty store.
    pub fn load(&self) -> Result<serde_json::Map<String, serde_json::Value>, IdentityError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(serde_json::Map::new());
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    /// Writes `key = value`, keeping the other entries.
    pub fn set(&self, key: &str, value: &str) -> Result<(), IdentityError> {
        let mut map = self.load()?;
        map.insert(key.to_string(), serde_json::Value::String(value.to_string()));
        std::fs::write(&self.path, serde_json::to_vec_pretty(&map)?)?;
        Ok(())
    }
}

impl IdentityStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        let map = match self.load() {
            Ok(map) => map,
            Err(err) => {
                log::warn!("cannot read identity from {}: {}", self.path.display(), err);
                return None;
            }
        };
        match map.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other @ (serde_json::Value::Number(_) | serde_json::Value::Bool(_)) => {
                Some(other.to_string())
            }
            _ => {
                log::warn!("identity key {:?} in {} is not a scalar", key, self.path.display());
                None
            }
        }
    }
}

/// Where the client gets its identity from.
#[derive(Debug, Clone, Default)]
pub enum IdentitySource {
    /// No identity; only unscoped topics are subscribed.
    #[default]
    None,
    /// A fixed identity.
    Fixed(String),
    /// Looked up under `key` in `store` at every connection establishment.
    Store {
        store: Arc<dyn IdentityStore>,
        key: String,
    },
}

impl IdentitySource {
    /// Store lookup under [`DEFAULT_IDENTITY_KEY`].
    pub fn store(store: Arc<dyn IdentityStore>) -> Self {
        Self::store_with_key(store, DEFAULT_IDENTITY_KEY)
    }

    pub fn store_with_key(store: Arc<dyn IdentityStore>, key: impl Into<String>) -> Self {
        IdentitySource::Store {
            store,
            key: key.into(),
        }
    }

    /// Returns the identity, treating empty and blank values as absent.
    pub fn resolve(&self) -> Option<String> {
        let value = match self {
            IdentitySource::None => None,
            IdentitySource::Fixed(id) => Some(id.clone()),
            IdentitySource::Store { store, key } => store.get(key),
        }?;
        let value = value.trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }
}
