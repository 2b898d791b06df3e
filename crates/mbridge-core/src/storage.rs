//! Directory-backed key-value storage
//!
//! Storage is split into namespaces (one per logical node) and, inside a
//! namespace, into named contexts. Each context is persisted as a single JSON
//! document:
//!
//! ```text
//! <root>/<namespace>/<context>.json
//! ```
//!
//! Values are arbitrary JSON; typed access goes through serde.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid storage name: {0:?}")]
    InvalidName(String),
    #[error("Storage document {0} is not a JSON object")]
    NotAnObject(PathBuf),
}

/// Root of all persisted node state
#[derive(Debug, Clone)]
pub struct StorageService {
    root: PathBuf,
}

impl StorageService {
    /// Create a service rooted at the given directory (created lazily on first write)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open the storage namespace of a node
    pub fn open(&self, namespace: &str) -> Result<NodeStorage, StorageError> {
        validate_name(namespace)?;
        Ok(NodeStorage {
            dir: self.root.join(namespace),
            namespace: namespace.to_string(),
        })
    }
}

/// All contexts belonging to one node
#[derive(Debug, Clone)]
pub struct NodeStorage {
    dir: PathBuf,
    namespace: String,
}

impl NodeStorage {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Get a named context inside this namespace
    pub fn context(&self, name: &str) -> Result<StorageContext, StorageError> {
        validate_name(name)?;
        Ok(StorageContext {
            path: self.dir.join(format!("{}.json", name)),
            name: name.to_string(),
        })
    }

    /// Remove every context of this namespace
    pub async fn erase(&self) -> Result<(), StorageError> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {
                info!(namespace = %self.namespace, "Erased node storage");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// A single JSON document of key/value pairs
#[derive(Debug, Clone)]
pub struct StorageContext {
    path: PathBuf,
    name: String,
}

impl StorageContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read a value, `None` when the key is absent
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let mut entries = self.load().await?;
        match entries.remove(key) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn has(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.load().await?.contains_key(key))
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let mut entries = self.load().await?;
        entries.insert(key.to_string(), serde_json::to_value(value)?);
        self.save(&entries).await?;
        debug!(context = %self.name, key = %key, "Stored value");
        Ok(())
    }

    /// Remove a key, returning whether it existed
    pub async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let mut entries = self.load().await?;
        if entries.remove(key).is_none() {
            return Ok(false);
        }
        self.save(&entries).await?;
        Ok(true)
    }

    pub async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self.load().await?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    /// Overwrite the whole document
    pub(crate) async fn replace_all(&self, entries: Map<String, Value>) -> Result<(), StorageError> {
        self.save(&entries).await
    }

    async fn load(&self) -> Result<Map<String, Value>, StorageError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&content)? {
            Value::Object(entries) => Ok(entries),
            _ => Err(StorageError::NotAnObject(self.path.clone())),
        }
    }

    async fn save(&self, entries: &Map<String, Value>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(entries)?;
        // Write then rename so a crash never leaves a truncated document
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

pub(crate) fn validate_name(name: &str) -> Result<(), StorageError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_control);
    if invalid {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}
