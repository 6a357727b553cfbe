//! Key-value persistence for the central's last known peer
//!
//! The central remembers exactly one peer: each successful connection
//! overwrites the previous entry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::ble::transport::BleAddress;

/// Key holding the address of the last successfully connected peer.
pub const LAST_PEER_KEY: &str = "bleconnect.central.last_peer";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// String key-value storage provided by the host.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }
}

/// A JSON object on disk, rewritten on every change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl JsonFileStore {
    /// Open the store, loading existing entries if the file is present.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let entries = if path.exists() {
            let data = std::fs::read(path).map_err(|e| StoreError::IoError(e.to_string()))?;
            serde_json::from_slice(&data)
                .map_err(|e| StoreError::SerializationError(e.to_string()))?
        } else {
            HashMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    fn write(&self, entries: &HashMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::IoError(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        std::fs::write(&self.path, json).map_err(|e| StoreError::IoError(e.to_string()))
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value.to_string());
        self.write(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.remove(key).is_some() {
            self.write(&entries)?;
        }
        Ok(())
    }
}

/// The central's view of the store: at most one remembered peer.
#[derive(Clone)]
pub struct KnownPeers {
    store: Arc<dyn KeyValueStore>,
}

impl KnownPeers {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Remembered peers, most recent first. Unparseable entries are dropped.
    pub fn load(&self) -> Vec<BleAddress> {
        match self.store.get(LAST_PEER_KEY) {
            Some(raw) => match raw.parse::<BleAddress>() {
                Ok(address) => vec![address],
                Err(e) => {
                    log::warn!("Ignoring stored peer: {}", e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        }
    }

    /// Replace the remembered peer.
    pub fn remember(&self, peer: &BleAddress) -> Result<(), StoreError> {
        let value = peer.to_string();
        if self.store.get(LAST_PEER_KEY).as_deref() == Some(value.as_str()) {
            return Ok(());
        }
        self.store.set(LAST_PEER_KEY, &value)
    }

    pub fn forget(&self) -> Result<(), StoreError> {
        self.store.remove(LAST_PEER_KEY)
    }
}
