//! Persistent device identity
//!
//! A device identifier is generated once and reused across reconnects.
//! Persistence lives behind a small key-value seam so hosts can plug in
//! whatever storage they have; the crate ships an in-memory store for
//! tests and a file-backed store for the binaries.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::crypto::random_bytes;

/// Storage key under which the device identifier is persisted
pub const DEVICE_ID_KEY: &str = "device-id";

/// A persisted random device identifier (32 hex chars)
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        DeviceId(hex::encode(random_bytes::<16>()))
    }

    /// Wrap an identifier loaded from storage
    pub fn from_string(id: String) -> Self {
        DeviceId(id)
    }

    /// The identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// External key-value persistence for identity material
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Load a value, `None` when absent
    async fn load(&self, key: &str) -> Option<String>;

    /// Persist a value
    async fn save(&self, key: &str, value: &str) -> io::Result<()>;
}

/// Load the device identifier, generating and persisting one on first use
pub async fn load_or_create_device_id(store: &dyn IdentityStore) -> io::Result<DeviceId> {
    if let Some(existing) = store.load(DEVICE_ID_KEY).await {
        return Ok(DeviceId::from_string(existing));
    }

    let id = DeviceId::generate();
    store.save(DEVICE_ID_KEY, id.as_str()).await?;
    Ok(id)
}

/// In-memory store for tests and short-lived sessions
#[derive(Default)]
pub struct MemoryIdentityStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryIdentityStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn load(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    async fn save(&self, key: &str, value: &str) -> io::Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// File-backed store: one JSON object per store file
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    /// Store backed by the given file path
    pub fn new(path: PathBuf) -> Self {
        FileIdentityStore { path }
    }

    fn read_entries(&self) -> HashMap<String, String> {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }
}

#[async_trait]
impl IdentityStore for FileIdentityStore {
    async fn load(&self, key: &str) -> Option<String> {
        self.read_entries().get(key).cloned()
    }

    async fn save(&self, key: &str, value: &str) -> io::Result<()> {
        let mut entries = self.read_entries();
        entries.insert(key.to_string(), value.to_string());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(&entries)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.path, text)
    }
}
