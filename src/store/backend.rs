//! Blob and metadata backends for the media store.

use crate::error::{StorageError, StorageResult};
use crate::store::record::StoredMediaRecord;
use crate::types::MediaKind;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;

/// Opaque byte storage keyed by media id.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` under `key`, replacing any previous value.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> StorageResult<()>;

    /// Reads the bytes stored under `key`.
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Deletes `key`. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Lists every stored key.
    async fn keys(&self) -> StorageResult<Vec<String>>;
}

/// Ordered record lists, one per media kind.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Loads the records for `kind`; a missing collection is empty.
    async fn load(&self, kind: MediaKind) -> StorageResult<Vec<StoredMediaRecord>>;

    /// Replaces the records for `kind`.
    async fn store(&self, kind: MediaKind, records: &[StoredMediaRecord]) -> StorageResult<()>;
}

fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(StorageError::InvalidKey(format!(
            "storage key must be non-empty [A-Za-z0-9_-], got {key:?}"
        )));
    }
    Ok(())
}

/// Writes through a temporary sibling and renames into place.
async fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

/// Blobs as files in one directory, with an optional byte quota.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    quota_bytes: Option<u64>,
}

impl FsBlobStore {
    /// Stores blobs under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            quota_bytes: None,
        }
    }

    /// Caps the total size of stored blobs.
    pub fn with_quota(mut self, bytes: u64) -> Self {
        self.quota_bytes = Some(bytes);
        self
    }

    fn path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(format!("{key}.bin")))
    }

    /// Sums committed `.bin` blobs; in-flight `.tmp` files are not counted.
    async fn used_bytes(&self, excluding: &Path) -> StorageResult<u64> {
        let mut total = 0;
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path == excluding || path.extension().and_then(|ext| ext.to_str()) != Some("bin") {
                continue;
            }
            total += entry.metadata().await?.len();
        }
        Ok(total)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> StorageResult<()> {
        let path = self.path(key)?;
        if let Some(quota) = self.quota_bytes {
            let used = self.used_bytes(&path).await?;
            let needed = bytes.len() as u64;
            if used + needed > quota {
                return Err(StorageError::QuotaExceeded {
                    needed,
                    available: quota.saturating_sub(used),
                });
            }
        }
        write_atomic(&path, &bytes).await
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(key) = name.to_str().and_then(|n| n.strip_suffix(".bin")) {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Record lists as pretty-printed JSON files (`images.json`, `videos.json`).
#[derive(Debug, Clone)]
pub struct JsonMetadataStore {
    root: PathBuf,
}

impl JsonMetadataStore {
    /// Stores metadata files under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, kind: MediaKind) -> PathBuf {
        self.root.join(format!("{}.json", kind.plural()))
    }
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    async fn load(&self, kind: MediaKind) -> StorageResult<Vec<StoredMediaRecord>> {
        let path = self.path(kind);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&text).map_err(|e| StorageError::Corrupt {
            location: path.display().to_string(),
            message: e.to_string(),
        })
    }

    async fn store(&self, kind: MediaKind, records: &[StoredMediaRecord]) -> StorageResult<()> {
        let json = serde_json::to_vec_pretty(records).map_err(|e| StorageError::Corrupt {
            location: kind.plural().to_string(),
            message: e.to_string(),
        })?;
        write_atomic(&self.path(kind), &json).await
    }
}

/// In-memory blobs with an optional quota.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    quota_bytes: Option<u64>,
}

impl MemoryBlobStore {
    /// Creates an unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the total size of stored blobs.
    pub fn with_quota(bytes: u64) -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
            quota_bytes: Some(bytes),
        }
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.blobs
            .lock()
            .map_err(|_| StorageError::Io(std::io::Error::other("blob map lock poisoned")))
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> StorageResult<()> {
        validate_key(key)?;
        let mut blobs = self.lock()?;
        if let Some(quota) = self.quota_bytes {
            let used: u64 = blobs
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.len() as u64)
                .sum();
            let needed = bytes.len() as u64;
            if used + needed > quota {
                return Err(StorageError::QuotaExceeded {
                    needed,
                    available: quota.saturating_sub(used),
                });
            }
        }
        blobs.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        self.lock()?
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn keys(&self) -> StorageResult<Vec<String>> {
        let mut keys: Vec<String> = self.lock()?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// In-memory record lists.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    records: Mutex<HashMap<MediaKind, Vec<StoredMediaRecord>>>,
}

impl MemoryMetadataStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn load(&self, kind: MediaKind) -> StorageResult<Vec<StoredMediaRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| StorageError::Io(std::io::Error::other("metadata lock poisoned")))?;
        Ok(records.get(&kind).cloned().unwrap_or_default())
    }

    async fn store(&self, kind: MediaKind, records: &[StoredMediaRecord]) -> StorageResult<()> {
        self.records
            .lock()
            .map_err(|_| StorageError::Io(std::io::Error::other("metadata lock poisoned")))?
            .insert(kind, records.to_vec());
        Ok(())
    }
}
