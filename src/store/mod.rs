//! Local gallery persistence.
//!
//! [`MediaStore`] owns two backends: a [`MetadataStore`] holding one ordered
//! record list per media kind, and a [`BlobStore`] for media bytes that are too
//! large to keep inline. Every mutation runs under one async mutex, so the
//! read-modify-write of a record list never races with another save.

mod backend;
mod record;

pub use backend::{BlobStore, FsBlobStore, JsonMetadataStore, MemoryBlobStore, MemoryMetadataStore, MetadataStore};
pub use record::{StoredMediaRecord, LOCAL_REF_SCHEME};

use crate::config::GenlyConfig;
use crate::error::{Result, StorageError};
use crate::types::{DataUri, MediaKind, MediaResult};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Default number of images kept.
pub const DEFAULT_IMAGE_LIMIT: usize = 5;
/// Default number of videos kept.
pub const DEFAULT_VIDEO_LIMIT: usize = 50;
/// Data URIs longer than this many characters are moved into the blob store.
pub const DEFAULT_INLINE_THRESHOLD: usize = 5000;

const EVENT_CAPACITY: usize = 64;

/// Retention and placement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Maximum images retained.
    pub image_limit: usize,
    /// Maximum videos retained.
    pub video_limit: usize,
    /// Data-URI length above which bytes go to the blob store.
    pub inline_threshold: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            image_limit: DEFAULT_IMAGE_LIMIT,
            video_limit: DEFAULT_VIDEO_LIMIT,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
        }
    }
}

impl StoreOptions {
    /// Retention cap for `kind`.
    pub fn limit(&self, kind: MediaKind) -> usize {
        match kind {
            MediaKind::Image => self.image_limit,
            MediaKind::Video => self.video_limit,
        }
    }
}

/// Caller-supplied details stored alongside a result.
#[derive(Debug, Clone, Default)]
pub struct SaveMetadata {
    /// Prompt that produced the media.
    pub prompt: String,
    /// Extra provider details merged into the record.
    pub provider_metadata: Map<String, Value>,
}

impl SaveMetadata {
    /// Metadata with just a prompt.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            provider_metadata: Map::new(),
        }
    }

    /// Adds one provider detail.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.provider_metadata.insert(key.into(), value.into());
        self
    }
}

/// A change to the gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum GalleryEvent {
    /// A record was saved.
    Saved(StoredMediaRecord),
    /// A record was deleted, explicitly or by eviction.
    Deleted {
        /// Record id.
        id: String,
        /// Kind of the deleted record.
        kind: MediaKind,
    },
    /// Every record of a kind was removed.
    Cleared(MediaKind),
}

/// Persists generated media and enforces per-kind retention.
pub struct MediaStore {
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    options: StoreOptions,
    lock: Mutex<()>,
    events: broadcast::Sender<GalleryEvent>,
}

impl std::fmt::Debug for MediaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStore")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl MediaStore {
    /// Creates a store over the given backends.
    pub fn new(blobs: Arc<dyn BlobStore>, metadata: Arc<dyn MetadataStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            blobs,
            metadata,
            options: StoreOptions::default(),
            lock: Mutex::new(()),
            events,
        }
    }

    /// Filesystem store rooted at `dir`: metadata JSON at the top, blobs under `blobs/`.
    pub fn open(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self::new(
            Arc::new(FsBlobStore::new(dir.join("blobs"))),
            Arc::new(JsonMetadataStore::new(dir)),
        )
    }

    /// Filesystem store in the configured data directory.
    pub fn from_config(config: &GenlyConfig) -> Self {
        Self::open(config.resolved_data_dir())
    }

    /// Ephemeral store backed by memory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBlobStore::new()), Arc::new(MemoryMetadataStore::new()))
    }

    /// Replaces the retention policy.
    pub fn with_options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    /// Current retention policy.
    pub fn options(&self) -> StoreOptions {
        self.options
    }

    /// Receives gallery change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<GalleryEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: GalleryEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Saves a generation result and evicts the oldest records beyond the cap.
    ///
    /// Inline data URIs longer than the threshold are decoded into the blob
    /// store and the record gets a `local://` token. If the blob store is out of
    /// quota the record keeps the original URL instead.
    pub async fn save(&self, result: &MediaResult, metadata: SaveMetadata) -> Result<StoredMediaRecord> {
        let _guard = self.lock.lock().await;
        let kind = result.kind;
        let id = uuid::Uuid::new_v4().to_string();

        let mut url = result.url.clone();
        let mut is_local_ref = false;
        let mut mime_type = None;

        if url.len() > self.options.inline_threshold {
            if let Some(data_uri) = DataUri::parse(&result.url) {
                let bytes = data_uri.decode()?;
                let size = bytes.len();
                match self.blobs.put(&id, bytes).await {
                    Ok(()) => {
                        debug!(id = %id, bytes = size, "Stored media blob");
                        url = StoredMediaRecord::local_ref(&id);
                        is_local_ref = true;
                        mime_type = Some(data_uri.mime_type.to_string());
                    }
                    Err(e) if e.is_quota() => {
                        warn!(id = %id, error = %e, "Blob quota exceeded, keeping inline reference");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let record = StoredMediaRecord {
            id: id.clone(),
            url,
            prompt: metadata.prompt,
            timestamp: chrono::Utc::now().timestamp_millis(),
            is_video: kind == MediaKind::Video,
            is_local_ref,
            mime_type,
            duration_secs: result.duration_secs,
            width: result.width,
            height: result.height,
            model: Some(result.model.clone()),
            provider_metadata: provider_details(result, metadata.provider_metadata),
        };

        let mut records = match self.metadata.load(kind).await {
            Ok(records) => records,
            Err(e) => {
                self.discard_blob(&record).await;
                return Err(e.into());
            }
        };
        records.insert(0, record.clone());
        sort_newest_first(&mut records);

        let limit = self.options.limit(kind);
        let evicted = records.split_off(limit.min(records.len()));

        // Evicted blobs go only after the shorter list is committed.
        if let Err(e) = self.metadata.store(kind, &records).await {
            self.discard_blob(&record).await;
            return Err(e.into());
        }
        for old in &evicted {
            debug!(id = %old.id, "Evicted media record");
            self.remove_blob(old).await;
        }

        info!(id = %record.id, kind = %kind, local = record.is_local_ref, evicted = evicted.len(), "Saved media");
        self.notify(GalleryEvent::Saved(record.clone()));
        for old in evicted {
            self.notify(GalleryEvent::Deleted { id: old.id, kind });
        }
        Ok(record)
    }

    /// Deletes the blob of a record whose metadata is already gone.
    ///
    /// Failures leave an orphan for [`MediaStore::prune_orphans`].
    async fn remove_blob(&self, record: &StoredMediaRecord) {
        if let Some(key) = record.blob_key() {
            if let Err(e) = self.blobs.delete(key).await {
                warn!(id = %record.id, error = %e, "Failed to delete blob of removed record");
            }
        }
    }

    async fn discard_blob(&self, record: &StoredMediaRecord) {
        if let Some(key) = record.blob_key() {
            if let Err(e) = self.blobs.delete(key).await {
                warn!(id = %record.id, error = %e, "Failed to discard blob after metadata error");
            }
        }
    }

    /// Returns a renderable URL for `record`.
    ///
    /// Local references are rebuilt as data URIs. A missing or unreadable blob
    /// falls back to the stored URL.
    pub async fn resolve(&self, record: &StoredMediaRecord) -> String {
        let Some(key) = record.blob_key() else {
            return record.url.clone();
        };
        match self.blobs.get(key).await {
            Ok(bytes) => {
                let mime = record.mime_type.as_deref().unwrap_or(match record.kind() {
                    MediaKind::Image => "image/png",
                    MediaKind::Video => "video/mp4",
                });
                DataUri::format(mime, &crate::types::encode_base64(&bytes))
            }
            Err(e) => {
                warn!(id = %record.id, error = %e, "Blob lookup failed, using stored URL");
                record.url.clone()
            }
        }
    }

    /// Records of `kind`, newest first.
    pub async fn list_all(&self, kind: MediaKind) -> Result<Vec<StoredMediaRecord>> {
        let mut records = self.metadata.load(kind).await?;
        sort_newest_first(&mut records);
        Ok(records)
    }

    /// Finds a record by id in either kind.
    pub async fn get(&self, id: &str) -> Result<Option<StoredMediaRecord>> {
        for kind in MediaKind::ALL {
            if let Some(record) = self.metadata.load(kind).await?.into_iter().find(|r| r.id == id) {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Deletes a record and then its blob.
    ///
    /// A failed metadata write leaves both the record and its blob in place.
    pub async fn delete(&self, id: &str) -> Result<StoredMediaRecord> {
        let _guard = self.lock.lock().await;
        for kind in MediaKind::ALL {
            let mut records = self.metadata.load(kind).await?;
            let Some(pos) = records.iter().position(|r| r.id == id) else {
                continue;
            };
            let record = records.remove(pos);
            self.metadata.store(kind, &records).await?;
            self.remove_blob(&record).await;
            info!(id = %id, kind = %kind, "Deleted media");
            self.notify(GalleryEvent::Deleted {
                id: id.to_string(),
                kind,
            });
            return Ok(record);
        }
        Err(StorageError::NotFound(id.to_string()).into())
    }

    /// Removes every record of `kind`, returning how many were removed.
    ///
    /// The emptied list is committed before any blob is deleted. If that write
    /// fails nothing is removed.
    pub async fn clear_all(&self, kind: MediaKind) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let records = self.metadata.load(kind).await?;
        self.metadata.store(kind, &[]).await?;
        for record in &records {
            self.remove_blob(record).await;
        }
        let removed = records.len();
        info!(kind = %kind, removed, "Cleared gallery");
        self.notify(GalleryEvent::Cleared(kind));
        Ok(removed)
    }

    /// Deletes blobs that no record references, returning their keys.
    pub async fn prune_orphans(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        let mut referenced = HashSet::new();
        for kind in MediaKind::ALL {
            for record in self.metadata.load(kind).await? {
                if let Some(key) = record.blob_key() {
                    referenced.insert(key.to_string());
                }
            }
        }
        let mut pruned = Vec::new();
        for key in self.blobs.keys().await? {
            if !referenced.contains(&key) {
                self.blobs.delete(&key).await?;
                pruned.push(key);
            }
        }
        if !pruned.is_empty() {
            info!(count = pruned.len(), "Pruned orphaned blobs");
        }
        Ok(pruned)
    }
}

fn sort_newest_first(records: &mut [StoredMediaRecord]) {
    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
}

fn provider_details(result: &MediaResult, mut details: Map<String, Value>) -> Map<String, Value> {
    details.insert("tier".into(), Value::from(result.tier.as_str()));
    if let Some(from) = result.fallback_from {
        details.insert("fallbackFrom".into(), Value::from(from.as_str()));
    }
    if let Some(cost) = result.cost {
        details.insert("cost".into(), Value::from(cost));
    }
    if let Some(seed) = result.seed {
        details.insert("seed".into(), Value::from(seed));
    }
    if let Some(task_id) = &result.task_id {
        details.insert("taskId".into(), Value::from(task_id.as_str()));
    }
    details
}
