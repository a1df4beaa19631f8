//! Persisted gallery records.

use crate::types::MediaKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Prefix of the URL stored on records whose bytes live in the blob store.
pub const LOCAL_REF_SCHEME: &str = "local://";

/// One saved image or video.
///
/// Records are immutable once written. When `is_local_ref` is set, `url` is a
/// `local://<id>` token and must go through [`MediaStore::resolve`](super::MediaStore::resolve)
/// before it can be rendered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMediaRecord {
    /// Unique id generated at save time.
    pub id: String,
    /// Remote URL, inline data URI, or local reference token.
    pub url: String,
    /// Prompt that produced the media.
    pub prompt: String,
    /// Save time in epoch milliseconds.
    pub timestamp: i64,
    /// True for videos.
    pub is_video: bool,
    /// True when the bytes were moved into the blob store.
    pub is_local_ref: bool,
    /// MIME type of internalized bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Video duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    /// Width in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    /// Height in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Model that produced the media.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Free-form provider details (tier, cost, seed, task id).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub provider_metadata: Map<String, Value>,
}

impl StoredMediaRecord {
    /// Image or video.
    pub fn kind(&self) -> MediaKind {
        if self.is_video {
            MediaKind::Video
        } else {
            MediaKind::Image
        }
    }

    /// Blob key behind a local reference, if this record has one.
    pub fn blob_key(&self) -> Option<&str> {
        if !self.is_local_ref {
            return None;
        }
        Some(self.url.strip_prefix(LOCAL_REF_SCHEME).unwrap_or(&self.id))
    }

    /// Formats the reference token for a blob id.
    pub fn local_ref(id: &str) -> String {
        format!("{LOCAL_REF_SCHEME}{id}")
    }
}
