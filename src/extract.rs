//! Locates a generated media reference inside provider responses.
//!
//! Provider response shapes drift, so extraction runs a fixed, ordered list
//! of shape matchers and then falls back to a bounded breadth-first scan of
//! the whole document. Object keys are visited in sorted order (serde_json's
//! default map), so the scan is deterministic for a given response.

use crate::error::{GenlyError, Result};
use crate::types::{DataUri, ImageFormat};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::LazyLock;

/// Inline payloads shorter than this are treated as placeholders, not media.
pub const MIN_INLINE_DATA_LEN: usize = 100;

/// Upper bound on nodes (objects, arrays, strings) inspected by the fallback scan.
pub const MAX_SCAN_NODES: usize = 100;

static MEDIA_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)https?://[^\s"'<>()\[\]]+?\.(?:mp4|mov|webm|png|jpe?g|webp|gif)(?:\?[^\s"'<>()\[\]]*)?"#)
        .expect("valid regex")
});

static VIDEO_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)https?://[^\s"'<>()\[\]]+?\.mp4(?:\?[^\s"'<>()\[\]]*)?"#).expect("valid regex")
});

static HQ_VIDEO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)High-quality video generated[\s\S]*?(https?://[^\s"'<>()\[\]]+?\.mp4)"#)
        .expect("valid regex")
});

static DATA_URI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"data:((?:image|video)/[a-zA-Z0-9.+-]+);base64,([A-Za-z0-9+/=]+)").expect("valid regex")
});

/// A media reference pulled out of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaReference {
    /// Base64 media carried in the response.
    Inline {
        /// MIME type of the payload.
        mime_type: String,
        /// Base64 payload.
        data: String,
    },
    /// Remote URL.
    Url(String),
}

impl MediaReference {
    /// Returns the reference as a URL string, formatting inline data as a data URI.
    pub fn into_url(self) -> String {
        match self {
            Self::Inline { mime_type, data } => DataUri::format(&mime_type, &data),
            Self::Url(url) => url,
        }
    }

    fn inline(mime_type: Option<&str>, data: &str) -> Self {
        let mime_type = mime_type
            .map(str::to_string)
            .unwrap_or_else(|| sniff_mime(data).to_string());
        Self::Inline {
            mime_type,
            data: data.to_string(),
        }
    }
}

fn sniff_mime(data: &str) -> &'static str {
    let prefix: String = data.chars().take(24).collect();
    crate::types::decode_base64_lenient(&prefix)
        .ok()
        .and_then(|bytes| ImageFormat::from_magic_bytes(&bytes))
        .map(|f| f.mime_type())
        .unwrap_or("image/png")
}

type ShapeMatcher = fn(&Value) -> Option<MediaReference>;

/// Known response shapes, tried in order before the generic scan.
const SHAPE_MATCHERS: &[(&str, ShapeMatcher)] = &[
    ("candidates", match_candidates),
    ("choices", match_choices),
    ("direct-fields", match_direct_fields),
];

/// Extracts a media reference from a JSON response.
pub fn extract_media(response: &Value) -> Result<MediaReference> {
    find_media(response).ok_or_else(|| {
        let err = GenlyError::extraction(response);
        tracing::warn!(error = %err, "no media in provider response");
        err
    })
}

/// Like [`extract_media`], for responses where no media yet is expected.
pub fn find_media(response: &Value) -> Option<MediaReference> {
    for (shape, matcher) in SHAPE_MATCHERS {
        if let Some(found) = matcher(response) {
            tracing::debug!(shape, "media found by shape matcher");
            return Some(found);
        }
    }

    let (found, visited) = scan(response);
    if found.is_some() {
        tracing::debug!(visited, "media found by fallback scan");
    }
    found
}

/// Extracts a media reference from a raw response body that may not be JSON.
pub fn extract_media_from_text(text: &str) -> Result<MediaReference> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        if value.is_object() || value.is_array() {
            return extract_media(&value);
        }
    }
    media_in_text(text).ok_or_else(|| GenlyError::Extraction {
        keys: vec!["<text>".to_string()],
    })
}

/// Finds a video URL in free text, preferring the high-quality announcement.
pub fn find_video_url(text: &str) -> Option<String> {
    if let Some(caps) = HQ_VIDEO_RE.captures(text) {
        return caps.get(1).map(|m| m.as_str().to_string());
    }
    VIDEO_URL_RE.find(text).map(|m| m.as_str().to_string())
}

/// Finds the first image or video URL in free text.
pub fn find_media_url(text: &str) -> Option<String> {
    MEDIA_URL_RE.find(text).map(|m| m.as_str().to_string())
}

fn media_in_text(text: &str) -> Option<MediaReference> {
    if let Some(caps) = DATA_URI_RE.captures(text) {
        let mime = caps.get(1)?.as_str();
        let data = caps.get(2)?.as_str();
        if data.len() > MIN_INLINE_DATA_LEN {
            return Some(MediaReference::inline(Some(mime), data));
        }
    }
    find_media_url(text).map(MediaReference::Url)
}

/// A URL-ish string: remote media URL or sufficiently long data URI.
fn media_in_url_field(value: &str) -> Option<MediaReference> {
    if let Some(uri) = DataUri::parse(value) {
        return (uri.data.len() > MIN_INLINE_DATA_LEN)
            .then(|| MediaReference::inline(Some(uri.mime_type), uri.data));
    }
    (value.starts_with("http://") || value.starts_with("https://"))
        .then(|| MediaReference::Url(value.to_string()))
}

fn str_field<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| map.get(*k).and_then(Value::as_str))
}

fn inline_pair(map: &Map<String, Value>) -> Option<MediaReference> {
    let data = str_field(map, &["data", "b64_json", "base64"])?;
    if data.len() <= MIN_INLINE_DATA_LEN {
        return None;
    }
    let mime = str_field(map, &["mime_type", "mimeType", "content_type", "contentType"]);
    if mime.is_none() && !map.contains_key("b64_json") {
        return None;
    }
    Some(MediaReference::inline(mime, data))
}

/// `candidates[].content.parts[]` with inline data, file data, or text.
fn match_candidates(value: &Value) -> Option<MediaReference> {
    let candidates = value.get("candidates")?.as_array()?;
    for candidate in candidates {
        let Some(parts) = candidate.pointer("/content/parts").and_then(Value::as_array) else {
            continue;
        };
        for part in parts {
            let inline = part.get("inline_data").or_else(|| part.get("inlineData"));
            if let Some(found) = inline.and_then(Value::as_object).and_then(inline_pair) {
                return Some(found);
            }
            let file = part.get("file_data").or_else(|| part.get("fileData"));
            if let Some(uri) = file.and_then(|f| f.get("file_uri").or_else(|| f.get("fileUri"))) {
                if let Some(found) = uri.as_str().and_then(media_in_url_field) {
                    return Some(found);
                }
            }
        }
        for part in parts {
            if let Some(found) = part.get("text").and_then(Value::as_str).and_then(media_in_text) {
                return Some(found);
            }
        }
    }
    None
}

/// `choices[].message.content` as a string, a block array, or a single block.
fn match_choices(value: &Value) -> Option<MediaReference> {
    let choices = value.get("choices")?.as_array()?;
    for choice in choices {
        let Some(content) = choice.pointer("/message/content") else {
            continue;
        };
        let found = match content {
            Value::String(text) => media_in_text(text),
            Value::Array(blocks) => blocks.iter().find_map(match_content_block),
            Value::Object(_) => match_content_block(content),
            _ => None,
        };
        if found.is_some() {
            return found;
        }
    }
    None
}

fn match_content_block(block: &Value) -> Option<MediaReference> {
    let image_url = block.get("image_url");
    let url = image_url
        .and_then(|u| u.get("url"))
        .or(image_url)
        .and_then(Value::as_str);
    if let Some(found) = url.and_then(media_in_url_field) {
        return Some(found);
    }
    if let Some(data) = block.get("b64_json").and_then(Value::as_str) {
        if data.len() > MIN_INLINE_DATA_LEN {
            return Some(MediaReference::inline(None, data));
        }
    }
    block.get("text").and_then(Value::as_str).and_then(media_in_text)
}

/// Flat or lightly nested URL fields used by task-style providers.
fn match_direct_fields(value: &Value) -> Option<MediaReference> {
    const POINTERS: &[&str] = &[
        "/video_url",
        "/videoUrl",
        "/output/video/url",
        "/video/url",
        "/image/url",
        "/images/0/url",
        "/data/0/videoURL",
        "/data/0/imageURL",
        "/data/0/url",
        "/data/0/b64_json",
        "/imageURL",
        "/image_url",
        "/url",
    ];
    let root = match value {
        Value::Array(items) if !items.is_empty() => &items[0],
        other => other,
    };
    for pointer in POINTERS {
        let Some(field) = root.pointer(pointer).and_then(Value::as_str) else {
            continue;
        };
        if pointer.ends_with("b64_json") {
            if field.len() > MIN_INLINE_DATA_LEN {
                return Some(MediaReference::inline(None, field));
            }
            continue;
        }
        if let Some(found) = media_in_url_field(field) {
            return Some(found);
        }
    }
    None
}

/// Breadth-first scan for inline media or media URLs.
///
/// Every inspected object, array, and string counts as one node. Returns the
/// first hit and the number of nodes inspected, which never exceeds
/// [`MAX_SCAN_NODES`]. Children that could not be reached within the budget
/// are never queued.
pub(crate) fn scan(value: &Value) -> (Option<MediaReference>, usize) {
    let mut queue = VecDeque::from([value]);
    let mut visited = 0;

    while let Some(node) = queue.pop_front() {
        if visited >= MAX_SCAN_NODES {
            break;
        }
        visited += 1;
        let children: Box<dyn Iterator<Item = &Value>> = match node {
            Value::Object(map) => {
                if let Some(found) = inline_pair(map) {
                    return (Some(found), visited);
                }
                Box::new(map.values())
            }
            Value::Array(items) => Box::new(items.iter()),
            Value::String(text) => {
                if let Some(found) = media_in_text(text) {
                    return (Some(found), visited);
                }
                continue;
            }
            _ => continue,
        };
        let budget = MAX_SCAN_NODES.saturating_sub(visited + queue.len());
        queue.extend(children.filter(|child| is_scannable(child)).take(budget));
    }

    (None, visited)
}

fn is_scannable(value: &Value) -> bool {
    matches!(value, Value::Object(_) | Value::Array(_) | Value::String(_))
}
