//! Core request and result types shared by adapters, the orchestrator, and the store.

use crate::error::{GenlyError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Largest width or height accepted before routing.
pub const MAX_DIMENSION: u32 = 4096;

/// Longest video duration accepted before routing, in seconds.
pub const MAX_DURATION_SECS: u32 = 20;

/// Whether a piece of media is a still image or a video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Still image.
    Image,
    /// Video clip.
    Video,
}

impl MediaKind {
    /// Both kinds, images first.
    pub const ALL: [MediaKind; 2] = [MediaKind::Image, MediaKind::Video];

    /// Plural label used for collection names.
    pub fn plural(&self) -> &'static str {
        match self {
            Self::Image => "images",
            Self::Video => "videos",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image => write!(f, "image"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Coarse quality selector that the orchestrator maps onto an adapter and model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QualityTier {
    /// Fast diffusion image model.
    #[default]
    Standard,
    /// Slower, higher-fidelity diffusion image model.
    Premium,
    /// Multimodal image model that accepts several reference images.
    Ultra,
    /// Task-based video generation polled by task id.
    VideoStandard,
    /// Chat-completion video generation.
    VideoSync,
    /// Task-based video generation polled by scanning a source document.
    VideoAsync,
    /// Image-to-video effect templates.
    Effects,
}

impl QualityTier {
    /// Every tier, in display order.
    pub const ALL: [QualityTier; 7] = [
        QualityTier::Standard,
        QualityTier::Premium,
        QualityTier::Ultra,
        QualityTier::VideoStandard,
        QualityTier::VideoSync,
        QualityTier::VideoAsync,
        QualityTier::Effects,
    ];

    /// Returns the tier identifier (e.g., "video-sync").
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Premium => "premium",
            Self::Ultra => "ultra",
            Self::VideoStandard => "video-standard",
            Self::VideoSync => "video-sync",
            Self::VideoAsync => "video-async",
            Self::Effects => "effects",
        }
    }

    /// The kind of media this tier produces.
    pub fn media_kind(&self) -> MediaKind {
        match self {
            Self::Standard | Self::Premium | Self::Ultra => MediaKind::Image,
            Self::VideoStandard | Self::VideoSync | Self::VideoAsync | Self::Effects => {
                MediaKind::Video
            }
        }
    }

    /// Default output size when the request does not specify one.
    pub fn default_dimensions(&self) -> (u32, u32) {
        match self {
            Self::Standard | Self::Premium | Self::Ultra => (832, 1280),
            Self::VideoStandard => (640, 640),
            Self::VideoSync | Self::VideoAsync => (1920, 1080),
            Self::Effects => (1280, 720),
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for QualityTier {
    type Err = GenlyError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|tier| tier.as_str() == normalized)
            .ok_or_else(|| GenlyError::Validation(format!("unknown quality tier: {s}")))
    }
}

/// Image formats recognized in reference images and inline payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// PNG format.
    Png,
    /// JPEG format.
    Jpeg,
    /// WebP format.
    WebP,
    /// GIF format.
    Gif,
}

impl ImageFormat {
    /// Returns the MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::WebP => "image/webp",
            Self::Gif => "image/gif",
        }
    }

    /// Returns the file extension for this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::WebP => "webp",
            Self::Gif => "gif",
        }
    }

    /// Attempts to detect format from a file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "webp" => Some(Self::WebP),
            "gif" => Some(Self::Gif),
            _ => None,
        }
    }

    /// Detects image format from magic bytes.
    pub fn from_magic_bytes(data: &[u8]) -> Option<Self> {
        // PNG: 89 50 4E 47 0D 0A 1A 0A
        if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
            return Some(Self::Png);
        }
        // JPEG: FF D8 FF
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(Self::Jpeg);
        }
        if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
            return Some(Self::Gif);
        }
        // WebP: RIFF....WEBP
        if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
            return Some(Self::WebP);
        }
        None
    }
}

/// A `data:` URI split into its MIME type and base64 payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataUri<'a> {
    /// MIME type (e.g., "image/png").
    pub mime_type: &'a str,
    /// Base64 payload without the prefix.
    pub data: &'a str,
}

impl<'a> DataUri<'a> {
    /// Parses a base64 `data:` URI.
    pub fn parse(uri: &'a str) -> Option<Self> {
        let rest = uri.strip_prefix("data:")?;
        let (header, data) = rest.split_once(',')?;
        let mime_type = header.strip_suffix(";base64")?;
        Some(Self { mime_type, data })
    }

    /// Formats a base64 payload as a `data:` URI.
    pub fn format(mime_type: &str, data: &str) -> String {
        format!("data:{mime_type};base64,{data}")
    }

    /// Decodes the payload.
    pub fn decode(&self) -> Result<Vec<u8>> {
        decode_base64_lenient(self.data).map_err(|e| GenlyError::Decode(e.to_string()))
    }
}

/// Decodes base64 that may carry a data-URI prefix, whitespace, or missing padding.
pub(crate) fn decode_base64_lenient(input: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;

    let b64 = match input.find(";base64,") {
        Some(pos) => &input[pos + 8..],
        None => input,
    };
    let cleaned: String = b64.chars().filter(|c| !c.is_ascii_whitespace()).collect();

    if let Ok(data) = base64::engine::general_purpose::STANDARD.decode(&cleaned) {
        return Ok(data);
    }
    base64::engine::general_purpose::STANDARD_NO_PAD.decode(&cleaned)
}

pub(crate) fn encode_base64(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// An image that conditions generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReferenceImage {
    /// Remote image reachable over HTTP(S).
    Url {
        /// Image URL.
        url: String,
    },
    /// Image on the local filesystem.
    File {
        /// Path to the image.
        path: PathBuf,
    },
    /// Base64 image carried in the request.
    Inline {
        /// MIME type of the image.
        mime_type: String,
        /// Base64 payload.
        data: String,
    },
}

impl ReferenceImage {
    /// Creates a reference from a URL.
    pub fn url(url: impl Into<String>) -> Self {
        Self::Url { url: url.into() }
    }

    /// Creates a reference from a local file.
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self::File {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Creates a reference from raw bytes, detecting the format.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(GenlyError::Validation("reference image is empty".into()));
        }
        let mime_type = ImageFormat::from_magic_bytes(bytes)
            .map(|f| f.mime_type())
            .unwrap_or("image/png");
        Ok(Self::Inline {
            mime_type: mime_type.to_string(),
            data: encode_base64(bytes),
        })
    }

    /// Interprets a user-supplied string: data URI, URL, or file path.
    pub fn parse(input: &str) -> Self {
        if let Some(uri) = DataUri::parse(input) {
            return Self::Inline {
                mime_type: uri.mime_type.to_string(),
                data: uri.data.to_string(),
            };
        }
        if input.starts_with("http://") || input.starts_with("https://") {
            return Self::url(input);
        }
        Self::file(input.strip_prefix("file://").unwrap_or(input))
    }
}

/// A request to generate a single image or video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Text prompt describing the desired media.
    pub prompt: String,
    /// What to avoid (honored by models that support it).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    /// Requested width in pixels.
    pub width: u32,
    /// Requested height in pixels.
    pub height: u32,
    /// Quality tier used for routing.
    pub tier: QualityTier,
    /// Conditioning images, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reference_images: Vec<ReferenceImage>,
    /// Explicit provider model id; bypasses tier routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Classifier-free guidance scale override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cfg_scale: Option<f32>,
    /// Seed for reproducible generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Video duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u32>,
    /// Effect template name for effect-based video tiers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
}

impl GenerationRequest {
    /// Creates a request with the tier's default dimensions.
    pub fn new(prompt: impl Into<String>, tier: QualityTier) -> Self {
        let (width, height) = tier.default_dimensions();
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            width,
            height,
            tier,
            reference_images: Vec::new(),
            model: None,
            cfg_scale: None,
            seed: None,
            duration_secs: None,
            effect: None,
        }
    }

    /// Sets the output size.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Sets the negative prompt.
    pub fn with_negative_prompt(mut self, negative: impl Into<String>) -> Self {
        self.negative_prompt = Some(negative.into());
        self
    }

    /// Appends a reference image.
    pub fn with_reference(mut self, reference: ReferenceImage) -> Self {
        self.reference_images.push(reference);
        self
    }

    /// Pins an explicit model id.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the guidance scale.
    pub fn with_cfg_scale(mut self, cfg: f32) -> Self {
        self.cfg_scale = Some(cfg);
        self
    }

    /// Sets the seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Sets the video duration.
    pub fn with_duration(mut self, secs: u32) -> Self {
        self.duration_secs = Some(secs);
        self
    }

    /// Sets the effect template.
    pub fn with_effect(mut self, effect: impl Into<String>) -> Self {
        self.effect = Some(effect.into());
        self
    }

    /// Checks the adapter-independent invariants.
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(GenlyError::Validation("prompt must not be empty".into()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(GenlyError::Validation(format!(
                "dimensions must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if self.width > MAX_DIMENSION || self.height > MAX_DIMENSION {
            return Err(GenlyError::Validation(format!(
                "dimensions exceed {MAX_DIMENSION}px, got {}x{}",
                self.width, self.height
            )));
        }
        if let Some(duration) = self.duration_secs {
            if duration == 0 || duration > MAX_DURATION_SECS {
                return Err(GenlyError::Validation(format!(
                    "duration must be between 1 and {MAX_DURATION_SECS} seconds, got {duration}"
                )));
            }
        }
        Ok(())
    }

    /// True when the request is portrait-oriented.
    pub fn is_portrait(&self) -> bool {
        self.height > self.width
    }
}

/// The outcome of a successful generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaResult {
    /// Remote URL or `data:` URI of the generated media.
    pub url: String,
    /// Image or video.
    pub kind: MediaKind,
    /// Provider model id that produced the media.
    pub model: String,
    /// Tier actually used.
    pub tier: QualityTier,
    /// Tier originally requested, when the orchestrator switched away from it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_from: Option<QualityTier>,
    /// Provider-reported cost.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Seed the provider used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Provider task or request id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Output width, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    /// Output height, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Video duration in seconds, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

impl MediaResult {
    /// Creates a result for the given URL.
    pub fn new(url: impl Into<String>, kind: MediaKind, model: impl Into<String>, tier: QualityTier) -> Self {
        Self {
            url: url.into(),
            kind,
            model: model.into(),
            tier,
            fallback_from: None,
            cost: None,
            seed: None,
            task_id: None,
            width: None,
            height: None,
            duration_secs: None,
        }
    }

    /// True when the media is carried inline as a data URI.
    pub fn is_inline(&self) -> bool {
        self.url.starts_with("data:")
    }
}

/// Picks the supported size closest to the requested one.
///
/// Closeness is aspect ratio first, then area.
pub(crate) fn nearest_size(width: u32, height: u32, supported: &[(u32, u32)]) -> Option<(u32, u32)> {
    let ratio = (width as f64 / height as f64).ln();
    let area = width as f64 * height as f64;
    supported.iter().copied().min_by(|a, b| {
        let key = |(w, h): (u32, u32)| {
            (
                ((w as f64 / h as f64).ln() - ratio).abs(),
                (w as f64 * h as f64 - area).abs(),
            )
        };
        let (ra, aa) = key(*a);
        let (rb, ab) = key(*b);
        ra.total_cmp(&rb).then(aa.total_cmp(&ab))
    })
}
