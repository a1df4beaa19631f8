//! Turns [`ReferenceImage`] values into what provider payloads need.

use crate::error::{GenlyError, Result, TimeoutKind};
use crate::http::{Auth, HttpClient};
use crate::types::{encode_base64, DataUri, ImageFormat, ReferenceImage};
use std::path::Path;
use std::time::Duration;

/// A reference image as MIME type plus base64 payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InlineImage {
    pub mime_type: String,
    pub data: String,
}

impl InlineImage {
    pub fn data_uri(&self) -> String {
        DataUri::format(&self.mime_type, &self.data)
    }

    fn from_bytes(bytes: &[u8], declared: Option<&str>, origin: &str) -> Result<Self> {
        if bytes.is_empty() {
            return Err(GenlyError::Validation(format!(
                "reference image {origin} is empty"
            )));
        }
        let mime_type = declared
            .filter(|m| m.starts_with("image/"))
            .map(|m| m.split(';').next().unwrap_or(m).trim().to_string())
            .or_else(|| ImageFormat::from_magic_bytes(bytes).map(|f| f.mime_type().to_string()))
            .ok_or_else(|| {
                GenlyError::Validation(format!("reference image {origin} is not a recognized image"))
            })?;
        Ok(Self {
            mime_type,
            data: encode_base64(bytes),
        })
    }
}

/// Loads a reference image into memory as base64.
pub(crate) async fn load_inline(
    http: &HttpClient,
    reference: &ReferenceImage,
    timeout: Duration,
) -> Result<InlineImage> {
    match reference {
        ReferenceImage::Inline { mime_type, data } => {
            if data.trim().is_empty() {
                return Err(GenlyError::Validation("inline reference image is empty".into()));
            }
            Ok(InlineImage {
                mime_type: mime_type.clone(),
                data: data.clone(),
            })
        }
        ReferenceImage::File { path } => load_file(path).await,
        ReferenceImage::Url { url } => {
            tracing::debug!(url = %url, "fetching reference image");
            let response = http.get(url, Auth::None, timeout, TimeoutKind::Upload).await?;
            InlineImage::from_bytes(&response.body, response.content_type.as_deref(), url)
        }
    }
}

async fn load_file(path: &Path) -> Result<InlineImage> {
    let bytes = tokio::fs::read(path).await?;
    let by_extension = path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(ImageFormat::from_extension)
        .map(|f| f.mime_type());
    let detected = ImageFormat::from_magic_bytes(&bytes).map(|f| f.mime_type());
    InlineImage::from_bytes(&bytes, detected.or(by_extension), &path.display().to_string())
}

/// Returns a URL the provider can fetch: remote URLs pass through, anything
/// else becomes a data URI.
pub(crate) async fn to_url_or_data_uri(
    http: &HttpClient,
    reference: &ReferenceImage,
    timeout: Duration,
) -> Result<String> {
    match reference {
        ReferenceImage::Url { url } => Ok(url.clone()),
        other => Ok(load_inline(http, other, timeout).await?.data_uri()),
    }
}
