//! Error types for media generation and storage.

use crate::providers::AdapterKind;
use crate::types::QualityTier;
use std::fmt;
use std::time::Duration;

/// Maximum length of a provider error body embedded in an error message.
const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Errors that can occur during media generation.
#[derive(Debug, thiserror::Error)]
pub enum GenlyError {
    /// The request is malformed or unsupported by the resolved adapter.
    #[error("invalid request: {0}")]
    Validation(String),

    /// A required credential is not configured.
    #[error("missing credential: set {credential} ({message})")]
    Configuration {
        /// Environment variable that supplies the credential.
        credential: &'static str,
        /// What needed it.
        message: String,
    },

    /// The provider rejected the credential.
    #[error("{provider} authentication failed: {message}")]
    Auth {
        /// Provider that rejected the request.
        provider: &'static str,
        /// Sanitized provider message.
        message: String,
    },

    /// The provider returned a non-success response or a terminal failure.
    #[error("{provider} error{}: {message}", status_suffix(.status))]
    Provider {
        /// Provider that failed.
        provider: &'static str,
        /// HTTP status, when the failure came from a status code.
        status: Option<u16>,
        /// Sanitized provider message.
        message: String,
    },

    /// Rate limit exceeded.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Server-suggested delay.
        retry_after: Option<Duration>,
    },

    /// No recognizable media reference in an otherwise successful response.
    #[error("no media found in response (top-level keys: [{}])", .keys.join(", "))]
    Extraction {
        /// Top-level keys of the response, for diagnostics.
        keys: Vec<String>,
    },

    /// An operation ran out of time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Which deadline expired.
        operation: TimeoutKind,
        /// How long was waited.
        after: Duration,
    },

    /// The caller cancelled the generation.
    #[error("generation cancelled")]
    Cancelled,

    /// Media store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Network or HTTP error.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Failed to decode base64 data.
    #[error("failed to decode: {0}")]
    Decode(String),

    /// I/O error (e.g., reading a reference image).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An adapter failure annotated with where it happened.
    #[error("{adapter} ({tier}): {source}")]
    Adapter {
        /// Adapter that was invoked.
        adapter: AdapterKind,
        /// Tier the request resolved to.
        tier: QualityTier,
        /// The underlying failure.
        #[source]
        source: Box<GenlyError>,
    },
}

/// Which deadline a [`GenlyError::Timeout`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// A single HTTP request.
    Request,
    /// The hard deadline on a synchronous multimodal generation.
    Generation,
    /// A reference image upload.
    Upload,
    /// The overall polling budget was exhausted.
    Polling,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => write!(f, "request"),
            Self::Generation => write!(f, "generation"),
            Self::Upload => write!(f, "upload"),
            Self::Polling => write!(f, "polling"),
        }
    }
}

impl GenlyError {
    /// Strips orchestrator context and returns the underlying error.
    pub fn root(&self) -> &GenlyError {
        match self {
            Self::Adapter { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns true if this error is likely transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Self::RateLimited { .. } | Self::Timeout { .. } | Self::Network(_) => true,
            Self::Provider {
                status: Some(status),
                ..
            } => *status >= 500,
            _ => false,
        }
    }

    /// Returns the suggested retry delay, if available.
    pub fn retry_after(&self) -> Option<Duration> {
        match self.root() {
            Self::RateLimited { retry_after } => *retry_after,
            Self::Timeout { .. } => Some(Duration::from_secs(1)),
            Self::Network(_) => Some(Duration::from_secs(2)),
            _ => None,
        }
    }

    /// Returns true if the caller cancelled the operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Cancelled)
    }

    /// Builds an extraction error from the top-level keys of a JSON value.
    pub(crate) fn extraction(value: &serde_json::Value) -> Self {
        let keys = match value {
            serde_json::Value::Object(map) => map.keys().take(12).cloned().collect(),
            serde_json::Value::Array(items) => vec![format!("<array of {}>", items.len())],
            other => vec![format!("<{}>", json_type_name(other))],
        };
        Self::Extraction { keys }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Errors raised by blob and metadata backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The blob backend has no room for the write.
    #[error("storage quota exceeded: need {needed} bytes, {available} available")]
    QuotaExceeded {
        /// Bytes the write required.
        needed: u64,
        /// Bytes still free under the quota.
        available: u64,
    },

    /// No item with the given key or id.
    #[error("not found: {0}")]
    NotFound(String),

    /// The key cannot be mapped safely onto the backend.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Persisted metadata could not be parsed.
    #[error("corrupt metadata in {location}: {message}")]
    Corrupt {
        /// File or collection that failed to parse.
        location: String,
        /// Parser message.
        message: String,
    },

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Returns true for the out-of-space condition the store degrades on.
    pub fn is_quota(&self) -> bool {
        match self {
            Self::QuotaExceeded { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::StorageFull,
            _ => false,
        }
    }
}

/// Result type alias for generation operations.
pub type Result<T> = std::result::Result<T, GenlyError>;

/// Result type alias for storage backends.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Redacts credentials and caps the length of a provider error body.
pub(crate) fn sanitize_error_message(text: &str) -> String {
    let mut out = String::with_capacity(text.len().min(MAX_ERROR_MESSAGE_LEN));
    let mut redact_next = false;
    for (i, word) in text.split(' ').enumerate() {
        if i > 0 {
            out.push(' ');
        }
        if redact_next || looks_like_secret(word) {
            out.push_str("[REDACTED]");
        } else {
            out.push_str(word);
        }
        redact_next = word.eq_ignore_ascii_case("bearer");
    }

    if out.chars().count() > MAX_ERROR_MESSAGE_LEN {
        let truncated: String = out.chars().take(MAX_ERROR_MESSAGE_LEN).collect();
        return format!("{truncated}...");
    }
    out.trim().to_string()
}

fn looks_like_secret(word: &str) -> bool {
    let word = word.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '-' && c != '_');
    word.starts_with("sk-") && word.len() > 12
}

/// Parses a `Retry-After` header given in seconds.
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Maps a non-success HTTP response onto the error taxonomy.
pub(crate) fn provider_error(
    provider: &'static str,
    status: u16,
    text: &str,
    headers: &reqwest::header::HeaderMap,
) -> GenlyError {
    let message = provider_message(text);

    if status == 401 || status == 403 {
        return GenlyError::Auth { provider, message };
    }
    if status == 429 {
        return GenlyError::RateLimited {
            retry_after: parse_retry_after(headers),
        };
    }

    GenlyError::Provider {
        provider,
        status: Some(status),
        message,
    }
}

/// Pulls the most useful message out of a provider error body.
fn provider_message(text: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
        let candidates = [
            value.pointer("/error/message"),
            value.pointer("/errors/0/message"),
            value.pointer("/detail"),
            value.pointer("/message"),
            value.pointer("/error"),
        ];
        if let Some(msg) = candidates.into_iter().flatten().find_map(|v| v.as_str()) {
            return sanitize_error_message(msg);
        }
    }
    sanitize_error_message(text)
}
