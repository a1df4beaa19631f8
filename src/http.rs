//! Thin reqwest wrapper shared by the provider adapters.

use crate::error::{provider_error, GenlyError, Result, TimeoutKind};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::{Duration, Instant};

/// How a request authenticates.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Auth<'a> {
    /// No Authorization header.
    None,
    /// `Authorization: Bearer <key>`; keys already carrying the prefix pass through.
    Bearer(&'a str),
    /// `Authorization: Key <key>` (fal.ai).
    Key(&'a str),
    /// The key itself as the header value.
    Raw(&'a str),
}

impl Auth<'_> {
    fn header_value(&self) -> Option<String> {
        match self {
            Self::None => None,
            Self::Bearer(key) if key.starts_with("Bearer ") => Some(key.to_string()),
            Self::Bearer(key) => Some(format!("Bearer {key}")),
            Self::Key(key) => Some(format!("Key {key}")),
            Self::Raw(key) => Some(key.to_string()),
        }
    }
}

/// A fully-read response body.
#[derive(Debug, Clone)]
pub(crate) struct HttpResponse {
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// True when the server answered with raw image bytes.
    pub fn is_image(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("image/"))
    }
}

/// HTTP client bound to one provider name for error reporting.
#[derive(Debug, Clone)]
pub(crate) struct HttpClient {
    client: reqwest::Client,
    provider: &'static str,
}

impl HttpClient {
    pub fn new(provider: &'static str) -> Self {
        Self {
            client: reqwest::Client::new(),
            provider,
        }
    }

    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        auth: Auth<'_>,
        body: &B,
        timeout: Duration,
        kind: TimeoutKind,
    ) -> Result<HttpResponse> {
        let builder = self.client.post(url).json(body);
        self.send(builder, url, auth, timeout, kind).await
    }

    pub async fn get(
        &self,
        url: &str,
        auth: Auth<'_>,
        timeout: Duration,
        kind: TimeoutKind,
    ) -> Result<HttpResponse> {
        let builder = self.client.get(url);
        self.send(builder, url, auth, timeout, kind).await
    }

    async fn send(
        &self,
        mut builder: reqwest::RequestBuilder,
        url: &str,
        auth: Auth<'_>,
        timeout: Duration,
        kind: TimeoutKind,
    ) -> Result<HttpResponse> {
        if let Some(value) = auth.header_value() {
            builder = builder.header(reqwest::header::AUTHORIZATION, value);
        }
        let start = Instant::now();
        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                GenlyError::Timeout {
                    operation: kind,
                    after: timeout,
                }
            } else {
                GenlyError::Network(e)
            }
        };

        let response = builder.timeout(timeout).send().await.map_err(map_err)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(map_err)?.to_vec();

        tracing::debug!(
            provider = self.provider,
            url = %url,
            status = status.as_u16(),
            bytes = body.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "provider response"
        );

        if !status.is_success() {
            let text = String::from_utf8_lossy(&body);
            return Err(provider_error(self.provider, status.as_u16(), &text, &headers));
        }

        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase());
        Ok(HttpResponse { content_type, body })
    }
}
