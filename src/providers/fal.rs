//! fal.ai queue protocol shared by the fal adapters.
//!
//! A request is submitted to `{queue}/{model}`; its `status_url` is polled
//! until `COMPLETED` and the result is then fetched from `response_url`.

use crate::config::{Credential, GenlyConfig};
use crate::error::{GenlyError, Result, TimeoutKind};
use crate::http::{Auth, HttpClient};
use crate::poll::PollOutcome;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub(crate) const PROVIDER: &str = "fal";

/// Authenticated access to the fal.ai queue.
#[derive(Debug, Clone)]
pub(crate) struct FalQueue {
    pub http: HttpClient,
    queue_url: String,
    api_key: Option<String>,
}

impl FalQueue {
    pub fn from_config(config: &GenlyConfig) -> Self {
        Self {
            http: HttpClient::new(PROVIDER),
            queue_url: config.endpoints.fal_queue.trim_end_matches('/').to_string(),
            api_key: config.credential(Credential::Fal).map(str::to_string),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// The key, or a configuration error naming what needed it.
    pub fn api_key(&self, purpose: &str) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| GenlyError::Configuration {
            credential: Credential::Fal.env_var(),
            message: format!("required for {purpose}"),
        })
    }

    pub async fn submit<B: Serialize + ?Sized>(
        &self,
        key: &str,
        model: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<FalSubmitResponse> {
        let url = format!("{}/{}", self.queue_url, model);
        let submit: FalSubmitResponse = self
            .http
            .post_json(&url, Auth::Key(key), body, timeout, TimeoutKind::Request)
            .await?
            .json()?;
        tracing::info!(request_id = %submit.request_id, model, "submitted fal.ai request");
        Ok(submit)
    }

    /// One status check; a completed request yields its result document.
    pub async fn check(
        &self,
        key: &str,
        submit: &FalSubmitResponse,
        model: &str,
        timeout: Duration,
    ) -> Result<PollOutcome<Value>> {
        let status: FalStatusResponse = self
            .http
            .get(&submit.status_url, Auth::Key(key), timeout, TimeoutKind::Request)
            .await?
            .json()?;

        match status.status.as_str() {
            "COMPLETED" => self.fetch_result(key, submit, model, timeout).await.map(PollOutcome::Ready),
            "FAILED" | "ERROR" => Ok(PollOutcome::Failed(match status.error {
                Some(Value::String(message)) => message,
                Some(other) => other.to_string(),
                None => "fal.ai request failed".to_string(),
            })),
            other => {
                tracing::debug!(request_id = %submit.request_id, status = other, "fal.ai request not ready");
                Ok(PollOutcome::Pending)
            }
        }
    }

    /// Fetches the finished result, falling back to the model-based URL when
    /// the queue's `response_url` does not resolve for nested model paths.
    async fn fetch_result(
        &self,
        key: &str,
        submit: &FalSubmitResponse,
        model: &str,
        timeout: Duration,
    ) -> Result<Value> {
        let response = match self
            .http
            .get(&submit.response_url, Auth::Key(key), timeout, TimeoutKind::Request)
            .await
        {
            Err(GenlyError::Provider {
                status: Some(404 | 405),
                ..
            }) => {
                let fallback = format!("{}/{}/requests/{}", self.queue_url, model, submit.request_id);
                tracing::debug!(fallback = %fallback, "fal.ai response_url not found, using model path");
                self.http
                    .get(&fallback, Auth::Key(key), timeout, TimeoutKind::Request)
                    .await?
            }
            other => other?,
        };
        response.json()
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct FalSubmitResponse {
    pub request_id: String,
    /// URL to poll for status (provided by fal.ai).
    pub status_url: String,
    /// URL to fetch completed result (provided by fal.ai).
    pub response_url: String,
}

#[derive(Debug, Deserialize)]
struct FalStatusResponse {
    status: String,
    #[serde(default)]
    error: Option<Value>,
}
